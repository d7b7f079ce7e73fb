use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use stagerun::log::{self, Level, LockedMakeWriter, OutputLock};
use stagerun::{
    CommandTask, Context, ContextBuilder, Error, Process, ProcessFlags, TaskManager, exit_code,
};

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Logs {
    capture: Capture,
    lock: OutputLock,
}

/// Installs one capturing subscriber for the whole test binary.
fn logs() -> &'static Logs {
    static LOGS: OnceLock<Logs> = OnceLock::new();

    LOGS.get_or_init(|| {
        let capture = Capture::default();
        let lock = OutputLock::new();

        let writer = {
            let capture = capture.clone();
            LockedMakeWriter::new(lock.clone(), move || capture.clone())
        };

        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(writer)
            .init();

        Logs { capture, lock }
    })
}

fn captured() -> String {
    String::from_utf8_lossy(&logs().capture.0.lock()).into_owned()
}

fn context() -> Arc<Context> {
    ContextBuilder::new()
        .poll_interval(Duration::from_millis(10))
        .output_lock(logs().lock.clone())
        .build()
}

#[test]
fn test_command_output_reaches_the_log() {
    let cx = context();

    let mut tm = TaskManager::new();
    tm.add(CommandTask::new("hello").build_cmd("printf '%s-%s\\n' greet ings"));

    let result = tm.run_all(&cx);

    assert!(result.is_ok());
    assert_eq!(exit_code(&result), 0);
    assert!(captured().contains("greet-ings"));
}

#[test]
fn test_forwarded_lines_name_their_task() {
    let cx = context();

    let mut tm = TaskManager::new();
    tm.add(CommandTask::new("tagger").build_cmd("printf '%s-%s\\n' tag out"));

    tm.run_all(&cx).unwrap();

    let text = captured();
    let line = text
        .lines()
        .find(|line| line.contains("tag-out"))
        .expect("output was forwarded");

    assert!(line.contains("task{name=tagger"), "{line}");
    assert!(line.contains("phase=build and install"), "{line}");
}

#[test]
fn test_failure_is_logged_with_stderr() {
    let cx = context();

    let mut tm = TaskManager::new();
    tm.add(CommandTask::new("fail").build_cmd("printf '%s-%s\\n' bro ken >&2; exit 1"));

    let result = tm.run_all(&cx);

    assert!(matches!(&result, Err(Error::RunFailed(failed)) if failed == &["fail"]));
    assert_eq!(exit_code(&result), 1);

    let text = captured();
    assert!(text.contains("bro-ken"));
    assert!(text.contains("returned 1"));
}

#[test]
fn test_success_with_stderr_is_summarized() {
    let cx = context();

    let mut process = Process::new(&cx).raw("printf '%s-%s\\n' warn line >&2; exit 0");

    assert_eq!(process.run_and_join().unwrap(), 0);

    let text = captured();
    assert!(text.contains("warn-line"));
    assert!(text.contains("(considered success), but stderr had something"));
}

#[test]
fn test_output_ignored_on_success() {
    let cx = context();

    let mut process = Process::new(&cx)
        .raw("printf '%s-%s\\n' quiet marker; printf '%s-%s\\n' quiet err >&2")
        .flags(ProcessFlags::IGNORE_OUTPUT_ON_SUCCESS);

    process.run_and_join().unwrap();

    let text = captured();
    assert!(!text.contains("quiet-marker"));
    assert!(!text.contains("quiet-err"));
}

#[test]
fn test_output_ignored_on_success_still_dumps_stderr_on_failure() {
    let cx = context();

    let mut process = Process::new(&cx)
        .raw("printf '%s-%s\\n' loud err >&2; exit 3")
        .flags(ProcessFlags::IGNORE_OUTPUT_ON_SUCCESS);

    assert!(matches!(
        process.run_and_join(),
        Err(Error::ProcessFailed { code: 3, .. })
    ));
    assert!(captured().contains("loud-err"));
}

#[test]
fn test_external_error_log_dumped_on_failure() {
    let cx = context();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tool-errors.log");

    // the log is cleared before start, the command writes it again
    let mut process = Process::new(&cx)
        .raw(format!(
            "printf '%s-%s\\n' log detail > '{}'; exit 1",
            path.display()
        ))
        .name("logger")
        .external_error_log(&path);

    assert!(process.run_and_join().is_err());

    let text = captured();
    assert!(text.contains("logger failed, content of"));
    assert!(text.contains("log-detail"));
}

#[test]
fn test_dry_run_logs_commands() {
    let cx = ContextBuilder::new()
        .dry_run(true)
        .output_lock(logs().lock.clone())
        .build();

    let mut tm = TaskManager::new();
    tm.add(CommandTask::new("dry").build_cmd("echo dry-run-marker"));

    tm.run_all(&cx).unwrap();

    assert!(captured().contains("> echo dry-run-marker"));
}

#[test]
fn test_levels_follow_the_subscriber() {
    logs();

    assert!(log::enabled(Level::Trace));
    assert!(log::enabled(Level::Error));

    // the global subscriber is taken
    assert!(!log::init(Level::Info, OutputLock::new()));
}

#[test]
fn test_interrupted_run_exit_code() {
    let cx = context();
    cx.interrupt_flag().set();

    let mut tm = TaskManager::new();
    tm.add(CommandTask::new("never").build_cmd("true"));

    let result = tm.run_all(&cx);

    assert!(matches!(result, Err(Error::Interrupted)));
    assert_eq!(exit_code(&result), 130);
}
