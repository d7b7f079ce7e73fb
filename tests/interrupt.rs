use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stagerun::process::State;
use stagerun::{
    CommandTask, Context, ContextBuilder, Error, Process, Result, Task, TaskContext, TaskManager,
    ToolContext,
};

fn context() -> Arc<Context> {
    ContextBuilder::new()
        .poll_interval(Duration::from_millis(10))
        .build()
}

fn after(delay: Duration, f: impl FnOnce() + Send + 'static) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        thread::sleep(delay);
        f();
    })
}

#[test]
fn test_interrupt_stops_a_sleeping_child() {
    let cx = context();

    let mut process = Process::new(&cx).raw("sleep 30");
    process.run().unwrap();

    let flag = process.interrupter();
    let setter = after(Duration::from_millis(200), move || flag.set());

    let start = Instant::now();
    let result = process.join();

    assert!(matches!(result, Err(Error::Interrupted)));
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(process.state(), State::Joined);

    setter.join().unwrap();
}

#[test]
fn test_interrupt_is_seen_within_a_poll_interval() {
    let interval = Duration::from_millis(500);
    let cx = ContextBuilder::new().poll_interval(interval).build();

    let mut process = Process::new(&cx).raw("sleep 30");
    process.run().unwrap();

    let flag = process.interrupter();
    let setter = after(Duration::from_millis(100), move || flag.set());

    let start = Instant::now();
    assert!(matches!(process.join(), Err(Error::Interrupted)));

    // the flag went up 100ms in
    assert!(start.elapsed() < Duration::from_millis(100) + 2 * interval);

    setter.join().unwrap();
}

#[test]
fn test_terminate_on_interrupt_kills_stubborn_child() {
    let cx = context();

    // the shell ignores sigint, only the kill gets through
    let mut process = Process::new(&cx)
        .raw("trap '' INT; sleep 30")
        .flags(stagerun::ProcessFlags::TERMINATE_ON_INTERRUPT);
    process.run().unwrap();

    let flag = process.interrupter();
    let setter = after(Duration::from_millis(200), move || flag.set());

    let start = Instant::now();
    assert!(matches!(process.join(), Err(Error::Interrupted)));
    assert!(start.elapsed() < Duration::from_secs(10));

    setter.join().unwrap();
}

#[test]
fn test_context_interrupt_reaches_processes() {
    let cx = context();

    let mut process = Process::new(&cx).raw("sleep 30");
    process.run().unwrap();

    let setter = {
        let cx = cx.clone();
        after(Duration::from_millis(200), move || cx.interrupt_flag().set())
    };

    let start = Instant::now();
    assert!(matches!(process.join(), Err(Error::Interrupted)));
    assert!(start.elapsed() < Duration::from_secs(10));

    setter.join().unwrap();
}

#[test]
fn test_tool_interrupt_reaches_current_process() {
    let cx = context();
    let tool = ToolContext::standalone(&cx, "sleeper");

    let setter = {
        let handle = tool.handle().clone();
        after(Duration::from_millis(200), move || handle.interrupt())
    };

    let start = Instant::now();
    let mut process = Process::new(&cx).raw("sleep 30");

    assert!(matches!(tool.execute(&mut process), Err(Error::Interrupted)));
    assert!(start.elapsed() < Duration::from_secs(10));

    setter.join().unwrap();
}

#[test]
fn test_interrupted_tool_starts_nothing() {
    let cx = context();
    let tool = ToolContext::standalone(&cx, "idle");

    tool.handle().interrupt();
    tool.handle().interrupt();
    assert!(tool.interrupted());

    let mut process = Process::new(&cx).raw("true");

    assert!(matches!(tool.execute(&mut process), Err(Error::Interrupted)));
    assert_eq!(process.state(), State::Unstarted);
}

#[test]
fn test_interrupt_all_stops_the_run() {
    let cx = context();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("after");

    let mut tm = TaskManager::new();
    tm.add(CommandTask::new("slow").build_cmd("sleep 30"));
    tm.add(
        CommandTask::new("after")
            .depends_on("slow")
            .build_cmd(format!("touch '{}'", marker.display())),
    );

    let tm = Arc::new(tm);

    let interrupter = {
        let tm = tm.clone();
        after(Duration::from_millis(300), move || tm.interrupt_all())
    };

    let start = Instant::now();
    let result = tm.run_all(&cx);

    assert!(matches!(result, Err(Error::Interrupted)));
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(tm.interrupted());
    assert!(!marker.exists(), "dependents must not start after an interrupt");

    interrupter.join().unwrap();
}

/// Runs its process straight from the task, with no tool in between.
struct Bare {
    names: Vec<String>,
}

impl Task for Bare {
    fn names(&self) -> &[String] {
        &self.names
    }

    fn build_and_install(&self, cx: &TaskContext) -> Result<()> {
        Process::new(cx.context()).raw("sleep 30").run_and_join()?;
        Ok(())
    }
}

#[test]
fn test_interrupt_all_reaches_processes_outside_tools() {
    let cx = context();

    let mut tm = TaskManager::new();
    tm.add(Bare {
        names: vec!["bare".to_string()],
    });

    let tm = Arc::new(tm);

    let interrupter = {
        let tm = tm.clone();
        after(Duration::from_millis(300), move || tm.interrupt_all())
    };

    let start = Instant::now();

    assert!(matches!(tm.run_all(&cx), Err(Error::Interrupted)));
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(cx.interrupted());

    interrupter.join().unwrap();
}

#[test]
fn test_interrupted_manager_runs_nothing() {
    let cx = context();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let mut tm = TaskManager::new();
    tm.add(CommandTask::new("task").build_cmd(format!("touch '{}'", marker.display())));

    tm.interrupt_all();

    assert!(matches!(tm.run_all(&cx), Err(Error::Interrupted)));
    assert!(!marker.exists());
}
