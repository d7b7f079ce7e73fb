//! One external command invocation.
//!
//! A [`Process`] is configured with consuming builder methods, started with
//! [`run`](Process::run) and waited on with [`join`](Process::join):
//!
//! ```text
//! unstarted --run()--> running --(poll tick)*--> completed --join()--> joined
//! ```
//!
//! While running, `join` wakes up at least once per poll interval. On every
//! wake up it reads whatever the pipes have, feeds pending stdin bytes and
//! checks the interrupt flag; an interrupt is only sent once.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;

use crate::env::Env;
use crate::error::{Error, Result};
use crate::log::{self, Level, Reason};
use crate::pipe::StdinPipe;
use crate::pipe::fd::poll_readable;
use crate::process::args::{ArgFlags, ToArg, push_arg};
use crate::process::spawn::{Child, Redirect, SpawnRequest};
use crate::process::stream::{Encoding, FilterFn, LineFilter, Stream, StreamMode};
use crate::runtime::{Context, InterruptFlag};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProcessFlags: u32 {
        /// An exit code outside the success set is only traced.
        const ALLOW_FAILURE = 0x01;
        /// Forwarded output isn't logged live; stderr is still dumped on failure.
        const IGNORE_OUTPUT_ON_SUCCESS = 0x02;
        /// Kill the process tree right after sending the interrupt.
        const TERMINATE_ON_INTERRUPT = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unstarted,
    Running,
    Completed,
    Joined,
}

struct Exec {
    bin: Option<PathBuf>,
    raw: Option<String>,
    // rendered arguments, each with a leading space
    args: String,
    cwd: Option<PathBuf>,
    env: Option<Env>,
    success: BTreeSet<i32>,
    code: Option<i32>,
}

struct Io {
    out: Stream,
    err: Stream,
    stdin: Option<Vec<u8>>,
    stdin_offset: usize,
    stdin_pipe: StdinPipe,
    error_log: Option<PathBuf>,
    // forwarded lines by level, after filtering
    logs: BTreeMap<Level, Vec<String>>,
}

pub struct Process {
    cx: Arc<Context>,
    name: Option<String>,
    exec: Exec,
    io: Io,
    flags: ProcessFlags,
    state: State,
    child: Option<Box<dyn Child>>,
    interrupt: InterruptFlag,
    interrupt_sent: bool,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("cmd", &self.command_line())
            .field("cwd", &self.exec.cwd)
            .field("flags", &self.flags)
            .field("state", &self.state)
            .field("code", &self.exec.code)
            .finish_non_exhaustive()
    }
}

impl Process {
    pub fn new(cx: &Arc<Context>) -> Self {
        Self {
            cx: cx.clone(),
            name: None,
            exec: Exec {
                bin: None,
                raw: None,
                args: String::new(),
                cwd: None,
                env: None,
                success: BTreeSet::from([0]),
                code: None,
            },
            io: Io {
                out: Stream::new(Reason::StdOut, Level::Trace),
                err: Stream::new(Reason::StdErr, Level::Error),
                stdin: None,
                stdin_offset: 0,
                stdin_pipe: StdinPipe::new(),
                error_log: None,
                logs: BTreeMap::new(),
            },
            flags: ProcessFlags::empty(),
            state: State::Unstarted,
            child: None,
            interrupt: InterruptFlag::new(),
            interrupt_sent: false,
        }
    }

    pub fn binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.exec.bin = Some(path.into());
        self
    }

    /// Runs `cmd` as given through the shell; arguments are ignored.
    pub fn raw(mut self, cmd: impl Into<String>) -> Self {
        self.exec.raw = Some(cmd.into());
        self
    }

    /// Name used in logs and errors instead of the binary's stem.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Directory the child starts in, created if missing.
    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.exec.cwd = Some(path.into());
        self
    }

    /// Environment of the child, this process's own if not set.
    pub fn env(mut self, env: Env) -> Self {
        self.exec.env = Some(env);
        self
    }

    pub fn arg(self, value: impl ToArg) -> Self {
        self.arg_with(value, ArgFlags::empty())
    }

    pub fn arg_with(mut self, value: impl ToArg, flags: ArgFlags) -> Self {
        let value = value.to_arg(flags);
        push_arg(&mut self.exec.args, "", &value, flags);
        self
    }

    pub fn args<I>(self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        values.into_iter().fold(self, |process, value| process.arg(value))
    }

    pub fn arg_kv(self, key: &str, value: impl ToArg) -> Self {
        self.arg_kv_with(key, value, ArgFlags::empty())
    }

    /// Adds `key value`, or `keyvalue` if the key ends with `=` or
    /// [`ArgFlags::NOSPACE`] is given.
    pub fn arg_kv_with(mut self, key: &str, value: impl ToArg, flags: ArgFlags) -> Self {
        let value = value.to_arg(flags);
        push_arg(&mut self.exec.args, key, &value, flags);
        self
    }

    pub fn stdout_mode(mut self, mode: StreamMode) -> Self {
        self.io.out.mode = mode;
        self
    }

    pub fn stdout_level(mut self, level: Level) -> Self {
        self.io.out.level = level;
        self
    }

    pub fn stdout_encoding(mut self, encoding: Encoding) -> Self {
        self.io.out.buffer.set_encoding(encoding);
        self
    }

    pub fn stdout_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&mut LineFilter) + Send + Sync + 'static,
    {
        self.io.out.filter = Some(Arc::new(filter) as FilterFn);
        self
    }

    pub fn stderr_mode(mut self, mode: StreamMode) -> Self {
        self.io.err.mode = mode;
        self
    }

    pub fn stderr_level(mut self, level: Level) -> Self {
        self.io.err.level = level;
        self
    }

    pub fn stderr_encoding(mut self, encoding: Encoding) -> Self {
        self.io.err.buffer.set_encoding(encoding);
        self
    }

    pub fn stderr_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&mut LineFilter) + Send + Sync + 'static,
    {
        self.io.err.filter = Some(Arc::new(filter) as FilterFn);
        self
    }

    /// Bytes written to the child's stdin, which is closed afterwards.
    pub fn stdin_string(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.io.stdin = Some(input.into());
        self
    }

    /// Exit codes considered successful, `{0}` by default.
    pub fn success_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.exec.success = codes.into_iter().collect();
        self
    }

    pub fn flags(mut self, flags: ProcessFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Log file the program writes on its own, deleted before the run and
    /// dumped if it fails.
    pub fn external_error_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.io.error_log = Some(path.into());
        self
    }

    /// Turns this process into `this | other`.
    pub fn pipe_into(mut self, other: &Process) -> Self {
        self.exec.raw = Some(format!("{} | {}", self.command_line(), other.command_line()));
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn process_flags(&self) -> ProcessFlags {
        self.flags
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.exec.cwd.as_deref()
    }

    /// The explicit name, the binary's stem, or the command line.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }

        if let Some(stem) = self.exec.bin.as_ref().and_then(|bin| bin.file_stem()) {
            return stem.to_string_lossy().into_owned();
        }

        self.command_line()
    }

    /// The raw command, or `"bin" args...`.
    pub fn command_line(&self) -> String {
        if let Some(raw) = self.exec.raw.as_ref().filter(|raw| !raw.is_empty()) {
            return raw.clone();
        }

        match &self.exec.bin {
            Some(bin) => format!("\"{}\"{}", bin.display(), self.exec.args),
            None => String::new(),
        }
    }

    /// Exit code of the child, `0` if it never ran.
    pub fn exit_code(&self) -> i32 {
        self.exec.code.unwrap_or(0)
    }

    /// Everything the child wrote to stdout, if it was piped.
    pub fn stdout_string(&self) -> String {
        self.io.out.buffer.text()
    }

    pub fn stderr_string(&self) -> String {
        self.io.err.buffer.text()
    }

    /// Asks the running child to stop; observed on the next poll tick.
    pub fn interrupt(&self) {
        self.interrupt.set();
        log::emit(Reason::Cmd, Level::Trace, "will interrupt");
    }

    /// Handle that interrupts this process when set, usable from other
    /// threads.
    pub fn interrupter(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    /// Starts the child and returns immediately.
    ///
    /// Under dry run, only logs the command.
    pub fn run(&mut self) -> Result<()> {
        if self.state != State::Unstarted {
            return Ok(());
        }

        if let Some(cwd) = &self.exec.cwd {
            log::emit(Reason::Cmd, Level::Debug, &format!("> cd {}", cwd.display()));
        }

        let what = self.command_line();
        log::emit(Reason::Cmd, Level::Debug, &format!("> {what}"));

        if self.cx.dry_run() {
            self.state = State::Completed;
            return Ok(());
        }

        if what.is_empty() {
            return Err(Error::NothingToRun);
        }

        self.spawn(&what)
    }

    /// Waits for the child, streaming its output, then checks its exit code.
    ///
    /// Fails with [`Error::Interrupted`] if the process was interrupted and
    /// with [`Error::ProcessFailed`] if the exit code isn't a success and
    /// failure isn't allowed. Every OS resource is released when this
    /// returns.
    pub fn join(&mut self) -> Result<()> {
        match self.state {
            State::Unstarted | State::Joined => return Ok(()),
            State::Completed => {
                self.state = State::Joined;
                return Ok(());
            }
            State::Running => {}
        }

        let result = self.wait();

        self.release();
        self.state = State::Joined;

        result
    }

    pub fn run_and_join(&mut self) -> Result<i32> {
        self.run()?;
        self.join()?;

        Ok(self.exit_code())
    }

    fn spawn(&mut self, what: &str) -> Result<()> {
        if let Some(cwd) = &self.exec.cwd {
            fs::create_dir_all(cwd)
                .map_err(|e| Error::os(format!("failed to create {}", cwd.display()), e))?;
        }

        self.delete_external_error_log();

        let env = match &self.exec.env {
            Some(env) => env.clone(),
            None => self.cx.system_env().get(),
        };

        let native = env.native_block()?;

        let stdin = match self.io.stdin {
            Some(_) => Redirect::Fd(self.io.stdin_pipe.create()?),
            None => Redirect::Null,
        };

        let stdout = redirect(&mut self.io.out)?;
        let stderr = redirect(&mut self.io.err)?;

        let child = self.cx.spawner().spawn(SpawnRequest {
            command: what,
            cwd: self.exec.cwd.as_deref(),
            env: &native,
            stdin,
            stdout,
            stderr,
        })?;

        log::emit(
            Reason::Cmd,
            Level::Trace,
            &format!("pid {} started", child.id()),
        );

        self.child = Some(child);
        self.state = State::Running;

        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        // dropping the child on an early return kills it
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let tick = poll_timeout(self.cx.config().poll_interval);

        loop {
            if let Some(code) = child.try_wait()? {
                self.exec.code = Some(code);
                break;
            }

            let fds: Vec<_> = [&self.io.out, &self.io.err]
                .iter()
                .filter_map(|stream| stream.pipe.pollable_fd())
                .collect();

            // once interrupted, the exit is picked up without waiting a full tick
            let timeout = if self.interrupt_sent {
                tick.min(EXIT_CHECK_MS)
            } else {
                tick
            };

            poll_readable(&fds, timeout)?;

            self.on_timeout(child.as_mut())?;
        }

        self.state = State::Completed;

        if self.interrupt_requested() {
            log::emit(Reason::Cmd, Level::Trace, "process was interrupted");
            return Err(Error::Interrupted);
        }

        self.drain()?;
        self.classify()
    }

    fn on_timeout(&mut self, child: &mut dyn Child) -> Result<()> {
        self.read_pipes(false)?;
        self.feed_stdin()?;

        if !self.interrupt_sent && self.interrupt_requested() {
            self.interrupt_sent = true;
            self.send_interrupt(child)?;
        }

        Ok(())
    }

    fn interrupt_requested(&self) -> bool {
        self.interrupt.is_set() || self.cx.interrupted()
    }

    fn send_interrupt(&self, child: &mut dyn Child) -> Result<()> {
        let pid = child.id();

        if pid == 0 {
            log::emit(
                Reason::Cmd,
                Level::Trace,
                "process id is 0, terminating instead",
            );

            return child.terminate();
        }

        log::emit(Reason::Cmd, Level::Trace, &format!("sending sigint to {pid}"));
        child.interrupt()?;

        if self.flags.contains(ProcessFlags::TERMINATE_ON_INTERRUPT) {
            log::emit(
                Reason::Cmd,
                Level::Trace,
                "terminating process (flag is set)",
            );

            child.terminate()?;
        }

        Ok(())
    }

    // An empty read right after exit doesn't mean everything arrived, so
    // the last partial line is kept by a first non-finishing pass.
    fn drain(&mut self) -> Result<()> {
        self.read_pipes(false)?;

        while !self.io.out.pipe.closed() || !self.io.err.pipe.closed() {
            self.read_pipes(true)?;
        }

        Ok(())
    }

    fn read_pipes(&mut self, finish: bool) -> Result<()> {
        let live = !self.flags.contains(ProcessFlags::IGNORE_OUTPUT_ON_SUCCESS);

        read_stream(&mut self.io.out, finish, live, &mut self.io.logs)?;
        read_stream(&mut self.io.err, finish, live, &mut self.io.logs)
    }

    fn feed_stdin(&mut self) -> Result<()> {
        let Some(input) = &self.io.stdin else {
            return Ok(());
        };

        let len = input.len();

        if self.io.stdin_offset < len {
            let written = self.io.stdin_pipe.write(&input[self.io.stdin_offset..])?;

            if self.io.stdin_pipe.is_open() {
                self.io.stdin_offset += written;
            } else {
                // the child closed its stdin
                self.io.stdin_offset = len;
            }
        }

        if self.io.stdin_offset >= len {
            self.io.stdin_pipe.close();
            self.io.stdin = None;
        }

        Ok(())
    }

    fn classify(&mut self) -> Result<()> {
        let code = self.exec.code.unwrap_or(-1);

        if self.exec.success.contains(&code) {
            self.on_success(code);
            return Ok(());
        }

        if self.flags.contains(ProcessFlags::ALLOW_FAILURE) {
            log::emit(
                Reason::Cmd,
                Level::Trace,
                &format!("process failed with {code} but failure was allowed"),
            );

            return Ok(());
        }

        self.dump_error_log();
        self.dump_stderr();

        Err(Error::ProcessFailed {
            name: self.display_name(),
            code,
        })
    }

    fn on_success(&self, code: i32) {
        let warnings = self.io.logs.get(&Level::Warning).map_or(&[][..], Vec::as_slice);
        let errors = self.io.logs.get(&Level::Error).map_or(&[][..], Vec::as_slice);

        let ignore = self.flags.contains(ProcessFlags::IGNORE_OUTPUT_ON_SUCCESS);

        if ignore || (warnings.is_empty() && errors.is_empty()) {
            log::emit(
                Reason::Cmd,
                Level::Trace,
                &format!("process exit code is {code} (considered success)"),
            );

            return;
        }

        log::emit(
            Reason::Cmd,
            Level::Warning,
            &format!("process exit code is {code} (considered success), but stderr had something"),
        );

        // forwarded stderr lines were already logged as they came
        if self.io.err.mode != StreamMode::ForwardToLog {
            log::emit(
                Reason::Cmd,
                Level::Warning,
                &format!("process was: {}", self.command_line()),
            );
            log::emit(Reason::Cmd, Level::Warning, "stderr:");

            for line in warnings.iter().chain(errors) {
                log::emit(Reason::StdErr, Level::Warning, &format!("        {line}"));
            }
        }
    }

    fn delete_external_error_log(&self) {
        let Some(path) = &self.io.error_log else {
            return;
        };

        if path.exists() {
            log::emit(
                Reason::Cmd,
                Level::Trace,
                &format!("external error log file {} exists, deleting", path.display()),
            );

            if let Err(e) = fs::remove_file(path) {
                log::emit(
                    Reason::Cmd,
                    Level::Warning,
                    &format!("failed to delete {}, {e}", path.display()),
                );
            }
        }
    }

    fn dump_error_log(&self) {
        let Some(path) = &self.io.error_log else {
            return;
        };

        let log = match fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => {
                log::emit(
                    Reason::Cmd,
                    Level::Debug,
                    &format!("external error log file {} doesn't exist", path.display()),
                );

                return;
            }
        };

        if log.trim().is_empty() {
            return;
        }

        log::emit(
            Reason::Cmd,
            Level::Error,
            &format!("{} failed, content of {}:", self.display_name(), path.display()),
        );

        for line in log.lines().filter(|line| !line.trim().is_empty()) {
            log::emit(Reason::Cmd, Level::Error, &format!("        {line}"));
        }
    }

    fn dump_stderr(&self) {
        if !self.io.err.piped() {
            return;
        }

        let text = self.stderr_string();

        if text.trim().is_empty() {
            log::emit(
                Reason::Cmd,
                Level::Error,
                &format!("{} failed, stderr was empty", self.display_name()),
            );

            return;
        }

        log::emit(
            Reason::Cmd,
            Level::Error,
            &format!(
                "{} failed, {}, content of stderr:",
                self.display_name(),
                self.command_line()
            ),
        );

        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            log::emit(Reason::Cmd, Level::Error, &format!("        {line}"));
        }
    }

    fn release(&mut self) {
        self.child = None;
        self.io.out.pipe.close();
        self.io.err.pipe.close();
        self.io.stdin_pipe.close();
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.state != State::Running {
            return;
        }

        if let Err(e) = self.join()
            && !e.is_interruption()
        {
            log::emit(Reason::Cmd, Level::Error, &e.to_string());
        }
    }
}

fn redirect(stream: &mut Stream) -> Result<Redirect> {
    Ok(match stream.mode {
        StreamMode::ForwardToLog | StreamMode::KeepInString => {
            Redirect::Fd(stream.pipe.create()?)
        }
        StreamMode::BitBucket => Redirect::Null,
        StreamMode::Inherit => Redirect::Inherit,
    })
}

fn read_stream(
    stream: &mut Stream,
    finish: bool,
    live: bool,
    logs: &mut BTreeMap<Level, Vec<String>>,
) -> Result<()> {
    match stream.mode {
        StreamMode::ForwardToLog => {
            let bytes = stream.pipe.read(finish)?;
            stream.buffer.add(bytes);

            let reason = stream.reason;
            let level = stream.level;
            let filter = stream.filter.clone();

            stream.buffer.next_lines(finish, |line| {
                let mut f = LineFilter {
                    line,
                    reason,
                    level,
                    discard: false,
                };

                if let Some(filter) = &filter {
                    filter(&mut f);

                    if f.discard {
                        return;
                    }
                }

                // with IGNORE_OUTPUT_ON_SUCCESS, logging waits for the outcome
                if live {
                    log::emit(f.reason, f.level, &f.line);
                }

                logs.entry(f.level).or_default().push(f.line);
            });
        }

        StreamMode::KeepInString => {
            let bytes = stream.pipe.read(finish)?;
            stream.buffer.add(bytes);
        }

        StreamMode::BitBucket | StreamMode::Inherit => {}
    }

    Ok(())
}

const EXIT_CHECK_MS: i32 = 5;

fn poll_timeout(interval: Duration) -> i32 {
    interval.as_millis().clamp(1, i32::MAX as u128) as i32
}
