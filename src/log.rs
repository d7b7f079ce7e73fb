//! Reason-tagged logging on top of `tracing`.
//!
//! Every message carries a [`Reason`] (what subsystem produced it) and a
//! [`Level`]. Output from concurrent workers is serialized through the
//! [`OutputLock`] owned by the run's context, which [`LockedMakeWriter`]
//! holds for the duration of one formatted event.

use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Environment variable overriding the log filter given on the command line.
pub const LOG_ENV: &str = "STAGERUN_LOG";

/// Severity of a log line. `Dump` is the most verbose and shares tracing's
/// TRACE level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Dump,
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl Level {
    fn directive(self) -> &'static str {
        match self {
            Level::Dump | Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warning => "warn",
            Level::Error => "error",
        }
    }
}

/// What part of the system a log line comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    Generic,
    Cmd,
    StdOut,
    StdErr,
    Interruption,
    Env,
    Task,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Generic => "generic",
            Reason::Cmd => "cmd",
            Reason::StdOut => "stdout",
            Reason::StdErr => "stderr",
            Reason::Interruption => "interruption",
            Reason::Env => "env",
            Reason::Task => "task",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emits `message` at a level only known at runtime.
pub fn emit(reason: Reason, level: Level, message: &str) {
    let reason = reason.as_str();

    match level {
        Level::Dump | Level::Trace => tracing::trace!(reason = reason, "{}", message),
        Level::Debug => tracing::debug!(reason = reason, "{}", message),
        Level::Info => tracing::info!(reason = reason, "{}", message),
        Level::Warning => tracing::warn!(reason = reason, "{}", message),
        Level::Error => tracing::error!(reason = reason, "{}", message),
    }
}

/// Whether lines at `level` would currently reach a subscriber.
pub fn enabled(level: Level) -> bool {
    match level {
        Level::Dump | Level::Trace => tracing::enabled!(tracing::Level::TRACE),
        Level::Debug => tracing::enabled!(tracing::Level::DEBUG),
        Level::Info => tracing::enabled!(tracing::Level::INFO),
        Level::Warning => tracing::enabled!(tracing::Level::WARN),
        Level::Error => tracing::enabled!(tracing::Level::ERROR),
    }
}

/// Process-wide output mutex shared by every writer of the run.
#[derive(Clone, Default)]
pub struct OutputLock(Arc<Mutex<()>>);

impl OutputLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds the output for the lifetime of the guard. Logging from the same
    /// thread while holding it deadlocks.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock()
    }
}

/// Wraps another [`MakeWriter`] so each event is written under the
/// [`OutputLock`].
pub struct LockedMakeWriter<M> {
    lock: OutputLock,
    inner: M,
}

impl<M> LockedMakeWriter<M> {
    pub fn new(lock: OutputLock, inner: M) -> Self {
        Self { lock, inner }
    }
}

/// Writer for a single event; the lock is released after `inner` is dropped.
pub struct LockedWriter<'a, W> {
    inner: W,
    _guard: MutexGuard<'a, ()>,
}

impl<W: io::Write> io::Write for LockedWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for LockedMakeWriter<M> {
    type Writer = LockedWriter<'a, M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        let guard = self.lock.lock();

        LockedWriter {
            inner: self.inner.make_writer(),
            _guard: guard,
        }
    }
}

/// Installs the global subscriber writing to stdout under `lock`.
///
/// `STAGERUN_LOG` takes precedence over `level`. Returns false if a
/// subscriber was already installed.
pub fn init(level: Level, lock: OutputLock) -> bool {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level.directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_writer(LockedMakeWriter::new(lock, io::stdout))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_locked_writer_holds_lock_while_writing() {
        let lock = OutputLock::new();
        let sink = Sink::default();
        let make = {
            let sink = sink.clone();
            LockedMakeWriter::new(lock.clone(), move || sink.clone())
        };

        {
            let mut writer = make.make_writer();
            assert!(lock.0.try_lock().is_none(), "lock must be held by the writer");
            writer.write_all(b"line\n").unwrap();
        }

        assert!(lock.0.try_lock().is_some());
        assert_eq!(&*sink.0.lock(), b"line\n");
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(Level::Dump < Level::Trace);
        assert!(Level::Warning < Level::Error);
        assert_eq!(Level::Dump.directive(), "trace");
    }
}
