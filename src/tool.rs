//! Tools: named, interruptible wrappers around external programs.
//!
//! A [`Tool`] runs its processes through [`ToolContext::execute`], which
//! keeps track of the one process currently running so that interrupting
//! the tool's [`ToolHandle`] reaches it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::log::{self, Level, Reason};
use crate::process::Process;
use crate::runtime::{Context, InterruptFlag};

/// One external program's usage contract.
pub trait Tool: Send {
    fn name(&self) -> &str;

    fn run(&mut self, cx: &ToolContext) -> Result<()>;
}

/// Interruption bookkeeping of a running tool, shared with whoever may
/// interrupt it.
pub struct ToolHandle {
    name: String,
    interrupted: AtomicBool,
    current: Mutex<Option<InterruptFlag>>,
}

impl fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolHandle")
            .field("name", &self.name)
            .field("interrupted", &self.interrupted())
            .finish()
    }
}

impl ToolHandle {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            interrupted: AtomicBool::new(false),
            current: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interrupts the tool and its current process. Only the first call
    /// does anything.
    pub fn interrupt(&self) {
        if self.interrupted.swap(true, Ordering::SeqCst) {
            return;
        }

        log::emit(
            Reason::Interruption,
            Level::Debug,
            &format!("interrupting {}", self.name),
        );

        if let Some(process) = self.current.lock().as_ref() {
            process.set();
        }
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// What a tool sees while it runs.
#[derive(Debug, Clone)]
pub struct ToolContext {
    cx: Arc<Context>,
    handle: Arc<ToolHandle>,
}

impl ToolContext {
    pub fn new(cx: &Arc<Context>, handle: Arc<ToolHandle>) -> Self {
        Self {
            cx: cx.clone(),
            handle,
        }
    }

    /// Context for a tool run outside of any task.
    pub fn standalone(cx: &Arc<Context>, name: impl Into<String>) -> Self {
        Self::new(cx, ToolHandle::new(name))
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.cx
    }

    pub fn handle(&self) -> &Arc<ToolHandle> {
        &self.handle
    }

    pub fn interrupted(&self) -> bool {
        self.handle.interrupted()
    }

    /// Runs and joins `process` as this tool's current process, returning
    /// its exit code.
    ///
    /// An interrupted tool doesn't start anything and fails with
    /// [`Error::Interrupted`].
    pub fn execute(&self, process: &mut Process) -> Result<i32> {
        if self.interrupted() {
            return Err(Error::Interrupted);
        }

        let flag = process.interrupter();
        *self.handle.current.lock() = Some(flag.clone());

        // interrupt() may have run between the check and the registration
        if self.interrupted() {
            flag.set();
        }

        let result = process.run_and_join();
        *self.handle.current.lock() = None;

        result
    }
}

/// Runs one arbitrary process, for programs without a dedicated tool.
pub struct ProcessTool {
    name: String,
    process: Process,
    code: Option<i32>,
}

impl ProcessTool {
    pub fn new(process: Process) -> Self {
        Self {
            name: process.display_name(),
            process,
            code: None,
        }
    }

    /// Exit code of the process, `0` before it ran.
    pub fn result(&self) -> i32 {
        self.code.unwrap_or(0)
    }

    pub fn process(&self) -> &Process {
        &self.process
    }
}

impl Tool for ProcessTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, cx: &ToolContext) -> Result<()> {
        let code = cx.execute(&mut self.process)?;
        self.code = Some(code);

        Ok(())
    }
}

/// Retries a parallel build that sometimes fails on races.
///
/// `f(true)` is a multiprocess attempt and returns whether it succeeded. It
/// is tried up to `max_tries` times, then `f(false)` runs once single
/// process. Errors from `f` are returned right away.
pub fn build_loop<F>(max_tries: usize, mut f: F) -> Result<()>
where
    F: FnMut(bool) -> Result<bool>,
{
    for _ in 0..max_tries {
        if f(true)? {
            return Ok(());
        }

        log::emit(
            Reason::Generic,
            Level::Debug,
            "multiprocess build sometimes fails because of race conditions; trying again",
        );
    }

    log::emit(
        Reason::Generic,
        Level::Debug,
        &format!(
            "multiprocess build has failed more than {max_tries} times, \
             restarting one last time single process"
        ),
    );

    if f(false)? {
        Ok(())
    } else {
        Err(Error::RetriesExhausted {
            attempts: max_tries + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_loop_falls_back_to_single_process() {
        let mut calls = Vec::new();

        build_loop(3, |multi| {
            calls.push(multi);
            Ok(!multi)
        })
        .unwrap();

        assert_eq!(calls, [true, true, true, false]);
    }

    #[test]
    fn test_build_loop_stops_on_first_success() {
        let mut calls = 0;

        build_loop(3, |_| {
            calls += 1;
            Ok(true)
        })
        .unwrap();

        assert_eq!(calls, 1);
    }

    #[test]
    fn test_build_loop_gives_up() {
        let err = build_loop(2, |_| Ok(false)).unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3 }));
    }

    #[test]
    fn test_interrupt_is_idempotent() {
        let handle = ToolHandle::new("cmake");
        let flag = InterruptFlag::new();
        *handle.current.lock() = Some(flag.clone());

        handle.interrupt();
        handle.interrupt();

        assert!(handle.interrupted());
        assert!(flag.is_set());
    }
}
