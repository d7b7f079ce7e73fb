use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::log::{self, Level, Reason};
use crate::process::Process;
use crate::runtime::Context;
use crate::task::{Phase, Task};
use crate::tool::{ProcessTool, Tool, ToolContext, ToolHandle};

/// Interruption bookkeeping of a task; at most one tool is current at any
/// time.
pub struct TaskHandle {
    name: String,
    interrupted: AtomicBool,
    current_tool: Mutex<Option<Arc<ToolHandle>>>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("interrupted", &self.interrupted())
            .finish()
    }
}

impl TaskHandle {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            interrupted: AtomicBool::new(false),
            current_tool: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interrupts the task's current tool, if any, and keeps new ones from
    /// starting.
    pub fn interrupt(&self) {
        if self.interrupted.swap(true, Ordering::SeqCst) {
            return;
        }

        log::emit(
            Reason::Interruption,
            Level::Debug,
            &format!("{}: interrupting", self.name),
        );

        if let Some(tool) = self.current_tool.lock().as_ref() {
            tool.interrupt();
        }
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }
}

/// What a task phase sees while it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    cx: Arc<Context>,
    handle: Arc<TaskHandle>,
    phase: Phase,
}

impl TaskContext {
    pub fn new(cx: &Arc<Context>, handle: Arc<TaskHandle>, phase: Phase) -> Self {
        Self {
            cx: cx.clone(),
            handle,
            phase,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.cx
    }

    pub fn handle(&self) -> &Arc<TaskHandle> {
        &self.handle
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn interrupted(&self) -> bool {
        self.handle.interrupted() || self.cx.interrupted()
    }

    /// Runs `tool` as the task's current tool.
    pub fn run_tool<T: Tool + ?Sized>(&self, tool: &mut T) -> Result<()> {
        if self.interrupted() {
            return Err(Error::Interrupted);
        }

        let span = tracing::info_span!("tool", name = %tool.name());
        let _entered = span.enter();

        let tool_handle = ToolHandle::new(tool.name());
        *self.handle.current_tool.lock() = Some(tool_handle.clone());

        if self.handle.interrupted() {
            tool_handle.interrupt();
        }

        log::emit(
            Reason::Task,
            Level::Trace,
            &format!("{}: running tool {}", self.handle.name, tool.name()),
        );

        let result = tool.run(&ToolContext::new(&self.cx, tool_handle));
        *self.handle.current_tool.lock() = None;

        result
    }

    /// Runs `process` through a [`ProcessTool`], returning its exit code.
    pub fn run_process(&self, process: Process) -> Result<i32> {
        let mut tool = ProcessTool::new(process);
        self.run_tool(&mut tool)?;

        Ok(tool.result())
    }
}

/// Runs one phase of `task`.
///
/// Nothing starts once the task or the run is interrupted, and the clean
/// phase is skipped when there is nothing to clean.
pub(crate) fn run_phase(task: &dyn Task, cx: &TaskContext) -> Result<()> {
    if cx.interrupted() {
        return Err(Error::Interrupted);
    }

    let name = task.name();

    match cx.phase() {
        Phase::Clean => {
            let flags = cx.context().config().clean_flags;

            if flags.is_empty() {
                log::emit(Reason::Task, Level::Trace, &format!("{name}: nothing to clean"));
                return Ok(());
            }

            log::emit(Reason::Task, Level::Info, &format!("{name}: cleaning"));
            task.clean(cx, flags)
        }

        Phase::Fetch => {
            log::emit(Reason::Task, Level::Info, &format!("{name}: fetching"));
            task.fetch(cx)
        }

        Phase::BuildAndInstall => {
            log::emit(Reason::Task, Level::Info, &format!("{name}: building"));
            task.build_and_install(cx)
        }
    }
}
