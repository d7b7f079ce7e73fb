//! Build orchestration core: child processes, tools, tasks and the scheduler
//! that runs them.
//!
//! # Architecture
//!
//! - **Env**: copy-on-write environment block handed to children
//! - **Pipes**: non-blocking reads of child output and stdin writes
//! - **Process**: one external command, polled until it exits or is interrupted
//! - **Tool**: interruptible wrapper running one or more processes
//! - **Task**: dependency graph node with clean, fetch and build phases
//! - **TaskManager**: runs the graph on a bounded thread pool
//! - **ContextBuilder**: fluent construction of the run-wide [`Context`]

mod builder;
pub mod env;
pub mod error;
pub mod log;
pub mod pipe;
pub mod process;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod tool;

pub use builder::ContextBuilder;
pub use env::{Env, SetMode, SystemEnv};
pub use error::{Error, Result, exit_code};
pub use process::{ArgFlags, Process, ProcessFlags, StreamMode};
pub use runtime::{Context, FailurePolicy, InterruptFlag, Phases, ThreadPool};
pub use scheduler::TaskManager;
pub use task::{CleanFlags, CommandTask, Phase, Task, TaskContext, make_names};
pub use tool::{ProcessTool, Tool, ToolContext, build_loop};
