//! Runtime subsystem modules.

pub mod context;
pub mod pool;

pub use context::{Config, Context, DEFAULT_POLL_INTERVAL, FailurePolicy, InterruptFlag, Phases};
pub use pool::ThreadPool;
