//! Fluent builder for the run-wide [`Context`].
//!
//! Every setting has a default, so `ContextBuilder::new().build()` gives a
//! working context that spawns real processes on all hardware threads.

use std::sync::Arc;
use std::time::Duration;

use crate::log::OutputLock;
use crate::process::{PosixSpawner, Spawner};
use crate::runtime::{Config, Context, FailurePolicy, InterruptFlag, Phases};
use crate::task::CleanFlags;

/// Builder for constructing a [`Context`] with fluent API.
///
/// # Example
/// ```ignore
/// let cx = ContextBuilder::new()
///     .dry_run(true)
///     .thread_count(4)
///     .build();
/// ```
pub struct ContextBuilder {
    config: Config,
    output: Option<OutputLock>,
    interrupt: Option<InterruptFlag>,
    spawner: Option<Arc<dyn Spawner>>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            output: None,
            interrupt: None,
            spawner: None,
        }
    }

    /// Logs commands instead of running them.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    /// Overrides the number of worker threads.
    pub fn thread_count(mut self, count: usize) -> Self {
        self.config.thread_count = Some(count);
        self
    }

    /// How long a process waits between two checks of its child.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn phases(mut self, phases: Phases) -> Self {
        self.config.phases = phases;
        self
    }

    pub fn clean_flags(mut self, flags: CleanFlags) -> Self {
        self.config.clean_flags = flags;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    /// Shares an output lock with a subscriber installed beforehand.
    pub fn output_lock(mut self, lock: OutputLock) -> Self {
        self.output = Some(lock);
        self
    }

    /// Uses an existing flag as the run-wide interrupt flag.
    pub fn interrupt_flag(mut self, flag: InterruptFlag) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// Replaces the OS process creation shim.
    pub fn spawner(mut self, spawner: impl Spawner + 'static) -> Self {
        self.spawner = Some(Arc::new(spawner));
        self
    }

    /// Builds the context.
    ///
    /// Consumes the builder; the returned context is read-only.
    ///
    /// # Returns
    /// A shared handle to the new context
    pub fn build(self) -> Arc<Context> {
        let spawner: Arc<dyn Spawner> = match self.spawner {
            Some(spawner) => spawner,
            None => Arc::new(PosixSpawner),
        };

        Arc::new(Context::new(
            self.config,
            self.output.unwrap_or_default(),
            self.interrupt.unwrap_or_default(),
            spawner,
        ))
    }
}
