//! Run-wide context shared by every worker.
//!
//! A [`Context`] is built once by [`ContextBuilder`](crate::ContextBuilder)
//! and then frozen. It replaces process-wide globals: the captured process
//! environment, the output lock, the interrupt flag, the spawner and the
//! configuration are all reached through the `Arc<Context>` handed to tasks,
//! tools and processes.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::env::SystemEnv;
use crate::log::OutputLock;
use crate::process::Spawner;
use crate::task::{CleanFlags, Phase};

/// Default wait between two checks of a running child.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cooperative cancellation flag. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Which phases a run goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phases {
    pub clean: bool,
    pub fetch: bool,
    pub build: bool,
}

impl Default for Phases {
    fn default() -> Self {
        Self {
            clean: true,
            fetch: true,
            build: true,
        }
    }
}

impl Phases {
    pub fn enabled(&self, phase: Phase) -> bool {
        match phase {
            Phase::Clean => self.clean,
            Phase::Fetch => self.fetch,
            Phase::BuildAndInstall => self.build,
        }
    }

    /// Enabled phases, in execution order.
    pub fn iter(&self) -> impl Iterator<Item = Phase> + '_ {
        Phase::ALL.into_iter().filter(|&phase| self.enabled(phase))
    }
}

/// What a failed task takes down with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Tasks depending on the failed one are skipped, others keep going.
    #[default]
    AbortDependents,
    /// Nothing new is started after the first failure.
    AbortRun,
}

/// Read-only settings of a run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log commands without starting any process.
    pub dry_run: bool,
    /// Worker count, hardware concurrency when `None`.
    pub thread_count: Option<usize>,
    pub poll_interval: Duration,
    pub phases: Phases,
    pub clean_flags: CleanFlags,
    pub failure_policy: FailurePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dry_run: false,
            thread_count: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            phases: Phases::default(),
            clean_flags: CleanFlags::empty(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

pub struct Context {
    config: Config,
    system_env: SystemEnv,
    output: OutputLock,
    interrupt: InterruptFlag,
    spawner: Arc<dyn Spawner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("interrupted", &self.interrupt.is_set())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn new(
        config: Config,
        output: OutputLock,
        interrupt: InterruptFlag,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        Self {
            config,
            system_env: SystemEnv::new(),
            output,
            interrupt,
            spawner,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// This process's environment.
    pub fn system_env(&self) -> &SystemEnv {
        &self.system_env
    }

    pub fn output_lock(&self) -> &OutputLock {
        &self.output
    }

    /// The run-wide interrupt flag; setting it interrupts every process
    /// started from this context.
    pub fn interrupt_flag(&self) -> &InterruptFlag {
        &self.interrupt
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.is_set()
    }

    pub fn spawner(&self) -> &dyn Spawner {
        self.spawner.as_ref()
    }
}
