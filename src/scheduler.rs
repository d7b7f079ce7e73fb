//! Runs the task graph on a bounded thread pool.
//!
//! A run goes phase by phase (clean, fetch, build and install). Within a
//! phase, a task is launched once every task it depends on has finished that
//! same phase. A task that fails, or is skipped because a dependency failed,
//! takes no part in later phases and neither do its dependents.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::log::{self, Level, Reason};
use crate::runtime::{Context, FailurePolicy, InterruptFlag, ThreadPool};
use crate::task::{Phase, Task, TaskContext, TaskHandle, run_phase};

struct Entry {
    task: Arc<dyn Task>,
    handle: Arc<TaskHandle>,
}

/// Tasks in execution order, with each task's resolved dependencies.
struct Plan {
    order: Vec<usize>,
    // indexed like `TaskManager::tasks`, only filled for planned tasks
    deps: Vec<Vec<usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Waiting,
    Running,
    Done,
}

type Finished = (usize, Result<()>);

/// Owns every task and runs them.
///
/// `run_all` and `interrupt_all` both take `&self`, so the manager can be
/// shared with whatever watches for cancellation.
#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<Entry>,
    // picked by name, in place of every enabled task
    selected: Option<Vec<usize>>,
    interrupted: InterruptFlag,
    running: Mutex<Vec<Arc<TaskHandle>>>,
    // contexts of the runs in progress
    active: Mutex<Vec<Arc<Context>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task. A task whose name is already taken is ignored.
    pub fn add<T: Task + 'static>(&mut self, task: T) -> &mut Self {
        if let Some(existing) = task.names().iter().find(|name| self.position(name).is_some()) {
            log::emit(
                Reason::Task,
                Level::Warning,
                &format!("task {existing} already exists, ignoring"),
            );

            return self;
        }

        let handle = TaskHandle::new(task.name());

        self.tasks.push(Entry {
            task: Arc::new(task),
            handle,
        });

        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Finds a task by name or alias.
    pub fn find(&self, name: &str) -> Option<&dyn Task> {
        self.position(name).map(|i| self.tasks[i].task.as_ref())
    }

    /// Stable names of every task, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|entry| entry.task.name()).collect()
    }

    /// Restricts runs to the named tasks and whatever they depend on.
    ///
    /// Names match aliases too. A selected task runs even if it's disabled.
    /// An empty list goes back to running every enabled task.
    pub fn select<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        if names.is_empty() {
            self.selected = None;
            return Ok(());
        }

        let mut selected = Vec::with_capacity(names.len());

        for name in names {
            let name = name.as_ref();
            let i = self
                .position(name)
                .ok_or_else(|| Error::UnknownTask(name.to_string()))?;

            selected.push(i);
        }

        selected.sort_unstable();
        selected.dedup();
        self.selected = Some(selected);

        Ok(())
    }

    /// Interrupts every running task and keeps new ones from starting.
    /// Safe to call from any thread, any number of times.
    ///
    /// The context of a run in progress is interrupted as well, which stops
    /// processes a task runs without going through a tool.
    pub fn interrupt_all(&self) {
        if !self.interrupted.is_set() {
            log::emit(Reason::Interruption, Level::Info, "interrupting all tasks");
        }

        self.interrupted.set();

        for cx in self.active.lock().iter() {
            cx.interrupt_flag().set();
        }

        self.interrupt_running();
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.is_set()
    }

    /// Runs every enabled task (or the selected ones) and their dependencies
    /// through every enabled phase.
    ///
    /// # Returns
    /// - `Err(Error::Interrupted)` if the run was interrupted
    /// - `Err(Error::RunFailed)` listing the tasks that failed
    /// - `Err(Error::UnknownTask)` or `Err(Error::DependencyCycle)` if the
    ///   graph is broken, before anything runs
    pub fn run_all(&self, cx: &Arc<Context>) -> Result<()> {
        self.active.lock().push(cx.clone());

        let result = self.run_planned(cx);

        self.active.lock().retain(|active| !Arc::ptr_eq(active, cx));

        result
    }

    fn run_planned(&self, cx: &Arc<Context>) -> Result<()> {
        for entry in &self.tasks {
            entry.handle.reset();
        }

        let plan = self.plan()?;

        if plan.order.is_empty() {
            log::emit(Reason::Task, Level::Info, "no tasks to run");
            return Ok(());
        }

        log::emit(
            Reason::Task,
            Level::Debug,
            &format!(
                "running {}",
                plan.order
                    .iter()
                    .map(|&i| self.name(i))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        );

        let mut failed = vec![false; self.tasks.len()];
        let mut failures = Vec::new();

        for phase in cx.config().phases.iter() {
            if self.stopping(cx) || self.aborted(cx, &failures) {
                break;
            }

            self.run_wave(cx, phase, &plan, &mut failed, &mut failures)?;
        }

        if self.stopping(cx) {
            log::emit(Reason::Interruption, Level::Info, "run was interrupted");
            return Err(Error::Interrupted);
        }

        if !failures.is_empty() {
            return Err(Error::RunFailed(failures));
        }

        Ok(())
    }

    fn run_wave(
        &self,
        cx: &Arc<Context>,
        phase: Phase,
        plan: &Plan,
        failed: &mut [bool],
        failures: &mut Vec<String>,
    ) -> Result<()> {
        let mut status = vec![Status::Done; self.tasks.len()];
        for &i in &plan.order {
            if !failed[i] {
                status[i] = Status::Waiting;
            }
        }

        let (tx, rx) = mpsc::channel::<Finished>();
        let mut pool = ThreadPool::new(cx.config().thread_count);
        let mut in_flight = 0usize;
        let mut stopped = false;

        loop {
            if !stopped && self.stopping(cx) {
                stopped = true;
                self.interrupt_running();
            }

            if !stopped && self.aborted(cx, failures) {
                log::emit(
                    Reason::Task,
                    Level::Debug,
                    "a task failed, not starting anything else",
                );
                stopped = true;
            }

            if !stopped {
                self.launch_ready(cx, phase, plan, &mut status, failed, &mut pool, &tx, &mut in_flight)?;
            }

            if in_flight == 0 {
                if stopped || !status.contains(&Status::Waiting) {
                    break;
                }

                // a slot can still look busy right after its job reported back
                thread::sleep(Duration::from_millis(1));
                continue;
            }

            match rx.recv_timeout(cx.config().poll_interval) {
                Ok((i, result)) => {
                    in_flight -= 1;
                    status[i] = Status::Done;

                    let handle = &self.tasks[i].handle;
                    self.running.lock().retain(|h| !Arc::ptr_eq(h, handle));

                    match result {
                        Ok(()) => {
                            log::emit(
                                Reason::Task,
                                Level::Debug,
                                &format!("{}: {phase} done", self.name(i)),
                            );
                        }

                        Err(e) if e.is_interruption() => {
                            failed[i] = true;
                            log::emit(
                                Reason::Interruption,
                                Level::Info,
                                &format!("{}: interrupted", self.name(i)),
                            );
                        }

                        Err(e) => {
                            failed[i] = true;
                            failures.push(self.name(i).to_string());
                            log::emit(Reason::Task, Level::Error, &e.to_string());
                        }
                    }
                }

                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        pool.join();

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn launch_ready(
        &self,
        cx: &Arc<Context>,
        phase: Phase,
        plan: &Plan,
        status: &mut [Status],
        failed: &mut [bool],
        pool: &mut ThreadPool,
        tx: &Sender<Finished>,
        in_flight: &mut usize,
    ) -> Result<()> {
        for &i in &plan.order {
            if status[i] != Status::Waiting {
                continue;
            }

            if let Some(&dep) = plan.deps[i].iter().find(|&&d| failed[d]) {
                status[i] = Status::Done;
                failed[i] = true;

                let skipped = Error::DependencyFailed {
                    task: self.name(i).to_string(),
                    dependency: self.name(dep).to_string(),
                };

                log::emit(Reason::Task, Level::Warning, &skipped.to_string());
                continue;
            }

            if !plan.deps[i].iter().all(|&d| status[d] == Status::Done) {
                continue;
            }

            let handle = self.tasks[i].handle.clone();
            let job = make_job(cx, self.tasks[i].task.clone(), handle.clone(), phase, i, tx.clone());

            if pool.try_add(job)?.is_some() {
                // every slot is busy
                break;
            }

            status[i] = Status::Running;
            *in_flight += 1;
            self.running.lock().push(handle);
        }

        Ok(())
    }

    fn plan(&self) -> Result<Plan> {
        let n = self.tasks.len();
        let mut deps = vec![Vec::new(); n];
        let mut included = vec![false; n];

        let mut stack: Vec<usize> = match &self.selected {
            Some(selected) => selected.iter().rev().copied().collect(),
            None => (0..n).filter(|&i| self.tasks[i].task.enabled()).rev().collect(),
        };

        while let Some(i) = stack.pop() {
            if included[i] {
                continue;
            }

            included[i] = true;

            for name in self.tasks[i].task.dependencies() {
                let j = self
                    .position(name)
                    .ok_or_else(|| Error::UnknownTask(name.clone()))?;

                deps[i].push(j);

                if !included[j] {
                    stack.push(j);
                }
            }

            deps[i].sort_unstable();
            deps[i].dedup();
        }

        let mut indegree = vec![0usize; n];
        let mut dependents = vec![Vec::new(); n];

        for i in (0..n).filter(|&i| included[i]) {
            indegree[i] = deps[i].len();

            for &d in &deps[i] {
                dependents[d].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| included[i] && indegree[i] == 0).collect();
        let mut order = Vec::new();

        while let Some(i) = ready.pop_front() {
            order.push(i);

            for &d in &dependents[i] {
                indegree[d] -= 1;

                if indegree[d] == 0 {
                    ready.push_back(d);
                }
            }
        }

        let planned = included.iter().filter(|&&b| b).count();

        if order.len() < planned {
            let cycle = (0..n)
                .filter(|&i| included[i] && indegree[i] > 0)
                .map(|i| self.name(i).to_string())
                .collect();

            return Err(Error::DependencyCycle(cycle));
        }

        Ok(Plan { order, deps })
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.tasks
            .iter()
            .position(|entry| entry.task.names().iter().any(|n| n == name))
    }

    fn name(&self, i: usize) -> &str {
        self.tasks[i].task.name()
    }

    fn stopping(&self, cx: &Context) -> bool {
        self.interrupted.is_set() || cx.interrupted()
    }

    fn aborted(&self, cx: &Context, failures: &[String]) -> bool {
        cx.config().failure_policy == FailurePolicy::AbortRun && !failures.is_empty()
    }

    fn interrupt_running(&self) {
        for handle in self.running.lock().iter() {
            handle.interrupt();
        }
    }
}

fn make_job(
    cx: &Arc<Context>,
    task: Arc<dyn Task>,
    handle: Arc<TaskHandle>,
    phase: Phase,
    index: usize,
    tx: Sender<Finished>,
) -> impl FnOnce() + Send + 'static {
    let cx = cx.clone();

    move || {
        // every line logged by the job carries the task and phase
        let span = tracing::info_span!("task", name = %task.name(), phase = %phase);
        let _entered = span.enter();

        let tcx = TaskContext::new(&cx, handle, phase);

        let result = panic::catch_unwind(AssertUnwindSafe(|| run_phase(task.as_ref(), &tcx)))
            .unwrap_or_else(|payload| {
                Err(Error::Panicked {
                    task: task.name().to_string(),
                    message: panic_message(payload.as_ref()),
                })
            })
            .map_err(|e| {
                if e.is_interruption() {
                    e
                } else {
                    Error::TaskFailed {
                        task: task.name().to_string(),
                        phase,
                        source: Box::new(e),
                    }
                }
            });

        // the receiver only goes away once the wave is over
        let _ = tx.send((index, result));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CommandTask;

    #[test]
    fn test_plan_orders_dependencies_first() {
        let mut tm = TaskManager::new();
        tm.add(CommandTask::new("app").depends_on("lib"));
        tm.add(CommandTask::new("lib").depends_on("zlib"));
        tm.add(CommandTask::new("zlib"));

        let plan = tm.plan().unwrap();
        let names: Vec<_> = plan.order.iter().map(|&i| tm.name(i)).collect();

        assert_eq!(names, ["zlib", "lib", "app"]);
    }

    #[test]
    fn test_disabled_task_pulled_in_by_dependency() {
        let mut tm = TaskManager::new();
        tm.add(CommandTask::new("app").depends_on("lib"));
        tm.add(CommandTask::new("lib").disabled());
        tm.add(CommandTask::new("unused").disabled());

        let plan = tm.plan().unwrap();
        let names: Vec<_> = plan.order.iter().map(|&i| tm.name(i)).collect();

        assert_eq!(names, ["lib", "app"]);
    }

    #[test]
    fn test_selection_replaces_enabled_tasks() {
        let mut tm = TaskManager::new();
        tm.add(CommandTask::new("app").depends_on("lib"));
        tm.add(CommandTask::new("lib"));
        tm.add(CommandTask::new("tool"));
        tm.add(CommandTask::new("docs").alias("manual").disabled());

        tm.select(&["manual", "app"]).unwrap();

        let plan = tm.plan().unwrap();
        let names: Vec<_> = plan.order.iter().map(|&i| tm.name(i)).collect();

        assert_eq!(names, ["lib", "docs", "app"]);

        tm.select::<&str>(&[]).unwrap();
        assert_eq!(tm.plan().unwrap().order.len(), 3);
    }

    #[test]
    fn test_selecting_unknown_task() {
        let mut tm = TaskManager::new();
        tm.add(CommandTask::new("app"));

        assert!(matches!(tm.select(&["nope"]), Err(Error::UnknownTask(name)) if name == "nope"));
        assert_eq!(tm.plan().unwrap().order.len(), 1);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut tm = TaskManager::new();
        tm.add(CommandTask::new("a").depends_on("a"));

        assert!(matches!(tm.plan(), Err(Error::DependencyCycle(names)) if names == ["a"]));
    }

    #[test]
    fn test_duplicate_names_ignored() {
        let mut tm = TaskManager::new();
        tm.add(CommandTask::new("a"));
        tm.add(CommandTask::new("b").alias("a"));

        assert_eq!(tm.len(), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }
}
