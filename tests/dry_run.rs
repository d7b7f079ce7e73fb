use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use stagerun::process::{Child, PosixSpawner, SpawnRequest, Spawner};
use stagerun::{CommandTask, ContextBuilder, Process, Result, TaskManager};

/// Counts spawns and hands them to the real spawner.
struct CountingSpawner {
    spawned: Arc<AtomicUsize>,
}

impl Spawner for CountingSpawner {
    fn spawn(&self, request: SpawnRequest<'_>) -> Result<Box<dyn Child>> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        PosixSpawner.spawn(request)
    }
}

fn builder(spawned: &Arc<AtomicUsize>) -> ContextBuilder {
    ContextBuilder::new()
        .poll_interval(Duration::from_millis(10))
        .spawner(CountingSpawner {
            spawned: spawned.clone(),
        })
}

#[test]
fn test_dry_run_spawns_nothing() {
    let spawned = Arc::new(AtomicUsize::new(0));
    let cx = builder(&spawned).dry_run(true).build();

    let mut tm = TaskManager::new();
    tm.add(CommandTask::new("lib").fetch_cmd("exit 1").build_cmd("exit 1"));
    tm.add(CommandTask::new("app").depends_on("lib").build_cmd("exit 1"));

    tm.run_all(&cx).unwrap();

    assert_eq!(spawned.load(Ordering::SeqCst), 0);
}

#[test]
fn test_dry_run_process_reports_success() {
    let spawned = Arc::new(AtomicUsize::new(0));
    let cx = builder(&spawned).dry_run(true).build();

    let mut process = Process::new(&cx).raw("exit 1");

    assert_eq!(process.run_and_join().unwrap(), 0);
    assert_eq!(spawned.load(Ordering::SeqCst), 0);
}

#[test]
fn test_real_run_goes_through_the_spawner() {
    let spawned = Arc::new(AtomicUsize::new(0));
    let cx = builder(&spawned).build();

    let mut tm = TaskManager::new();
    tm.add(CommandTask::new("a").fetch_cmd("true").build_cmd("true"));
    tm.add(CommandTask::new("b").build_cmd("true"));

    tm.run_all(&cx).unwrap();

    assert_eq!(spawned.load(Ordering::SeqCst), 3);
}
