use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use stagerun::log::OutputLock;
use stagerun::runtime::DEFAULT_POLL_INTERVAL;
use stagerun::{CleanFlags, ContextBuilder, FailurePolicy, InterruptFlag, Phase, Phases};

#[test]
fn test_builder_defaults() {
    let cx = ContextBuilder::new().build();
    let config = cx.config();

    assert!(!cx.dry_run());
    assert!(!cx.interrupted());
    assert_eq!(config.thread_count, None);
    assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
    assert_eq!(config.phases, Phases::default());
    assert!(config.clean_flags.is_empty());
    assert_eq!(config.failure_policy, FailurePolicy::AbortDependents);
}

#[test]
fn test_builder_overrides() {
    let cx = ContextBuilder::new()
        .dry_run(true)
        .thread_count(3)
        .poll_interval(Duration::from_millis(5))
        .clean_flags(CleanFlags::REBUILD | CleanFlags::RECONFIGURE)
        .failure_policy(FailurePolicy::AbortRun)
        .build();

    let config = cx.config();

    assert!(cx.dry_run());
    assert_eq!(config.thread_count, Some(3));
    assert_eq!(config.poll_interval, Duration::from_millis(5));
    assert!(config.clean_flags.contains(CleanFlags::REBUILD));
    assert!(!config.clean_flags.contains(CleanFlags::RECLONE));
    assert_eq!(config.failure_policy, FailurePolicy::AbortRun);
}

#[test]
fn test_phases_iterate_in_order() {
    let phases = Phases {
        clean: false,
        fetch: true,
        build: true,
    };

    let cx = ContextBuilder::new().phases(phases).build();
    let enabled: Vec<_> = cx.config().phases.iter().collect();

    assert_eq!(enabled, [Phase::Fetch, Phase::BuildAndInstall]);
    assert!(!cx.config().phases.enabled(Phase::Clean));
}

#[test]
fn test_shared_interrupt_flag() {
    let flag = InterruptFlag::new();

    let first = ContextBuilder::new().interrupt_flag(flag.clone()).build();
    let second = ContextBuilder::new().interrupt_flag(flag.clone()).build();
    let unrelated = ContextBuilder::new().build();

    flag.set();

    assert!(first.interrupted());
    assert!(second.interrupted());
    assert!(!unrelated.interrupted());
}

#[test]
fn test_multiple_contexts_are_independent() {
    let a = ContextBuilder::new().thread_count(1).build();
    let b = ContextBuilder::new().thread_count(8).build();

    a.interrupt_flag().set();

    assert!(a.interrupted());
    assert!(!b.interrupted());
    assert_eq!(b.config().thread_count, Some(8));
}

#[test]
fn test_output_lock_is_shared_with_the_context() {
    let lock = OutputLock::new();
    let cx = ContextBuilder::new().output_lock(lock.clone()).build();

    let guard = cx.output_lock().lock();
    let acquired = Arc::new(AtomicBool::new(false));

    let writer = {
        let acquired = acquired.clone();
        thread::spawn(move || {
            let _guard = lock.lock();
            acquired.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!acquired.load(Ordering::SeqCst));

    drop(guard);
    writer.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
}
