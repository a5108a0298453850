// tests/internal_runners.rs

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use cinder::config::InternalRunnerSettings;
use cinder::dag::JobStatus;
use cinder::exec::InternalRunnerManager;
use cinder_test_utils::{eventually, BuildDefinitionBuilder, ManualClock, Script, ScriptedExecutor};

use common::{coordinator, runner, statuses, LEASE_TIMEOUT};

fn settings(grace_period: Duration) -> InternalRunnerSettings {
    InternalRunnerSettings {
        count: 1,
        poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(20),
        grace_period,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_aborts_jobs_that_outlive_the_grace_period() {
    let clock = Arc::new(ManualClock::new());
    let c = coordinator(clock.clone());
    let build = c
        .submit_build(&BuildDefinitionBuilder::new("slow").with_simple_job("soak", &[]).build())
        .unwrap();

    let executor = ScriptedExecutor::new().script("soak", Script::succeed().with_delay(Duration::from_secs(30)));
    let grace = Duration::from_millis(300);
    let mut manager = InternalRunnerManager::new(c.clone(), Arc::new(executor.clone()), settings(grace));
    manager.start().unwrap();
    assert_eq!(manager.running(), 1);

    eventually("internal runner picks up the job", || executor.executed_count("soak") == 1).await;
    assert_eq!(statuses(&c, &build)["soak"], JobStatus::Running);

    let started = Instant::now();
    manager.stop().await.unwrap();
    let waited = started.elapsed();
    assert!(waited >= grace, "stopped after {waited:?}, before the grace period");
    assert!(waited < grace + Duration::from_secs(2), "stop took {waited:?}");
    assert_eq!(manager.running(), 0);
    assert!(!c.registry().is_allowed("internal-0").unwrap());

    // The aborted job still holds its lease until the heartbeat timeout.
    assert_eq!(statuses(&c, &build)["soak"], JobStatus::Running);
    let r1 = runner(&c, "r1");
    assert!(c.poll_for_work(&r1).unwrap().is_none());

    clock.advance(LEASE_TIMEOUT + Duration::from_secs(1));
    assert_eq!(c.reclaim_expired_leases().unwrap(), 1);
    let grant = c.poll_for_work(&r1).unwrap().expect("reclaimed job is leasable again");
    assert_eq!(grant.job.name, "soak");
    assert_eq!(grant.attempt, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_waits_for_idle_runners_without_aborting() {
    let c = coordinator(Arc::new(ManualClock::new()));
    let mut manager =
        InternalRunnerManager::new(c.clone(), Arc::new(ScriptedExecutor::new()), settings(Duration::from_secs(5)));
    manager.start().unwrap();
    manager.start().unwrap();
    assert_eq!(manager.running(), 1);

    let started = Instant::now();
    manager.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!c.registry().is_allowed("internal-0").unwrap());

    manager.stop().await.unwrap();
}
