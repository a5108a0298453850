// tests/scheduling.rs

mod common;

use std::sync::Arc;
use std::time::Duration;

use cinder::dag::{JobGraph, JobStatus, Outcome};
use cinder::engine::SystemClock;
use cinder::errors::CinderError;
use cinder_test_utils::{BuildDefinitionBuilder, JobDefinitionBuilder, ManualClock};

use common::{complete, coordinator, drain, runner, statuses};

fn fan_in() -> cinder::config::BuildDefinition {
    BuildDefinitionBuilder::new("fan-in")
        .with_simple_job("A", &[])
        .with_simple_job("C", &[])
        .with_simple_job("D", &["A", "C"])
        .build()
}

#[test]
fn fan_in_build_runs_dependencies_before_dependent() {
    let c = coordinator(Arc::new(SystemClock));
    let r = runner(&c, "r1");
    let build = c.submit_build(&fan_in()).unwrap();

    let graph = JobGraph::new(c.list_jobs(&build).unwrap());
    let mut eligible: Vec<_> = graph.eligible().iter().map(|j| j.name.clone()).collect();
    eligible.sort();
    assert_eq!(eligible, vec!["A", "C"]);

    let first = c.poll_for_work(&r).unwrap().unwrap();
    let second = c.poll_for_work(&r).unwrap().unwrap();
    assert!(c.poll_for_work(&r).unwrap().is_none(), "D must wait for A and C");

    complete(&c, &r, &first, Outcome::Succeeded);
    assert_eq!(c.build_snapshot(&build).unwrap().status, JobStatus::Running);
    complete(&c, &r, &second, Outcome::Succeeded);

    let graph = JobGraph::new(c.list_jobs(&build).unwrap());
    let eligible: Vec<_> = graph.eligible().iter().map(|j| j.name.clone()).collect();
    assert_eq!(eligible, vec!["D"]);
    assert_eq!(c.build_snapshot(&build).unwrap().status, JobStatus::Running);

    let d = c.poll_for_work(&r).unwrap().unwrap();
    assert_eq!(d.job.name, "D");
    assert_eq!(complete(&c, &r, &d, Outcome::Succeeded), JobStatus::Succeeded);

    let snapshot = c.build_snapshot(&build).unwrap();
    assert_eq!(snapshot.status, JobStatus::Succeeded);
    assert_eq!(snapshot.build.error, None);
    assert!(snapshot.jobs.iter().all(|j| j.timings.finished_at.is_some()));
}

#[test]
fn failed_dependency_skips_dependent_without_leasing_it() {
    let c = coordinator(Arc::new(SystemClock));
    let r = runner(&c, "r1");
    let build = c.submit_build(&fan_in()).unwrap();

    let mut grants = vec![
        c.poll_for_work(&r).unwrap().unwrap(),
        c.poll_for_work(&r).unwrap().unwrap(),
    ];
    grants.sort_by(|a, b| a.job.name.cmp(&b.job.name));
    c.report_completion(&r, &grants[0].item_id, Outcome::Failed, Some("exit 2".into()))
        .unwrap();

    let s = statuses(&c, &build);
    assert_eq!(s["A"], JobStatus::Failed);
    assert_eq!(s["D"], JobStatus::Skipped);
    assert_eq!(c.build_snapshot(&build).unwrap().status, JobStatus::Failed);

    complete(&c, &r, &grants[1], Outcome::Succeeded);
    assert!(c.poll_for_work(&r).unwrap().is_none());

    let snapshot = c.build_snapshot(&build).unwrap();
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.build.error.as_deref(), Some("1 job(s) failed"));
    let a = snapshot.jobs.iter().find(|j| j.name == "A").unwrap();
    assert_eq!(a.error.as_deref(), Some("exit 2"));

    let d = snapshot.jobs.iter().find(|j| j.name == "D").unwrap();
    assert!(c.fetch_log_descriptor(&d.id).unwrap().sealed);
}

#[test]
fn run_policy_runs_dependent_after_failure() {
    let c = coordinator(Arc::new(SystemClock));
    let r = runner(&c, "r1");
    let def = BuildDefinitionBuilder::new("cleanup")
        .with_simple_job("work", &[])
        .with_job(
            "cleanup",
            JobDefinitionBuilder::new("rm -rf tmp")
                .after(&["work"])
                .run_on_dependency_failure()
                .build(),
        )
        .build();
    let build = c.submit_build(&def).unwrap();

    let work = c.poll_for_work(&r).unwrap().unwrap();
    complete(&c, &r, &work, Outcome::Failed);

    let cleanup = c.poll_for_work(&r).unwrap().unwrap();
    assert_eq!(cleanup.job.name, "cleanup");
    complete(&c, &r, &cleanup, Outcome::Succeeded);

    assert_eq!(c.build_snapshot(&build).unwrap().status, JobStatus::Failed);
}

#[test]
fn skips_cascade_through_chains() {
    let c = coordinator(Arc::new(SystemClock));
    let r = runner(&c, "r1");
    let def = BuildDefinitionBuilder::new("chain")
        .with_simple_job("a", &[])
        .with_simple_job("b", &["a"])
        .with_simple_job("c", &["b"])
        .build();
    let build = c.submit_build(&def).unwrap();

    let a = c.poll_for_work(&r).unwrap().unwrap();
    complete(&c, &r, &a, Outcome::Failed);

    let s = statuses(&c, &build);
    assert_eq!(s["b"], JobStatus::Skipped);
    assert_eq!(s["c"], JobStatus::Skipped);
}

#[test]
fn cyclic_build_is_rejected_before_anything_is_stored() {
    let c = coordinator(Arc::new(SystemClock));
    let def = BuildDefinitionBuilder::new("loop")
        .with_simple_job("a", &["b"])
        .with_simple_job("b", &["a"])
        .build();

    assert!(matches!(c.submit_build(&def), Err(CinderError::GraphCycle(_))));
    assert!(c.list_builds().unwrap().is_empty());
}

#[test]
fn cancel_stops_pending_jobs_and_is_idempotent() {
    let c = coordinator(Arc::new(SystemClock));
    let r = runner(&c, "r1");
    let build = c.submit_build(&fan_in()).unwrap();
    let running = c.poll_for_work(&r).unwrap().unwrap();

    assert_eq!(c.cancel_build(&build).unwrap(), JobStatus::Canceled);
    assert!(statuses(&c, &build).values().all(|s| *s == JobStatus::Canceled));
    assert!(c.poll_for_work(&r).unwrap().is_none());

    // The runner of a canceled job loses its item.
    assert!(c.heartbeat(&r, &running.item_id).unwrap_err().is_not_found());

    assert_eq!(c.cancel_build(&build).unwrap(), JobStatus::Canceled);
}

#[test]
fn builds_are_served_in_submission_order() {
    let clock = Arc::new(ManualClock::new());
    let c = coordinator(clock.clone());
    let r = runner(&c, "r1");
    let first = c
        .submit_build(&BuildDefinitionBuilder::new("one").with_simple_job("x", &[]).build())
        .unwrap();
    clock.advance(Duration::from_secs(1));
    let second = c
        .submit_build(&BuildDefinitionBuilder::new("two").with_simple_job("y", &[]).build())
        .unwrap();

    assert_eq!(drain(&c, &r), vec!["x", "y"]);
    assert_eq!(c.list_builds().unwrap()[0].id, second);
    assert_eq!(c.build_snapshot(&first).unwrap().status, JobStatus::Succeeded);
}
