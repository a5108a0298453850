// tests/sqlite_store.rs

mod common;

use std::sync::Arc;

use cinder::dag::{JobStatus, Outcome};
use cinder::engine::{Coordinator, SystemClock};
use cinder::log::LogLine;
use cinder::store::Store;
use cinder_test_utils::{init_tracing, BuildDefinitionBuilder};
use tempfile::TempDir;

use common::{complete, queue_settings, runner, statuses};

fn open(dir: &TempDir) -> Arc<Coordinator> {
    let path = dir.path().join("cinder.db");
    let store = Store::sqlite(path.to_str().unwrap()).unwrap();
    Arc::new(Coordinator::new(store, Arc::new(SystemClock), queue_settings()))
}

#[test]
fn build_state_and_logs_survive_reopening() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let (build, job) = {
        let c = open(&dir);
        let r = runner(&c, "r1");
        let build = c
            .submit_build(
                &BuildDefinitionBuilder::new("durable")
                    .with_simple_job("compile", &[])
                    .with_simple_job("test", &["compile"])
                    .build(),
            )
            .unwrap();

        let grant = c.poll_for_work(&r).unwrap().unwrap();
        c.append_log(
            &r,
            &grant.item_id,
            &[LogLine::line(1, "cc -c main.c"), LogLine::line(2, "done")],
        )
        .unwrap();
        complete(&c, &r, &grant, Outcome::Succeeded);
        (build, grant.job.id)
    };

    let c = open(&dir);
    let s = statuses(&c, &build);
    assert_eq!(s["compile"], JobStatus::Succeeded);
    assert_eq!(s["test"], JobStatus::Queued);

    let lines = c.fetch_log_lines(&job, 0, None).unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1].text, "done");
    assert!(c.fetch_log_descriptor(&job).unwrap().sealed);

    // Credentials are not persisted; a reopened server re-registers runners.
    let r = runner(&c, "r1");
    let grant = c.poll_for_work(&r).unwrap().unwrap();
    assert_eq!(grant.job.name, "test");
    complete(&c, &r, &grant, Outcome::Succeeded);
    assert_eq!(c.build_snapshot(&build).unwrap().status, JobStatus::Succeeded);
}

#[test]
fn concurrent_polls_on_sqlite_lease_once() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let c = open(&dir);
    let r1 = runner(&c, "r1");
    let r2 = runner(&c, "r2");
    c.submit_build(&BuildDefinitionBuilder::new("one").with_simple_job("x", &[]).build())
        .unwrap();

    let (a, b) = std::thread::scope(|s| {
        let t1 = s.spawn(|| c.poll_for_work(&r1).unwrap());
        let t2 = s.spawn(|| c.poll_for_work(&r2).unwrap());
        (t1.join().unwrap(), t2.join().unwrap())
    });
    assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
}
