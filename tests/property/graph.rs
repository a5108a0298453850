use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cinder::config::BuildDefinition;
use cinder::dag::{JobStatus, Outcome};
use cinder::engine::{Coordinator, Credentials, SystemClock};
use cinder::store::Store;
use cinder_test_utils::{BuildDefinitionBuilder, JobDefinitionBuilder};
use proptest::prelude::*;

#[derive(Debug, Clone)]
struct Case {
    def: BuildDefinition,
    failing: BTreeSet<String>,
}

fn name(i: usize) -> String {
    format!("job_{i}")
}

// Acyclic by construction: job N may only depend on jobs 0..N-1.
fn case_strategy(max_jobs: usize) -> impl Strategy<Value = Case> {
    (1..=max_jobs).prop_flat_map(|n| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n),
            proptest::collection::vec(any::<bool>(), n),
            proptest::collection::vec(proptest::bool::weighted(0.2), n),
        )
            .prop_map(move |(raw_deps, run_policy, fails)| {
                let mut builder = BuildDefinitionBuilder::new("prop");
                let mut failing = BTreeSet::new();
                for i in 0..n {
                    let deps: BTreeSet<String> = if i == 0 {
                        BTreeSet::new()
                    } else {
                        raw_deps[i].iter().map(|d| name(d % i)).collect()
                    };
                    let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                    let mut job = JobDefinitionBuilder::new("true").after(&deps);
                    if run_policy[i] {
                        job = job.run_on_dependency_failure();
                    }
                    builder = builder.with_job(&name(i), job.build());
                    if fails[i] {
                        failing.insert(name(i));
                    }
                }
                Case {
                    def: builder.build(),
                    failing,
                }
            })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn scheduling_respects_dependencies_and_terminates(case in case_strategy(10)) {
        let c = Coordinator::new(Store::memory(), Arc::new(SystemClock), Default::default());
        c.registry().allow("r", "t", false).unwrap();
        let session = c.register_runner(&Credentials { name: "r".into(), token: "t".into() }).unwrap();
        let build = c.submit_build(&case.def).unwrap();

        let mut leased = BTreeSet::new();
        let mut polls = 0;
        while let Some(grant) = c.poll_for_work(&session).unwrap() {
            polls += 1;
            prop_assert!(polls <= case.def.job.len(), "more leases than jobs");

            let jobs: BTreeMap<String, JobStatus> = c
                .list_jobs(&build)
                .unwrap()
                .into_iter()
                .map(|j| (j.name, j.status))
                .collect();
            let def = &case.def.job[&grant.job.name];
            for dep in &def.after {
                let status = jobs[dep];
                match def.on_dependency_failure {
                    cinder::types::DependencyPolicy::Skip => prop_assert_eq!(status, JobStatus::Succeeded),
                    cinder::types::DependencyPolicy::Run => prop_assert!(status.has_finished()),
                }
            }
            prop_assert!(leased.insert(grant.job.name.clone()), "job leased twice");

            let outcome = if case.failing.contains(&grant.job.name) {
                Outcome::Failed
            } else {
                Outcome::Succeeded
            };
            c.report_completion(&session, &grant.item_id, outcome, None).unwrap();
        }

        let snapshot = c.build_snapshot(&build).unwrap();
        prop_assert!(snapshot.jobs.iter().all(|j| j.status.has_finished()));

        let any_failed = snapshot.jobs.iter().any(|j| j.status == JobStatus::Failed);
        let expected = if any_failed { JobStatus::Failed } else { JobStatus::Succeeded };
        prop_assert_eq!(snapshot.status, expected);

        for job in &snapshot.jobs {
            let ran = leased.contains(&job.name);
            prop_assert_eq!(ran, job.status != JobStatus::Skipped);
        }
    }

    #[test]
    fn indirected_view_is_a_topological_order(case in case_strategy(12)) {
        let jobs = cinder::dag::decompose(&case.def, &"build-prop".into(), chrono::Utc::now()).unwrap();
        let graph = cinder::dag::JobGraph::new(jobs);
        let view = graph.indirected_view();

        prop_assert_eq!(view.order.len(), graph.jobs().len());
        let position: BTreeMap<_, _> = view.order.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        for (from, to) in graph.edges() {
            prop_assert!(position[from] < position[to]);
            prop_assert!(view.depth[to] > view.depth[from]);
        }
        // Reduced edges are a subset of the real ones.
        for edge in &view.edges {
            prop_assert!(graph.edges().contains(edge));
        }
    }
}
