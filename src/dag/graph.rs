// src/dag/graph.rs

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dag::JobStatus;
use crate::store::Job;
use crate::types::{DependencyPolicy, JobId};

/// Point-in-time view of one build's jobs and their dependency edges.
///
/// Arena layout: jobs live in a flat vector sorted by scheduling order and
/// edges are `(dependency, dependent)` id pairs. Every query is a pure
/// function of the snapshot, so it can be rebuilt and re-evaluated freely
/// while completions are in flight.
#[derive(Debug, Clone)]
pub struct JobGraph {
    jobs: Vec<Job>,
    index: HashMap<JobId, usize>,
    /// `(dependency, dependent)` pairs whose endpoints are both in the build.
    edges: Vec<(JobId, JobId)>,
    dependents: Vec<Vec<usize>>,
}

/// Display-oriented rendering of a graph. Not used for scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphView {
    /// Topological order; ties broken by submission order, then id.
    pub order: Vec<JobId>,
    /// Longest distance from a root, for layered layouts.
    pub depth: HashMap<JobId, usize>,
    /// Edges with transitively implied ones removed.
    pub edges: Vec<(JobId, JobId)>,
}

type SortKey = (DateTime<Utc>, u32, String);

impl JobGraph {
    pub fn new(mut jobs: Vec<Job>) -> Self {
        jobs.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let index: HashMap<JobId, usize> = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| (job.id.clone(), i))
            .collect();

        let mut edges = Vec::new();
        let mut dependents = vec![Vec::new(); jobs.len()];
        for (i, job) in jobs.iter().enumerate() {
            for dep in &job.depends_on {
                match index.get(dep) {
                    Some(&d) => {
                        edges.push((dep.clone(), job.id.clone()));
                        dependents[d].push(i);
                    }
                    None => warn!(
                        job = %job.id,
                        dependency = %dep,
                        "job depends on a job outside its build; it will never become eligible"
                    ),
                }
            }
        }

        Self {
            jobs,
            index,
            edges,
            dependents,
        }
    }

    /// Jobs in scheduling order.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.index.get(id).map(|&i| &self.jobs[i])
    }

    pub fn edges(&self) -> &[(JobId, JobId)] {
        &self.edges
    }

    fn dependency_statuses<'a>(&'a self, job: &'a Job) -> impl Iterator<Item = Option<JobStatus>> + 'a {
        job.depends_on
            .iter()
            .map(|dep| self.job(dep).map(|d| d.status))
    }

    fn dependencies_satisfied(&self, job: &Job) -> bool {
        self.dependency_statuses(job).all(|status| match (status, job.policy) {
            (Some(s), DependencyPolicy::Skip) => s.is_success(),
            (Some(s), DependencyPolicy::Run) => s.has_finished(),
            (None, _) => false,
        })
    }

    /// Pending jobs whose dependencies are satisfied, in scheduling order.
    ///
    /// A dependency is satisfied when it succeeded, or, for jobs with
    /// [`DependencyPolicy::Run`], when it reached any terminal status.
    pub fn eligible(&self) -> Vec<&Job> {
        self.jobs
            .iter()
            .filter(|job| job.status.is_pending())
            .filter(|job| self.dependencies_satisfied(job))
            .collect()
    }

    /// Jobs that must be skipped, closed over chains: if A fails, a
    /// skip-policy B after A and a skip-policy C after B are both returned.
    /// Leased (`Running`) jobs are never skipped.
    pub fn skippable(&self) -> Vec<&Job> {
        let mut status: Vec<JobStatus> = self.jobs.iter().map(|j| j.status).collect();
        let mut skipped = Vec::new();

        loop {
            let mut changed = false;
            for (i, job) in self.jobs.iter().enumerate() {
                if job.policy != DependencyPolicy::Skip
                    || !matches!(status[i], JobStatus::Submitted | JobStatus::Queued)
                {
                    continue;
                }
                let blocked = job.depends_on.iter().any(|dep| {
                    self.index.get(dep).is_some_and(|&d| {
                        matches!(
                            status[d],
                            JobStatus::Failed | JobStatus::Canceled | JobStatus::Skipped
                        )
                    })
                });
                if blocked {
                    status[i] = JobStatus::Skipped;
                    skipped.push(i);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        skipped.sort_unstable();
        skipped.into_iter().map(|i| &self.jobs[i]).collect()
    }

    /// Derived build status.
    ///
    /// Precedence: any `Failed` → `Failed`; else any `Canceled` →
    /// `Canceled`; else any pending job → `Running`; else `Succeeded`.
    /// `Skipped` jobs count as finished without affecting the outcome.
    pub fn aggregate_status(&self) -> JobStatus {
        let has = |s: JobStatus| self.jobs.iter().any(|j| j.status == s);
        if has(JobStatus::Failed) {
            JobStatus::Failed
        } else if has(JobStatus::Canceled) {
            JobStatus::Canceled
        } else if self.jobs.iter().any(|j| j.status.is_pending()) {
            JobStatus::Running
        } else {
            JobStatus::Succeeded
        }
    }

    pub fn all_finished(&self) -> bool {
        self.jobs.iter().all(|j| j.status.has_finished())
    }

    pub fn failed_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .count()
    }

    /// Deterministic, cycle-free rendering for display.
    pub fn indirected_view(&self) -> GraphView {
        let n = self.jobs.len();
        let key = |i: usize| -> SortKey {
            let j = &self.jobs[i];
            (j.submitted_at, j.index, j.id.to_string())
        };

        let mut in_degree = vec![0usize; n];
        for children in &self.dependents {
            for &c in children {
                in_degree[c] += 1;
            }
        }

        // Kahn's algorithm with a min-heap on the sort key.
        let mut ready: BinaryHeap<Reverse<(SortKey, usize)>> = (0..n)
            .filter(|&i| in_degree[i] == 0)
            .map(|i| Reverse((key(i), i)))
            .collect();
        let mut order = Vec::with_capacity(n);
        let mut depth = vec![0usize; n];

        while let Some(Reverse((_, i))) = ready.pop() {
            order.push(i);
            for &c in &self.dependents[i] {
                depth[c] = depth[c].max(depth[i] + 1);
                in_degree[c] -= 1;
                if in_degree[c] == 0 {
                    ready.push(Reverse((key(c), c)));
                }
            }
        }

        if order.len() < n {
            warn!(
                remaining = n - order.len(),
                "job graph contains a cycle; appending remaining jobs in submission order"
            );
            let placed: HashSet<usize> = order.iter().copied().collect();
            order.extend((0..n).filter(|i| !placed.contains(i)));
        }

        // Descendant sets, computed in reverse topological order.
        let mut reach: Vec<HashSet<usize>> = vec![HashSet::new(); n];
        for &i in order.iter().rev() {
            let mut acc = HashSet::new();
            for &c in &self.dependents[i] {
                acc.insert(c);
                acc.extend(reach[c].iter().copied());
            }
            reach[i] = acc;
        }

        let mut edges = Vec::new();
        for &u in &order {
            for &v in &self.dependents[u] {
                let implied = self.dependents[u]
                    .iter()
                    .any(|&w| w != v && reach[w].contains(&v));
                if !implied {
                    edges.push((self.jobs[u].id.clone(), self.jobs[v].id.clone()));
                }
            }
        }

        GraphView {
            order: order.iter().map(|&i| self.jobs[i].id.clone()).collect(),
            depth: order
                .iter()
                .map(|&i| (self.jobs[i].id.clone(), depth[i]))
                .collect(),
            edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobTimings;
    use crate::types::BuildId;

    fn job(name: &str, index: u32, deps: &[&str], status: JobStatus) -> Job {
        Job {
            id: JobId::from(name),
            build_id: BuildId::from("b"),
            name: name.to_string(),
            index,
            submitted_at: DateTime::<Utc>::UNIX_EPOCH,
            depends_on: deps.iter().map(|d| JobId::from(*d)).collect(),
            policy: DependencyPolicy::Skip,
            commands: vec![],
            status,
            error: None,
            runner: None,
            timings: JobTimings::default(),
            version: 0,
        }
    }

    fn names(jobs: Vec<&Job>) -> Vec<String> {
        jobs.into_iter().map(|j| j.name.clone()).collect()
    }

    #[test]
    fn diamond_becomes_eligible_in_waves() {
        use JobStatus::*;
        let g = JobGraph::new(vec![
            job("A", 0, &[], Submitted),
            job("C", 1, &[], Submitted),
            job("D", 2, &["A", "C"], Submitted),
        ]);
        assert_eq!(names(g.eligible()), vec!["A", "C"]);
        assert_eq!(g.aggregate_status(), Running);

        let g = JobGraph::new(vec![
            job("A", 0, &[], Succeeded),
            job("C", 1, &[], Succeeded),
            job("D", 2, &["A", "C"], Submitted),
        ]);
        assert_eq!(names(g.eligible()), vec!["D"]);
        assert_eq!(g.aggregate_status(), Running);

        let g = JobGraph::new(vec![
            job("A", 0, &[], Succeeded),
            job("C", 1, &[], Succeeded),
            job("D", 2, &["A", "C"], Succeeded),
        ]);
        assert!(g.eligible().is_empty());
        assert_eq!(g.aggregate_status(), Succeeded);
    }

    #[test]
    fn failure_outranks_running_and_cancel() {
        use JobStatus::*;
        let g = JobGraph::new(vec![job("A", 0, &[], Failed), job("B", 1, &[], Running)]);
        assert_eq!(g.aggregate_status(), Failed);

        let g = JobGraph::new(vec![
            job("A", 0, &[], Canceled),
            job("B", 1, &[], Failed),
            job("C", 2, &[], Queued),
        ]);
        assert_eq!(g.aggregate_status(), Failed);

        let g = JobGraph::new(vec![job("A", 0, &[], Canceled), job("B", 1, &[], Running)]);
        assert_eq!(g.aggregate_status(), Canceled);

        let g = JobGraph::new(vec![job("A", 0, &[], Succeeded), job("B", 1, &[], Skipped)]);
        assert_eq!(g.aggregate_status(), Succeeded);

        assert_eq!(JobGraph::new(vec![]).aggregate_status(), Succeeded);
    }

    #[test]
    fn skips_propagate_through_chains_but_respect_run_policy() {
        use JobStatus::*;
        let mut cleanup = job("cleanup", 3, &["B"], Submitted);
        cleanup.policy = DependencyPolicy::Run;

        let g = JobGraph::new(vec![
            job("A", 0, &[], Failed),
            job("B", 1, &["A"], Submitted),
            job("C", 2, &["B"], Submitted),
            cleanup,
        ]);

        assert_eq!(names(g.skippable()), vec!["B", "C"]);
        // cleanup waits for B to become terminal; nothing is eligible yet.
        assert!(g.eligible().is_empty());
    }

    #[test]
    fn run_policy_job_is_eligible_after_failed_dependency() {
        use JobStatus::*;
        let mut notify = job("notify", 1, &["A"], Submitted);
        notify.policy = DependencyPolicy::Run;
        let g = JobGraph::new(vec![job("A", 0, &[], Failed), notify]);
        assert_eq!(names(g.eligible()), vec!["notify"]);
        assert!(g.skippable().is_empty());
    }

    #[test]
    fn missing_dependency_is_never_satisfied() {
        let g = JobGraph::new(vec![job("A", 0, &["ghost"], JobStatus::Submitted)]);
        assert!(g.eligible().is_empty());
        assert!(g.edges().is_empty());
    }

    #[test]
    fn indirected_view_drops_implied_edges_and_orders_deterministically() {
        use JobStatus::*;
        // A -> B -> C plus the implied A -> C.
        let g = JobGraph::new(vec![
            job("C", 2, &["A", "B"], Submitted),
            job("B", 1, &["A"], Submitted),
            job("A", 0, &[], Submitted),
            job("Z", 0, &[], Submitted),
        ]);

        let view = g.indirected_view();
        let order: Vec<_> = view.order.iter().map(|id| id.to_string()).collect();
        assert_eq!(order, vec!["A", "Z", "B", "C"]);
        assert_eq!(view.depth[&JobId::from("C")], 2);

        let edges: Vec<_> = view
            .edges
            .iter()
            .map(|(a, b)| format!("{a}->{b}"))
            .collect();
        assert_eq!(edges, vec!["A->B", "B->C"]);
    }
}
