// src/dag/decompose.rs

//! Turning a submitted definition into job records.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::build::BuildDefinition;
use crate::dag::JobStatus;
use crate::errors::Result;
use crate::store::{Job, JobTimings};
use crate::types::{BuildId, JobId};

/// Validate `def` and produce one `Submitted` job per definition entry.
///
/// A cyclic definition fails with `GraphCycle` before any job is produced,
/// so a cyclic build never reaches scheduling. Jobs are indexed in
/// topological order, which is also their display order.
pub fn decompose(
    def: &BuildDefinition,
    build_id: &BuildId,
    submitted_at: DateTime<Utc>,
) -> Result<Vec<Job>> {
    let order = def.validate()?;

    let ids: std::collections::HashMap<&str, JobId> = order
        .iter()
        .map(|name| (name.as_str(), JobId::generate()))
        .collect();

    let mut jobs = Vec::with_capacity(order.len());
    for (index, name) in order.iter().enumerate() {
        let Some(job_def) = def.job.get(name) else {
            continue;
        };
        let depends_on = job_def
            .after
            .iter()
            .filter_map(|dep| ids.get(dep.as_str()).cloned())
            .collect();

        jobs.push(Job {
            id: ids[name.as_str()].clone(),
            build_id: build_id.clone(),
            name: name.clone(),
            index: index as u32,
            submitted_at,
            depends_on,
            policy: job_def.on_dependency_failure,
            commands: job_def.commands.clone(),
            status: JobStatus::Submitted,
            error: None,
            runner: None,
            timings: JobTimings {
                created_at: Some(submitted_at),
                ..JobTimings::default()
            },
            version: 0,
        });
    }

    debug!(build = %build_id, jobs = jobs.len(), "decomposed build definition");
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::build::{parse_build_definition, JobDefinition};
    use crate::dag::JobGraph;
    use crate::errors::CinderError;

    #[test]
    fn jobs_reference_dependencies_by_id() {
        let def = parse_build_definition(
            r#"
            name = "ci"
            [job.A]
            commands = ["a"]
            [job.C]
            commands = ["c"]
            [job.D]
            commands = ["d"]
            after = ["A", "C"]
            "#,
            false,
        )
        .unwrap();

        let build = BuildId::from("b");
        let jobs = decompose(&def, &build, Utc::now()).unwrap();
        assert_eq!(jobs.len(), 3);

        let d = jobs.iter().find(|j| j.name == "D").unwrap();
        assert_eq!(d.index, 2);
        assert_eq!(d.depends_on.len(), 2);
        for dep in &d.depends_on {
            assert!(jobs.iter().any(|j| &j.id == dep && j.name != "D"));
        }

        let graph = JobGraph::new(jobs);
        let eligible: Vec<_> = graph.eligible().iter().map(|j| j.name.clone()).collect();
        assert_eq!(eligible.len(), 2);
        assert!(!eligible.contains(&"D".to_string()));
    }

    #[test]
    fn cyclic_definition_produces_no_jobs() {
        let mut def = BuildDefinition {
            name: "loop".into(),
            job: Default::default(),
        };
        for (name, dep) in [("x", "y"), ("y", "z"), ("z", "x")] {
            def.job.insert(
                name.into(),
                JobDefinition {
                    commands: vec!["true".into()],
                    after: vec![dep.into()],
                    ..Default::default()
                },
            );
        }

        let err = decompose(&def, &BuildId::from("b"), Utc::now()).unwrap_err();
        assert!(matches!(err, CinderError::GraphCycle(_)));
    }
}
