#![allow(dead_code)]

use std::collections::BTreeMap;

use cinder::config::{BuildDefinition, JobDefinition};
use cinder::types::DependencyPolicy;

/// Builder for `BuildDefinition` to simplify test setup.
pub struct BuildDefinitionBuilder {
    def: BuildDefinition,
}

impl BuildDefinitionBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            def: BuildDefinition {
                name: name.to_string(),
                job: BTreeMap::new(),
            },
        }
    }

    pub fn with_job(mut self, name: &str, job: JobDefinition) -> Self {
        self.def.job.insert(name.to_string(), job);
        self
    }

    /// Shorthand for a job running `true` after `after`.
    pub fn with_simple_job(self, name: &str, after: &[&str]) -> Self {
        let job = JobDefinitionBuilder::new("true").after(after).build();
        self.with_job(name, job)
    }

    /// Returns the definition without validating it, so tests can submit
    /// invalid ones.
    pub fn build(self) -> BuildDefinition {
        self.def
    }
}

/// Builder for `JobDefinition`.
pub struct JobDefinitionBuilder {
    job: JobDefinition,
}

impl JobDefinitionBuilder {
    pub fn new(command: &str) -> Self {
        Self {
            job: JobDefinition {
                commands: vec![command.to_string()],
                ..JobDefinition::default()
            },
        }
    }

    pub fn command(mut self, command: &str) -> Self {
        self.job.commands.push(command.to_string());
        self
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.job.after.extend(deps.iter().map(|d| d.to_string()));
        self
    }

    pub fn run_on_dependency_failure(mut self) -> Self {
        self.job.on_dependency_failure = DependencyPolicy::Run;
        self
    }

    pub fn build(self) -> JobDefinition {
        self.job
    }
}
