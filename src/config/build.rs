// src/config/build.rs

//! Build definitions: the document a user submits.
//!
//! ```toml
//! name = "ci"
//!
//! [job.lint]
//! commands = ["cargo clippy"]
//!
//! [job.test]
//! commands = ["cargo test"]
//!
//! [job.package]
//! commands = ["cargo build --release"]
//! after = ["lint", "test"]
//!
//! [job.notify]
//! commands = ["./notify.sh"]
//! after = ["package"]
//! on_dependency_failure = "run"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{CinderError, Result};
use crate::types::DependencyPolicy;

const NAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.-]*$";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildDefinition {
    pub name: String,

    /// All jobs from `[job.<name>]`.
    #[serde(default)]
    pub job: BTreeMap<String, JobDefinition>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Shell commands, run in order; the first failure fails the job.
    #[serde(default)]
    pub commands: Vec<String>,

    /// Jobs that must finish before this one starts.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub on_dependency_failure: DependencyPolicy,
}

impl BuildDefinition {
    /// Check names, references and acyclicity. Returns job names in a
    /// topological order (dependencies first).
    pub fn validate(&self) -> Result<Vec<String>> {
        let name_re = Regex::new(NAME_PATTERN)
            .map_err(|e| CinderError::ConfigError(format!("invalid name pattern: {e}")))?;

        if !name_re.is_match(&self.name) {
            return Err(CinderError::ConfigError(format!(
                "invalid build name '{}'",
                self.name
            )));
        }
        ensure_has_jobs(self)?;

        for (name, job) in &self.job {
            if !name_re.is_match(name) {
                return Err(CinderError::ConfigError(format!(
                    "invalid job name '{name}'"
                )));
            }
            if job.commands.is_empty() {
                return Err(CinderError::ConfigError(format!(
                    "job '{name}' has no commands"
                )));
            }
        }

        validate_job_dependencies(self)?;
        job_order(self)
    }
}

fn ensure_has_jobs(def: &BuildDefinition) -> Result<()> {
    if def.job.is_empty() {
        return Err(CinderError::ConfigError(
            "build must contain at least one [job.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_job_dependencies(def: &BuildDefinition) -> Result<()> {
    for (name, job) in def.job.iter() {
        for dep in job.after.iter() {
            if dep == name {
                return Err(CinderError::ConfigError(format!(
                    "job '{}' cannot depend on itself in `after`",
                    name
                )));
            }
            if !def.job.contains_key(dep) {
                return Err(CinderError::ConfigError(format!(
                    "job '{}' has unknown dependency '{}' in `after`",
                    name, dep
                )));
            }
        }
    }
    Ok(())
}

fn job_order(def: &BuildDefinition) -> Result<Vec<String>> {
    // Edge direction: dep -> job.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in def.job.keys() {
        graph.add_node(name.as_str());
    }
    for (name, job) in def.job.iter() {
        for dep in job.after.iter() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(cycle) => Err(CinderError::GraphCycle(format!(
            "build '{}' has a dependency cycle involving job '{}'",
            def.name,
            cycle.node_id()
        ))),
    }
}

/// Parse a definition; `.json` files are JSON, anything else TOML.
pub fn parse_build_definition(contents: &str, json: bool) -> Result<BuildDefinition> {
    let def = if json {
        serde_json::from_str(contents)?
    } else {
        toml::from_str(contents)?
    };
    Ok(def)
}

/// Load and validate a build definition file.
pub fn load_build_definition(path: impl AsRef<Path>) -> Result<BuildDefinition> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let json = path.extension().is_some_and(|ext| ext == "json");
    let def = parse_build_definition(&contents, json)?;
    def.validate()?;
    Ok(def)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> BuildDefinition {
        parse_build_definition(src, false).unwrap()
    }

    #[test]
    fn orders_dependencies_first() {
        let def = parse(
            r#"
            name = "ci"
            [job.package]
            commands = ["make"]
            after = ["lint", "test"]
            [job.lint]
            commands = ["lint"]
            [job.test]
            commands = ["test"]
            on_dependency_failure = "run"
            "#,
        );
        assert_eq!(def.job["test"].on_dependency_failure, DependencyPolicy::Run);
        assert_eq!(def.job["lint"].on_dependency_failure, DependencyPolicy::Skip);

        let order = def.validate().unwrap();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("lint") < pos("package"));
        assert!(pos("test") < pos("package"));
    }

    #[test]
    fn cycles_are_graph_errors() {
        let def = parse(
            r#"
            name = "loop"
            [job.a]
            commands = ["a"]
            after = ["b"]
            [job.b]
            commands = ["b"]
            after = ["a"]
            "#,
        );
        assert!(matches!(def.validate(), Err(CinderError::GraphCycle(_))));
    }

    #[test]
    fn rejects_bad_references_and_names() {
        let unknown = parse(
            r#"
            name = "ci"
            [job.a]
            commands = ["a"]
            after = ["nope"]
            "#,
        );
        assert!(matches!(unknown.validate(), Err(CinderError::ConfigError(_))));

        let selfish = parse(
            r#"
            name = "ci"
            [job.a]
            commands = ["a"]
            after = ["a"]
            "#,
        );
        assert!(matches!(selfish.validate(), Err(CinderError::ConfigError(_))));

        let badname = parse(
            r#"
            name = "ci"
            [job."-x"]
            commands = ["a"]
            "#,
        );
        assert!(badname.validate().is_err());

        let empty = parse(r#"name = "ci""#);
        assert!(empty.validate().is_err());
    }

    #[test]
    fn json_definitions_are_accepted() {
        let def = parse_build_definition(
            r#"{"name":"ci","job":{"a":{"commands":["true"]}}}"#,
            true,
        )
        .unwrap();
        assert_eq!(def.validate().unwrap(), vec!["a".to_string()]);
    }
}
