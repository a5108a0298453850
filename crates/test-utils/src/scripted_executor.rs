use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cinder::dag::Outcome;
use cinder::exec::{ExecutionResult, JobExecutor, LogSink};
use cinder::store::Job;

/// What a scripted job does.
#[derive(Debug, Clone)]
pub struct Script {
    pub lines: Vec<String>,
    pub delay: Option<Duration>,
    pub result: Option<ExecutionResult>,
}

impl Script {
    pub fn succeed() -> Self {
        Self {
            lines: Vec::new(),
            delay: None,
            result: Some(ExecutionResult::succeeded()),
        }
    }

    pub fn fail(reason: &str) -> Self {
        Self {
            result: Some(ExecutionResult::failed(reason)),
            ..Self::succeed()
        }
    }

    /// Never finishes; the runner must drop it.
    pub fn hang() -> Self {
        Self {
            result: None,
            ..Self::succeed()
        }
    }

    pub fn with_lines(mut self, lines: &[&str]) -> Self {
        self.lines = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A fake executor that:
/// - records which jobs were run, by name
/// - writes each script's lines to the log
/// - finishes with the scripted result (success for unscripted jobs)
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, job: &str, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(job.to_string(), script);
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn executed_count(&self, job: &str) -> usize {
        self.executed.lock().unwrap().iter().filter(|j| *j == job).count()
    }
}

impl JobExecutor for ScriptedExecutor {
    fn execute<'a>(
        &'a self,
        job: &'a Job,
        log: LogSink,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'a>> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&job.name)
            .cloned()
            .unwrap_or_else(Script::succeed);
        self.executed.lock().unwrap().push(job.name.clone());

        Box::pin(async move {
            for line in &script.lines {
                log.line(line.clone());
            }
            if let Some(delay) = script.delay {
                tokio::time::sleep(delay).await;
            }
            match script.result {
                Some(result) => result,
                None => {
                    std::future::pending::<()>().await;
                    ExecutionResult::from(Outcome::Canceled)
                }
            }
        })
    }
}
