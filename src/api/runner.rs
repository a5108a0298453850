// src/api/runner.rs

//! Runner API: registration, polling, heartbeats, logs and completion.

use std::sync::Arc;

use serde_json::Value;

use crate::api::protocol::RunnerRequest;
use crate::api::server::Handler;
use crate::engine::Coordinator;
use crate::errors::Result;

#[derive(Debug, Clone)]
pub struct RunnerApi {
    coordinator: Arc<Coordinator>,
}

impl RunnerApi {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

impl Handler for RunnerApi {
    type Request = RunnerRequest;

    fn handle(&self, request: RunnerRequest) -> Result<Value> {
        let c = &self.coordinator;
        let value = match request {
            RunnerRequest::Register { credentials } => {
                serde_json::to_value(c.register_runner(&credentials)?)?
            }
            RunnerRequest::Poll { session } => serde_json::to_value(c.poll_for_work(&session)?)?,
            RunnerRequest::Heartbeat { session, item_id } => {
                c.heartbeat(&session, &item_id)?;
                Value::Null
            }
            RunnerRequest::AppendLog {
                session,
                item_id,
                lines,
            } => serde_json::to_value(c.append_log(&session, &item_id, &lines)?)?,
            RunnerRequest::Complete {
                session,
                item_id,
                outcome,
                error,
            } => serde_json::to_value(c.report_completion(&session, &item_id, outcome, error)?)?,
            RunnerRequest::Deregister { session } => {
                c.deregister_runner(&session)?;
                Value::Null
            }
        };
        Ok(value)
    }
}
