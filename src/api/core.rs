// src/api/core.rs

//! Core (user-facing) API: builds, jobs, runners and logs.

use std::sync::Arc;

use serde::Serialize;

use crate::api::protocol::{paginate, CoreRequest};
use crate::api::server::Handler;
use crate::engine::Coordinator;
use crate::errors::Result;

#[derive(Debug, Clone)]
pub struct CoreApi {
    coordinator: Arc<Coordinator>,
}

impl CoreApi {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

fn to_value<T: Serialize>(value: T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

impl Handler for CoreApi {
    type Request = CoreRequest;

    fn handle(&self, request: CoreRequest) -> Result<serde_json::Value> {
        let c = &self.coordinator;
        match request {
            CoreRequest::SubmitBuild { definition } => to_value(c.submit_build(&definition)?),
            CoreRequest::CancelBuild { build_id } => to_value(c.cancel_build(&build_id)?),
            CoreRequest::GetBuild { build_id } => to_value(c.build_snapshot(&build_id)?),
            CoreRequest::GetGraph { build_id } => to_value(c.build_graph_view(&build_id)?),
            CoreRequest::ListBuilds { page } => to_value(paginate(&c.list_builds()?, &page, "builds")?),
            CoreRequest::ListJobs { build_id, page } => {
                let base = format!("builds/{build_id}/jobs");
                to_value(paginate(&c.list_jobs(&build_id)?, &page, &base)?)
            }
            CoreRequest::ListRunners { page } => {
                to_value(paginate(&c.list_runners()?, &page, "runners")?)
            }
            CoreRequest::GetJob { job_id } => to_value(c.job(&job_id)?),
            CoreRequest::LogDescriptor { job_id } => to_value(c.fetch_log_descriptor(&job_id)?),
            CoreRequest::LogLines {
                job_id,
                after,
                limit,
            } => to_value(c.fetch_log_lines(&job_id, after, limit)?),
            CoreRequest::LogBlocks { job_id } => to_value(c.fetch_log_blocks(&job_id)?),
        }
    }
}
