// src/api/client.rs

//! Clients for both listeners.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::api::protocol::{CoreRequest, Page, PageRequest, Reply, RunnerRequest};
use crate::config::build::BuildDefinition;
use crate::dag::{GraphView, JobStatus};
use crate::engine::{BuildSnapshot, Credentials, LeaseGrant, RunnerSession};
use crate::errors::{CinderError, Result};
use crate::exec::runner::{BoxFuture, RunnerClient};
use crate::exec::ExecutionResult;
use crate::log::{LogBlock, LogDescriptor, LogLine};
use crate::store::{Build, Job, RunnerRecord};
use crate::types::{BuildId, JobId, WorkItemId};

struct Stream {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

/// One lazily opened connection, reopened after an I/O failure. Calls on a
/// connection are serialized.
#[derive(Clone)]
pub struct Connection {
    addr: String,
    stream: Arc<Mutex<Option<Stream>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("addr", &self.addr).finish()
    }
}

impl Connection {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: Arc::new(Mutex::new(None)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn call<Req: Serialize, Resp: DeserializeOwned>(&self, request: &Req) -> Result<Resp> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let (read, write) = TcpStream::connect(&self.addr).await?.into_split();
            *guard = Some(Stream {
                lines: BufReader::new(read).lines(),
                write,
            });
        }

        let exchanged = match guard.as_mut() {
            Some(stream) => exchange(stream, &line).await,
            None => Err(closed()),
        };
        let reply = match exchanged {
            Ok(reply) => reply,
            Err(e) => {
                *guard = None;
                return Err(e);
            }
        };
        drop(guard);

        let value = serde_json::from_str::<Reply>(&reply)?.into_result()?;
        Ok(serde_json::from_value(value)?)
    }
}

async fn exchange(stream: &mut Stream, line: &str) -> Result<String> {
    stream.write.write_all(line.as_bytes()).await?;
    match stream.lines.next_line().await? {
        Some(reply) => Ok(reply),
        None => Err(closed()),
    }
}

fn closed() -> CinderError {
    CinderError::IoError(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "server closed the connection",
    ))
}

/// Client for the core API.
#[derive(Debug, Clone)]
pub struct CoreClient {
    conn: Connection,
}

impl CoreClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            conn: Connection::new(addr),
        }
    }

    pub async fn submit_build(&self, definition: &BuildDefinition) -> Result<BuildId> {
        self.conn
            .call(&CoreRequest::SubmitBuild {
                definition: definition.clone(),
            })
            .await
    }

    pub async fn cancel_build(&self, build_id: &BuildId) -> Result<JobStatus> {
        self.conn
            .call(&CoreRequest::CancelBuild {
                build_id: build_id.clone(),
            })
            .await
    }

    pub async fn build(&self, build_id: &BuildId) -> Result<BuildSnapshot> {
        self.conn
            .call(&CoreRequest::GetBuild {
                build_id: build_id.clone(),
            })
            .await
    }

    pub async fn graph(&self, build_id: &BuildId) -> Result<GraphView> {
        self.conn
            .call(&CoreRequest::GetGraph {
                build_id: build_id.clone(),
            })
            .await
    }

    pub async fn list_builds(&self, page: PageRequest) -> Result<Page<Build>> {
        self.conn.call(&CoreRequest::ListBuilds { page }).await
    }

    pub async fn list_jobs(&self, build_id: &BuildId, page: PageRequest) -> Result<Page<Job>> {
        self.conn
            .call(&CoreRequest::ListJobs {
                build_id: build_id.clone(),
                page,
            })
            .await
    }

    pub async fn list_runners(&self, page: PageRequest) -> Result<Page<RunnerRecord>> {
        self.conn.call(&CoreRequest::ListRunners { page }).await
    }

    pub async fn job(&self, job_id: &JobId) -> Result<Job> {
        self.conn
            .call(&CoreRequest::GetJob {
                job_id: job_id.clone(),
            })
            .await
    }

    pub async fn log_descriptor(&self, job_id: &JobId) -> Result<LogDescriptor> {
        self.conn
            .call(&CoreRequest::LogDescriptor {
                job_id: job_id.clone(),
            })
            .await
    }

    pub async fn log_lines(&self, job_id: &JobId, after: u64, limit: Option<usize>) -> Result<Vec<LogLine>> {
        self.conn
            .call(&CoreRequest::LogLines {
                job_id: job_id.clone(),
                after,
                limit,
            })
            .await
    }

    pub async fn log_blocks(&self, job_id: &JobId) -> Result<Vec<LogBlock>> {
        self.conn
            .call(&CoreRequest::LogBlocks {
                job_id: job_id.clone(),
            })
            .await
    }
}

/// Runner-side client speaking to a remote runner listener.
#[derive(Debug, Clone)]
pub struct RemoteRunnerClient {
    conn: Connection,
}

impl RemoteRunnerClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            conn: Connection::new(addr),
        }
    }
}

impl RunnerClient for RemoteRunnerClient {
    fn register<'a>(&'a self, creds: &'a Credentials) -> BoxFuture<'a, Result<RunnerSession>> {
        Box::pin(async move {
            self.conn
                .call(&RunnerRequest::Register {
                    credentials: creds.clone(),
                })
                .await
        })
    }

    fn poll<'a>(&'a self, session: &'a RunnerSession) -> BoxFuture<'a, Result<Option<LeaseGrant>>> {
        Box::pin(async move {
            self.conn
                .call(&RunnerRequest::Poll {
                    session: session.clone(),
                })
                .await
        })
    }

    fn heartbeat<'a>(
        &'a self,
        session: &'a RunnerSession,
        item: &'a WorkItemId,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.conn
                .call::<_, Option<()>>(&RunnerRequest::Heartbeat {
                    session: session.clone(),
                    item_id: item.clone(),
                })
                .await
                .map(|_| ())
        })
    }

    fn append_log<'a>(
        &'a self,
        session: &'a RunnerSession,
        item: &'a WorkItemId,
        lines: Vec<LogLine>,
    ) -> BoxFuture<'a, Result<LogDescriptor>> {
        Box::pin(async move {
            self.conn
                .call(&RunnerRequest::AppendLog {
                    session: session.clone(),
                    item_id: item.clone(),
                    lines,
                })
                .await
        })
    }

    fn complete<'a>(
        &'a self,
        session: &'a RunnerSession,
        item: &'a WorkItemId,
        result: ExecutionResult,
    ) -> BoxFuture<'a, Result<JobStatus>> {
        Box::pin(async move {
            self.conn
                .call(&RunnerRequest::Complete {
                    session: session.clone(),
                    item_id: item.clone(),
                    outcome: result.outcome,
                    error: result.error,
                })
                .await
        })
    }

    fn deregister<'a>(&'a self, session: &'a RunnerSession) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.conn
                .call::<_, Option<()>>(&RunnerRequest::Deregister {
                    session: session.clone(),
                })
                .await
                .map(|_| ())
        })
    }
}
