// src/api/server.rs

//! Generic newline-delimited JSON listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::api::protocol::{Reply, WireError};
use crate::errors::{CinderError, Result};

/// Answers decoded requests of one API surface.
pub trait Handler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + 'static;

    fn handle(&self, request: Self::Request) -> Result<serde_json::Value>;
}

/// A running listener. Independently stoppable.
#[derive(Debug)]
pub struct Listener {
    name: &'static str,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Listener {
    /// Bind `addr` and start serving `handler`.
    pub async fn bind<H: Handler>(name: &'static str, addr: &str, handler: Arc<H>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(accept_loop(name, listener, handler, shutdown_rx));
        info!(listener = name, addr = %local_addr, "listener started");

        Ok(Self {
            name,
            local_addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, let open connections finish their current request,
    /// and wait at most `timeout`.
    pub async fn stop(self, timeout: Duration) -> Result<()> {
        let _ = self.shutdown.send(true);
        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {
                info!(listener = self.name, "listener stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(CinderError::Other(anyhow::anyhow!(
                "{} listener task failed: {e}",
                self.name
            ))),
            Err(_) => {
                handle.abort();
                Err(CinderError::Other(anyhow::anyhow!(
                    "{} listener did not stop within {timeout:?}",
                    self.name
                )))
            }
        }
    }
}

async fn accept_loop<H: Handler>(
    name: &'static str,
    listener: TcpListener,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(listener = name, %peer, "connection accepted");
                    connections.spawn(serve_connection(stream, handler.clone(), shutdown.clone()));
                }
                Err(e) => warn!(listener = name, error = %e, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_connection<H: Handler>(
    stream: TcpStream,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.changed() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<H::Request>(&line) {
            Ok(request) => {
                let handler = handler.clone();
                match tokio::task::spawn_blocking(move || handler.handle(request)).await {
                    Ok(result) => Reply::from_result(result),
                    Err(e) => Reply::from_result(Err(CinderError::Other(anyhow::anyhow!(
                        "request handler failed: {e}"
                    )))),
                }
            }
            Err(e) => Reply::Error(WireError {
                code: "invalid_request".to_string(),
                message: format!("malformed request: {e}"),
            }),
        };

        let mut out = match serde_json::to_string(&reply) {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "could not encode reply");
                break;
            }
        };
        out.push('\n');
        if write.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}
