//! Liveness, readiness and status endpoint.
//!
//! A deliberately tiny HTTP/1.1 responder: one request per connection,
//! `Connection: close`, GET and HEAD only.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::scheduler::{HostStatus, Scheduler};

#[derive(Error, Debug)]
pub enum HealthError {
    #[error("failed to bind health probe address {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Set once the first inventory has been applied.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Serialize)]
struct StatusBody {
    ready: bool,
    shutting_down: bool,
    hosts: Vec<HostStatus>,
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.as_bytes().to_vec(),
        }
    }

    fn into_bytes(self, include_body: bool) -> Vec<u8> {
        let reason = match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Unknown",
        };
        let head = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Cache-Control: no-cache\r\n\
             Connection: close\r\n\
             \r\n",
            self.status,
            reason,
            self.content_type,
            self.body.len()
        );
        let mut bytes = head.into_bytes();
        if include_body {
            bytes.extend(self.body);
        }
        bytes
    }
}

fn respond(request: &str, scheduler: &Scheduler, readiness: &Readiness) -> Vec<u8> {
    let request_line = request.lines().next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Response::text(400, "bad request\n").into_bytes(true);
    };
    if method != "GET" && method != "HEAD" {
        return Response::text(405, "method not allowed\n").into_bytes(true);
    }
    let path = target.split('?').next().unwrap_or(target);

    let response = match path {
        "/healthz" => Response::text(200, "ok\n"),
        "/readyz" if readiness.is_ready() && !scheduler.is_shutting_down() => {
            Response::text(200, "ok\n")
        }
        "/readyz" => Response::text(503, "not ready\n"),
        "/status" => {
            let body = StatusBody {
                ready: readiness.is_ready(),
                shutting_down: scheduler.is_shutting_down(),
                hosts: scheduler.snapshot(),
            };
            match serde_json::to_vec_pretty(&body) {
                Ok(json) => Response {
                    status: 200,
                    content_type: "application/json",
                    body: json,
                },
                Err(e) => {
                    warn!(error = %e, "failed to serialize status");
                    Response::text(500, "internal server error\n")
                }
            }
        }
        _ => Response::text(404, "not found\n"),
    };
    response.into_bytes(method == "GET")
}

/// Bind the probe listener. Split from [`serve`] so bind errors surface at
/// startup and tests can use port 0.
pub async fn bind(addr: &str) -> Result<TcpListener, HealthError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| HealthError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Answer probes on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    scheduler: Scheduler,
    readiness: Readiness,
    shutdown: CancelSignal,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "health probe listening");
    }
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let scheduler = scheduler.clone();
                    let readiness = readiness.clone();
                    tokio::spawn(handle_connection(stream, peer, scheduler, readiness));
                }
                Err(e) => warn!(error = %e, "health probe accept failed"),
            },
        }
    }
    debug!("health probe stopped");
}

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    peer: SocketAddr,
    scheduler: Scheduler,
    readiness: Readiness,
) {
    let mut buf = vec![0u8; 4096];
    let n = match stream.read(&mut buf).await {
        Ok(n) if n > 0 => n,
        _ => return,
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    let response = respond(&request, &scheduler, &readiness);
    if let Err(e) = stream.write_all(&response).await {
        debug!(peer = %peer, error = %e, "failed to write probe response");
    }
    let _ = stream.shutdown().await;
}
