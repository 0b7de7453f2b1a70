//! Side-channel access logging.
//!
//! Every request on every branch passes through [`access_log_layer`], which
//! also carries the request-correlation span (request_id). Lines go through
//! an unbounded channel to a single writer task that owns the append-only
//! log file, so concurrent requests never interleave partial lines and the
//! response path never waits on file I/O.

use std::path::Path;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{SecondsFormat, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crate::router::request_host;

/// Handle to the access log writer. Cheap to clone; a disabled log drops
/// records without formatting overhead beyond the line itself.
#[derive(Clone)]
pub struct AccessLog {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl AccessLog {
    /// Open (appending) the log file and spawn the writer task.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(file, rx));

        tracing::info!(path = %path.display(), "Access log enabled");
        Ok(Self { tx: Some(tx) })
    }

    /// No-op log for deployments without an access_log path configured.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    fn record(&self, line: String) {
        if let Some(tx) = &self.tx {
            // The writer only goes away at shutdown; a send error then is fine.
            let _ = tx.send(line);
        }
    }
}

async fn write_lines(mut file: tokio::fs::File, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = file.write_all(line.as_bytes()).await {
            tracing::error!(error = %e, "Failed to write access log line");
        }
    }
}

fn format_line(
    method: &axum::http::Method,
    path: &str,
    host: &str,
    status: u16,
    latency_ms: u64,
) -> String {
    format!(
        "{} {} {} {} {} {}ms\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        method,
        path,
        host,
        status,
        latency_ms
    )
}

/// Middleware feeding the access log and wrapping the request in a
/// correlation span. Outermost layer so it sees the final status of every
/// branch, including 404 fallthrough.
pub async fn access_log_layer(
    State(log): State<AccessLog>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4();
    let method = request.method().clone();
    let host = request_host(&request).unwrap_or_else(|| "-".to_string());
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        host = %host,
        method = %method,
        path = %path,
    );

    let start = Instant::now();

    async move {
        let response = next.run(request).await;
        let latency_ms = start.elapsed().as_millis() as u64;
        let status = response.status().as_u16();

        tracing::info!(status, latency_ms, "Request completed");
        log.record(format_line(&method, &path, &host, status, latency_ms));

        response
    }
    .instrument(span)
    .await
}
