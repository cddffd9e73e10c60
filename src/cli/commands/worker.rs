//! Worker command - execute one request read from stdin
//!
//! Spawned by the local executor. Output on stdout is one JSON message per
//! line; anything else the process prints goes to stderr.

use crate::error::{CommuneError, CommuneResult};
use crate::job::bash;
use crate::job::worker::WorkerRequest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Execute the worker command
pub async fn execute() -> CommuneResult<()> {
    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .map_err(|e| CommuneError::io("reading worker request", e))?;
    let request: WorkerRequest = serde_json::from_slice(&input)
        .map_err(|e| CommuneError::Worker(format!("malformed request: {}", e)))?;
    debug!("Worker executing {}", request.transformation.short());

    let messages = tokio::select! {
        messages = bash::execute(&request) => messages,
        _ = terminated() => {
            debug!("Worker terminated");
            return Ok(());
        }
    };

    let mut stdout = tokio::io::stdout();
    for message in messages {
        stdout
            .write_all(message.to_line()?.as_bytes())
            .await
            .map_err(|e| CommuneError::io("writing worker output", e))?;
    }
    stdout
        .flush()
        .await
        .map_err(|e| CommuneError::io("writing worker output", e))
}

#[cfg(unix)]
async fn terminated() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminated() {
    let _ = tokio::signal::ctrl_c().await;
}
