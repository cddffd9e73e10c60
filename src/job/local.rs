//! Local execution in a worker process

use super::worker::{
    log_report, CapturedOutput, LogStream, WorkerMessage, WorkerPin, WorkerRequest,
};
use super::{hard_cancelled, JobContext, JobOutcome};
use crate::buffer::put_buffer;
use crate::checksum::Checksum;
use crate::error::TransformationError;
use crate::transformation::{is_semantic_celltype, Pin, Transformation};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Run a transformation in a worker once a local slot is free
pub async fn execute(
    ctx: &JobContext,
    checksum: Checksum,
    tf: &Transformation,
    hard_cancel: &mut watch::Receiver<bool>,
) -> JobOutcome {
    let _permit = tokio::select! {
        permit = ctx.slots.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return failed("local executor is shut down"),
        },
        _ = hard_cancelled(hard_cancel) => return JobOutcome::HardCancelled,
    };

    let request = match build_request(ctx, checksum, tf).await {
        Ok(request) => request,
        Err(e) => return JobOutcome::Failed(e),
    };

    let mut child = match ctx.launcher.spawn(&request).await {
        Ok(child) => child,
        Err(e) => return failed(e.to_string()),
    };
    info!("Running {} locally", checksum.short());

    let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return failed("worker was started without piped stdio");
    };

    let payload = match serde_json::to_vec(&request) {
        Ok(payload) => payload,
        Err(e) => return failed(e.to_string()),
    };
    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(&payload).await {
            debug!("Could not hand request to worker: {}", e);
        }
        let _ = stdin.shutdown().await;
    });
    let stderr_task = tokio::spawn(async move { capture(&mut stderr).await });

    let mut run = WorkerRun::default();
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => run.on_line(ctx, checksum, &line).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("Reading worker output for {} failed: {}", checksum.short(), e);
                    break;
                }
            },
            _ = hard_cancelled(hard_cancel) => {
                terminate(&mut child, ctx.settings.termination_grace).await;
                return JobOutcome::HardCancelled;
            }
        }
    }

    let exit = child.wait().await;
    let process_stderr = stderr_task.await.unwrap_or_default();
    if !process_stderr.is_empty() {
        run.stderr.push_str(&process_stderr.render());
    }

    let summary = match (&run.error, &run.result) {
        (Some(message), _) => message.clone(),
        (None, Some(result)) => result.to_hex(),
        (None, None) => "<no result>".to_string(),
    };
    let stdout = run.stdout.render();
    let stderr = run.stderr.render();
    let report = log_report(
        &summary,
        non_empty(&stdout),
        non_empty(&stderr),
        run.execution_time,
    );
    ctx.report(|r| r.logs(checksum, report));

    if let Some(message) = run.error {
        return failed(message);
    }
    if let Some(result) = run.result {
        return JobOutcome::Success(result);
    }
    match exit {
        Ok(status) if !status.success() => failed(format!("worker exited with {}", status)),
        Ok(_) => failed("worker produced no result"),
        Err(e) => failed(format!("worker could not be awaited: {}", e)),
    }
}

/// What the worker has told us so far
#[derive(Default)]
struct WorkerRun {
    result: Option<Checksum>,
    error: Option<String>,
    execution_time: Option<f64>,
    stdout: CapturedOutput,
    stderr: CapturedOutput,
}

impl WorkerRun {
    async fn on_line(&mut self, ctx: &JobContext, checksum: Checksum, line: &str) {
        let message = match serde_json::from_str::<WorkerMessage>(line) {
            Ok(message) => message,
            Err(_) => {
                self.stdout.push_str(line);
                self.stdout.push_str("\n");
                return;
            }
        };

        match message {
            WorkerMessage::Progress { value } => ctx.report(|r| r.progress(checksum, value)),
            WorkerMessage::Preliminary { buffer } => match store_hex(ctx, &buffer).await {
                Ok(preliminary) => ctx.report(|r| r.preliminary(checksum, preliminary)),
                Err(e) => debug!("Dropping preliminary result: {}", e),
            },
            WorkerMessage::Result { buffer } => match store_hex(ctx, &buffer).await {
                Ok(result) => self.result = Some(result),
                Err(e) => self.error = Some(format!("could not store result: {}", e)),
            },
            WorkerMessage::ResultChecksum { checksum } => self.result = Some(checksum),
            WorkerMessage::Error { message } => self.error = Some(message),
            WorkerMessage::ExecutionTime { seconds } => self.execution_time = Some(seconds),
            WorkerMessage::Log { stream, content } => {
                let target = match stream {
                    LogStream::Stdout => &mut self.stdout,
                    LogStream::Stderr => &mut self.stderr,
                };
                target.push_str(&content);
            }
        }
    }
}

/// Read a stream to its end, keeping a bounded amount of it
async fn capture<R: AsyncRead + Unpin>(reader: &mut R) -> CapturedOutput {
    let mut captured = CapturedOutput::default();
    let mut chunk = [0u8; 8192];
    let mut pending = Vec::new();
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&chunk[..n]);
        // Hold back a UTF-8 sequence cut by the chunk boundary
        let complete = match std::str::from_utf8(&pending) {
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            _ => pending.len(),
        };
        captured.push_str(&String::from_utf8_lossy(&pending[..complete]));
        pending.drain(..complete);
    }
    captured.push_str(&String::from_utf8_lossy(&pending));
    captured
}

async fn store_hex(ctx: &JobContext, buffer: &str) -> Result<Checksum, String> {
    let bytes = hex::decode(buffer).map_err(|e| e.to_string())?;
    put_buffer(ctx.store.as_ref(), bytes)
        .await
        .map_err(|e| e.to_string())
}

async fn build_request(
    ctx: &JobContext,
    checksum: Checksum,
    tf: &Transformation,
) -> Result<WorkerRequest, TransformationError> {
    let mut pins = BTreeMap::new();
    for (name, pin) in &tf.pins {
        let Some(input) = pin.checksum else {
            return Err(TransformationError::Execution(format!(
                "input pin '{}' has no value",
                name
            )));
        };
        let buffer = resolve_input(ctx, pin, input)
            .await
            .ok_or(TransformationError::CacheMiss(input))?;
        pins.insert(
            name.clone(),
            WorkerPin {
                celltype: pin.celltype.clone(),
                subcelltype: pin.subcelltype.clone(),
                buffer: hex::encode(buffer),
            },
        );
    }

    Ok(WorkerRequest {
        transformation: checksum,
        language: tf.exec.language.clone(),
        output: tf.output.clone(),
        meta: tf.exec.meta.clone(),
        env: tf.exec.env,
        as_map: tf.as_map.clone(),
        pins,
    })
}

/// Find the bytes behind an input checksum, locally or from peers
async fn resolve_input(ctx: &JobContext, pin: &Pin, checksum: Checksum) -> Option<Vec<u8>> {
    let subcelltype = pin.subcelltype.as_deref();
    let mut candidates = ctx.index.syntactic(&checksum, &pin.celltype, subcelltype);
    if candidates.is_empty() && is_semantic_celltype(&pin.celltype) {
        candidates = ctx
            .clients
            .remote_semantic_to_syntactic(checksum, &pin.celltype, subcelltype, None, false)
            .await;
        for syntactic in &candidates {
            ctx.index
                .record(*syntactic, &pin.celltype, subcelltype, checksum);
        }
    }

    for candidate in &candidates {
        if let Ok(Some(buffer)) = ctx.store.get(candidate).await {
            return Some(buffer);
        }
    }
    for candidate in candidates {
        if let Some(buffer) = ctx.clients.remote_buffer(candidate, None, false).await {
            if let Err(e) = ctx.store.put(candidate, buffer.clone()).await {
                debug!("Could not keep fetched buffer {}: {}", candidate.short(), e);
            }
            return Some(buffer);
        }
    }
    None
}

/// SIGTERM, then SIGKILL once the grace period is over
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid refers to our own child, which has not been reaped yet
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!("Worker ignored SIGTERM, killing it");
        let _ = child.kill().await;
    }
}

fn failed(message: impl Into<String>) -> JobOutcome {
    JobOutcome::Failed(TransformationError::Execution(message.into()))
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
