//! Remote execution through transformation servants
//!
//! The survey asks every servant for its status concurrently and keeps the
//! best answer; a "done" answer ends the round at once. Following a
//! servant means submitting the job if needed and long-polling it until it
//! finishes, fails, or loses the job (a restart).

use super::{hard_cancelled, JobContext};
use crate::checksum::Checksum;
use crate::communion::{gather, JobStatus};
use crate::error::CommuneResult;
use crate::transformation::ExecutionMeta;
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// A peer that can report on and run transformations
#[async_trait]
pub trait TransformationService: Send + Sync {
    fn peer_id(&self) -> &str;

    async fn status(&self, checksum: Checksum, meta: &ExecutionMeta) -> CommuneResult<JobStatus>;

    async fn submit(&self, checksum: Checksum, meta: &ExecutionMeta) -> CommuneResult<JobStatus>;

    /// Long-poll: returns when the job finishes or `window` elapses
    async fn wait(&self, checksum: Checksum, window: Duration) -> CommuneResult<JobStatus>;

    async fn cancel(&self, checksum: Checksum) -> CommuneResult<()>;

    async fn hard_cancel(&self, checksum: Checksum) -> CommuneResult<()>;

    async fn clear_exception(&self, checksum: Checksum) -> CommuneResult<()>;
}

pub enum SurveyOutcome {
    Done(Checksum),
    Exception(String),
    /// Servants sharing the best status (runnable or running)
    Candidates(Vec<(Arc<dyn TransformationService>, JobStatus)>),
    Unavailable,
}

/// Best-of-N status race with early exit on "done"
pub async fn survey(
    services: &[Arc<dyn TransformationService>],
    checksum: Checksum,
    meta: &ExecutionMeta,
    window: Duration,
) -> SurveyOutcome {
    if services.is_empty() {
        return SurveyOutcome::Unavailable;
    }

    let queries = services.iter().map(|service| {
        let service = Arc::clone(service);
        let meta = meta.clone();
        async move {
            match service.status(checksum, &meta).await {
                Ok(status) => Some((service, status)),
                Err(e) => {
                    debug!("Status request to {} failed: {}", service.peer_id(), e);
                    None
                }
            }
        }
    });
    let answers = gather(queries, window, |(_, status)| status.code() == 3).await;

    let Some(best) = answers
        .iter()
        .map(|(_, status)| status.code())
        .filter(|code| *code >= 0)
        .max()
    else {
        return SurveyOutcome::Unavailable;
    };

    let mut best_answers = answers
        .into_iter()
        .filter(|(_, status)| status.code() == best);
    match best {
        3 => match best_answers.next() {
            Some((_, JobStatus::Done(result))) => SurveyOutcome::Done(result),
            _ => SurveyOutcome::Unavailable,
        },
        0 => match best_answers.next() {
            Some((_, JobStatus::Exception(message))) => SurveyOutcome::Exception(message),
            _ => SurveyOutcome::Unavailable,
        },
        1 => SurveyOutcome::Candidates(best_answers.take(1).collect()),
        _ => SurveyOutcome::Candidates(best_answers.collect()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    Done(Checksum),
    Failed(String),
    HardCancelled,
    /// The servant lost the job; survey again
    Restart,
    /// No servant can run it after all
    Unavailable,
}

/// Tells servants we no longer need a job when the follow ends early
struct CancelGuard {
    services: Vec<Arc<dyn TransformationService>>,
    checksum: Checksum,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        for service in self.services.drain(..) {
            let checksum = self.checksum;
            handle.spawn(async move {
                let _ = service.cancel(checksum).await;
            });
        }
    }
}

/// Follow the candidate servants until one of them settles the job
pub async fn follow(
    candidates: Vec<(Arc<dyn TransformationService>, JobStatus)>,
    checksum: Checksum,
    meta: &ExecutionMeta,
    ctx: &JobContext,
    hard_cancel: &mut watch::Receiver<bool>,
) -> RemoteOutcome {
    let mut guard = CancelGuard {
        services: candidates.iter().map(|(s, _)| Arc::clone(s)).collect(),
        checksum,
        armed: true,
    };

    let mut running: FuturesUnordered<_> = candidates
        .into_iter()
        .map(|(service, status)| follow_one(service, status, checksum, meta.clone(), ctx))
        .collect();

    let mut restart = false;
    loop {
        tokio::select! {
            next = running.next() => match next {
                Some(RemoteOutcome::Done(result)) => return RemoteOutcome::Done(result),
                Some(RemoteOutcome::Failed(message)) => return RemoteOutcome::Failed(message),
                Some(RemoteOutcome::Restart) => restart = true,
                Some(_) => {}
                None => {
                    return if restart {
                        RemoteOutcome::Restart
                    } else {
                        RemoteOutcome::Unavailable
                    };
                }
            },
            _ = hard_cancelled(hard_cancel) => {
                guard.armed = false;
                for service in &guard.services {
                    let service = Arc::clone(service);
                    tokio::spawn(async move {
                        if let Err(e) = service.hard_cancel(checksum).await {
                            debug!("Hard cancel on {} not delivered: {}", service.peer_id(), e);
                        }
                    });
                }
                return RemoteOutcome::HardCancelled;
            }
        }
    }
}

async fn follow_one(
    service: Arc<dyn TransformationService>,
    initial: JobStatus,
    checksum: Checksum,
    meta: ExecutionMeta,
    ctx: &JobContext,
) -> RemoteOutcome {
    let window = ctx.settings.round_trip_timeout;
    let mut submitted = false;
    let mut status = initial;
    let mut last_progress = None;
    let mut last_preliminary = None;

    loop {
        match status {
            JobStatus::Done(result) => return RemoteOutcome::Done(result),
            JobStatus::Exception(message) => return RemoteOutcome::Failed(message),
            JobStatus::Runnable if !submitted => {
                submitted = true;
                debug!("Submitting {} to {}", checksum.short(), service.peer_id());
                status = match service.submit(checksum, &meta).await {
                    Ok(status) => status,
                    Err(e) => {
                        debug!("Submit to {} failed: {}", service.peer_id(), e);
                        return RemoteOutcome::Unavailable;
                    }
                };
                continue;
            }
            JobStatus::Running {
                progress,
                preliminary,
            } => {
                submitted = true;
                if progress.is_some() && progress != last_progress {
                    last_progress = progress;
                    if let Some(progress) = progress {
                        ctx.report(|r| r.progress(checksum, progress));
                    }
                }
                if preliminary.is_some() && preliminary != last_preliminary {
                    last_preliminary = preliminary;
                    if let Some(preliminary) = preliminary {
                        ctx.report(|r| r.preliminary(checksum, preliminary));
                    }
                }
            }
            JobStatus::Runnable | JobStatus::TransformationUnknown => {
                debug!("{} lost job {}", service.peer_id(), checksum.short());
                return RemoteOutcome::Restart;
            }
            JobStatus::NotRunnable | JobStatus::InputsUnknown => return RemoteOutcome::Unavailable,
        }

        status = match service.wait(checksum, window).await {
            Ok(status) => status,
            Err(e) if e.is_transient() => match service.status(checksum, &meta).await {
                Ok(status) => status,
                Err(e) => {
                    debug!("Lost contact with {}: {}", service.peer_id(), e);
                    return RemoteOutcome::Unavailable;
                }
            },
            Err(e) => {
                debug!("Wait on {} failed: {}", service.peer_id(), e);
                return RemoteOutcome::Unavailable;
            }
        };
    }
}
