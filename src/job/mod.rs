//! Jobs: one execution attempt per transformation checksum
//!
//! A job first asks transformation servants whether they already have (or
//! can produce) the result, and falls back to running the transformation
//! in a local worker process. Remote peers may ask for a restart, which
//! loops back to the survey, up to a fixed cap.

pub mod bash;
pub mod local;
pub mod remote;
pub mod worker;

use crate::buffer::BufferStore;
use crate::checksum::Checksum;
use crate::communion::ClientManager;
use crate::error::TransformationError;
use crate::transformation::{SemanticIndex, Transformation};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use worker::WorkerLauncher;

pub use remote::{RemoteOutcome, SurveyOutcome, TransformationService};

/// Where a job is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Surveying,
    AwaitingRemote,
    ExecutingLocal,
    RestartRequested,
    Done,
    Failed,
    HardCancelled,
}

/// How a job ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(Checksum),
    Failed(TransformationError),
    HardCancelled,
    /// Dropped because nobody needs the result anymore
    Cancelled,
}

/// Receives what a running job reports, in emission order
pub trait JobReporter: Send + Sync {
    fn progress(&self, transformation: Checksum, progress: f64);
    fn preliminary(&self, transformation: Checksum, result: Checksum);
    fn logs(&self, transformation: Checksum, report: String);
}

/// Execution knobs shared by all jobs of one instance
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub local_cores: usize,
    pub force_local: bool,
    pub restart_cap: u32,
    pub round_trip_timeout: Duration,
    pub termination_grace: Duration,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            local_cores: 1,
            force_local: false,
            restart_cap: 100,
            round_trip_timeout: Duration::from_secs(5),
            termination_grace: Duration::from_millis(2000),
        }
    }
}

/// Services a job needs while it runs
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn BufferStore>,
    pub index: Arc<SemanticIndex>,
    pub clients: Arc<ClientManager>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub slots: Arc<Semaphore>,
    pub settings: ExecutionSettings,
    pub reporter: Weak<dyn JobReporter>,
}

impl JobContext {
    pub(crate) fn report(&self, f: impl FnOnce(&dyn JobReporter)) {
        if let Some(reporter) = self.reporter.upgrade() {
            f(reporter.as_ref());
        }
    }
}

pub struct Job {
    pub checksum: Checksum,
    pub id: u64,
    /// Peer that submitted this job, never asked to run it back
    origin_peer: Option<String>,
    state: Mutex<JobState>,
    attached: AtomicUsize,
    restarts: AtomicU32,
    hard_cancel: watch::Sender<bool>,
    outcome: watch::Sender<Option<JobOutcome>>,
    /// Bumped on every progress or preliminary report
    updates: watch::Sender<u64>,
    started_at: DateTime<Utc>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Job {
    pub fn new(checksum: Checksum, id: u64, origin_peer: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            checksum,
            id,
            origin_peer,
            state: Mutex::new(JobState::Created),
            attached: AtomicUsize::new(0),
            restarts: AtomicU32::new(0),
            hard_cancel: watch::channel(false).0,
            outcome: watch::channel(None).0,
            updates: watch::channel(0).0,
            started_at: Utc::now(),
            task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Add a consumer; returns the new count
    pub fn attach(&self) -> usize {
        self.attached.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn detach(&self) -> usize {
        self.attached
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or(0)
    }

    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Milliseconds since the job was created
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<JobOutcome>> {
        self.outcome.subscribe()
    }

    /// Changes whenever the job reports progress or a preliminary result
    pub fn subscribe_updates(&self) -> watch::Receiver<u64> {
        self.updates.subscribe()
    }

    pub(crate) fn notify_update(&self) {
        self.updates.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub(crate) fn set_task(&self, handle: JoinHandle<()>) {
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Terminate the job no matter who still wants it
    pub fn request_hard_cancel(&self) {
        info!("Hard-cancelling job {} for {}", self.id, self.checksum.short());
        self.hard_cancel.send_replace(true);
    }

    /// Ordinary cancellation: drop the work, its worker dies with it
    pub(crate) fn abort(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.publish(JobOutcome::Cancelled);
    }

    /// Publish the final outcome to everyone awaiting this job
    pub(crate) fn publish(&self, outcome: JobOutcome) {
        let state = match &outcome {
            JobOutcome::Success(_) => JobState::Done,
            JobOutcome::HardCancelled => JobState::HardCancelled,
            JobOutcome::Failed(_) | JobOutcome::Cancelled => JobState::Failed,
        };
        self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            self.set_state(state);
            true
        });
    }

    /// Drive the job to completion
    pub async fn run(&self, ctx: &JobContext, tf: &Transformation) -> JobOutcome {
        info!(
            "Job {} started for {} at {}",
            self.id,
            self.checksum.short(),
            self.started_at.format("%H:%M:%S%.3f")
        );
        let mut hard_cancel = self.hard_cancel.subscribe();
        if *hard_cancel.borrow() {
            return JobOutcome::HardCancelled;
        }

        let local_flag = tf.exec.local();
        let skip_remote = ctx.settings.force_local || local_flag == Some(true);
        if !skip_remote {
            if let Some(outcome) = self.run_remote(ctx, tf, &mut hard_cancel).await {
                return outcome;
            }
        }

        if local_flag == Some(false) {
            return JobOutcome::Failed(TransformationError::LocalDisabled(
                "transformation metadata forbids local execution".to_string(),
            ));
        }
        if ctx.settings.local_cores == 0 {
            return JobOutcome::Failed(TransformationError::LocalDisabled(
                "no local cores configured".to_string(),
            ));
        }

        self.set_state(JobState::ExecutingLocal);
        local::execute(ctx, self.checksum, tf, &mut hard_cancel).await
    }

    /// Survey peers and follow the best one; `None` means fall back to local execution
    async fn run_remote(
        &self,
        ctx: &JobContext,
        tf: &Transformation,
        hard_cancel: &mut watch::Receiver<bool>,
    ) -> Option<JobOutcome> {
        let origin = self.origin_peer.as_deref();
        self.race_servants(ctx, tf, hard_cancel, || {
            ctx.clients.transformation_services(origin)
        })
        .await
    }

    /// One survey-and-follow round per restart, up to the restart cap
    async fn race_servants(
        &self,
        ctx: &JobContext,
        tf: &Transformation,
        hard_cancel: &mut watch::Receiver<bool>,
        servants: impl Fn() -> Vec<Arc<dyn TransformationService>>,
    ) -> Option<JobOutcome> {
        loop {
            self.set_state(JobState::Surveying);
            let services = servants();
            let survey = tokio::select! {
                survey = remote::survey(
                    &services,
                    self.checksum,
                    &tf.exec,
                    ctx.settings.round_trip_timeout,
                ) => survey,
                _ = hard_cancelled(hard_cancel) => return Some(JobOutcome::HardCancelled),
            };

            let candidates = match survey {
                SurveyOutcome::Done(result) => return Some(JobOutcome::Success(result)),
                SurveyOutcome::Exception(message) => {
                    return Some(JobOutcome::Failed(TransformationError::Remote(message)))
                }
                SurveyOutcome::Candidates(candidates) => candidates,
                SurveyOutcome::Unavailable => return None,
            };

            self.set_state(JobState::AwaitingRemote);
            match remote::follow(candidates, self.checksum, &tf.exec, ctx, hard_cancel).await {
                RemoteOutcome::Done(result) => return Some(JobOutcome::Success(result)),
                RemoteOutcome::Failed(message) => {
                    return Some(JobOutcome::Failed(TransformationError::Remote(message)))
                }
                RemoteOutcome::HardCancelled => return Some(JobOutcome::HardCancelled),
                RemoteOutcome::Unavailable => return None,
                RemoteOutcome::Restart => {
                    self.set_state(JobState::RestartRequested);
                    let restarts = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
                    if restarts > ctx.settings.restart_cap {
                        return Some(JobOutcome::Failed(TransformationError::RestartExceeded(
                            ctx.settings.restart_cap,
                        )));
                    }
                    warn!(
                        "Job {} for {} restarting ({} so far)",
                        self.id,
                        self.checksum.short(),
                        restarts
                    );
                }
            }
        }
    }
}

/// Resolves when a hard cancel has been requested
pub(crate) async fn hard_cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
