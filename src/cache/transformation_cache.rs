//! The transformation cache
//!
//! All bookkeeping lives behind one mutex: registered transformations and
//! their consumers, live jobs, final and preliminary results, cached
//! exceptions, progress and execution logs. The lock is never held across
//! an `.await`; jobs run in their own tasks and report back through
//! [`JobReporter`] and [`TransformationCache::job_done`].

use super::keepalive::KeepAliveManager;
use super::observer::{ConsumerId, TransformationObserver};
use crate::buffer::{put_buffer, BufferStore};
use crate::checksum::Checksum;
use crate::communion::{BufferStatus, ClientManager, JobStatus};
use crate::error::{CommuneError, CommuneResult, TransformationError};
use crate::job::worker::WorkerLauncher;
use crate::job::{ExecutionSettings, Job, JobContext, JobOutcome, JobReporter, JobState};
use crate::transformation::{
    is_semantic_celltype, ExecutionMeta, Normalizer, SemanticIndex, Transformation,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Longest a peer may hold a `transformation_wait` open
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Collaborators the cache is built from
pub struct CacheServices {
    pub store: Arc<dyn BufferStore>,
    pub index: Arc<SemanticIndex>,
    pub clients: Arc<ClientManager>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub normalizer: Arc<dyn Normalizer>,
}

struct Entry {
    tf: Arc<Transformation>,
    consumers: HashMap<ConsumerId, Option<Arc<dyn TransformationObserver>>>,
    /// Bumped on every registration; stale keep-alive releases compare it
    generation: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Checksum, Entry>,
    jobs: HashMap<Checksum, Arc<Job>>,
    results: HashMap<Checksum, Checksum>,
    preliminary: HashMap<Checksum, Checksum>,
    exceptions: HashMap<Checksum, TransformationError>,
    progress: HashMap<Checksum, f64>,
    logs: HashMap<Checksum, String>,
    next_consumer: u64,
    jobs_created: u64,
}

impl CacheState {
    fn observers(&self, checksum: &Checksum) -> Vec<Arc<dyn TransformationObserver>> {
        self.entries
            .get(checksum)
            .map(|entry| entry.consumers.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Status from what is known locally, without looking anything up
    fn snapshot(&self, checksum: &Checksum) -> Option<JobStatus> {
        if let Some(result) = self.results.get(checksum) {
            return Some(JobStatus::Done(*result));
        }
        if self.jobs.contains_key(checksum) {
            return Some(JobStatus::Running {
                progress: self.progress.get(checksum).copied(),
                preliminary: self.preliminary.get(checksum).copied(),
            });
        }
        self.exceptions
            .get(checksum)
            .map(|e| JobStatus::Exception(e.to_string()))
    }
}

fn tf_owner(checksum: &Checksum) -> String {
    format!("tf:{}", checksum.to_hex())
}

fn result_owner(checksum: &Checksum) -> String {
    format!("result:{}", checksum.to_hex())
}

pub struct TransformationCache {
    me: Weak<TransformationCache>,
    state: Mutex<CacheState>,
    ctx: JobContext,
    normalizer: Arc<dyn Normalizer>,
    keepalive: KeepAliveManager,
    keep_alive: Duration,
}

impl TransformationCache {
    /// Must be called inside a tokio runtime
    pub fn new(
        services: CacheServices,
        settings: ExecutionSettings,
        keep_alive: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let reporter: Weak<dyn JobReporter> = me.clone();
            Self {
                me: me.clone(),
                state: Mutex::new(CacheState::default()),
                ctx: JobContext {
                    store: services.store,
                    index: services.index,
                    clients: services.clients,
                    launcher: services.launcher,
                    slots: Arc::new(Semaphore::new(settings.local_cores)),
                    settings,
                    reporter,
                },
                normalizer: services.normalizer,
                keepalive: KeepAliveManager::start(),
                keep_alive,
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<dyn BufferStore> {
        &self.ctx.store
    }

    pub fn clients(&self) -> &Arc<ClientManager> {
        &self.ctx.clients
    }

    pub fn index(&self) -> &Arc<SemanticIndex> {
        &self.ctx.index
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.ctx.settings
    }

    /// Register interest in a transformation
    ///
    /// Inputs of semantic celltypes are replaced by their semantic
    /// checksums, the canonical buffer is stored, and a job is started
    /// unless a result or exception is already known. The observer, if
    /// any, is told about a known outcome right away.
    pub async fn register_transformation(
        &self,
        tf: Transformation,
        observer: Option<Arc<dyn TransformationObserver>>,
    ) -> CommuneResult<(Checksum, ConsumerId)> {
        let tf = self.normalize(tf).await?;
        let checksum = put_buffer(self.ctx.store.as_ref(), tf.canonical_buffer()?).await?;

        let (consumer, known_result, known_exception) = {
            let mut state = self.lock();
            let consumer = ConsumerId::Local(state.next_consumer);
            state.next_consumer += 1;
            self.attach_consumer(
                &mut state,
                checksum,
                Arc::new(tf),
                consumer.clone(),
                observer.clone(),
                None,
            );
            (
                consumer,
                state.results.get(&checksum).copied(),
                state.exceptions.get(&checksum).cloned(),
            )
        };
        debug!("Registered {} for {}", consumer, checksum.short());

        if let Some(observer) = observer {
            if let Some(result) = known_result {
                observer.on_result(checksum, result, false);
            } else if let Some(error) = known_exception {
                observer.on_exception(checksum, &error);
            }
        }
        Ok((checksum, consumer))
    }

    /// Replace syntactic input checksums of semantic celltypes
    async fn normalize(&self, mut tf: Transformation) -> CommuneResult<Transformation> {
        for pin in tf.pins.values_mut() {
            let Some(syntactic) = pin.checksum else {
                continue;
            };
            if !is_semantic_celltype(&pin.celltype) {
                continue;
            }
            let subcelltype = pin.subcelltype.as_deref();
            if let Some(semantic) = self.ctx.index.semantic(&syntactic, &pin.celltype, subcelltype)
            {
                pin.checksum = Some(semantic);
                continue;
            }
            let Some(buffer) = self.ctx.store.get(&syntactic).await? else {
                debug!(
                    "No buffer for {} input {}, keeping its checksum",
                    pin.celltype,
                    syntactic.short()
                );
                continue;
            };
            let semantic = match self.normalizer.normalize(&pin.celltype, &buffer) {
                Some(normalized) => put_buffer(self.ctx.store.as_ref(), normalized).await?,
                None => syntactic,
            };
            self.ctx
                .index
                .record(syntactic, &pin.celltype, subcelltype, semantic);
            pin.checksum = Some(semantic);
        }
        Ok(tf)
    }

    fn attach_consumer(
        &self,
        state: &mut CacheState,
        checksum: Checksum,
        tf: Arc<Transformation>,
        consumer: ConsumerId,
        observer: Option<Arc<dyn TransformationObserver>>,
        origin: Option<String>,
    ) {
        let entry = state.entries.entry(checksum).or_insert_with(|| {
            self.ctx.store.incref(checksum, &tf_owner(&checksum), false);
            Entry {
                tf,
                consumers: HashMap::new(),
                generation: 0,
            }
        });
        entry.consumers.insert(consumer, observer);
        entry.generation += 1;
        let tf = Arc::clone(&entry.tf);

        if !state.results.contains_key(&checksum) && !state.exceptions.contains_key(&checksum) {
            self.ensure_job(state, checksum, tf, origin);
        }
    }

    /// Drop one consumer; the entry itself goes after the keep-alive period
    pub fn release_transformation(&self, checksum: Checksum, consumer: &ConsumerId) {
        let generation = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(&checksum) else {
                return;
            };
            if entry.consumers.remove(consumer).is_none() || !entry.consumers.is_empty() {
                return;
            }
            entry.generation
        };
        debug!("Last consumer of {} released", checksum.short());
        self.schedule_expiry(checksum, generation);
    }

    fn schedule_expiry(&self, checksum: Checksum, generation: u64) {
        let me = self.me.clone();
        self.keepalive.schedule_release(self.keep_alive, move || {
            if let Some(cache) = me.upgrade() {
                cache.expire(checksum, generation);
            }
        });
    }

    /// Keep-alive release: destroy the entry if nobody came back
    fn expire(&self, checksum: Checksum, generation: u64) {
        let orphan = {
            let mut state = self.lock();
            let unused = state
                .entries
                .get(&checksum)
                .is_some_and(|e| e.consumers.is_empty() && e.generation == generation);
            if !unused {
                return;
            }
            state.entries.remove(&checksum);
            state.logs.remove(&checksum);
            match state.jobs.get(&checksum) {
                Some(job) if job.attached() == 0 => state.jobs.remove(&checksum),
                _ => None,
            }
        };
        debug!("Keep-alive expired for {}", checksum.short());
        self.ctx.store.decref(&checksum, &tf_owner(&checksum));
        if let Some(job) = orphan {
            info!("Cancelling job {} for {}: no consumers left", job.id, checksum.short());
            job.abort();
        }
    }

    /// Create the job for `checksum` unless one is live; never two per checksum
    fn ensure_job(
        &self,
        state: &mut CacheState,
        checksum: Checksum,
        tf: Arc<Transformation>,
        origin: Option<String>,
    ) -> Arc<Job> {
        if let Some(job) = state.jobs.get(&checksum) {
            return Arc::clone(job);
        }
        state.jobs_created += 1;
        let job = Job::new(checksum, state.jobs_created, origin);
        state.jobs.insert(checksum, Arc::clone(&job));
        state.progress.remove(&checksum);
        state.preliminary.remove(&checksum);

        let ctx = self.ctx.clone();
        let me = self.me.clone();
        let running = Arc::clone(&job);
        let handle = tokio::spawn(async move {
            let outcome = running.run(&ctx, &tf).await;
            match me.upgrade() {
                Some(cache) => cache.job_done(&running, outcome),
                None => running.publish(outcome),
            }
        });
        job.set_task(handle);
        job
    }

    /// Record a finished job and tell everyone
    fn job_done(&self, job: &Arc<Job>, outcome: JobOutcome) {
        let checksum = job.checksum;
        let (observers, expiry) = {
            let mut state = self.lock();
            if state
                .jobs
                .get(&checksum)
                .is_some_and(|live| Arc::ptr_eq(live, job))
            {
                state.jobs.remove(&checksum);
            }
            state.progress.remove(&checksum);
            state.preliminary.remove(&checksum);
            match &outcome {
                JobOutcome::Success(result) => {
                    state.results.insert(checksum, *result);
                    state.exceptions.remove(&checksum);
                }
                JobOutcome::Failed(error) if error.is_sticky() => {
                    state.exceptions.insert(checksum, error.clone());
                }
                _ => {}
            }
            let observers = state.observers(&checksum);

            // Peers that submitted this job are done with it
            let expiry = state.entries.get_mut(&checksum).and_then(|entry| {
                let before = entry.consumers.len();
                entry
                    .consumers
                    .retain(|id, _| !matches!(id, ConsumerId::Remote(_)));
                (before > 0 && entry.consumers.is_empty()).then_some(entry.generation)
            });
            (observers, expiry)
        };
        if let Some(generation) = expiry {
            self.schedule_expiry(checksum, generation);
        }

        match &outcome {
            JobOutcome::Success(result) => {
                info!(
                    "Job {} for {} done in {} ms: {}",
                    job.id,
                    checksum.short(),
                    job.elapsed_ms(),
                    result.short()
                );
                self.ctx.store.incref(*result, &result_owner(&checksum), true);
                for observer in &observers {
                    observer.on_result(checksum, *result, false);
                }
            }
            JobOutcome::Failed(error) => {
                warn!(
                    "Job {} for {} failed after {} ms and {} restarts: {}",
                    job.id,
                    checksum.short(),
                    job.elapsed_ms(),
                    job.restarts(),
                    error
                );
                for observer in &observers {
                    observer.on_exception(checksum, error);
                }
            }
            JobOutcome::HardCancelled => {
                info!("Job {} for {} hard-cancelled", job.id, checksum.short());
                for observer in &observers {
                    observer.on_exception(checksum, &TransformationError::HardCancelled);
                }
            }
            JobOutcome::Cancelled => {}
        }
        job.publish(outcome);
    }

    /// Result of a registered transformation, running it if needed
    ///
    /// Known results and cached exceptions are returned without starting a
    /// job. Concurrent callers share one job.
    pub async fn run_transformation(&self, checksum: Checksum) -> CommuneResult<Checksum> {
        let job = {
            let mut state = self.lock();
            if let Some(result) = state.results.get(&checksum) {
                return Ok(*result);
            }
            if let Some(error) = state.exceptions.get(&checksum) {
                return Err(error.clone().into());
            }
            match state.jobs.get(&checksum).cloned() {
                Some(job) => job,
                None => {
                    let tf = state
                        .entries
                        .get(&checksum)
                        .map(|entry| Arc::clone(&entry.tf))
                        .ok_or(CommuneError::UnknownTransformation(checksum))?;
                    self.ensure_job(&mut state, checksum, tf, None)
                }
            }
        };

        let mut outcome = job.subscribe();
        let _attached = Attached::new(&job, self.me.clone());
        let outcome = outcome
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| (*outcome).clone());

        match outcome {
            Some(JobOutcome::Success(result)) => Ok(result),
            Some(JobOutcome::Failed(error)) => Err(error.into()),
            Some(JobOutcome::HardCancelled) => Err(TransformationError::HardCancelled.into()),
            Some(JobOutcome::Cancelled) | None => Err(CommuneError::Internal(format!(
                "job for {} was cancelled",
                checksum.short()
            ))),
        }
    }

    /// Called when the last awaiter of a job goes away
    fn reap(&self, job: &Arc<Job>) {
        let orphan = {
            let mut state = self.lock();
            let live = state
                .jobs
                .get(&job.checksum)
                .is_some_and(|live| Arc::ptr_eq(live, job));
            if !live || state.entries.contains_key(&job.checksum) || job.attached() > 0 {
                return;
            }
            state.jobs.remove(&job.checksum)
        };
        if let Some(job) = orphan {
            info!("Cancelling job {}: nobody is waiting", job.id);
            job.abort();
        }
    }

    /// Forcibly stop the job for `checksum`, whoever still wants it
    pub fn hard_cancel(&self, checksum: Checksum) -> bool {
        let job = self.lock().jobs.get(&checksum).cloned();
        match job {
            Some(job) => {
                job.request_hard_cancel();
                true
            }
            None => false,
        }
    }

    /// Forget a cached exception here and on every peer, then retry
    pub fn clear_exception(&self, checksum: Checksum) {
        for service in self.ctx.clients.transformation_services(None) {
            tokio::spawn(async move {
                if let Err(e) = service.clear_exception(checksum).await {
                    debug!("clear_exception not forwarded to {}: {}", service.peer_id(), e);
                }
            });
        }
        self.clear_local_exception(checksum);
    }

    fn clear_local_exception(&self, checksum: Checksum) {
        let mut state = self.lock();
        if state.exceptions.remove(&checksum).is_some() {
            info!("Cleared exception for {}", checksum.short());
        }
        let retry = state
            .entries
            .get(&checksum)
            .filter(|entry| !entry.consumers.is_empty())
            .map(|entry| Arc::clone(&entry.tf));
        if let Some(tf) = retry {
            if !state.results.contains_key(&checksum) {
                self.ensure_job(&mut state, checksum, tf, None);
            }
        }
    }

    /// Look a transformation up by checksum, here or on peers
    async fn find_transformation(&self, checksum: Checksum) -> Option<Arc<Transformation>> {
        if let Some(entry) = self.lock().entries.get(&checksum) {
            return Some(Arc::clone(&entry.tf));
        }
        let buffer = match self.ctx.store.get(&checksum).await {
            Ok(Some(buffer)) => buffer,
            _ => {
                let buffer = self.ctx.clients.remote_buffer(checksum, None, false).await?;
                if let Err(e) = self.ctx.store.put(checksum, buffer.clone()).await {
                    debug!("Could not keep transformation {}: {}", checksum.short(), e);
                }
                buffer
            }
        };
        match Transformation::from_canonical(&buffer) {
            Ok(tf) => Some(Arc::new(tf)),
            Err(e) => {
                debug!("{} is not a transformation: {}", checksum.short(), e);
                None
            }
        }
    }

    /// Whether every input can be obtained, locally or from peers
    async fn inputs_available(&self, tf: &Transformation) -> bool {
        for pin in tf.pins.values() {
            let Some(checksum) = pin.checksum else {
                return false;
            };
            let subcelltype = pin.subcelltype.as_deref();
            let mut candidates = self.ctx.index.syntactic(&checksum, &pin.celltype, subcelltype);
            if candidates.is_empty() {
                candidates = self
                    .ctx
                    .clients
                    .remote_semantic_to_syntactic(checksum, &pin.celltype, subcelltype, None, false)
                    .await;
                for syntactic in &candidates {
                    self.ctx
                        .index
                        .record(*syntactic, &pin.celltype, subcelltype, checksum);
                }
            }

            let mut found = false;
            for candidate in candidates {
                if self.ctx.store.contains(&candidate).await
                    || self
                        .ctx
                        .clients
                        .remote_buffer_status(candidate, None, false)
                        .await
                        >= BufferStatus::Remote
                {
                    found = true;
                    break;
                }
            }
            if !found {
                return false;
            }
        }
        true
    }

    /// Answer a peer's `transformation_status`
    pub async fn serve_transformation_status(&self, checksum: Checksum) -> JobStatus {
        if let Some(status) = self.lock().snapshot(&checksum) {
            return status;
        }
        let Some(tf) = self.find_transformation(checksum).await else {
            return JobStatus::TransformationUnknown;
        };
        if tf.output.hash_pattern.is_some() || self.ctx.settings.local_cores == 0 {
            return JobStatus::NotRunnable;
        }
        if !self.inputs_available(&tf).await {
            return JobStatus::InputsUnknown;
        }
        JobStatus::Runnable
    }

    /// Answer a peer's `transformation_job`: run it on the peer's behalf
    pub async fn serve_transformation_job(
        &self,
        checksum: Checksum,
        meta: ExecutionMeta,
        peer: &str,
    ) -> JobStatus {
        if let Some(result) = self.lock().results.get(&checksum) {
            return JobStatus::Done(*result);
        }
        let Some(tf) = self.find_transformation(checksum).await else {
            return JobStatus::TransformationUnknown;
        };
        let tf = if meta.is_empty() {
            tf
        } else {
            let mut tf = (*tf).clone();
            tf.exec = meta;
            Arc::new(tf)
        };

        let mut state = self.lock();
        state.exceptions.remove(&checksum);
        self.attach_consumer(
            &mut state,
            checksum,
            tf,
            ConsumerId::Remote(peer.to_string()),
            None,
            Some(peer.to_string()),
        );
        info!("Peer {} submitted {}", peer, checksum.short());
        state.snapshot(&checksum).unwrap_or(JobStatus::Runnable)
    }

    /// Answer a peer's `transformation_wait`: hold until the job reports
    /// anything new or the timeout passes
    pub async fn serve_transformation_wait(
        &self,
        checksum: Checksum,
        timeout: Option<Duration>,
    ) -> JobStatus {
        let timeout = timeout
            .unwrap_or(self.ctx.settings.round_trip_timeout)
            .min(MAX_WAIT);
        let job = self.lock().jobs.get(&checksum).cloned();
        if let Some(job) = job {
            let mut outcome = job.subscribe();
            let mut updates = job.subscribe_updates();
            let woke = tokio::time::timeout(timeout, async {
                tokio::select! {
                    _ = outcome.wait_for(Option::is_some) => {}
                    _ = updates.changed() => {}
                }
            })
            .await
            .is_ok();
            if !woke {
                debug!("Wait on {} timed out", checksum.short());
            }
        }

        let state = self.lock();
        state.snapshot(&checksum).unwrap_or_else(|| {
            if state.entries.contains_key(&checksum) {
                JobStatus::Runnable
            } else {
                JobStatus::TransformationUnknown
            }
        })
    }

    pub fn serve_transformation_cancel(&self, checksum: Checksum, peer: &str) {
        self.release_transformation(checksum, &ConsumerId::Remote(peer.to_string()));
    }

    /// A peer asked us to forget an exception; not forwarded any further
    pub fn serve_clear_exception(&self, checksum: Checksum) {
        self.clear_local_exception(checksum);
    }

    pub fn result(&self, checksum: &Checksum) -> Option<Checksum> {
        self.lock().results.get(checksum).copied()
    }

    pub fn exception(&self, checksum: &Checksum) -> Option<TransformationError> {
        self.lock().exceptions.get(checksum).cloned()
    }

    pub fn last_progress(&self, checksum: &Checksum) -> Option<f64> {
        self.lock().progress.get(checksum).copied()
    }

    /// The report of the last local execution
    pub fn execution_log(&self, checksum: &Checksum) -> Option<String> {
        self.lock().logs.get(checksum).cloned()
    }

    pub fn job_state(&self, checksum: &Checksum) -> Option<JobState> {
        self.lock().jobs.get(checksum).map(|job| job.state())
    }

    pub fn consumers(&self, checksum: &Checksum) -> usize {
        self.lock()
            .entries
            .get(checksum)
            .map(|entry| entry.consumers.len())
            .unwrap_or(0)
    }

    pub fn is_registered(&self, checksum: &Checksum) -> bool {
        self.lock().entries.contains_key(checksum)
    }

    /// Number of jobs started since creation
    pub fn jobs_created(&self) -> u64 {
        self.lock().jobs_created
    }

    /// Release pending entries and stop every job
    pub fn shutdown(&self) {
        self.keepalive.purge_all();
        self.keepalive.shutdown();
        let jobs: Vec<_> = self.lock().jobs.drain().map(|(_, job)| job).collect();
        for job in jobs {
            job.abort();
        }
    }
}

impl JobReporter for TransformationCache {
    fn progress(&self, transformation: Checksum, progress: f64) {
        let (observers, job) = {
            let mut state = self.lock();
            if state.progress.get(&transformation) == Some(&progress) {
                return;
            }
            state.progress.insert(transformation, progress);
            (state.observers(&transformation), state.jobs.get(&transformation).cloned())
        };
        for observer in observers {
            observer.on_progress(transformation, progress);
        }
        if let Some(job) = job {
            job.notify_update();
        }
    }

    fn preliminary(&self, transformation: Checksum, result: Checksum) {
        let (observers, job) = {
            let mut state = self.lock();
            if state.preliminary.get(&transformation) == Some(&result) {
                return;
            }
            state.preliminary.insert(transformation, result);
            (state.observers(&transformation), state.jobs.get(&transformation).cloned())
        };
        for observer in observers {
            observer.on_result(transformation, result, true);
        }
        if let Some(job) = job {
            job.notify_update();
        }
    }

    fn logs(&self, transformation: Checksum, report: String) {
        let mut state = self.lock();
        if state.entries.contains_key(&transformation) {
            state.logs.insert(transformation, report);
        }
    }
}

/// Counts a `run_transformation` caller as attached to its job
struct Attached {
    job: Arc<Job>,
    cache: Weak<TransformationCache>,
}

impl Attached {
    fn new(job: &Arc<Job>, cache: Weak<TransformationCache>) -> Self {
        job.attach();
        Self {
            job: Arc::clone(job),
            cache,
        }
    }
}

impl Drop for Attached {
    fn drop(&mut self) {
        if self.job.detach() == 0 {
            if let Some(cache) = self.cache.upgrade() {
                cache.reap(&self.job);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cache::test_support::{cache_with, shell};
    use crate::transformation::{OutputPin, Pin};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const RESULT_42: &str = r#"echo '{"kind":"result","buffer":"3432"}'"#;

    fn transformation(tag: &str) -> Transformation {
        Transformation::new(OutputPin::new("result", "plain"))
            .with_pin("a", Pin::new("plain", Checksum::digest(tag.as_bytes())))
            .with_language("bash")
    }

    async fn register(cache: &TransformationCache, tag: &str) -> (Checksum, ConsumerId) {
        cache
            .store()
            .put(Checksum::digest(tag.as_bytes()), tag.as_bytes().to_vec())
            .await
            .unwrap();
        cache
            .register_transformation(transformation(tag), None)
            .await
            .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        results: AtomicUsize,
        preliminary: Mutex<Vec<Checksum>>,
        progress: Mutex<Vec<f64>>,
        exceptions: Mutex<Vec<TransformationError>>,
    }

    impl TransformationObserver for Recorder {
        fn on_result(&self, _tf: Checksum, result: Checksum, preliminary: bool) {
            if preliminary {
                self.preliminary.lock().unwrap().push(result);
            } else {
                self.results.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_progress(&self, _tf: Checksum, progress: f64) {
            self.progress.lock().unwrap().push(progress);
        }

        fn on_exception(&self, _tf: Checksum, error: &TransformationError) {
            self.exceptions.lock().unwrap().push(error.clone());
        }
    }

    #[tokio::test]
    async fn metadata_does_not_change_identity() {
        let cache = cache_with(shell(&format!("cat >/dev/null; {}", RESULT_42)), 5000);
        let plain = transformation("x");
        let with_meta = transformation("x").with_meta(serde_json::json!({"local": true}));
        let (a, _) = cache.register_transformation(plain, None).await.unwrap();
        let (b, _) = cache.register_transformation(with_meta, None).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.consumers(&a), 2);
    }

    #[tokio::test]
    async fn concurrent_runs_share_one_job() {
        let cache = cache_with(
            shell(&format!("cat >/dev/null; sleep 0.3; {}", RESULT_42)),
            5000,
        );
        let (checksum, _) = register(&cache, "shared").await;

        let (first, second) = tokio::join!(
            cache.run_transformation(checksum),
            cache.run_transformation(checksum)
        );
        let expected = Checksum::digest(b"42");
        assert_eq!(first.unwrap(), expected);
        assert_eq!(second.unwrap(), expected);
        assert_eq!(cache.jobs_created(), 1);
        assert!(cache.execution_log(&checksum).unwrap().contains(&expected.to_hex()));
    }

    #[tokio::test]
    async fn exceptions_are_sticky_until_cleared() {
        let cache = cache_with(
            shell(r#"cat >/dev/null; echo '{"kind":"error","message":"boom"}'"#),
            5000,
        );
        let (checksum, _) = register(&cache, "doomed").await;

        let err = cache.run_transformation(checksum).await.unwrap_err();
        assert!(matches!(
            err,
            CommuneError::Transformation(TransformationError::Execution(ref m)) if m == "boom"
        ));
        assert!(cache.run_transformation(checksum).await.is_err());
        assert_eq!(cache.jobs_created(), 1);

        cache.clear_exception(checksum);
        assert!(cache.run_transformation(checksum).await.is_err());
        assert_eq!(cache.jobs_created(), 2);
    }

    #[tokio::test]
    async fn keep_alive_grace_preserves_entry() {
        let cache = cache_with(shell(&format!("cat >/dev/null; {}", RESULT_42)), 300);
        let (checksum, consumer) = register(&cache, "grace").await;
        let result = cache.run_transformation(checksum).await.unwrap();

        cache.release_transformation(checksum, &consumer);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (again, _) = register(&cache, "grace").await;
        assert_eq!(again, checksum);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(cache.is_registered(&checksum));
        assert_eq!(cache.result(&checksum), Some(result));
    }

    #[tokio::test]
    async fn expired_entry_keeps_result() {
        let cache = cache_with(shell(&format!("cat >/dev/null; {}", RESULT_42)), 100);
        let (checksum, consumer) = register(&cache, "expire").await;
        let result = cache.run_transformation(checksum).await.unwrap();
        assert!(cache.execution_log(&checksum).is_some());

        cache.release_transformation(checksum, &consumer);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!cache.is_registered(&checksum));
        assert!(cache.execution_log(&checksum).is_none());
        assert_eq!(cache.run_transformation(checksum).await.unwrap(), result);
        assert_eq!(
            cache.store().get(&result).await.unwrap(),
            Some(b"42".to_vec())
        );
    }

    #[tokio::test]
    async fn hard_cancel_is_not_sticky() {
        let cache = cache_with(shell("cat >/dev/null; sleep 30"), 5000);
        let (checksum, _) = register(&cache, "slow").await;

        let runner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.run_transformation(checksum).await })
        };
        for _ in 0..100 {
            if cache.job_state(&checksum) == Some(JobState::ExecutingLocal) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.hard_cancel(checksum));

        let err = tokio::time::timeout(Duration::from_secs(10), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            CommuneError::Transformation(TransformationError::HardCancelled)
        ));
        assert!(cache.exception(&checksum).is_none());
        assert!(cache.job_state(&checksum).is_none());
        assert_eq!(cache.jobs_created(), 1);

        let rerun = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.run_transformation(checksum).await })
        };
        for _ in 0..100 {
            if cache.jobs_created() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(cache.jobs_created(), 2);
        cache.shutdown();
        rerun.abort();
    }

    #[tokio::test]
    async fn observers_hear_results() {
        let cache = cache_with(shell(&format!("cat >/dev/null; {}", RESULT_42)), 5000);
        cache
            .store()
            .put(Checksum::digest(b"obs"), b"obs".to_vec())
            .await
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let (checksum, _) = cache
            .register_transformation(transformation("obs"), Some(recorder.clone()))
            .await
            .unwrap();
        cache.run_transformation(checksum).await.unwrap();
        assert_eq!(recorder.results.load(Ordering::SeqCst), 1);

        // Late registrations are told right away
        let late = Arc::new(Recorder::default());
        cache
            .register_transformation(transformation("obs"), Some(late.clone()))
            .await
            .unwrap();
        assert_eq!(late.results.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn progress_and_preliminary_reach_observers_once() {
        let script = [
            "cat >/dev/null",
            r#"echo '{"kind":"progress","value":10.0}'"#,
            r#"echo '{"kind":"progress","value":10.0}'"#,
            r#"echo '{"kind":"preliminary","buffer":"3431"}'"#,
            r#"echo '{"kind":"preliminary","buffer":"3431"}'"#,
            r#"echo '{"kind":"progress","value":50.0}'"#,
            RESULT_42,
        ]
        .join("; ");
        let cache = cache_with(shell(&script), 5000);
        cache
            .store()
            .put(Checksum::digest(b"steps"), b"steps".to_vec())
            .await
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let (checksum, _) = cache
            .register_transformation(transformation("steps"), Some(recorder.clone()))
            .await
            .unwrap();
        cache.run_transformation(checksum).await.unwrap();

        assert_eq!(*recorder.progress.lock().unwrap(), vec![10.0, 50.0]);
        assert_eq!(
            *recorder.preliminary.lock().unwrap(),
            vec![Checksum::digest(b"41")]
        );
        assert_eq!(recorder.results.load(Ordering::SeqCst), 1);
        assert_eq!(cache.last_progress(&checksum), None);
    }

    #[tokio::test]
    async fn wait_wakes_on_progress() {
        let script = format!(
            r#"cat >/dev/null; sleep 0.5; echo '{{"kind":"progress","value":50.0}}'; sleep 5; {}"#,
            RESULT_42
        );
        let cache = cache_with(shell(&script), 5000);
        let (checksum, _) = register(&cache, "wait").await;

        let started = tokio::time::Instant::now();
        let status = cache
            .serve_transformation_wait(checksum, Some(Duration::from_secs(20)))
            .await;
        assert!(matches!(
            status,
            JobStatus::Running { progress: Some(p), .. } if p == 50.0
        ));
        assert!(started.elapsed() < Duration::from_secs(4));
        cache.shutdown();
    }

    #[tokio::test]
    async fn long_worker_output_is_truncated_in_log() {
        let script = format!(
            "cat >/dev/null; head -c 50000 /dev/zero | tr '\\0' x >&2; {}",
            RESULT_42
        );
        let cache = cache_with(shell(&script), 5000);
        let (checksum, _) = register(&cache, "noisy").await;
        cache.run_transformation(checksum).await.unwrap();

        let log = cache.execution_log(&checksum).unwrap();
        assert!(log.contains("...(skipped 40040 characters)..."));
        assert!(log.chars().count() < 11_000);
    }

    #[tokio::test]
    async fn unknown_transformation_is_an_error() {
        let cache = cache_with(shell("cat >/dev/null"), 5000);
        let err = cache
            .run_transformation(Checksum::digest(b"never registered"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommuneError::UnknownTransformation(_)));
    }

    #[tokio::test]
    async fn semantic_inputs_share_a_checksum() {
        let cache = cache_with(shell(&format!("cat >/dev/null; {}", RESULT_42)), 5000);
        let mut checksums = Vec::new();
        for settings in ["a: 1\nb: [x]\n", "# tuned\nb:\n  - x\na: 1   \n\n"] {
            let syntactic = put_buffer(cache.store().as_ref(), settings.as_bytes().to_vec())
                .await
                .unwrap();
            let tf = Transformation::new(OutputPin::new("result", "plain"))
                .with_pin("code", Pin::new("bash", Checksum::digest(b"cat settings")))
                .with_pin("settings", Pin::new("yaml", syntactic));
            let (checksum, _) = cache.register_transformation(tf, None).await.unwrap();
            checksums.push(checksum);
        }
        assert_eq!(checksums[0], checksums[1]);
    }

    #[tokio::test]
    async fn code_differing_in_hash_lines_is_distinct() {
        let cache = cache_with(shell(&format!("cat >/dev/null; {}", RESULT_42)), 5000);
        let mut checksums = Vec::new();
        for code in ["cat <<EOF\n# keep me\nEOF\n", "cat <<EOF\nEOF\n"] {
            let syntactic = put_buffer(cache.store().as_ref(), code.as_bytes().to_vec())
                .await
                .unwrap();
            let tf = Transformation::new(OutputPin::new("result", "plain"))
                .with_pin("code", Pin::new("bash", syntactic));
            let (checksum, _) = cache.register_transformation(tf, None).await.unwrap();
            cache.run_transformation(checksum).await.unwrap();
            checksums.push(checksum);
        }
        assert_ne!(checksums[0], checksums[1]);
        assert_eq!(cache.jobs_created(), 2);
    }
}
