//! Transformation cache
//!
//! Maps transformation checksums to their consumers, their single live job
//! and their outcome.
//!
//! # Entry lifecycle
//!
//! | Event | Effect |
//! |-------|--------|
//! | First registration | Entry created, canonical buffer stored, job started |
//! | Job succeeds | Result kept (outlives the entry) |
//! | Job fails | Exception kept until `clear_exception` |
//! | Last consumer released | Entry destroyed after the keep-alive period |
//! | Re-registered in time | Pending release becomes a no-op |

pub mod keepalive;
pub mod observer;
pub mod transformation_cache;

pub use keepalive::KeepAliveManager;
pub use observer::{ConsumerId, TransformationObserver};
pub use transformation_cache::{CacheServices, TransformationCache};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::buffer::MemoryBufferStore;
    use crate::cache::{CacheServices, TransformationCache};
    use crate::checksum::Checksum;
    use crate::communion::ClientManager;
    use crate::job::worker::{ProcessLauncher, WorkerLauncher};
    use crate::job::{ExecutionSettings, JobContext, JobReporter};
    use crate::transformation::{SemanticIndex, StructuredNormalizer};
    use std::sync::{Arc, Weak};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct NullReporter;

    impl JobReporter for NullReporter {
        fn progress(&self, _: Checksum, _: f64) {}
        fn preliminary(&self, _: Checksum, _: Checksum) {}
        fn logs(&self, _: Checksum, _: String) {}
    }

    pub fn settings() -> ExecutionSettings {
        ExecutionSettings {
            local_cores: 2,
            round_trip_timeout: Duration::from_millis(500),
            termination_grace: Duration::from_millis(500),
            ..ExecutionSettings::default()
        }
    }

    pub fn shell(script: &str) -> Arc<ProcessLauncher> {
        Arc::new(ProcessLauncher::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
        ))
    }

    pub fn job_context() -> JobContext {
        job_context_with(shell("cat >/dev/null"))
    }

    pub fn job_context_with(launcher: Arc<dyn WorkerLauncher>) -> JobContext {
        JobContext {
            store: Arc::new(MemoryBufferStore::new()),
            index: Arc::new(SemanticIndex::new()),
            clients: Arc::new(ClientManager::new(Duration::from_millis(500), 1000)),
            launcher,
            slots: Arc::new(Semaphore::new(2)),
            settings: settings(),
            reporter: Weak::<NullReporter>::new(),
        }
    }

    pub fn cache_with(
        launcher: Arc<dyn WorkerLauncher>,
        keep_alive_ms: u64,
    ) -> Arc<TransformationCache> {
        TransformationCache::new(
            CacheServices {
                store: Arc::new(MemoryBufferStore::new()),
                index: Arc::new(SemanticIndex::new()),
                clients: Arc::new(ClientManager::new(Duration::from_millis(500), 1000)),
                launcher,
                normalizer: Arc::new(StructuredNormalizer),
            },
            settings(),
            Duration::from_millis(keep_alive_ms),
        )
    }
}
