//! One complete commune instance
//!
//! Wires the buffer store, semantic index, peer clients, worker launcher,
//! transformation cache and communion server together from a [`Config`].

use crate::buffer::{put_buffer, BufferStore, MemoryBufferStore};
use crate::cache::{CacheServices, TransformationCache};
use crate::checksum::Checksum;
use crate::communion::{ClientManager, CommunionServer, Dispatcher, PeerConfig};
use crate::config::Config;
use crate::error::CommuneResult;
use crate::job::worker::{ProcessLauncher, WorkerLauncher};
use crate::transformation::{SemanticIndex, StructuredNormalizer, Transformation};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct Instance {
    cache: Arc<TransformationCache>,
    server: Arc<CommunionServer>,
    listen_addr: Option<SocketAddr>,
}

impl Instance {
    /// Start an instance with the configured worker command
    pub async fn start(config: &Config) -> CommuneResult<Self> {
        let launcher = ProcessLauncher::from_command(&config.execution.worker_command)?;
        Self::start_with(config, Arc::new(launcher)).await
    }

    /// Start an instance that runs local jobs through `launcher`
    pub async fn start_with(
        config: &Config,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> CommuneResult<Self> {
        let id = config
            .communion
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let store: Arc<dyn BufferStore> = match &config.cache.buffer_dir {
            Some(dir) => {
                debug!("Persisting buffers in {}", dir.display());
                Arc::new(MemoryBufferStore::with_dir(dir.clone()))
            }
            None => Arc::new(MemoryBufferStore::new()),
        };
        let clients = Arc::new(ClientManager::new(
            config.communion.round_trip_timeout(),
            config.communion.small_buffer_limit,
        ));

        let cache = TransformationCache::new(
            CacheServices {
                store,
                index: Arc::new(SemanticIndex::new()),
                clients: Arc::clone(&clients),
                launcher,
                normalizer: Arc::new(StructuredNormalizer),
            },
            config.execution_settings(),
            config.cache.keep_alive(),
        );

        let dispatcher = Dispatcher::new(
            config.communion.servant,
            config.communion.small_buffer_limit,
            Arc::clone(&cache),
        );
        let server = CommunionServer::new(
            PeerConfig::new(id, config.communion.master, config.communion.servant),
            Arc::new(dispatcher),
            clients,
        );

        let listen_addr = match config.communion.listen_addr() {
            Some(addr) => Some(server.listen(&addr).await?),
            None => None,
        };
        server.connect_all(&config.communion.peers).await;
        info!(
            "Instance {} up ({} peer(s) linked)",
            server.id(),
            server.peers().len()
        );

        Ok(Self {
            cache,
            server,
            listen_addr,
        })
    }

    pub fn id(&self) -> &str {
        self.server.id()
    }

    pub fn cache(&self) -> &Arc<TransformationCache> {
        &self.cache
    }

    pub fn server(&self) -> &Arc<CommunionServer> {
        &self.server
    }

    /// Address the communion listener is bound to
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Dial another instance; returns its ID
    pub async fn connect(&self, addr: &str) -> CommuneResult<String> {
        self.server.connect(addr).await
    }

    /// Store a buffer locally and return its checksum
    pub async fn put_buffer(&self, buffer: Vec<u8>) -> CommuneResult<Checksum> {
        put_buffer(self.cache.store().as_ref(), buffer).await
    }

    /// A buffer from the local store, or from the first peer that has it
    pub async fn buffer(&self, checksum: Checksum) -> CommuneResult<Option<Vec<u8>>> {
        if let Some(buffer) = self.cache.store().get(&checksum).await? {
            return Ok(Some(buffer));
        }
        let fetched = self.cache.clients().remote_buffer(checksum, None, false).await;
        if let Some(buffer) = &fetched {
            self.cache.store().put(checksum, buffer.clone()).await?;
        }
        Ok(fetched)
    }

    /// Register a transformation, wait for its result checksum, release it
    pub async fn compute(&self, tf: Transformation) -> CommuneResult<Checksum> {
        let (checksum, consumer) = self.cache.register_transformation(tf, None).await?;
        let result = self.cache.run_transformation(checksum).await;
        self.cache.release_transformation(checksum, &consumer);
        result
    }

    /// Purge pending releases, stop jobs and close every link
    pub fn shutdown(&self) {
        info!("Shutting down instance {}", self.id());
        self.server.shutdown();
        self.cache.shutdown();
    }
}
