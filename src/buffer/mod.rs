//! Buffer storage
//!
//! The cache only needs a narrow contract from its buffer store: fetch and
//! store bytes by checksum, and keep owner-token reference counts so that
//! buffers nobody holds can be evicted.

mod memory;

pub use memory::MemoryBufferStore;

use crate::checksum::Checksum;
use crate::error::CommuneResult;
use async_trait::async_trait;

/// Checksum-addressed byte storage
#[async_trait]
pub trait BufferStore: Send + Sync {
    /// Fetch a buffer, `None` when unknown
    async fn get(&self, checksum: &Checksum) -> CommuneResult<Option<Vec<u8>>>;

    /// Store a buffer under its checksum
    async fn put(&self, checksum: Checksum, buffer: Vec<u8>) -> CommuneResult<()>;

    /// Whether the buffer is available without asking peers
    async fn contains(&self, checksum: &Checksum) -> bool;

    /// Length of a locally available buffer
    async fn length(&self, checksum: &Checksum) -> Option<usize>;

    /// Add a reference held by `owner`
    fn incref(&self, checksum: Checksum, owner: &str, persistent: bool);

    /// Drop a reference held by `owner`
    fn decref(&self, checksum: &Checksum, owner: &str);
}

/// Hash a buffer and store it, returning its checksum
pub async fn put_buffer(store: &dyn BufferStore, buffer: Vec<u8>) -> CommuneResult<Checksum> {
    let checksum = Checksum::digest(&buffer);
    store.put(checksum, buffer).await?;
    Ok(checksum)
}
