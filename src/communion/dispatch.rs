//! Serving side of communion
//!
//! Every request is checked against our servant capabilities first. Buffer
//! and semantic lookups that cannot be answered locally are passed on to the
//! other peers, marked as forwarded so that they are not passed on again.

use super::handshake::{Capabilities, Capability};
use super::message::{BufferStatus, CommunionRequest, RequestKind};
use super::peer::RequestHandler;
use super::wire::Content;
use crate::cache::TransformationCache;
use crate::checksum::Checksum;
use crate::error::{CommuneError, CommuneResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct Dispatcher {
    servant: Capabilities,
    small_buffer_limit: usize,
    cache: Arc<TransformationCache>,
}

impl Dispatcher {
    pub fn new(
        servant: Capabilities,
        small_buffer_limit: usize,
        cache: Arc<TransformationCache>,
    ) -> Self {
        Self {
            servant,
            small_buffer_limit,
            cache,
        }
    }

    fn too_large(&self, capability: Capability, length: usize) -> bool {
        capability == Capability::Small && length > self.small_buffer_limit
    }

    async fn buffer_status(
        &self,
        peer: &str,
        checksum: Checksum,
        capability: Capability,
        forwarded: bool,
    ) -> BufferStatus {
        if let Some(length) = self.cache.store().length(&checksum).await {
            return if self.too_large(capability, length) {
                BufferStatus::Restricted
            } else {
                BufferStatus::Local
            };
        }
        if forwarded {
            return BufferStatus::Unknown;
        }
        match self
            .cache
            .clients()
            .remote_buffer_status(checksum, Some(peer), true)
            .await
        {
            BufferStatus::Local | BufferStatus::Remote => BufferStatus::Remote,
            _ => BufferStatus::Unknown,
        }
    }

    async fn buffer(
        &self,
        peer: &str,
        checksum: Checksum,
        capability: Capability,
        forwarded: bool,
    ) -> CommuneResult<Content> {
        let store = self.cache.store();
        let buffer = match store.get(&checksum).await? {
            Some(buffer) => Some(buffer),
            None if !forwarded => {
                let fetched = self
                    .cache
                    .clients()
                    .remote_buffer(checksum, Some(peer), true)
                    .await;
                if let Some(buffer) = &fetched {
                    store.put(checksum, buffer.clone()).await?;
                }
                fetched
            }
            None => None,
        };
        Ok(match buffer {
            Some(buffer) if self.too_large(capability, buffer.len()) => {
                debug!("Not serving {}: larger than the small limit", checksum.short());
                Content::None
            }
            Some(buffer) => Content::Bytes(buffer),
            None => Content::None,
        })
    }

    async fn buffer_length(&self, peer: &str, checksum: Checksum, forwarded: bool) -> Content {
        let length = match self.cache.store().length(&checksum).await {
            Some(length) => Some(length),
            None if !forwarded => {
                self.cache
                    .clients()
                    .remote_buffer_length(checksum, Some(peer), true)
                    .await
            }
            None => None,
        };
        match length {
            Some(length) => Content::Json(Value::from(length)),
            None => Content::None,
        }
    }

    async fn semantic_to_syntactic(
        &self,
        peer: &str,
        checksum: Checksum,
        celltype: &str,
        subcelltype: Option<&str>,
        forwarded: bool,
    ) -> Content {
        let index = self.cache.index();
        let mut syntactic = index.syntactic(&checksum, celltype, subcelltype);
        if syntactic.is_empty() && !forwarded {
            syntactic = self
                .cache
                .clients()
                .remote_semantic_to_syntactic(checksum, celltype, subcelltype, Some(peer), true)
                .await;
            for variant in &syntactic {
                index.record(*variant, celltype, subcelltype, checksum);
            }
        }
        if syntactic.is_empty() {
            return Content::None;
        }
        Content::Json(Value::Array(
            syntactic
                .iter()
                .map(|cs| Value::String(cs.to_hex()))
                .collect(),
        ))
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, peer_id: &str, request: CommunionRequest) -> CommuneResult<Content> {
        let capability = self.servant.get(request.kind.capability());
        if !capability.enabled() {
            return Err(CommuneError::NotServed(request.kind.name().to_string()));
        }
        let checksum = request.checksum;
        let forwarded = request.forwarded;
        let cache = &self.cache;

        let content = match request.kind {
            RequestKind::BufferStatus => self
                .buffer_status(peer_id, checksum, capability, forwarded)
                .await
                .to_content(),
            RequestKind::Buffer => {
                self.buffer(peer_id, checksum, capability, forwarded)
                    .await?
            }
            RequestKind::BufferLength => self.buffer_length(peer_id, checksum, forwarded).await,
            RequestKind::SemanticToSyntactic {
                celltype,
                subcelltype,
            } => {
                self.semantic_to_syntactic(
                    peer_id,
                    checksum,
                    &celltype,
                    subcelltype.as_deref(),
                    forwarded,
                )
                .await
            }
            RequestKind::TransformationStatus { .. } => {
                cache.serve_transformation_status(checksum).await.to_content()
            }
            RequestKind::TransformationJob { meta } => cache
                .serve_transformation_job(checksum, meta, peer_id)
                .await
                .to_content(),
            RequestKind::TransformationWait { timeout_ms } => cache
                .serve_transformation_wait(checksum, timeout_ms.map(Duration::from_millis))
                .await
                .to_content(),
            RequestKind::TransformationCancel => {
                cache.serve_transformation_cancel(checksum, peer_id);
                Content::None
            }
            RequestKind::TransformationHardCancel => {
                cache.hard_cancel(checksum);
                Content::None
            }
            RequestKind::TransformationClearException => {
                cache.serve_clear_exception(checksum);
                Content::None
            }
        };
        Ok(content)
    }
}
