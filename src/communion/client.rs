//! Outgoing side of communion
//!
//! The client manager keeps one entry per connected peer together with the
//! joint capability map (our master map met with the peer's servant map)
//! and fans requests out to every peer allowed to answer them.

use super::handshake::{Capabilities, Capability, CommunionKind};
use super::message::{BufferStatus, CommunionRequest, JobStatus, RequestKind};
use super::peer::PeerLink;
use super::wire::Content;
use crate::checksum::Checksum;
use crate::error::{CommuneError, CommuneResult};
use crate::job::TransformationService;
use crate::transformation::ExecutionMeta;
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound for a single buffer transfer
const BUFFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Collect answers as they arrive
///
/// Each answer restarts the `window`; a quiet window ends the round. An
/// answer for which `is_decisive` holds ends it at once.
pub async fn gather<F, T>(
    futures: impl IntoIterator<Item = F>,
    window: Duration,
    is_decisive: impl Fn(&T) -> bool,
) -> Vec<T>
where
    F: Future<Output = Option<T>>,
{
    let mut pending: FuturesUnordered<F> = futures.into_iter().collect();
    let mut answers = Vec::new();
    while !pending.is_empty() {
        match tokio::time::timeout(window, pending.next()).await {
            Ok(Some(Some(answer))) => {
                let decisive = is_decisive(&answer);
                answers.push(answer);
                if decisive {
                    break;
                }
            }
            Ok(Some(None)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    answers
}

#[derive(Clone)]
struct PeerEntry {
    link: Arc<PeerLink>,
    joint: Capabilities,
}

pub struct ClientManager {
    peers: RwLock<Vec<PeerEntry>>,
    round_trip: Duration,
    small_buffer_limit: usize,
}

impl ClientManager {
    pub fn new(round_trip: Duration, small_buffer_limit: usize) -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
            round_trip,
            small_buffer_limit,
        }
    }

    pub fn add_peer(&self, link: Arc<PeerLink>, master: &Capabilities) {
        let joint = master.meet(&link.peer_config().servant);
        info!("Serving as master for peer {}", link.peer_id());
        debug!("Joint capabilities with {}: {:?}", link.peer_id(), joint);
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.retain(|entry| entry.link.peer_id() != link.peer_id());
        peers.push(PeerEntry { link, joint });
    }

    pub fn remove_peer(&self, peer_id: &str) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| entry.link.peer_id() != peer_id);
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| entry.link.peer_id().to_string())
            .collect()
    }

    /// Open links allowed to answer `kind`, except the excluded peer
    fn peers_for(&self, kind: CommunionKind, exclude: Option<&str>) -> Vec<PeerEntry> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.joint.get(kind).enabled())
            .filter(|entry| !entry.link.is_closed())
            .filter(|entry| Some(entry.link.peer_id()) != exclude)
            .cloned()
            .collect()
    }

    fn request(kind: RequestKind, checksum: Checksum, forwarded: bool) -> CommunionRequest {
        let request = CommunionRequest::new(kind, checksum);
        if forwarded {
            request.forwarded()
        } else {
            request
        }
    }

    /// Best buffer status any peer reports
    pub async fn remote_buffer_status(
        &self,
        checksum: Checksum,
        exclude: Option<&str>,
        forwarded: bool,
    ) -> BufferStatus {
        let request = Self::request(RequestKind::BufferStatus, checksum, forwarded);
        let queries = self
            .peers_for(CommunionKind::BufferStatus, exclude)
            .into_iter()
            .map(|entry| {
                let request = request.clone();
                async move {
                    let response = entry.link.request(&request, self.round_trip).await;
                    match response.and_then(|r| BufferStatus::from_content(&r.content)) {
                        Ok(status) => Some(status),
                        Err(e) => {
                            debug!("buffer_status from {}: {}", entry.link.peer_id(), e);
                            None
                        }
                    }
                }
            });
        gather(queries, self.round_trip, |status| *status == BufferStatus::Local)
            .await
            .into_iter()
            .max()
            .unwrap_or(BufferStatus::Unknown)
    }

    /// Fetch a buffer from the first peer that has it
    ///
    /// Buffers whose digest does not match the checksum are discarded.
    pub async fn remote_buffer(
        &self,
        checksum: Checksum,
        exclude: Option<&str>,
        forwarded: bool,
    ) -> Option<Vec<u8>> {
        for entry in self.peers_for(CommunionKind::Buffer, exclude) {
            let peer = entry.link.peer_id();
            if entry.joint.buffer == Capability::Small {
                let length_request = Self::request(RequestKind::BufferLength, checksum, forwarded);
                let length = entry
                    .link
                    .request(&length_request, self.round_trip)
                    .await
                    .ok()
                    .and_then(|r| content_length(&r.content));
                match length {
                    Some(length) if length <= self.small_buffer_limit => {}
                    _ => continue,
                }
            }

            let request = Self::request(RequestKind::Buffer, checksum, forwarded);
            let response = match entry.link.request(&request, BUFFER_TIMEOUT).await {
                Ok(response) => response,
                Err(e) => {
                    debug!("buffer from {}: {}", peer, e);
                    continue;
                }
            };
            match response.content {
                Content::Bytes(buffer) if Checksum::digest(&buffer) == checksum => {
                    debug!("Got buffer {} from {}", checksum.short(), peer);
                    return Some(buffer);
                }
                Content::Bytes(_) => {
                    warn!("Peer {} sent a corrupt buffer for {}", peer, checksum.short());
                }
                _ => {}
            }
        }
        None
    }

    pub async fn remote_buffer_length(
        &self,
        checksum: Checksum,
        exclude: Option<&str>,
        forwarded: bool,
    ) -> Option<usize> {
        let request = Self::request(RequestKind::BufferLength, checksum, forwarded);
        let queries = self
            .peers_for(CommunionKind::BufferLength, exclude)
            .into_iter()
            .map(|entry| {
                let request = request.clone();
                async move {
                    let response = entry.link.request(&request, self.round_trip).await.ok()?;
                    content_length(&response.content)
                }
            });
        gather(queries, self.round_trip, |_| true)
            .await
            .into_iter()
            .next()
    }

    /// Union of the syntactic checksums peers know for a semantic one
    pub async fn remote_semantic_to_syntactic(
        &self,
        checksum: Checksum,
        celltype: &str,
        subcelltype: Option<&str>,
        exclude: Option<&str>,
        forwarded: bool,
    ) -> Vec<Checksum> {
        let kind = RequestKind::SemanticToSyntactic {
            celltype: celltype.to_string(),
            subcelltype: subcelltype.map(str::to_string),
        };
        let request = Self::request(kind, checksum, forwarded);
        let queries = self
            .peers_for(CommunionKind::SemanticToSyntactic, exclude)
            .into_iter()
            .map(|entry| {
                let request = request.clone();
                async move {
                    let response = entry.link.request(&request, self.round_trip).await.ok()?;
                    content_checksums(&response.content)
                }
            });

        let mut union = Vec::new();
        for answer in gather(queries, self.round_trip, |_| false).await {
            for checksum in answer {
                if !union.contains(&checksum) {
                    union.push(checksum);
                }
            }
        }
        union
    }

    /// Peers we may ask about transformations
    pub fn transformation_services(
        &self,
        exclude: Option<&str>,
    ) -> Vec<Arc<dyn TransformationService>> {
        self.peers_for(CommunionKind::TransformationStatus, exclude)
            .into_iter()
            .map(|entry| {
                Arc::new(TransformationClient {
                    link: entry.link,
                    joint: entry.joint,
                    round_trip: self.round_trip,
                }) as Arc<dyn TransformationService>
            })
            .collect()
    }
}

fn content_length(content: &Content) -> Option<usize> {
    match content {
        Content::Json(value) => value.as_u64().and_then(|n| usize::try_from(n).ok()),
        _ => None,
    }
}

fn content_checksums(content: &Content) -> Option<Vec<Checksum>> {
    match content {
        Content::Json(serde_json::Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|item| item.as_str())
                .filter_map(|hex| Checksum::from_hex(hex).ok())
                .collect(),
        ),
        _ => None,
    }
}

/// A connected peer acting as a transformation servant
struct TransformationClient {
    link: Arc<PeerLink>,
    joint: Capabilities,
    round_trip: Duration,
}

impl TransformationClient {
    fn require(&self, kind: CommunionKind, name: &str) -> CommuneResult<()> {
        if self.joint.get(kind).enabled() {
            Ok(())
        } else {
            Err(CommuneError::NotServed(name.to_string()))
        }
    }

    async fn ask(
        &self,
        kind: RequestKind,
        checksum: Checksum,
        timeout: Duration,
    ) -> CommuneResult<Content> {
        let response = self
            .link
            .request(&CommunionRequest::new(kind, checksum), timeout)
            .await?;
        Ok(response.content)
    }

    async fn ask_status(
        &self,
        kind: RequestKind,
        checksum: Checksum,
        timeout: Duration,
    ) -> CommuneResult<JobStatus> {
        JobStatus::from_content(&self.ask(kind, checksum, timeout).await?)
    }
}

#[async_trait]
impl TransformationService for TransformationClient {
    fn peer_id(&self) -> &str {
        self.link.peer_id()
    }

    async fn status(&self, checksum: Checksum, meta: &ExecutionMeta) -> CommuneResult<JobStatus> {
        let kind = RequestKind::TransformationStatus { meta: meta.clone() };
        let status = self.ask_status(kind, checksum, self.round_trip).await?;
        // A peer we may not submit to cannot run anything for us
        if status == JobStatus::Runnable && !self.joint.transformation_job.enabled() {
            return Ok(JobStatus::NotRunnable);
        }
        Ok(status)
    }

    async fn submit(&self, checksum: Checksum, meta: &ExecutionMeta) -> CommuneResult<JobStatus> {
        self.require(CommunionKind::TransformationJob, "transformation_job")?;
        let kind = RequestKind::TransformationJob { meta: meta.clone() };
        self.ask_status(kind, checksum, self.round_trip).await
    }

    async fn wait(&self, checksum: Checksum, window: Duration) -> CommuneResult<JobStatus> {
        self.require(CommunionKind::TransformationJob, "transformation_wait")?;
        let kind = RequestKind::TransformationWait {
            timeout_ms: Some(window.as_millis() as u64),
        };
        self.ask_status(kind, checksum, window + self.round_trip)
            .await
    }

    async fn cancel(&self, checksum: Checksum) -> CommuneResult<()> {
        self.require(CommunionKind::TransformationJob, "transformation_cancel")?;
        self.ask(RequestKind::TransformationCancel, checksum, self.round_trip)
            .await?;
        Ok(())
    }

    async fn hard_cancel(&self, checksum: Checksum) -> CommuneResult<()> {
        self.require(CommunionKind::HardCancel, "hard_cancel")?;
        self.ask(RequestKind::TransformationHardCancel, checksum, self.round_trip)
            .await?;
        Ok(())
    }

    async fn clear_exception(&self, checksum: Checksum) -> CommuneResult<()> {
        self.require(CommunionKind::ClearException, "clear_exception")?;
        self.ask(
            RequestKind::TransformationClearException,
            checksum,
            self.round_trip,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communion::framing::framed;
    use crate::communion::handshake::{PeerConfig, Role};
    use crate::communion::peer::RequestHandler;
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};

    /// Serves fixed answers; `corrupt` returns the wrong bytes for buffers
    struct Fixed {
        buffer: Vec<u8>,
        corrupt: bool,
    }

    #[async_trait]
    impl RequestHandler for Fixed {
        async fn handle(&self, _peer: &str, request: CommunionRequest) -> CommuneResult<Content> {
            let known = Checksum::digest(&self.buffer) == request.checksum;
            Ok(match request.kind {
                RequestKind::BufferStatus if known => BufferStatus::Local.to_content(),
                RequestKind::BufferStatus => BufferStatus::Unknown.to_content(),
                RequestKind::Buffer if self.corrupt => Content::Bytes(b"evil".to_vec()),
                RequestKind::Buffer if known => Content::Bytes(self.buffer.clone()),
                RequestKind::BufferLength if known => Content::Json(json!(self.buffer.len())),
                _ => Content::None,
            })
        }
    }

    struct Silent;

    #[async_trait]
    impl RequestHandler for Silent {
        async fn handle(&self, _peer: &str, _request: CommunionRequest) -> CommuneResult<Content> {
            Err(CommuneError::NotServed("nothing".to_string()))
        }
    }

    /// Link from us to a servant answering with `handler`
    async fn servant(id: &str, handler: Fixed) -> Arc<PeerLink> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let theirs = PeerConfig::new(id, Capabilities::all(), Capabilities::all());
        let ours = PeerConfig::new("us", Capabilities::all(), Capabilities::all());
        let _ = PeerLink::spawn(framed(accepted), ours, Role::Acceptor, Arc::new(handler));
        PeerLink::spawn(framed(dial), theirs, Role::Dialer, Arc::new(Silent))
    }

    type Answer = std::pin::Pin<Box<dyn Future<Output = Option<i32>> + Send>>;

    #[tokio::test]
    async fn gather_stops_on_decisive_answer() {
        let slow = Box::pin(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Some(0)
        }) as Answer;
        let fast = Box::pin(async { Some(3) }) as Answer;
        let answers = tokio::time::timeout(
            Duration::from_secs(2),
            gather(vec![slow, fast], Duration::from_secs(30), |n| *n == 3),
        )
        .await
        .unwrap();
        assert_eq!(answers, vec![3]);
    }

    #[tokio::test]
    async fn gather_window_ends_round() {
        let slow = Box::pin(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Some(1)
        }) as Answer;
        let none = Box::pin(async { None }) as Answer;
        let answers = gather(vec![slow, none], Duration::from_millis(100), |_| false).await;
        assert!(answers.is_empty());
    }

    #[tokio::test]
    async fn buffer_status_and_fetch() {
        let clients = ClientManager::new(Duration::from_secs(2), 1000);
        let link = servant(
            "b",
            Fixed {
                buffer: b"hello".to_vec(),
                corrupt: false,
            },
        )
        .await;
        clients.add_peer(link, &Capabilities::all());

        let cs = Checksum::digest(b"hello");
        assert_eq!(
            clients.remote_buffer_status(cs, None, false).await,
            BufferStatus::Local
        );
        assert_eq!(
            clients.remote_buffer(cs, None, false).await,
            Some(b"hello".to_vec())
        );
        assert_eq!(clients.remote_buffer_length(cs, None, false).await, Some(5));
        assert_eq!(
            clients
                .remote_buffer_status(Checksum::digest(b"other"), None, false)
                .await,
            BufferStatus::Unknown
        );
    }

    #[tokio::test]
    async fn excluded_peer_is_not_asked() {
        let clients = ClientManager::new(Duration::from_secs(2), 1000);
        let link = servant(
            "b",
            Fixed {
                buffer: b"hello".to_vec(),
                corrupt: false,
            },
        )
        .await;
        clients.add_peer(link, &Capabilities::all());
        let cs = Checksum::digest(b"hello");
        assert_eq!(
            clients.remote_buffer_status(cs, Some("b"), false).await,
            BufferStatus::Unknown
        );
    }

    #[tokio::test]
    async fn corrupt_buffer_is_rejected() {
        let clients = ClientManager::new(Duration::from_secs(2), 1000);
        let link = servant(
            "b",
            Fixed {
                buffer: b"hello".to_vec(),
                corrupt: true,
            },
        )
        .await;
        clients.add_peer(link, &Capabilities::all());
        assert_eq!(
            clients
                .remote_buffer(Checksum::digest(b"hello"), None, false)
                .await,
            None
        );
    }

    #[tokio::test]
    async fn small_capability_checks_length_first() {
        let clients = ClientManager::new(Duration::from_secs(2), 3);
        let link = servant(
            "b",
            Fixed {
                buffer: b"hello".to_vec(),
                corrupt: false,
            },
        )
        .await;
        let master = Capabilities {
            buffer: Capability::Small,
            ..Capabilities::all()
        };
        clients.add_peer(link, &master);
        assert_eq!(
            clients
                .remote_buffer(Checksum::digest(b"hello"), None, false)
                .await,
            None
        );
    }
}
