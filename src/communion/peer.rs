//! One established peer connection
//!
//! A link owns a writer task fed through a channel and a reader task that
//! demultiplexes incoming frames: responses complete the pending request
//! with the same message ID, requests are handed to the [`RequestHandler`]
//! and answered with that ID.

use super::framing::{next_frame, FramedStream};
use super::handshake::{PeerConfig, Role};
use super::message::CommunionRequest;
use super::wire::{Content, Message, Mode};
use crate::error::{CommuneError, CommuneResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Serves requests arriving from peers
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, peer_id: &str, request: CommunionRequest) -> CommuneResult<Content>;
}

type Pending = Mutex<HashMap<u32, oneshot::Sender<Message>>>;

pub struct PeerLink {
    peer: PeerConfig,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    pending: Pending,
    next_id: AtomicU32,
    closed: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Removes a pending entry when the awaiting request goes away
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl PeerLink {
    /// Start the reader and writer tasks for a handshaken stream
    pub fn spawn(
        frames: FramedStream<TcpStream>,
        peer: PeerConfig,
        role: Role,
        handler: Arc<dyn RequestHandler>,
    ) -> Arc<Self> {
        let (mut writer, mut reader) = frames.split::<Bytes>();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (closed, _) = watch::channel(false);

        let link = Arc::new(Self {
            peer,
            outgoing: tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(match role {
                Role::Dialer => 1000,
                Role::Acceptor => 0,
            }),
            closed,
            tasks: Mutex::new(Vec::new()),
        });

        let peer_id = link.peer.id.clone();
        let write_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.send(Bytes::from(frame)).await {
                    debug!("Write to peer {} failed: {}", peer_id, e);
                    break;
                }
            }
        });

        let read_link = Arc::clone(&link);
        let read_task = tokio::spawn(async move {
            loop {
                let frame = match next_frame(&mut reader).await {
                    Ok(frame) => frame,
                    Err(CommuneError::ConnectionClosed) => {
                        debug!("Peer {} closed the connection", read_link.peer.id);
                        break;
                    }
                    Err(e) => {
                        warn!("Dropping peer {}: {}", read_link.peer.id, e);
                        break;
                    }
                };
                if let Err(e) = read_link.on_frame(&frame, &handler) {
                    warn!("Dropping peer {}: {}", read_link.peer.id, e);
                    break;
                }
            }
            read_link.mark_closed();
        });

        link.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([write_task, read_task]);
        link
    }

    fn on_frame(
        self: &Arc<Self>,
        frame: &[u8],
        handler: &Arc<dyn RequestHandler>,
    ) -> CommuneResult<()> {
        let message = Message::decode(frame)?;
        debug!(
            "Communion {:?} #{}: received {} bytes from peer {}",
            message.mode,
            message.id,
            frame.len(),
            self.peer.id
        );

        match message.mode {
            Mode::Response => {
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&message.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(message);
                    }
                    None => debug!("Late response #{} from {}", message.id, self.peer.id),
                }
            }
            Mode::Request => {
                let link = Arc::clone(self);
                let handler = Arc::clone(handler);
                tokio::spawn(async move {
                    let id = message.id;
                    let reply = match CommunionRequest::from_message(&message) {
                        Ok(request) => {
                            let name = request.kind.name();
                            match handler.handle(&link.peer.id, request).await {
                                Ok(content) => Message::response(id, content),
                                Err(e) => {
                                    debug!("Request {} #{} failed: {}", name, id, e);
                                    Message::error_response(id, e.to_string())
                                }
                            }
                        }
                        Err(e) => Message::error_response(id, e.to_string()),
                    };
                    if let Err(e) = link.send(&reply) {
                        debug!("Could not answer #{} to {}: {}", id, link.peer.id, e);
                    }
                });
            }
        }
        Ok(())
    }

    fn send(&self, message: &Message) -> CommuneResult<()> {
        let bytes = message.encode()?;
        debug!(
            "Communion {:?} #{}: send {} bytes to peer {}",
            message.mode,
            message.id,
            bytes.len(),
            self.peer.id
        );
        self.outgoing
            .send(bytes)
            .map_err(|_| CommuneError::ConnectionClosed)
    }

    /// Send a request and wait for the response carrying the same ID
    pub async fn request(
        &self,
        request: &CommunionRequest,
        timeout: Duration,
    ) -> CommuneResult<Message> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        // mark_closed raises the flag before clearing the table
        if self.is_closed() {
            return Err(CommuneError::ConnectionClosed);
        }

        self.send(&request.to_message(id)?)?;

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(CommuneError::ConnectionClosed),
            Err(_) => {
                return Err(CommuneError::PeerTimeout {
                    peer: self.peer.id.clone(),
                    duration_ms: timeout.as_millis() as u64,
                })
            }
        };

        if response.is_error() {
            return Err(CommuneError::RemoteError {
                peer: self.peer.id.clone(),
                message: response
                    .content
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        Ok(response)
    }

    fn mark_closed(&self) {
        self.closed.send_replace(true);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection is gone
    pub async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn close(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.mark_closed();
    }

    pub fn peer_id(&self) -> &str {
        &self.peer.id
    }

    pub fn peer_config(&self) -> &PeerConfig {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;
    use crate::communion::framing::framed;
    use crate::communion::handshake::Capabilities;
    use crate::communion::message::RequestKind;
    use tokio::net::TcpListener;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, _peer: &str, request: CommunionRequest) -> CommuneResult<Content> {
            match request.kind {
                RequestKind::Buffer => Ok(Content::Str(request.checksum.to_hex())),
                RequestKind::BufferLength => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Content::None)
                }
                _ => Err(CommuneError::NotServed(request.kind.name().to_string())),
            }
        }
    }

    async fn pair() -> (Arc<PeerLink>, Arc<PeerLink>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let config = |id: &str| PeerConfig::new(id, Capabilities::all(), Capabilities::all());
        let a = PeerLink::spawn(framed(dial), config("b"), Role::Dialer, Arc::new(Echo));
        let b = PeerLink::spawn(framed(accepted), config("a"), Role::Acceptor, Arc::new(Echo));
        (a, b)
    }

    #[tokio::test]
    async fn request_response_by_id() {
        let (a, _b) = pair().await;
        let cs = Checksum::digest(b"x");
        let request = CommunionRequest::new(RequestKind::Buffer, cs);
        let response = a.request(&request, Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.id, 1000);
        assert_eq!(response.content.as_str(), Some(cs.to_hex().as_str()));
    }

    #[tokio::test]
    async fn server_errors_are_flagged() {
        let (_a, b) = pair().await;
        let request = CommunionRequest::new(RequestKind::BufferStatus, Checksum::digest(b""));
        let err = b.request(&request, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, CommuneError::RemoteError { .. }));
    }

    #[tokio::test]
    async fn slow_answer_times_out_and_cleans_up() {
        let (a, _b) = pair().await;
        let request = CommunionRequest::new(RequestKind::BufferLength, Checksum::digest(b""));
        let err = a
            .request(&request, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CommuneError::PeerTimeout { .. }));
        assert!(a.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closing_one_side_is_silent() {
        let (a, b) = pair().await;
        b.close();
        tokio::time::timeout(Duration::from_secs(5), a.wait_closed())
            .await
            .unwrap();
        let request = CommunionRequest::new(RequestKind::Buffer, Checksum::digest(b""));
        let err = a.request(&request, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CommuneError::ConnectionClosed));
    }

    #[tokio::test]
    async fn request_on_closed_link_fails_fast() {
        let (a, _b) = pair().await;
        a.close();
        let request = CommunionRequest::new(RequestKind::Buffer, Checksum::digest(b""));
        let err = tokio::time::timeout(
            Duration::from_secs(1),
            a.request(&request, Duration::from_secs(30)),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, CommuneError::ConnectionClosed));
        assert!(a.pending.lock().unwrap().is_empty());
    }
}
