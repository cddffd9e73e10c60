//! Peer connection management
//!
//! The server accepts inbound connections, dials configured peers, runs
//! the handshake on every new stream and keeps at most one link per peer
//! ID. Closed links are unregistered from the client manager.

use super::client::ClientManager;
use super::framing::framed;
use super::handshake::{handshake, PeerConfig, Role};
use super::peer::{PeerLink, RequestHandler};
use crate::error::{CommuneError, CommuneResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct CommunionServer {
    me: Weak<CommunionServer>,
    config: PeerConfig,
    handler: Arc<dyn RequestHandler>,
    clients: Arc<ClientManager>,
    links: Mutex<HashMap<String, Arc<PeerLink>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CommunionServer {
    pub fn new(
        config: PeerConfig,
        handler: Arc<dyn RequestHandler>,
        clients: Arc<ClientManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            handler,
            clients,
            links: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(peer_id)
    }

    /// IDs of the peers currently linked
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    /// Bind `addr` and accept peers in the background
    pub async fn listen(&self, addr: &str) -> CommuneResult<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CommuneError::io(format!("binding communion listener on {}", addr), e))?;
        let local = listener
            .local_addr()
            .map_err(|e| CommuneError::io("reading listener address", e))?;
        info!("Communion server listening on {}", local);

        let me = self.me.clone();
        self.track(tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accepting peer connection failed: {}", e);
                        continue;
                    }
                };
                let Some(server) = me.upgrade() else {
                    break;
                };
                debug!("Incoming communion connection from {}", remote);
                tokio::spawn(async move {
                    if let Err(e) = server.establish(stream, Role::Acceptor).await {
                        log_rejection(&remote.to_string(), &e);
                    }
                });
            }
        }));
        Ok(local)
    }

    /// Dial a peer; returns its ID once the link is up
    pub async fn connect(&self, addr: &str) -> CommuneResult<String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CommuneError::io(format!("connecting to peer {}", addr), e))?;
        self.establish(stream, Role::Dialer).await
    }

    /// Dial every address, logging the ones that fail
    pub async fn connect_all(&self, addrs: &[String]) {
        for addr in addrs {
            match self.connect(addr).await {
                Ok(id) => debug!("Dialed {} ({})", addr, id),
                Err(e) => log_rejection(addr, &e),
            }
        }
    }

    async fn establish(&self, stream: TcpStream, role: Role) -> CommuneResult<String> {
        let mut frames = framed(stream);
        let peer = handshake(&mut frames, &self.config, role, |id| self.is_connected(id)).await?;
        let peer_id = peer.id.clone();
        let link = PeerLink::spawn(frames, peer, role, Arc::clone(&self.handler));

        {
            let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
            if links.contains_key(&peer_id) {
                drop(links);
                link.close();
                return Err(CommuneError::DuplicatePeer(peer_id));
            }
            links.insert(peer_id.clone(), Arc::clone(&link));
        }
        self.clients.add_peer(Arc::clone(&link), &self.config.master);
        info!("Connected to communion peer {}", peer_id);

        let me = self.me.clone();
        self.track(tokio::spawn(async move {
            link.wait_closed().await;
            if let Some(server) = me.upgrade() {
                server.unregister(&link);
            }
        }));
        Ok(peer_id)
    }

    fn unregister(&self, link: &Arc<PeerLink>) {
        let peer_id = link.peer_id();
        let removed = {
            let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
            match links.get(peer_id) {
                Some(current) if Arc::ptr_eq(current, link) => links.remove(peer_id).is_some(),
                _ => false,
            }
        };
        if removed {
            self.clients.remove_peer(peer_id);
            info!("Communion peer {} disconnected", peer_id);
        }
    }

    /// Stop accepting and close every link
    pub fn shutdown(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        let links: Vec<_> = self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, link)| link)
            .collect();
        for link in links {
            self.clients.remove_peer(link.peer_id());
            link.close();
        }
    }
}

fn log_rejection(addr: &str, error: &CommuneError) {
    match error {
        CommuneError::DuplicatePeer(id) => debug!("Dropped duplicate link to {} ({})", id, addr),
        CommuneError::ProtocolMismatch { .. } => warn!("Peer at {} rejected: {}", addr, error),
        _ => warn!("Peer at {} unavailable: {}", addr, error),
    }
}
