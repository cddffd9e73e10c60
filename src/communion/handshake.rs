//! Peer handshake
//!
//! 1. The dialing side sends its [`PeerConfig`] as JSON, the accepting side
//!    answers with its own.
//! 2. Each side validates the other: a peer ID that is already connected is
//!    dropped silently, a protocol mismatch is answered with
//!    `"Protocol mismatch: ..."` before closing, anything else gets
//!    `"Protocol OK"`.
//! 3. Each side waits for the other's `"Protocol OK"`.

use super::framing::{next_frame, send_frame, FramedStream};
use crate::error::{CommuneError, CommuneResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Protocol identification triple
pub const PROTOCOL: [&str; 3] = ["seamless", "communion", "0.3"];

pub const PROTOCOL_OK: &str = "Protocol OK";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Permission for one communion sub-type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capability {
    #[default]
    Off,
    On,
    /// Only buffers up to the configured small-buffer limit
    Small,
}

impl Capability {
    pub fn enabled(self) -> bool {
        self != Capability::Off
    }

    /// Combine what one side requests with what the other serves
    pub fn meet(self, other: Capability) -> Capability {
        match (self, other) {
            (Capability::Off, _) | (_, Capability::Off) => Capability::Off,
            (Capability::Small, _) | (_, Capability::Small) => Capability::Small,
            _ => Capability::On,
        }
    }
}

impl Serialize for Capability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Capability::Off => serializer.serialize_bool(false),
            Capability::On => serializer.serialize_bool(true),
            Capability::Small => serializer.serialize_str("small"),
        }
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Word(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => Ok(Capability::On),
            Raw::Flag(false) => Ok(Capability::Off),
            Raw::Word(w) if w == "small" => Ok(Capability::Small),
            Raw::Word(w) => Err(serde::de::Error::custom(format!(
                "expected true, false or \"small\", got \"{}\"",
                w
            ))),
        }
    }
}

/// Communion sub-types that can be enabled per direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommunionKind {
    Buffer,
    BufferStatus,
    BufferLength,
    SemanticToSyntactic,
    TransformationJob,
    TransformationStatus,
    HardCancel,
    ClearException,
}

/// Capability map for one direction (master or servant)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub buffer: Capability,
    pub buffer_status: Capability,
    pub buffer_length: Capability,
    pub semantic_to_syntactic: Capability,
    pub transformation_job: Capability,
    pub transformation_status: Capability,
    pub hard_cancel: Capability,
    pub clear_exception: Capability,
}

impl Default for Capabilities {
    /// What an instance serves unless told otherwise
    fn default() -> Self {
        Self {
            buffer: Capability::Off,
            buffer_status: Capability::Off,
            buffer_length: Capability::On,
            semantic_to_syntactic: Capability::On,
            transformation_job: Capability::Off,
            transformation_status: Capability::Off,
            hard_cancel: Capability::Off,
            clear_exception: Capability::Off,
        }
    }
}

impl Capabilities {
    /// What an instance requests from peers unless told otherwise
    pub fn master() -> Self {
        Self {
            buffer: Capability::On,
            buffer_status: Capability::On,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self {
            buffer: Capability::On,
            buffer_status: Capability::On,
            buffer_length: Capability::On,
            semantic_to_syntactic: Capability::On,
            transformation_job: Capability::On,
            transformation_status: Capability::On,
            hard_cancel: Capability::On,
            clear_exception: Capability::On,
        }
    }

    pub fn get(&self, kind: CommunionKind) -> Capability {
        match kind {
            CommunionKind::Buffer => self.buffer,
            CommunionKind::BufferStatus => self.buffer_status,
            CommunionKind::BufferLength => self.buffer_length,
            CommunionKind::SemanticToSyntactic => self.semantic_to_syntactic,
            CommunionKind::TransformationJob => self.transformation_job,
            CommunionKind::TransformationStatus => self.transformation_status,
            CommunionKind::HardCancel => self.hard_cancel,
            CommunionKind::ClearException => self.clear_exception,
        }
    }

    /// Per sub-type meet of our master map with a peer's servant map
    pub fn meet(&self, servant: &Capabilities) -> Capabilities {
        Capabilities {
            buffer: self.buffer.meet(servant.buffer),
            buffer_status: self.buffer_status.meet(servant.buffer_status),
            buffer_length: self.buffer_length.meet(servant.buffer_length),
            semantic_to_syntactic: self.semantic_to_syntactic.meet(servant.semantic_to_syntactic),
            transformation_job: self.transformation_job.meet(servant.transformation_job),
            transformation_status: self.transformation_status.meet(servant.transformation_status),
            hard_cancel: self.hard_cancel.meet(servant.hard_cancel),
            clear_exception: self.clear_exception.meet(servant.clear_exception),
        }
    }
}

/// What each side announces during the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub protocol: Vec<String>,
    pub id: String,
    pub master: Capabilities,
    pub servant: Capabilities,
}

impl PeerConfig {
    pub fn new(id: impl Into<String>, master: Capabilities, servant: Capabilities) -> Self {
        Self {
            protocol: PROTOCOL.iter().map(|s| s.to_string()).collect(),
            id: id.into(),
            master,
            servant,
        }
    }

    fn protocol_matches(&self) -> bool {
        self.protocol.iter().map(String::as_str).eq(PROTOCOL.iter().copied())
    }
}

/// Which side of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Acceptor,
}

/// Run the handshake and return the peer's announced configuration
///
/// `is_connected` decides whether a peer ID already has a link.
pub async fn handshake<S, F>(
    stream: &mut FramedStream<S>,
    ours: &PeerConfig,
    role: Role,
    is_connected: F,
) -> CommuneResult<PeerConfig>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&str) -> bool,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange(stream, ours, role, is_connected))
        .await
        .map_err(|_| CommuneError::Handshake("timed out".to_string()))?
}

async fn exchange<S, F>(
    stream: &mut FramedStream<S>,
    ours: &PeerConfig,
    role: Role,
    is_connected: F,
) -> CommuneResult<PeerConfig>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&str) -> bool,
{
    let own = serde_json::to_vec(ours)?;
    if role == Role::Dialer {
        send_frame(stream, own.clone()).await?;
    }
    let raw = next_frame(stream).await?;
    if role == Role::Acceptor {
        send_frame(stream, own).await?;
    }

    let theirs: PeerConfig = serde_json::from_slice(&raw)
        .map_err(|e| CommuneError::Handshake(format!("malformed peer config: {}", e)))?;

    if theirs.id == ours.id || is_connected(&theirs.id) {
        debug!("Peer {} already connected, dropping link", theirs.id);
        return Err(CommuneError::DuplicatePeer(theirs.id));
    }

    if !theirs.protocol_matches() {
        let ours_text = PROTOCOL.join("/");
        let reply = format!("Protocol mismatch: {}", ours_text);
        let _ = send_frame(stream, reply).await;
        warn!(
            "Rejecting peer {}: protocol {:?}",
            theirs.id, theirs.protocol
        );
        return Err(CommuneError::ProtocolMismatch {
            ours: ours_text,
            theirs: theirs.protocol.join("/"),
        });
    }
    send_frame(stream, PROTOCOL_OK).await?;

    let answer = next_frame(stream).await?;
    let answer = String::from_utf8_lossy(&answer);
    if answer != PROTOCOL_OK {
        return Err(CommuneError::ProtocolMismatch {
            ours: PROTOCOL.join("/"),
            theirs: answer.into_owned(),
        });
    }
    Ok(theirs)
}
