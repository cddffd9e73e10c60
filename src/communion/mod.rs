//! Communion: the peer-to-peer protocol
//!
//! Instances exchange buffers, checksum mappings and transformation jobs
//! over TCP. Each connection starts with a handshake that exchanges the
//! protocol version, the instance ID and two capability maps: `master`
//! (what an instance asks of others) and `servant` (what it serves).
//!
//! # Layers
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | `framing` | Length-prefixed frames on the stream |
//! | `wire` | Binary message layout inside a frame |
//! | `handshake` | Peer configs and capability maps |
//! | `message` | Typed requests and status codes |
//! | `peer` | One link: request/response correlation by message ID |
//! | `client` | Fan-out of requests to eligible peers |
//! | `dispatch` | Answering requests from peers |
//! | `server` | Accepting, dialing and tracking links |

pub mod client;
pub mod dispatch;
pub mod framing;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod server;
pub mod wire;

pub use client::{gather, ClientManager};
pub use dispatch::Dispatcher;
pub use handshake::{Capabilities, Capability, CommunionKind, PeerConfig, PROTOCOL};
pub use message::{BufferStatus, CommunionRequest, JobStatus, RequestKind};
pub use peer::{PeerLink, RequestHandler};
pub use server::CommunionServer;
pub use wire::{Content, Message, Mode};
