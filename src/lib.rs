//! Commune - content-addressed transformation cache
//!
//! A transformation is identified by the checksum of its canonical
//! description. Each checksum is computed at most once per instance, and
//! instances linked over the communion protocol share buffers, semantic
//! checksum mappings, results and running jobs.

pub mod buffer;
pub mod cache;
pub mod checksum;
pub mod cli;
pub mod communion;
pub mod config;
pub mod error;
pub mod instance;
pub mod job;
pub mod transformation;

pub use checksum::Checksum;
pub use error::{CommuneError, CommuneResult, TransformationError};
pub use instance::Instance;
