//! Consumers of transformation results

use crate::checksum::Checksum;
use crate::error::TransformationError;
use std::fmt;

/// Identifies who holds a reference on a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConsumerId {
    Local(u64),
    /// A peer that submitted the job
    Remote(String),
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerId::Local(n) => write!(f, "local#{}", n),
            ConsumerId::Remote(peer) => write!(f, "peer:{}", peer),
        }
    }
}

/// Callbacks for one consumer; all default to doing nothing
pub trait TransformationObserver: Send + Sync {
    fn on_result(&self, _transformation: Checksum, _result: Checksum, _preliminary: bool) {}

    fn on_progress(&self, _transformation: Checksum, _progress: f64) {}

    fn on_exception(&self, _transformation: Checksum, _error: &TransformationError) {}
}
