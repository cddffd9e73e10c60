//! Typed communion requests and status codes
//!
//! Requests put their sub-type and parameters in the message metadata and
//! the checksum, as hex, in the string content.

use super::handshake::CommunionKind;
use super::wire::{Content, Message};
use crate::checksum::Checksum;
use crate::error::{CommuneError, CommuneResult};
use crate::transformation::ExecutionMeta;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A request sub-type and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestKind {
    BufferStatus,
    Buffer,
    BufferLength,
    SemanticToSyntactic {
        celltype: String,
        subcelltype: Option<String>,
    },
    TransformationStatus {
        #[serde(default)]
        meta: ExecutionMeta,
    },
    TransformationJob {
        #[serde(default)]
        meta: ExecutionMeta,
    },
    TransformationWait {
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    TransformationCancel,
    TransformationHardCancel,
    TransformationClearException,
}

impl RequestKind {
    /// The servant permission that gates this request
    pub fn capability(&self) -> CommunionKind {
        match self {
            RequestKind::BufferStatus => CommunionKind::BufferStatus,
            RequestKind::Buffer => CommunionKind::Buffer,
            RequestKind::BufferLength => CommunionKind::BufferLength,
            RequestKind::SemanticToSyntactic { .. } => CommunionKind::SemanticToSyntactic,
            RequestKind::TransformationStatus { .. } => CommunionKind::TransformationStatus,
            RequestKind::TransformationJob { .. }
            | RequestKind::TransformationWait { .. }
            | RequestKind::TransformationCancel => CommunionKind::TransformationJob,
            RequestKind::TransformationHardCancel => CommunionKind::HardCancel,
            RequestKind::TransformationClearException => CommunionKind::ClearException,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::BufferStatus => "buffer_status",
            RequestKind::Buffer => "buffer",
            RequestKind::BufferLength => "buffer_length",
            RequestKind::SemanticToSyntactic { .. } => "semantic_to_syntactic",
            RequestKind::TransformationStatus { .. } => "transformation_status",
            RequestKind::TransformationJob { .. } => "transformation_job",
            RequestKind::TransformationWait { .. } => "transformation_wait",
            RequestKind::TransformationCancel => "transformation_cancel",
            RequestKind::TransformationHardCancel => "transformation_hard_cancel",
            RequestKind::TransformationClearException => "transformation_clear_exception",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommunionRequest {
    pub kind: RequestKind,
    pub checksum: Checksum,
    /// Set when a peer passes on a request it could not answer itself
    pub forwarded: bool,
}

impl CommunionRequest {
    pub fn new(kind: RequestKind, checksum: Checksum) -> Self {
        Self {
            kind,
            checksum,
            forwarded: false,
        }
    }

    pub fn forwarded(mut self) -> Self {
        self.forwarded = true;
        self
    }

    pub fn to_message(&self, id: u32) -> CommuneResult<Message> {
        let mut metadata = match serde_json::to_value(&self.kind)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if self.forwarded {
            metadata.insert("forwarded".to_string(), Value::Bool(true));
        }
        Ok(Message::request(
            id,
            metadata,
            Content::Str(self.checksum.to_hex()),
        ))
    }

    pub fn from_message(message: &Message) -> CommuneResult<Self> {
        let mut metadata = message.metadata.clone();
        let forwarded = metadata
            .remove("forwarded")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let kind: RequestKind = serde_json::from_value(Value::Object(metadata))
            .map_err(|e| CommuneError::invalid_frame(format!("bad request: {}", e)))?;
        let checksum = message
            .content
            .as_str()
            .ok_or_else(|| CommuneError::invalid_frame("request content is not a checksum"))
            .and_then(Checksum::from_hex)?;
        Ok(Self {
            kind,
            checksum,
            forwarded,
        })
    }
}

static NULL: Value = Value::Null;

/// Answer to `buffer_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BufferStatus {
    Unknown = -2,
    Restricted = -1,
    Remote = 0,
    Local = 1,
}

impl BufferStatus {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Local),
            0 => Some(Self::Remote),
            -1 => Some(Self::Restricted),
            -2 => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn to_content(self) -> Content {
        Content::Json(json!(self.code()))
    }

    pub fn from_content(content: &Content) -> CommuneResult<Self> {
        match content {
            Content::Json(value) => value
                .as_i64()
                .and_then(Self::from_code)
                .ok_or_else(|| CommuneError::invalid_frame("bad buffer status")),
            _ => Err(CommuneError::invalid_frame("bad buffer status")),
        }
    }
}

/// Answer to transformation status, job and wait requests
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Done(Checksum),
    Running {
        progress: Option<f64>,
        preliminary: Option<Checksum>,
    },
    Runnable,
    Exception(String),
    NotRunnable,
    InputsUnknown,
    TransformationUnknown,
}

impl JobStatus {
    pub fn code(&self) -> i64 {
        match self {
            JobStatus::Done(_) => 3,
            JobStatus::Running { .. } => 2,
            JobStatus::Runnable => 1,
            JobStatus::Exception(_) => 0,
            JobStatus::NotRunnable => -1,
            JobStatus::InputsUnknown => -2,
            JobStatus::TransformationUnknown => -3,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            JobStatus::Done(cs) => json!([3, cs.to_hex()]),
            JobStatus::Running {
                progress,
                preliminary,
            } => json!([2, progress, preliminary.map(|cs| cs.to_hex())]),
            JobStatus::Exception(message) => json!([0, message]),
            other => json!([other.code(), null]),
        }
    }

    pub fn from_value(value: &Value) -> CommuneResult<Self> {
        let bad = || CommuneError::invalid_frame(format!("bad job status: {}", value));
        let items = value.as_array().ok_or_else(bad)?;
        let code = items.first().and_then(Value::as_i64).ok_or_else(bad)?;
        let arg = |n: usize| items.get(n).unwrap_or(&NULL);
        let status = match code {
            3 => JobStatus::Done(Checksum::from_hex(arg(1).as_str().ok_or_else(bad)?)?),
            2 => JobStatus::Running {
                progress: arg(1).as_f64(),
                preliminary: match arg(2).as_str() {
                    Some(hex) => Some(Checksum::from_hex(hex)?),
                    None => None,
                },
            },
            1 => JobStatus::Runnable,
            0 => JobStatus::Exception(arg(1).as_str().unwrap_or_default().to_string()),
            -1 => JobStatus::NotRunnable,
            -2 => JobStatus::InputsUnknown,
            -3 => JobStatus::TransformationUnknown,
            _ => return Err(bad()),
        };
        Ok(status)
    }

    pub fn to_content(&self) -> Content {
        Content::Json(self.to_value())
    }

    pub fn from_content(content: &Content) -> CommuneResult<Self> {
        match content {
            Content::Json(value) => Self::from_value(value),
            _ => Err(CommuneError::invalid_frame("job status is not JSON")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_metadata_layout() {
        let cs = Checksum::digest(b"x");
        let message = CommunionRequest::new(RequestKind::BufferStatus, cs)
            .to_message(12)
            .unwrap();
        assert_eq!(message.metadata["type"], "buffer_status");
        assert!(!message.metadata.contains_key("forwarded"));
        assert_eq!(message.content.as_str(), Some(cs.to_hex().as_str()));
    }

    #[test]
    fn request_roundtrip_through_wire() {
        let cs = Checksum::digest(b"tf");
        let request = CommunionRequest::new(
            RequestKind::SemanticToSyntactic {
                celltype: "python".to_string(),
                subcelltype: None,
            },
            cs,
        )
        .forwarded();
        let bytes = request.to_message(1).unwrap().encode().unwrap();
        let decoded = CommunionRequest::from_message(&Message::decode(&bytes).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn unknown_request_type_rejected() {
        let mut metadata = Map::new();
        metadata.insert("type".to_string(), json!("transformer_job_run"));
        let message = Message::request(1, metadata, Content::Str(Checksum::digest(b"").to_hex()));
        assert!(CommunionRequest::from_message(&message).is_err());
    }

    #[test]
    fn job_status_codes() {
        let cs = Checksum::digest(b"r");
        assert_eq!(JobStatus::Done(cs).to_value(), json!([3, cs.to_hex()]));
        assert_eq!(JobStatus::Runnable.to_value(), json!([1, null]));
        assert_eq!(JobStatus::TransformationUnknown.to_value(), json!([-3, null]));
        assert_eq!(
            JobStatus::Running {
                progress: Some(40.0),
                preliminary: None
            }
            .to_value(),
            json!([2, 40.0, null])
        );
        let exc = JobStatus::from_value(&json!([0, "boom"])).unwrap();
        assert_eq!(exc, JobStatus::Exception("boom".to_string()));
        assert!(JobStatus::from_value(&json!([7])).is_err());
    }

    #[test]
    fn buffer_status_codes() {
        assert_eq!(BufferStatus::Local.code(), 1);
        assert_eq!(BufferStatus::Unknown.code(), -2);
        assert_eq!(
            BufferStatus::from_content(&BufferStatus::Restricted.to_content()).unwrap(),
            BufferStatus::Restricted
        );
        assert!(BufferStatus::Local > BufferStatus::Remote);
    }
}
