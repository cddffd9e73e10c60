//! Communion wire format
//!
//! ```text
//! +----------+------+--------+-----------+----------+------+---------+
//! | SEAMLESS | mode | id u32 | len u32   | metadata | type | content |
//! | 8 bytes  | 1    | LE     | LE        | JSON     | 1    | ...     |
//! +----------+------+--------+-----------+----------+------+---------+
//! ```
//!
//! A zero metadata length means no metadata follows. Content types:
//! `0` none, `1` bool (one byte), `2` raw bytes, `3` UTF-8 string,
//! `4` JSON-encoded number or list.

use crate::error::{CommuneError, CommuneResult};
use serde_json::{Map, Value};

pub const MAGIC: &[u8; 8] = b"SEAMLESS";

const CONTENT_NONE: u8 = 0;
const CONTENT_BOOL: u8 = 1;
const CONTENT_BYTES: u8 = 2;
const CONTENT_STR: u8 = 3;
const CONTENT_JSON: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    None,
    Bool(bool),
    Bytes(Vec<u8>),
    Str(String),
    Json(Value),
}

impl Content {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Content::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// One decoded communion message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub mode: Mode,
    pub id: u32,
    pub metadata: Map<String, Value>,
    pub content: Content,
}

impl Message {
    pub fn request(id: u32, metadata: Map<String, Value>, content: Content) -> Self {
        Self {
            mode: Mode::Request,
            id,
            metadata,
            content,
        }
    }

    pub fn response(id: u32, content: Content) -> Self {
        Self {
            mode: Mode::Response,
            id,
            metadata: Map::new(),
            content,
        }
    }

    /// A response signalling a server-side failure
    pub fn error_response(id: u32, message: impl Into<String>) -> Self {
        let mut metadata = Map::new();
        metadata.insert("error".to_string(), Value::Bool(true));
        Self {
            mode: Mode::Response,
            id,
            metadata,
            content: Content::Str(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.metadata
            .get("error")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn encode(&self) -> CommuneResult<Vec<u8>> {
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(MAGIC);
        out.push(match self.mode {
            Mode::Request => 0,
            Mode::Response => 1,
        });
        out.extend_from_slice(&self.id.to_le_bytes());

        if self.metadata.is_empty() {
            out.extend_from_slice(&0u32.to_le_bytes());
        } else {
            let aux = serde_json::to_vec(&self.metadata)?;
            out.extend_from_slice(&len_u32(aux.len())?.to_le_bytes());
            out.extend_from_slice(&aux);
        }

        match &self.content {
            Content::None => out.push(CONTENT_NONE),
            Content::Bool(b) => {
                out.push(CONTENT_BOOL);
                out.push(u8::from(*b));
            }
            Content::Bytes(bytes) => {
                out.push(CONTENT_BYTES);
                out.extend_from_slice(bytes);
            }
            Content::Str(s) => {
                out.push(CONTENT_STR);
                out.extend_from_slice(s.as_bytes());
            }
            Content::Json(value) => {
                out.push(CONTENT_JSON);
                out.extend_from_slice(&serde_json::to_vec(value)?);
            }
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> CommuneResult<Self> {
        let mut cursor = Cursor { data, pos: 0 };

        if cursor.take(MAGIC.len())? != MAGIC {
            return Err(CommuneError::invalid_frame("bad magic"));
        }
        let mode = match cursor.take(1)?[0] {
            0 => Mode::Request,
            1 => Mode::Response,
            other => {
                return Err(CommuneError::invalid_frame(format!("unknown mode {}", other)));
            }
        };
        let id = cursor.u32_le()?;

        let aux_len = cursor.u32_le()? as usize;
        let metadata = if aux_len == 0 {
            Map::new()
        } else {
            match serde_json::from_slice(cursor.take(aux_len)?)? {
                Value::Object(map) => map,
                _ => return Err(CommuneError::invalid_frame("metadata is not an object")),
            }
        };

        let content_type = cursor.take(1)?[0];
        let rest = cursor.rest();
        let content = match content_type {
            CONTENT_NONE => Content::None,
            CONTENT_BOOL => match rest {
                [0] => Content::Bool(false),
                [1] => Content::Bool(true),
                _ => return Err(CommuneError::invalid_frame("malformed bool content")),
            },
            CONTENT_BYTES => Content::Bytes(rest.to_vec()),
            CONTENT_STR => Content::Str(
                String::from_utf8(rest.to_vec())
                    .map_err(|_| CommuneError::invalid_frame("string content is not UTF-8"))?,
            ),
            CONTENT_JSON => Content::Json(serde_json::from_slice(rest)?),
            other => {
                return Err(CommuneError::invalid_frame(format!(
                    "unknown content type {}",
                    other
                )));
            }
        };

        Ok(Self {
            mode,
            id,
            metadata,
            content,
        })
    }
}

fn len_u32(len: usize) -> CommuneResult<u32> {
    u32::try_from(len).map_err(|_| CommuneError::FrameTooLarge {
        size: len,
        max: u32::MAX as usize,
    })
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> CommuneResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| CommuneError::invalid_frame("truncated message"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32_le(&mut self) -> CommuneResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}
