//! Length-prefixed transport frames
//!
//! Each frame is a 4-byte little-endian length followed by the payload.
//! [`FrameCodec`] wraps a [`LengthDelimitedCodec`] and rejects an oversized
//! length before any of the payload is buffered.

use crate::error::{CommuneError, CommuneResult};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

/// Maximum frame payload (256 MiB)
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

const LENGTH_FIELD: usize = 4;

/// A byte stream carrying communion frames
pub type FramedStream<S> = Framed<S, FrameCodec>;

pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> FramedStream<S> {
    Framed::new(stream, FrameCodec::new())
}

#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    /// The inner codec has consumed a length prefix and waits for its payload
    in_payload: bool,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .little_endian()
                .length_field_length(LENGTH_FIELD)
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
            in_payload: false,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = CommuneError;

    fn decode(&mut self, src: &mut BytesMut) -> CommuneResult<Option<BytesMut>> {
        let head_available = !self.in_payload && src.len() >= LENGTH_FIELD;
        if head_available {
            let size = (&src[..LENGTH_FIELD]).get_u32_le() as usize;
            if size > MAX_FRAME_SIZE {
                return Err(CommuneError::FrameTooLarge {
                    size,
                    max: MAX_FRAME_SIZE,
                });
            }
        }
        let frame = self
            .inner
            .decode(src)
            .map_err(|e| CommuneError::io("decoding frame", e))?;
        self.in_payload = frame.is_none() && (self.in_payload || head_available);
        Ok(frame)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CommuneError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> CommuneResult<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CommuneError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        self.inner
            .encode(payload, dst)
            .map_err(|e| CommuneError::io("encoding frame", e))
    }
}

/// Read one frame; a clean end of stream is `ConnectionClosed`
pub async fn next_frame<S>(frames: &mut S) -> CommuneResult<BytesMut>
where
    S: Stream<Item = CommuneResult<BytesMut>> + Unpin,
{
    frames
        .next()
        .await
        .unwrap_or(Err(CommuneError::ConnectionClosed))
}

pub async fn send_frame<S>(frames: &mut S, payload: impl Into<Bytes>) -> CommuneResult<()>
where
    S: Sink<Bytes, Error = CommuneError> + Unpin,
{
    frames.send(payload.into()).await
}
