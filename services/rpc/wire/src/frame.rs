//! Length-prefixed framing for [`GenericMessage`].
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | Header (16B)         | version, kind, flags,      |
//! |                      | checksum, request_id       |
//! +----------------------+----------------------------+
//! | u32 meta_len         | canonical CBOR map length  |
//! +----------------------+----------------------------+
//! | meta_bytes           | target, method, headers    |
//! +----------------------+----------------------------+
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tracing::trace;

use crate::codec::{get_meta_str, parse_meta, MessageCodec, MetaBuilder};
use crate::header::{Flags, FrameHeader, HEADER_SIZE};
use crate::message::GenericMessage;
use crate::WireError;

/// Maximum frame size (16 MiB default, 64 MiB hard limit)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Hard maximum frame size limit (64 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum metadata size (64 KiB)
pub const MAX_META_SIZE: usize = 64 * 1024;

const META_TARGET: &str = "target";
const META_METHOD: &str = "method";

/// Default codec for [`GenericMessage`]
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    checksum: bool,
}

impl FrameCodec {
    /// Create a codec with the default frame size limit and no checksums
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            checksum: false,
        }
    }

    /// Limit accepted and produced frames to `max_frame_size` bytes
    /// (clamped to [`HARD_MAX_FRAME_SIZE`])
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size.min(HARD_MAX_FRAME_SIZE);
        self
    }

    /// Stamp outgoing frames with a CRC-32 of their body
    pub fn with_checksum(mut self) -> Self {
        self.checksum = true;
        self
    }

    /// Configured frame size limit
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn body_checksum(meta_raw: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(meta_raw);
    hasher.update(payload);
    hasher.finalize()
}

fn build_meta(message: &GenericMessage) -> Result<Bytes, WireError> {
    let mut meta = MetaBuilder::new();
    if let Some(ref target) = message.target {
        meta = meta.insert_str(META_TARGET, target);
    }
    if let Some(ref method) = message.method {
        meta = meta.insert_str(META_METHOD, method);
    }
    for (key, value) in &message.headers {
        if key != META_TARGET && key != META_METHOD {
            meta = meta.insert_bytes(key, value);
        }
    }
    meta.build()
}

impl MessageCodec for FrameCodec {
    type Message = GenericMessage;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<GenericMessage>, WireError> {
        // Need at least 4 bytes for frame length
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if frame_len > self.max_frame_size {
            return Err(WireError::Size(frame_len));
        }
        if frame_len < HEADER_SIZE + 4 {
            return Err(WireError::Malformed);
        }

        if buf.len() < 4 + frame_len {
            trace!("Partial frame: have {} of {} bytes", buf.len(), 4 + frame_len);
            return Ok(None);
        }

        buf.advance(4);
        let mut frame_buf = buf.split_to(frame_len).freeze();
        let header = FrameHeader::decode(&mut frame_buf)?;

        let meta_len = frame_buf.get_u32() as usize;
        if meta_len > MAX_META_SIZE || frame_buf.len() < meta_len {
            return Err(WireError::Meta);
        }

        let meta_raw = frame_buf.split_to(meta_len);
        let payload = frame_buf;

        if header.flags.contains(Flags::CHECKSUM) {
            let actual = body_checksum(&meta_raw, &payload);
            if actual != header.checksum {
                return Err(WireError::Checksum {
                    expected: header.checksum,
                    actual,
                });
            }
        }

        let mut target = None;
        let mut method = None;
        let mut headers = BTreeMap::new();
        if !meta_raw.is_empty() {
            let meta = parse_meta(&meta_raw)?;
            target = get_meta_str(&meta, META_TARGET);
            method = get_meta_str(&meta, META_METHOD);
            for (key, value) in meta {
                if key == META_TARGET || key == META_METHOD {
                    continue;
                }
                match value {
                    ciborium::Value::Bytes(bytes) => {
                        headers.insert(key, bytes);
                    }
                    ciborium::Value::Text(text) => {
                        headers.insert(key, text.into_bytes());
                    }
                    _ => {
                        // Skip other value types
                    }
                }
            }
        }

        Ok(Some(GenericMessage {
            kind: header.kind,
            request_id: header.request_id,
            target,
            method,
            headers,
            payload,
        }))
    }

    fn encode(&mut self, message: &GenericMessage, dst: &mut BytesMut) -> Result<(), WireError> {
        let meta_raw = build_meta(message)?;
        if meta_raw.len() > MAX_META_SIZE {
            return Err(WireError::Size(meta_raw.len()));
        }

        let frame_len = HEADER_SIZE + 4 + meta_raw.len() + message.payload.len();
        if frame_len > self.max_frame_size {
            return Err(WireError::Size(frame_len));
        }

        let mut header = FrameHeader::new(message.kind, message.request_id);
        if self.checksum {
            header.flags |= Flags::CHECKSUM;
            header.checksum = body_checksum(&meta_raw, &message.payload);
        }

        dst.reserve(4 + frame_len);
        dst.put_u32(frame_len as u32);
        header.encode(dst);
        dst.put_u32(meta_raw.len() as u32);
        dst.put_slice(&meta_raw);
        dst.put_slice(&message.payload);

        Ok(())
    }
}
