//! Message model and frame codec for the rpc transport.
//!
//! This crate defines the [`MessageCodec`] seam the session layer decodes
//! inbound bytes through, the [`GenericMessage`] exchanged with the dispatch
//! layer, and [`FrameCodec`], the default length-prefixed codec.
//!
//! ## Features
//!
//! - **Incremental decoding**: `Ok(None)` while a frame is still partial
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **CBOR Metadata**: Target, method and headers in a canonical CBOR map
//! - **Optional checksums**: CRC-32 over the frame body

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod message;

// Re-export main types
pub use codec::{get_meta_str, parse_meta, MessageCodec, MetaBuilder};
pub use error::WireError;
pub use frame::{FrameCodec, DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE, MAX_META_SIZE};
pub use header::{Flags, FrameHeader, MessageKind, HEADER_SIZE, WIRE_VERSION};
pub use message::GenericMessage;
