//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors.
///
/// Every variant means the byte stream can no longer be trusted; "need more
/// data" is never an error and is reported as `Ok(None)` by decoders.
#[derive(Error, Debug)]
pub enum WireError {
    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Invalid CBOR metadata
    #[error("cbor meta invalid")]
    Meta,

    /// Metadata could not be encoded
    #[error("cbor meta encoding failed")]
    MetaEncode,

    /// Body checksum mismatch
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum computed over the received body
        actual: u32,
    },

    /// Reserved flag bits nonzero
    #[error("reserved flag bits nonzero: {0:#06x}")]
    Reserved(u16),

    /// Unknown message kind
    #[error("unknown message kind {0}")]
    Kind(u8),

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,
}
