//! Control-message framing.
//!
//! Every control message starts with an 8-byte header: the function id
//! followed by the transaction id (xid), both little-endian u32. The
//! function-id space is disjoint from the xid space; the reserved id 0
//! tags a message as a response rather than a command.

use std::fmt;

use crate::error::{Error, Result};

/// Control-message header size in bytes.
pub const MSG_HDR_SIZE: usize = 8;

/// Maximum control-message size, header included.
pub const MAX_MSG_SIZE: usize = 4096;

/// Maximum control-message payload size.
pub const MAX_PAYLOAD_SIZE: usize = MAX_MSG_SIZE - MSG_HDR_SIZE;

/// Reserved function id tagging a message as a response.
pub const FN_RESPONSE: u32 = 0;

/// Identifier of a remote operation. Must be non-zero; id 0 is the
/// response tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Control-message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHdr {
    /// Function id, or [`FN_RESPONSE`] for a response.
    pub func: u32,
    /// Transaction id correlating a request with its response.
    pub xid: u32,
}

impl MsgHdr {
    /// Create a new header.
    pub fn new(func: u32, xid: u32) -> Self {
        Self { func, xid }
    }

    /// Check whether this message is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.func == FN_RESPONSE
    }

    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; MSG_HDR_SIZE] {
        let mut out = [0u8; MSG_HDR_SIZE];
        out[..4].copy_from_slice(&self.func.to_le_bytes());
        out[4..].copy_from_slice(&self.xid.to_le_bytes());
        out
    }

    /// Parse a header from the front of a received message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MSG_HDR_SIZE {
            return Err(Error::Protocol("control message shorter than its header"));
        }
        let func = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let xid = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self { func, xid })
    }
}
