//! Wire message catalogues.
//!
//! Three families, each on its own reserved port:
//! - [`control`]: port-0 messages handled inside the comms layer itself.
//! - [`membership`]: the membership protocol catalogue.
//! - [`service`]: the service-group protocol message.
//!
//! Codecs are hand-written little-endian over `bytes` cursors; the header
//! ([`crate::wire::Header`]) is framed separately by the comms layer.

pub mod control;
pub mod membership;
pub mod service;

use bytes::{Buf, BufMut};

use crate::types::NodeState;
use crate::wire::WireError;
use crate::MAX_NODE_NAME_LEN;

pub use control::{BarrierControl, BarrierSubCmd, ControlMessage};
pub use membership::{
    EndTransition, Hello, JoinRequest, MembershipMessage, StartAck, StartTransition, ViewChunk,
    CHUNK_FIRST, CHUNK_LAST,
};
pub use service::SgMessage;

// ---------------------------------------------------------------------------
// Shared codec helpers
// ---------------------------------------------------------------------------

/// Checks that `buf` holds at least `needed` more bytes.
pub(crate) fn ensure<B: Buf>(buf: &B, needed: usize, field: &'static str) -> Result<(), WireError> {
    if buf.remaining() < needed {
        Err(WireError::Truncated {
            field,
            needed: needed - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

/// Reads `len` raw bytes.
pub(crate) fn get_bytes<B: Buf>(
    buf: &mut B,
    len: usize,
    field: &'static str,
) -> Result<Vec<u8>, WireError> {
    ensure(buf, len, field)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Reads a NUL-terminated UTF-8 string, consuming the terminator.
pub(crate) fn get_cstr<B: Buf>(buf: &mut B, field: &'static str) -> Result<String, WireError> {
    let mut bytes = Vec::new();
    loop {
        if buf.remaining() == 0 {
            return Err(WireError::MissingNul { field });
        }
        let b = buf.get_u8();
        if b == 0 {
            break;
        }
        if bytes.len() >= MAX_NODE_NAME_LEN {
            return Err(WireError::TooLong {
                field,
                len: bytes.len() + 1,
                max: MAX_NODE_NAME_LEN,
            });
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|_| WireError::BadString { field })
}

/// Writes a NUL-terminated string.
pub(crate) fn put_cstr<B: BufMut>(buf: &mut B, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

// ---------------------------------------------------------------------------
// Packed node descriptor
// ---------------------------------------------------------------------------

/// One node, as packed into STARTTRANS, MASTERVIEW, and JOINCONF messages.
///
/// Wire layout: `u8 name_len, name, u8 state, u16 num_addrs,
/// num_addrs x address_length bytes, u8 votes, u32 expected_votes,
/// u32 node_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub name: String,
    pub state: NodeState,
    pub addresses: Vec<Vec<u8>>,
    pub votes: u8,
    pub expected_votes: u32,
    pub node_id: u32,
}

impl NodeDescriptor {
    /// Appends the packed encoding. Every address must be exactly
    /// `address_length` bytes; shorter ones are zero-padded, longer ones
    /// truncated (the cluster-wide address length is fixed at startup).
    pub fn encode<B: BufMut>(&self, buf: &mut B, address_length: usize) {
        let name_len = self.name.len().min(u8::MAX as usize);
        buf.put_u8(name_len as u8);
        buf.put_slice(&self.name.as_bytes()[..name_len]);
        buf.put_u8(self.state.to_wire());
        buf.put_u16_le(self.addresses.len() as u16);
        for addr in &self.addresses {
            if addr.len() >= address_length {
                buf.put_slice(&addr[..address_length]);
            } else {
                buf.put_slice(addr);
                buf.put_bytes(0, address_length - addr.len());
            }
        }
        buf.put_u8(self.votes);
        buf.put_u32_le(self.expected_votes);
        buf.put_u32_le(self.node_id);
    }

    pub fn decode<B: Buf>(buf: &mut B, address_length: usize) -> Result<Self, WireError> {
        ensure(buf, 1, "node descriptor name length")?;
        let name_len = buf.get_u8() as usize;
        let name_bytes = get_bytes(buf, name_len, "node descriptor name")?;
        let name =
            String::from_utf8(name_bytes).map_err(|_| WireError::BadString { field: "node name" })?;
        ensure(buf, 3, "node descriptor state")?;
        let state = NodeState::from_wire(buf.get_u8())?;
        let num_addrs = buf.get_u16_le() as usize;
        let mut addresses = Vec::with_capacity(num_addrs);
        for _ in 0..num_addrs {
            addresses.push(get_bytes(buf, address_length, "node descriptor address")?);
        }
        ensure(buf, 9, "node descriptor votes")?;
        let votes = buf.get_u8();
        let expected_votes = buf.get_u32_le();
        let node_id = buf.get_u32_le();
        Ok(Self {
            name,
            state,
            addresses,
            votes,
            expected_votes,
            node_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
