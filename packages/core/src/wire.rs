//! The fixed protocol header prepended to every cluster datagram.
//!
//! Wire layout (16 bytes, little-endian):
//!
//! | offset | size | field   |
//! |-------:|-----:|---------|
//! | 0      | 1    | port    |
//! | 1      | 1    | flags   |
//! | 2      | 2    | cluster |
//! | 4      | 2    | seq     |
//! | 6      | 2    | ack     |
//! | 8      | 4    | srcid   |
//! | 12     | 4    | tgtid   |

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use thiserror::Error;

/// Length of the encoded header in bytes.
pub const HEADER_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error decoding a wire structure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer truncated: needed {needed} more bytes for {field}")]
    Truncated { field: &'static str, needed: usize },
    #[error("unknown {field} value {value}")]
    BadValue { field: &'static str, value: u32 },
    #[error("unknown control command {0}")]
    BadCommand(u8),
    #[error("string field {field} is not valid UTF-8")]
    BadString { field: &'static str },
    #[error("missing NUL terminator in {field}")]
    MissingNul { field: &'static str },
    #[error("{field} too long: {len} > {max}")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

bitflags! {
    /// Flag byte of the protocol header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u8 {
        /// The receiver must not acknowledge this message.
        const NOACK     = 0x01;
        /// A protocol reply doubles as the ACK; cleared in the saved copy
        /// so a resend solicits a real ACK.
        const REPLYEXP  = 0x02;
        /// Sent to all nodes rather than one target.
        const MULTICAST = 0x04;
        /// Queue the message for the comms worker instead of sending inline.
        const QUEUE     = 0x08;
        /// Loop a multicast back to the sender as well.
        const BCASTSELF = 0x10;
        /// Return would-block instead of suspending the caller.
        const DONTWAIT  = 0x20;
        /// Transmit on every send-capable interface, not just the current one.
        const ALLINT    = 0x40;
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The protocol header stamped onto every outbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Destination port; 0 is the control port.
    pub port: u8,
    pub flags: MsgFlags,
    /// 16-bit hash of the cluster name; mismatches are dropped silently.
    pub cluster: u16,
    /// Sender's sequence number.
    pub seq: u16,
    /// Piggyback ACK of the peer's last received sequence.
    pub ack: u16,
    /// Node id of the sender. Negative ids are temporary (pre-join).
    pub srcid: i32,
    /// Node id of the target, or 0 for multicast.
    pub tgtid: i32,
}

impl Header {
    /// Appends the 16-byte encoding to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.port);
        buf.put_u8(self.flags.bits());
        buf.put_u16_le(self.cluster);
        buf.put_u16_le(self.seq);
        buf.put_u16_le(self.ack);
        buf.put_i32_le(self.srcid);
        buf.put_i32_le(self.tgtid);
    }

    /// Decodes a header from the front of `buf`, advancing it.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Truncated` if fewer than [`HEADER_LEN`] bytes
    /// remain. Unknown flag bits are dropped rather than rejected so that
    /// newer peers can extend the flag byte compatibly.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < HEADER_LEN {
            return Err(WireError::Truncated {
                field: "header",
                needed: HEADER_LEN - buf.remaining(),
            });
        }
        let port = buf.get_u8();
        let flags = MsgFlags::from_bits_truncate(buf.get_u8());
        let cluster = buf.get_u16_le();
        let seq = buf.get_u16_le();
        let ack = buf.get_u16_le();
        let srcid = buf.get_i32_le();
        let tgtid = buf.get_i32_le();
        Ok(Self {
            port,
            flags,
            cluster,
            seq,
            ack,
            srcid,
            tgtid,
        })
    }
}

/// Compares two 16-bit sequence numbers, wrap-aware.
///
/// Returns `true` if `a` is strictly newer than `b` in the circular space.
#[must_use]
pub fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
