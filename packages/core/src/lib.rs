//! Conclave core — wire framing and message catalogue for the cluster protocol.
//!
//! This crate owns everything that crosses the wire: the fixed protocol
//! header, the port-0 control messages, the membership message catalogue,
//! the service-group messages, and the domain enums they carry. The engine
//! crate (`conclave-node`) builds the state machines on top of these types.
//!
//! All multi-byte integers are little-endian on the wire.

pub mod hash;
pub mod messages;
pub mod types;
pub mod wire;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Protocol version triple. A major mismatch rejects a joiner outright;
/// minor and patch are backwards compatible.
pub const PROTOCOL_MAJOR_VERSION: u32 = 2;
pub const PROTOCOL_MINOR_VERSION: u32 = 0;
pub const PROTOCOL_PATCH_VERSION: u32 = 1;

/// Maximum number of send retries before unacked peers are declared dead.
pub const MAX_RETRIES: u32 = 3;

/// Maximum size of a cluster datagram, header included.
pub const MAX_CLUSTER_MESSAGE: usize = 1500;

/// Maximum length of a node name, including the terminating NUL.
pub const MAX_NODE_NAME_LEN: usize = 256;

/// Maximum length of a barrier name, including the terminating NUL.
pub const MAX_BARRIER_NAME_LEN: usize = 33;

/// Fixed length of the cluster-name field in a join request.
pub const CLUSTER_NAME_LEN: usize = 16;

/// Reserved port for internal control messages (ACK, LISTENREQ, BARRIER...).
pub const PORT_CONTROL: u8 = 0;

/// Reserved port for the membership protocol.
pub const PORT_MEMBERSHIP: u8 = 1;

/// Reserved port for the service-group protocol.
pub const PORT_SERVICES: u8 = 2;

/// Ports above this value are user ports: sends on them block while the
/// cluster is inquorate or a transition is in progress.
pub const HIGH_PROTECTED_PORT: u8 = 9;

/// Number of service-group levels.
pub const SG_LEVELS: u8 = 4;

// ---------------------------------------------------------------------------
// Re-exports — flat public API
// ---------------------------------------------------------------------------

pub use hash::{cluster_id_hash, node_backoff_hash};
pub use types::{
    AckStatus, BarrierEndReason, HelloFlags, JoinAckKind, LeaveReason, NodeState, ReconfigParam,
    SgMsgStatus, SgMsgType, TransitionReason,
};
pub use wire::{Header, MsgFlags, WireError, HEADER_LEN};
