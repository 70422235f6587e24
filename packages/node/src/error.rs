//! Engine error and wait-outcome types.

use thiserror::Error;

use conclave_core::WireError;

/// Errors surfaced across the engine's public API.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The local node is not (or no longer) a cluster member.
    #[error("not connected to the cluster")]
    NotConnected,

    /// A DONTWAIT operation would have blocked.
    #[error("operation would block")]
    WouldBlock,

    /// A port bind found the slot occupied.
    #[error("port {0} already bound")]
    AddressInUse(u8),

    /// A reserved or out-of-range port was used.
    #[error("invalid port {0}")]
    InvalidPort(u8),

    /// The remote end had no listener on the target port.
    #[error("no listener on remote port {0}")]
    NoListener(u8),

    /// The cluster rejected our join request; do not retry.
    #[error("join rejected: {0}")]
    Rejected(&'static str),

    /// The blocked caller was interrupted (signal or shutdown).
    #[error("interrupted")]
    Interrupted,

    #[error("timed out")]
    TimedOut,

    /// A payload exceeded the maximum datagram size.
    #[error("message of {0} bytes exceeds the datagram limit")]
    MessageTooLong(usize),

    /// A barrier operation referenced a name that is not registered.
    #[error("no such barrier {0:?}")]
    NoSuchBarrier(String),

    /// Barrier registration conflicted with an existing barrier.
    #[error("barrier {0:?} exists with a different node count")]
    BarrierMismatch(String),

    /// The requested barrier attribute is not supported.
    #[error("unsupported barrier attribute")]
    UnsupportedAttribute,

    /// A service-group operation referenced an unknown local id.
    #[error("no such service group {0}")]
    NoSuchGroup(u32),

    /// A service group with this name is already registered as unique.
    #[error("service group {0:?} already registered")]
    GroupExists(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How a blocking wait (send gate, barrier, listen probe) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited condition was reached.
    Completed,
    TimedOut,
    /// The wait target was cancelled or deleted under the waiter.
    Cancelled,
    /// The caller was interrupted.
    Signalled,
    /// The node left the cluster while waiting.
    Disconnected,
}
