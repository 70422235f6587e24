//! Cluster event stream.
//!
//! Replaces the historical signal-based listener notification with an
//! explicit event stream: subscribers get a broadcast receiver, and bound
//! port listeners additionally receive out-of-band notifications inline on
//! their delivery queues.

use serde::Serialize;

use conclave_core::types::LeaveReason;

/// Events published to subscribers on membership and configuration changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ClusterEvent {
    /// A transition committed; the member set or generation changed.
    MembershipChanged {
        generation: u32,
        members: Vec<u32>,
    },
    /// The quorate flag flipped.
    QuorumChanged { quorate: bool },
    /// A node was declared dead or left.
    NodeDown { node_id: u32, reason: u8 },
    /// Some cluster configuration value changed (votes, expected votes,
    /// config version).
    ConfigChanged,
    /// The local node left the cluster.
    LeftCluster { reason: u8 },
}

impl ClusterEvent {
    #[must_use]
    pub fn left(reason: LeaveReason) -> Self {
        ClusterEvent::LeftCluster {
            reason: reason.bits(),
        }
    }
}

/// Out-of-band notices posted on a bound port's delivery queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobNotice {
    /// A remote member closed the matching port.
    PortClosed { node_id: i32 },
    /// Cluster state changed (quorum, membership, configuration); clients
    /// should re-query whatever state they cache.
    StateChange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn left_event_carries_reason_bits() {
        let ev = ClusterEvent::left(LeaveReason::PANIC);
        assert_eq!(
            ev,
            ClusterEvent::LeftCluster {
                reason: LeaveReason::PANIC.bits()
            }
        );
    }
}
