//! Protocol domain enums shared between the wire catalogue and the engine.
//!
//! Every enum that appears in a wire message carries explicit `from_wire`/
//! `to_wire` conversions rather than relying on discriminant layout.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::wire::WireError;

// ---------------------------------------------------------------------------
// Node state
// ---------------------------------------------------------------------------

/// Lifecycle state of a node record.
///
/// `RemoteMember` is the state a node descriptor arrives in when another
/// member packs its view into MASTERVIEW/JOINCONF: a member from the
/// sender's point of view that the receiver has not confirmed locally yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeState {
    Member,
    Joining,
    RemoteMember,
    Dead,
}

impl NodeState {
    pub fn to_wire(self) -> u8 {
        match self {
            NodeState::Member => 1,
            NodeState::Joining => 2,
            NodeState::RemoteMember => 3,
            NodeState::Dead => 4,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self, WireError> {
        match v {
            1 => Ok(NodeState::Member),
            2 => Ok(NodeState::Joining),
            3 => Ok(NodeState::RemoteMember),
            4 => Ok(NodeState::Dead),
            other => Err(WireError::BadValue {
                field: "node state",
                value: u32::from(other),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Membership transition reasons
// ---------------------------------------------------------------------------

/// Why a master started a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransitionReason {
    /// A new node is joining the cluster.
    NewNode,
    /// A node has left the cluster.
    RemNode,
    /// Another node left while a transition was already in progress.
    AnotherRemNode,
    /// An election completed and the sender is the new master.
    NewMaster,
    /// A consistency check was requested (e.g. HELLO member-count mismatch).
    Check,
    /// The transition restarted after a timeout.
    Restart,
    /// The master died mid-transition and the sender took over.
    DeadMaster,
}

impl TransitionReason {
    pub fn to_wire(self) -> u8 {
        match self {
            TransitionReason::NewNode => 1,
            TransitionReason::RemNode => 2,
            TransitionReason::AnotherRemNode => 3,
            TransitionReason::NewMaster => 4,
            TransitionReason::Check => 5,
            TransitionReason::Restart => 6,
            TransitionReason::DeadMaster => 7,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self, WireError> {
        match v {
            1 => Ok(TransitionReason::NewNode),
            2 => Ok(TransitionReason::RemNode),
            3 => Ok(TransitionReason::AnotherRemNode),
            4 => Ok(TransitionReason::NewMaster),
            5 => Ok(TransitionReason::Check),
            6 => Ok(TransitionReason::Restart),
            7 => Ok(TransitionReason::DeadMaster),
            other => Err(WireError::BadValue {
                field: "transition reason",
                value: u32::from(other),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Join acknowledgement
// ---------------------------------------------------------------------------

/// Verdict carried in a JOINACK message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JoinAckKind {
    /// The applicant may join; a transition will admit it.
    Ok,
    /// The applicant is incompatible and must not retry.
    Nak,
    /// The cluster is busy (in transition); retry later.
    Wait,
}

impl JoinAckKind {
    pub fn to_wire(self) -> u8 {
        match self {
            JoinAckKind::Ok => 1,
            JoinAckKind::Nak => 2,
            JoinAckKind::Wait => 3,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self, WireError> {
        match v {
            1 => Ok(JoinAckKind::Ok),
            2 => Ok(JoinAckKind::Nak),
            3 => Ok(JoinAckKind::Wait),
            other => Err(WireError::BadValue {
                field: "joinack kind",
                value: u32::from(other),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Reconfiguration parameters
// ---------------------------------------------------------------------------

/// Cluster parameter changed by a RECONFIG message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconfigParam {
    ExpectedVotes,
    NodeVotes,
    ConfigVersion,
}

impl ReconfigParam {
    pub fn to_wire(self) -> u8 {
        match self {
            ReconfigParam::ExpectedVotes => 1,
            ReconfigParam::NodeVotes => 2,
            ReconfigParam::ConfigVersion => 3,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self, WireError> {
        match v {
            1 => Ok(ReconfigParam::ExpectedVotes),
            2 => Ok(ReconfigParam::NodeVotes),
            3 => Ok(ReconfigParam::ConfigVersion),
            other => Err(WireError::BadValue {
                field: "reconfig param",
                value: u32::from(other),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Leave reasons
// ---------------------------------------------------------------------------

bitflags! {
    /// Reason flags carried in a LEAVE message and recorded on the node
    /// record. `FORCE` is only meaningful locally (skip the quorum check on
    /// the way out); the rest describe why the node left.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LeaveReason: u8 {
        const DOWN         = 0x01;
        const KILLED       = 0x02;
        const PANIC        = 0x04;
        const REMOVED      = 0x08;
        const REJECTED     = 0x10;
        const INCONSISTENT = 0x20;
        const DEAD         = 0x40;
        const FORCE        = 0x80;
    }
}

// ---------------------------------------------------------------------------
// HELLO flags
// ---------------------------------------------------------------------------

bitflags! {
    /// Flags in the HELLO heartbeat message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HelloFlags: u8 {
        /// Unicast liveness probe to the master during a transition;
        /// requires an ACK.
        const MASTER  = 0x01;
        /// The sender's cluster is quorate.
        const QUORATE = 0x02;
    }
}

// ---------------------------------------------------------------------------
// ACK status
// ---------------------------------------------------------------------------

/// Status byte carried in an explicit ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Ok,
    /// The target port had no bound listener.
    NoListener,
}

impl AckStatus {
    pub fn to_wire(self) -> u8 {
        match self {
            AckStatus::Ok => 0,
            AckStatus::NoListener => 1,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(AckStatus::Ok),
            1 => Ok(AckStatus::NoListener),
            other => Err(WireError::BadValue {
                field: "ack status",
                value: u32::from(other),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Barrier end reasons
// ---------------------------------------------------------------------------

/// Why a barrier wait resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BarrierEndReason {
    /// All expected participants arrived.
    Done,
    /// The barrier timer fired first.
    Timeout,
    /// The node left the cluster while the barrier was waiting.
    NotConnected,
    /// The barrier was explicitly cancelled or deleted.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Service-group message types
// ---------------------------------------------------------------------------

/// Type byte of a service-group message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SgMsgType {
    JoinReq,
    JoinRep,
    JstopReq,
    JstopRep,
    JstartCmd,
    LeaveReq,
    LeaveRep,
    LstopReq,
    LstopRep,
    LstartCmd,
    LstartDone,
    Recover,
}

impl SgMsgType {
    pub fn to_wire(self) -> u8 {
        match self {
            SgMsgType::JoinReq => 1,
            SgMsgType::JoinRep => 2,
            SgMsgType::JstopReq => 3,
            SgMsgType::JstopRep => 4,
            SgMsgType::JstartCmd => 5,
            SgMsgType::LeaveReq => 6,
            SgMsgType::LeaveRep => 7,
            SgMsgType::LstopReq => 8,
            SgMsgType::LstopRep => 9,
            SgMsgType::LstartCmd => 10,
            SgMsgType::LstartDone => 11,
            SgMsgType::Recover => 12,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self, WireError> {
        match v {
            1 => Ok(SgMsgType::JoinReq),
            2 => Ok(SgMsgType::JoinRep),
            3 => Ok(SgMsgType::JstopReq),
            4 => Ok(SgMsgType::JstopRep),
            5 => Ok(SgMsgType::JstartCmd),
            6 => Ok(SgMsgType::LeaveReq),
            7 => Ok(SgMsgType::LeaveRep),
            8 => Ok(SgMsgType::LstopReq),
            9 => Ok(SgMsgType::LstopRep),
            10 => Ok(SgMsgType::LstartCmd),
            11 => Ok(SgMsgType::LstartDone),
            12 => Ok(SgMsgType::Recover),
            other => Err(WireError::BadValue {
                field: "sg message type",
                value: u32::from(other),
            }),
        }
    }
}

/// Status byte of a service-group reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgMsgStatus {
    Pos,
    Neg,
    Wait,
}

impl SgMsgStatus {
    pub fn to_wire(self) -> u8 {
        match self {
            SgMsgStatus::Pos => 1,
            SgMsgStatus::Neg => 2,
            SgMsgStatus::Wait => 3,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self, WireError> {
        match v {
            1 => Ok(SgMsgStatus::Pos),
            2 => Ok(SgMsgStatus::Neg),
            3 => Ok(SgMsgStatus::Wait),
            other => Err(WireError::BadValue {
                field: "sg message status",
                value: u32::from(other),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
