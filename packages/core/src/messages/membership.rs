//! The membership protocol catalogue.
//!
//! One command byte after the header selects the message. STARTTRANS,
//! MASTERVIEW and JOINCONF carry packed node descriptors; MASTERVIEW and
//! JOINCONF are split across datagrams with first/last chunk flags.

use bytes::{Buf, BufMut};

use super::{ensure, get_bytes, get_cstr, put_cstr, NodeDescriptor};
use crate::types::{HelloFlags, JoinAckKind, LeaveReason, ReconfigParam, TransitionReason};
use crate::wire::WireError;
use crate::CLUSTER_NAME_LEN;

const CMD_JOINCONF: u8 = 1;
const CMD_JOINREQ: u8 = 2;
const CMD_LEAVE: u8 = 3;
const CMD_HELLO: u8 = 4;
const CMD_KILL: u8 = 5;
const CMD_JOINACK: u8 = 6;
const CMD_ENDTRANS: u8 = 7;
const CMD_RECONFIG: u8 = 8;
const CMD_MASTERVIEW: u8 = 9;
const CMD_STARTTRANS: u8 = 10;
const CMD_JOINREJ: u8 = 11;
const CMD_VIEWACK: u8 = 12;
const CMD_STARTACK: u8 = 13;
const CMD_TRANSITION: u8 = 14;
const CMD_NEWCLUSTER: u8 = 15;
const CMD_CONFACK: u8 = 16;
const CMD_NOMINATE: u8 = 17;

/// Chunk flag: first datagram of a packed view.
pub const CHUNK_FIRST: u8 = 0x01;
/// Chunk flag: last datagram of a packed view.
pub const CHUNK_LAST: u8 = 0x02;

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Full join record carried by JOINREQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub votes: u8,
    pub expected_votes: u32,
    /// The sender's idea of the member count (zero for a fresh applicant).
    pub members: u32,
    pub major_version: u32,
    pub minor_version: u32,
    pub patch_version: u32,
    pub config_version: u32,
    pub address_length: u32,
    pub cluster_name: String,
    pub addresses: Vec<Vec<u8>>,
    pub node_name: String,
}

/// Periodic heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub flags: HelloFlags,
    pub members: u16,
    pub generation: u32,
}

/// Commits a transition on every recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndTransition {
    pub quorum: u32,
    pub total_votes: u32,
    pub generation: u32,
    /// Node id assigned to the joiner, or 0 when the transition removed a
    /// node.
    pub new_node_id: u32,
}

/// Starts a master-driven transition. For a NEWNODE transition the joiner's
/// addresses and name ride along so every member can create the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTransition {
    pub reason: TransitionReason,
    pub flags: u8,
    pub votes: u8,
    pub expected_votes: u32,
    pub generation: u32,
    /// Node the transition removes (REMNODE family), else 0.
    pub node_id: i32,
    /// Joining node's addresses + name when `reason` is `NewNode`.
    pub joining: Option<(Vec<Vec<u8>>, String)>,
}

/// A member's answer to STARTTRANS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartAck {
    pub reason: TransitionReason,
    pub generation: u32,
    /// Node id the sender proposes for the joiner (0 = no proposal).
    pub node_id: u32,
    pub highest_node_id: u32,
}

/// One datagram's worth of a packed cluster view (MASTERVIEW / JOINCONF).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewChunk {
    pub flags: u8,
    pub nodes: Vec<NodeDescriptor>,
}

impl ViewChunk {
    #[must_use]
    pub fn is_first(&self) -> bool {
        self.flags & CHUNK_FIRST != 0
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.flags & CHUNK_LAST != 0
    }
}

// ---------------------------------------------------------------------------
// Message enum
// ---------------------------------------------------------------------------

/// A message on the reserved membership port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipMessage {
    /// Master -> joiner: the packed post-transition cluster view.
    JoinConf(ViewChunk),
    JoinReq(JoinRequest),
    Leave(LeaveReason),
    Hello(Hello),
    Kill,
    JoinAck(JoinAckKind),
    EndTrans(EndTransition),
    Reconfig { param: ReconfigParam, value: u32 },
    /// Master -> members: the membership the master believes in.
    MasterView(ViewChunk),
    StartTrans(StartTransition),
    /// Terminal rejection; the applicant must not retry.
    JoinRej,
    ViewAck { agree: bool },
    StartAck(StartAck),
    /// Legacy probe retained on the wire; carries nothing.
    Transition,
    /// "I am about to form a cluster" tie-break announcement.
    NewCluster { low_ip: u32 },
    ConfAck,
    /// A STARTTRANS forwarded to the node that won a master tie.
    Nominate(StartTransition),
}

impl MembershipMessage {
    /// Appends the encoding. `address_length` is the cluster-wide binary
    /// address size (needed for packed descriptors and STARTTRANS bodies).
    pub fn encode<B: BufMut>(&self, buf: &mut B, address_length: usize) {
        match self {
            MembershipMessage::JoinConf(chunk) => {
                buf.put_u8(CMD_JOINCONF);
                encode_chunk(chunk, buf, address_length);
            }
            MembershipMessage::JoinReq(req) => {
                buf.put_u8(CMD_JOINREQ);
                buf.put_u8(req.votes);
                buf.put_u16_le(req.addresses.len() as u16);
                buf.put_u32_le(req.expected_votes);
                buf.put_u32_le(req.members);
                buf.put_u32_le(req.major_version);
                buf.put_u32_le(req.minor_version);
                buf.put_u32_le(req.patch_version);
                buf.put_u32_le(req.config_version);
                buf.put_u32_le(req.address_length);
                let name = req.cluster_name.as_bytes();
                let copy = name.len().min(CLUSTER_NAME_LEN - 1);
                buf.put_slice(&name[..copy]);
                buf.put_bytes(0, CLUSTER_NAME_LEN - copy);
                for addr in &req.addresses {
                    let alen = req.address_length as usize;
                    if addr.len() >= alen {
                        buf.put_slice(&addr[..alen]);
                    } else {
                        buf.put_slice(addr);
                        buf.put_bytes(0, alen - addr.len());
                    }
                }
                put_cstr(buf, &req.node_name);
            }
            MembershipMessage::Leave(reason) => {
                buf.put_u8(CMD_LEAVE);
                buf.put_u8(reason.bits());
            }
            MembershipMessage::Hello(h) => {
                buf.put_u8(CMD_HELLO);
                buf.put_u8(h.flags.bits());
                buf.put_u16_le(h.members);
                buf.put_u32_le(h.generation);
            }
            MembershipMessage::Kill => buf.put_u8(CMD_KILL),
            MembershipMessage::JoinAck(kind) => {
                buf.put_u8(CMD_JOINACK);
                buf.put_u8(kind.to_wire());
            }
            MembershipMessage::EndTrans(e) => {
                buf.put_u8(CMD_ENDTRANS);
                buf.put_u8(0); // pad
                buf.put_u16_le(0); // pad
                buf.put_u32_le(e.quorum);
                buf.put_u32_le(e.total_votes);
                buf.put_u32_le(e.generation);
                buf.put_u32_le(e.new_node_id);
            }
            MembershipMessage::Reconfig { param, value } => {
                buf.put_u8(CMD_RECONFIG);
                buf.put_u8(param.to_wire());
                buf.put_u16_le(0); // pad
                buf.put_u32_le(*value);
            }
            MembershipMessage::MasterView(chunk) => {
                buf.put_u8(CMD_MASTERVIEW);
                encode_chunk(chunk, buf, address_length);
            }
            MembershipMessage::StartTrans(st) => {
                buf.put_u8(CMD_STARTTRANS);
                encode_starttrans(st, buf, address_length);
            }
            MembershipMessage::JoinRej => buf.put_u8(CMD_JOINREJ),
            MembershipMessage::ViewAck { agree } => {
                buf.put_u8(CMD_VIEWACK);
                buf.put_u8(u8::from(*agree));
            }
            MembershipMessage::StartAck(sa) => {
                buf.put_u8(CMD_STARTACK);
                buf.put_u8(sa.reason.to_wire());
                buf.put_u16_le(0); // pad
                buf.put_u32_le(sa.generation);
                buf.put_u32_le(sa.node_id);
                buf.put_u32_le(sa.highest_node_id);
            }
            MembershipMessage::Transition => buf.put_u8(CMD_TRANSITION),
            MembershipMessage::NewCluster { low_ip } => {
                buf.put_u8(CMD_NEWCLUSTER);
                buf.put_u32_le(*low_ip);
            }
            MembershipMessage::ConfAck => buf.put_u8(CMD_CONFACK),
            MembershipMessage::Nominate(st) => {
                buf.put_u8(CMD_NOMINATE);
                encode_starttrans(st, buf, address_length);
            }
        }
    }

    pub fn decode<B: Buf>(buf: &mut B, address_length: usize) -> Result<Self, WireError> {
        ensure(buf, 1, "membership command")?;
        match buf.get_u8() {
            CMD_JOINCONF => Ok(MembershipMessage::JoinConf(decode_chunk(
                buf,
                address_length,
            )?)),
            CMD_JOINREQ => {
                ensure(buf, 3 + 7 * 4 + CLUSTER_NAME_LEN, "joinreq body")?;
                let votes = buf.get_u8();
                let num_addr = buf.get_u16_le() as usize;
                let expected_votes = buf.get_u32_le();
                let members = buf.get_u32_le();
                let major_version = buf.get_u32_le();
                let minor_version = buf.get_u32_le();
                let patch_version = buf.get_u32_le();
                let config_version = buf.get_u32_le();
                let addr_len = buf.get_u32_le();
                let raw_name = get_bytes(buf, CLUSTER_NAME_LEN, "cluster name")?;
                let end = raw_name
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(raw_name.len());
                let cluster_name = String::from_utf8(raw_name[..end].to_vec())
                    .map_err(|_| WireError::BadString {
                        field: "cluster name",
                    })?;
                let mut addresses = Vec::with_capacity(num_addr);
                for _ in 0..num_addr {
                    addresses.push(get_bytes(buf, addr_len as usize, "joinreq address")?);
                }
                let node_name = get_cstr(buf, "joinreq node name")?;
                Ok(MembershipMessage::JoinReq(JoinRequest {
                    votes,
                    expected_votes,
                    members,
                    major_version,
                    minor_version,
                    patch_version,
                    config_version,
                    address_length: addr_len,
                    cluster_name,
                    addresses,
                    node_name,
                }))
            }
            CMD_LEAVE => {
                ensure(buf, 1, "leave reason")?;
                Ok(MembershipMessage::Leave(LeaveReason::from_bits_truncate(
                    buf.get_u8(),
                )))
            }
            CMD_HELLO => {
                ensure(buf, 7, "hello body")?;
                let flags = HelloFlags::from_bits_truncate(buf.get_u8());
                let members = buf.get_u16_le();
                let generation = buf.get_u32_le();
                Ok(MembershipMessage::Hello(Hello {
                    flags,
                    members,
                    generation,
                }))
            }
            CMD_KILL => Ok(MembershipMessage::Kill),
            CMD_JOINACK => {
                ensure(buf, 1, "joinack kind")?;
                Ok(MembershipMessage::JoinAck(JoinAckKind::from_wire(
                    buf.get_u8(),
                )?))
            }
            CMD_ENDTRANS => {
                ensure(buf, 3 + 16, "endtrans body")?;
                let _pad1 = buf.get_u8();
                let _pad2 = buf.get_u16_le();
                Ok(MembershipMessage::EndTrans(EndTransition {
                    quorum: buf.get_u32_le(),
                    total_votes: buf.get_u32_le(),
                    generation: buf.get_u32_le(),
                    new_node_id: buf.get_u32_le(),
                }))
            }
            CMD_RECONFIG => {
                ensure(buf, 7, "reconfig body")?;
                let param = ReconfigParam::from_wire(buf.get_u8())?;
                let _pad = buf.get_u16_le();
                let value = buf.get_u32_le();
                Ok(MembershipMessage::Reconfig { param, value })
            }
            CMD_MASTERVIEW => Ok(MembershipMessage::MasterView(decode_chunk(
                buf,
                address_length,
            )?)),
            CMD_STARTTRANS => Ok(MembershipMessage::StartTrans(decode_starttrans(
                buf,
                address_length,
            )?)),
            CMD_JOINREJ => Ok(MembershipMessage::JoinRej),
            CMD_VIEWACK => {
                ensure(buf, 1, "viewack body")?;
                Ok(MembershipMessage::ViewAck {
                    agree: buf.get_u8() != 0,
                })
            }
            CMD_STARTACK => {
                ensure(buf, 3 + 12, "startack body")?;
                let reason = TransitionReason::from_wire(buf.get_u8())?;
                let _pad = buf.get_u16_le();
                Ok(MembershipMessage::StartAck(StartAck {
                    reason,
                    generation: buf.get_u32_le(),
                    node_id: buf.get_u32_le(),
                    highest_node_id: buf.get_u32_le(),
                }))
            }
            CMD_TRANSITION => Ok(MembershipMessage::Transition),
            CMD_NEWCLUSTER => {
                ensure(buf, 4, "newcluster body")?;
                Ok(MembershipMessage::NewCluster {
                    low_ip: buf.get_u32_le(),
                })
            }
            CMD_CONFACK => Ok(MembershipMessage::ConfAck),
            CMD_NOMINATE => Ok(MembershipMessage::Nominate(decode_starttrans(
                buf,
                address_length,
            )?)),
            other => Err(WireError::BadCommand(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Body codecs shared by more than one command
// ---------------------------------------------------------------------------

fn encode_chunk<B: BufMut>(chunk: &ViewChunk, buf: &mut B, address_length: usize) {
    buf.put_u8(chunk.flags);
    buf.put_u16_le(chunk.nodes.len() as u16);
    for node in &chunk.nodes {
        node.encode(buf, address_length);
    }
}

fn decode_chunk<B: Buf>(buf: &mut B, address_length: usize) -> Result<ViewChunk, WireError> {
    ensure(buf, 3, "view chunk")?;
    let flags = buf.get_u8();
    let count = buf.get_u16_le() as usize;
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        nodes.push(NodeDescriptor::decode(buf, address_length)?);
    }
    Ok(ViewChunk { flags, nodes })
}

fn encode_starttrans<B: BufMut>(st: &StartTransition, buf: &mut B, address_length: usize) {
    buf.put_u8(st.reason.to_wire());
    buf.put_u8(st.flags);
    buf.put_u8(st.votes);
    buf.put_u32_le(st.expected_votes);
    buf.put_u32_le(st.generation);
    buf.put_i32_le(st.node_id);
    match &st.joining {
        Some((addresses, name)) => {
            buf.put_u16_le(addresses.len() as u16);
            for addr in addresses {
                if addr.len() >= address_length {
                    buf.put_slice(&addr[..address_length]);
                } else {
                    buf.put_slice(addr);
                    buf.put_bytes(0, address_length - addr.len());
                }
            }
            put_cstr(buf, name);
        }
        None => buf.put_u16_le(0),
    }
}

fn decode_starttrans<B: Buf>(
    buf: &mut B,
    address_length: usize,
) -> Result<StartTransition, WireError> {
    ensure(buf, 3 + 12 + 2, "starttrans body")?;
    let reason = TransitionReason::from_wire(buf.get_u8())?;
    let flags = buf.get_u8();
    let votes = buf.get_u8();
    let expected_votes = buf.get_u32_le();
    let generation = buf.get_u32_le();
    let node_id = buf.get_i32_le();
    let num_addrs = buf.get_u16_le() as usize;
    let joining = if num_addrs > 0 {
        let mut addresses = Vec::with_capacity(num_addrs);
        for _ in 0..num_addrs {
            addresses.push(get_bytes(buf, address_length, "starttrans address")?);
        }
        let name = get_cstr(buf, "starttrans node name")?;
        Some((addresses, name))
    } else {
        None
    };
    Ok(StartTransition {
        reason,
        flags,
        votes,
        expected_votes,
        generation,
        node_id,
        joining,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
