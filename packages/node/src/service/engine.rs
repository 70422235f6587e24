//! The service-group engine.
//!
//! Synchronous protocol core: every input (SG message, start_done, barrier
//! resolution, membership change) returns the [`SgEffect`]s the daemon must
//! carry out. One engine lock serialises all of it, matching the
//! single-threaded service daemon the protocol assumes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use conclave_core::messages::service::SgMessage;
use conclave_core::types::{SgMsgStatus, SgMsgType};

use crate::error::ClusterError;
use crate::membership::node_table::NodeStore;

use super::group::{
    event_barrier_name, recovery_barrier_name, Group, RecoverState, SeState, Sevent, SgState,
    StartReason, UeState, Uevent, ServiceOps,
};

/// Seconds to wait before retrying a WAITed or cancelled join/leave.
pub const RETRY_DELAY_SECS: u64 = 2;

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// Destination of an outbound SG message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SgTarget {
    Nodes(Vec<i32>),
    Multicast,
}

/// An effect for the service daemon to execute, in order.
pub enum SgEffect {
    Send {
        target: SgTarget,
        msg: SgMessage,
    },
    /// Run `ops.stop` for the group.
    Stop { local_id: u32 },
    /// Run `ops.start`; the service answers with `start_done`.
    Start {
        local_id: u32,
        event_id: u32,
        members: Vec<u32>,
        reason: StartReason,
    },
    /// Run `ops.finish`.
    Finish { local_id: u32, event_id: u32 },
    /// Create the barrier record (without arming) so early WAITs land.
    RegisterBarrier { name: String, expected: u32 },
    /// Arm the barrier; resolution comes back via `barrier_done`.
    EnterBarrier { name: String, expected: u32 },
    CancelBarrier { name: String },
    /// Re-kick the group's sevent after `RETRY_DELAY_SECS`.
    RetryLater { local_id: u32 },
}

impl std::fmt::Debug for SgEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SgEffect::Send { target, msg } => f
                .debug_struct("Send")
                .field("target", target)
                .field("type", &msg.ty)
                .finish(),
            SgEffect::Stop { local_id } => f.debug_struct("Stop").field("sg", local_id).finish(),
            SgEffect::Start {
                local_id, members, ..
            } => f
                .debug_struct("Start")
                .field("sg", local_id)
                .field("members", members)
                .finish(),
            SgEffect::Finish { local_id, .. } => {
                f.debug_struct("Finish").field("sg", local_id).finish()
            }
            SgEffect::RegisterBarrier { name, .. } => {
                f.debug_struct("RegisterBarrier").field("name", name).finish()
            }
            SgEffect::EnterBarrier { name, .. } => {
                f.debug_struct("EnterBarrier").field("name", name).finish()
            }
            SgEffect::CancelBarrier { name } => {
                f.debug_struct("CancelBarrier").field("name", name).finish()
            }
            SgEffect::RetryLater { local_id } => {
                f.debug_struct("RetryLater").field("sg", local_id).finish()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Recovery {
    id: u32,
    /// Affected groups, by level (index = level).
    levels: [Vec<u32>; 4],
    level: usize,
}

struct Inner {
    store: Arc<NodeStore>,
    groups: HashMap<u32, Group>,
    by_global: HashMap<u32, u32>,
    by_name: HashMap<String, u32>,
    next_local: u32,
    next_event: u16,
    /// Highest global SG counter observed cluster-wide.
    global_lastid: u32,
    recovery: Option<Recovery>,
    next_recovery: u32,
    quorate: bool,
}

/// The service-group engine.
pub struct ServiceEngine {
    inner: Mutex<Inner>,
}

impl ServiceEngine {
    #[must_use]
    pub fn new(store: Arc<NodeStore>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                store,
                groups: HashMap::new(),
                by_global: HashMap::new(),
                by_name: HashMap::new(),
                next_local: 1,
                next_event: 1,
                global_lastid: 0,
                recovery: None,
                next_recovery: 1,
                quorate: false,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Registers a service group and returns its local id. With `unique`,
    /// a second registration of the same name fails; otherwise it shares
    /// the existing group and bumps its refcount.
    pub fn register(
        &self,
        name: &str,
        level: u8,
        unique: bool,
        ops: Arc<dyn ServiceOps>,
    ) -> Result<u32, ClusterError> {
        let mut inner = self.inner.lock();
        if let Some(&local_id) = inner.by_name.get(name) {
            if unique {
                return Err(ClusterError::GroupExists(name.to_string()));
            }
            let group = inner.groups.get_mut(&local_id).expect("indexed group");
            group.refcount += 1;
            return Ok(local_id);
        }
        let local_id = inner.next_local;
        inner.next_local += 1;
        inner.by_name.insert(name.to_string(), local_id);
        inner.groups.insert(
            local_id,
            Group {
                local_id,
                global_id: 0,
                name: name.to_string(),
                level: level.min(3),
                state: SgState::None,
                refcount: 1,
                members: Vec::new(),
                joining: Vec::new(),
                ops,
                sevent: None,
                uevent: None,
                need_recovery: false,
                recover_state: RecoverState::None,
            },
        );
        Ok(local_id)
    }

    /// Drops one registration; the last drop frees the group.
    pub fn unregister(&self, local_id: u32) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock();
        let group = inner
            .groups
            .get_mut(&local_id)
            .ok_or(ClusterError::NoSuchGroup(local_id))?;
        group.refcount -= 1;
        if group.refcount > 0 {
            return Ok(());
        }
        if let Some(mut sevent) = group.sevent.take() {
            if let Some(waiter) = sevent.waiter.take() {
                let _ = waiter.send(Err(ClusterError::Interrupted));
            }
        }
        let name = group.name.clone();
        let global_id = group.global_id;
        inner.groups.remove(&local_id);
        inner.by_name.remove(&name);
        inner.by_global.remove(&global_id);
        Ok(())
    }

    /// The current member list of a group.
    pub fn members_of(&self, local_id: u32) -> Result<Vec<u32>, ClusterError> {
        let inner = self.inner.lock();
        inner
            .groups
            .get(&local_id)
            .map(Group::member_ids)
            .ok_or(ClusterError::NoSuchGroup(local_id))
    }

    /// The cluster-wide id of a group (0 until first joined).
    pub fn global_id_of(&self, local_id: u32) -> Result<u32, ClusterError> {
        let inner = self.inner.lock();
        inner
            .groups
            .get(&local_id)
            .map(|g| g.global_id)
            .ok_or(ClusterError::NoSuchGroup(local_id))
    }

    /// Resolves the ops handle for executing Start/Stop/Finish effects.
    pub fn ops_of(&self, local_id: u32) -> Option<Arc<dyn ServiceOps>> {
        self.inner.lock().groups.get(&local_id).map(|g| Arc::clone(&g.ops))
    }

    // -----------------------------------------------------------------------
    // Join / leave entry points
    // -----------------------------------------------------------------------

    /// Starts a join; the returned receiver resolves when the sevent
    /// completes. Processing is held until the cluster is quorate.
    pub fn begin_join(
        &self,
        local_id: u32,
    ) -> Result<(oneshot::Receiver<Result<(), ClusterError>>, Vec<SgEffect>), ClusterError> {
        self.begin(local_id, false)
    }

    /// Starts a leave; resolves when the group has let go of us.
    pub fn begin_leave(
        &self,
        local_id: u32,
    ) -> Result<(oneshot::Receiver<Result<(), ClusterError>>, Vec<SgEffect>), ClusterError> {
        self.begin(local_id, true)
    }

    fn begin(
        &self,
        local_id: u32,
        leaving: bool,
    ) -> Result<(oneshot::Receiver<Result<(), ClusterError>>, Vec<SgEffect>), ClusterError> {
        let mut inner = self.inner.lock();
        let event_id = inner.next_event;
        inner.next_event = inner.next_event.wrapping_add(1).max(1);
        let quorate = inner.quorate;
        let group = inner
            .groups
            .get_mut(&local_id)
            .ok_or(ClusterError::NoSuchGroup(local_id))?;
        if group.sevent.is_some() || group.uevent.is_some() {
            return Err(ClusterError::WouldBlock);
        }
        let (tx, rx) = oneshot::channel();
        group.sevent = Some(Sevent {
            id: event_id,
            leaving,
            state: if leaving {
                SeState::LeaveBegin
            } else {
                SeState::JoinBegin
            },
            waiting_from: HashSet::new(),
            memb: Vec::new(),
            delayed: false,
            barrier_name: String::new(),
            waiter: Some(tx),
        });
        if !leaving {
            group.state = SgState::Join;
        }
        let effects = if quorate {
            Self::kick_sevent(&mut inner, local_id)
        } else {
            Vec::new()
        };
        Ok((rx, effects))
    }

    /// Quorum gate: kicks every parked sevent when the cluster becomes
    /// quorate.
    pub fn set_quorate(&self, quorate: bool) -> Vec<SgEffect> {
        let mut inner = self.inner.lock();
        inner.quorate = quorate;
        if !quorate {
            return Vec::new();
        }
        let pending: Vec<u32> = inner
            .groups
            .values()
            .filter(|g| {
                g.sevent
                    .as_ref()
                    .is_some_and(|se| matches!(se.state, SeState::JoinBegin | SeState::LeaveBegin))
            })
            .map(|g| g.local_id)
            .collect();
        let mut effects = Vec::new();
        for local_id in pending {
            effects.extend(Self::kick_sevent(&mut inner, local_id));
        }
        effects
    }

    /// Re-kicks a delayed sevent (the daemon calls this after
    /// `RETRY_DELAY_SECS`).
    pub fn restart_sevent(&self, local_id: u32) -> Vec<SgEffect> {
        let mut inner = self.inner.lock();
        let Some(group) = inner.groups.get_mut(&local_id) else {
            return Vec::new();
        };
        let Some(sevent) = group.sevent.as_mut() else {
            return Vec::new();
        };
        sevent.state = if sevent.leaving {
            SeState::LeaveBegin
        } else {
            SeState::JoinBegin
        };
        sevent.waiting_from.clear();
        sevent.memb.clear();
        sevent.delayed = false;
        if inner.quorate {
            Self::kick_sevent(&mut inner, local_id)
        } else {
            Vec::new()
        }
    }

    fn kick_sevent(inner: &mut Inner, local_id: u32) -> Vec<SgEffect> {
        let our_id = inner.store.our_id();
        let cluster_members: Vec<i32> = inner
            .store
            .members()
            .iter()
            .map(|n| n.node_id)
            .filter(|&id| id != our_id)
            .collect();
        let global_lastid = inner.global_lastid;
        let Some(group) = inner.groups.get_mut(&local_id) else {
            return Vec::new();
        };
        let level = group.level;
        let gid = group.global_id;
        let name = group.name.clone();
        let member_peers: Vec<i32> = group
            .members
            .iter()
            .map(|&id| id as i32)
            .filter(|&id| id != our_id)
            .collect();
        if group.sevent.is_none() {
            return Vec::new();
        }

        let leaving = group.sevent.as_ref().expect("checked above").leaving;
        if leaving {
            // LEAVE polls the SG members, not the whole cluster.
            if member_peers.is_empty() {
                // Sole member: nothing to negotiate.
                let mut sevent = group.sevent.take().expect("checked above");
                group.members.clear();
                group.state = SgState::None;
                if let Some(waiter) = sevent.waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
                return vec![SgEffect::Stop { local_id }];
            }
            let sevent = group.sevent.as_mut().expect("checked above");
            sevent.state = SeState::LeaveAckWait;
            sevent.waiting_from = member_peers.iter().copied().collect();
            let msg = SgMessage {
                sevent_id: sevent.id,
                global_sgid: gid,
                sglevel: u16::from(level),
                ..SgMessage::new(SgMsgType::LeaveReq)
            };
            return vec![SgEffect::Send {
                target: SgTarget::Nodes(member_peers),
                msg,
            }];
        }

        if cluster_members.is_empty() {
            return Self::become_first_member(inner, local_id);
        }
        let sevent = group.sevent.as_mut().expect("checked above");
        sevent.state = SeState::JoinAckWait;
        sevent.waiting_from = cluster_members.into_iter().collect();
        let msg = SgMessage {
            sevent_id: sevent.id,
            global_lastid,
            sglevel: u16::from(level),
            payload: name.into_bytes(),
            ..SgMessage::new(SgMsgType::JoinReq)
        };
        vec![SgEffect::Send {
            target: SgTarget::Multicast,
            msg,
        }]
    }

    /// Nobody else has this SG: mint its global id and run alone.
    fn become_first_member(inner: &mut Inner, local_id: u32) -> Vec<SgEffect> {
        let our_id = inner.store.our_id().max(0) as u32;
        inner.global_lastid += 1;
        let counter = inner.global_lastid;
        let Some(group) = inner.groups.get_mut(&local_id) else {
            return Vec::new();
        };
        group.global_id = (u32::from(group.level) << 24) | (counter & 0x00FF_FFFF);
        group.members = vec![our_id];
        let global_id = group.global_id;
        let sevent = group.sevent.as_mut().expect("sevent drives this");
        sevent.state = SeState::JstartServiceWait;
        sevent.barrier_name = event_barrier_name(global_id, our_id, sevent.id, 1);
        let event_id = u32::from(sevent.id);
        let barrier = sevent.barrier_name.clone();
        inner.by_global.insert(global_id, local_id);
        info!(sg = local_id, global_id, "formed new service group");
        vec![
            SgEffect::RegisterBarrier {
                name: barrier,
                expected: 1,
            },
            SgEffect::Start {
                local_id,
                event_id,
                members: vec![our_id],
                reason: StartReason::Join,
            },
        ]
    }

    // -----------------------------------------------------------------------
    // Message handling
    // -----------------------------------------------------------------------

    pub fn handle_message(&self, src: i32, msg: &SgMessage) -> Vec<SgEffect> {
        let mut inner = self.inner.lock();
        // Track the global counter from every message.
        if msg.global_lastid > inner.global_lastid {
            inner.global_lastid = msg.global_lastid;
        }
        match msg.ty {
            SgMsgType::JoinReq => Self::on_join_req(&mut inner, src, msg),
            SgMsgType::JoinRep => Self::on_join_rep(&mut inner, src, msg),
            SgMsgType::JstopReq => Self::on_stop_req(&mut inner, src, msg, false),
            SgMsgType::JstopRep => Self::on_stop_rep(&mut inner, src, msg, false),
            SgMsgType::JstartCmd => Self::on_start_cmd(&mut inner, src, msg, false),
            SgMsgType::LeaveReq => Self::on_leave_req(&mut inner, src, msg),
            SgMsgType::LeaveRep => Self::on_leave_rep(&mut inner, src, msg),
            SgMsgType::LstopReq => Self::on_stop_req(&mut inner, src, msg, true),
            SgMsgType::LstopRep => Self::on_stop_rep(&mut inner, src, msg, true),
            SgMsgType::LstartCmd => Self::on_start_cmd(&mut inner, src, msg, true),
            SgMsgType::LstartDone => Self::on_lstart_done(&mut inner, src, msg),
            SgMsgType::Recover => Self::on_recover_msg(&mut inner, msg),
        }
    }

    fn reply(src: i32, ty: SgMsgType, status: SgMsgStatus, req: &SgMessage, gid: u32, lastid: u32) -> SgEffect {
        SgEffect::Send {
            target: SgTarget::Nodes(vec![src]),
            msg: SgMessage {
                ty,
                status: Some(status),
                sevent_id: req.sevent_id,
                global_sgid: gid,
                global_lastid: lastid,
                sglevel: req.sglevel,
                payload: Vec::new(),
            },
        }
    }

    fn on_join_req(inner: &mut Inner, src: i32, msg: &SgMessage) -> Vec<SgEffect> {
        let our_id = inner.store.our_id();
        let lastid = inner.global_lastid;
        let name = String::from_utf8_lossy(&msg.payload).into_owned();
        let Some(&local_id) = inner.by_name.get(name.as_str()) else {
            // Unknown SG here: "fine by me".
            return vec![Self::reply(src, SgMsgType::JoinRep, SgMsgStatus::Neg, msg, 0, lastid)];
        };
        let group = inner.groups.get_mut(&local_id).expect("indexed group");
        let gid = group.global_id;
        let joiner = src.max(0) as u32;

        // The joiner retries until recovery is over.
        if group.state == SgState::Recover || group.need_recovery {
            return vec![Self::reply(src, SgMsgType::JoinRep, SgMsgStatus::Wait, msg, gid, lastid)];
        }

        // A node that got as far as a uevent with us and then backed out
        // retries from the beginning; don't turn it away. Anyone else waits
        // for the uevent in flight.
        if let Some(uevent) = group.uevent.as_ref() {
            if uevent.node_id != src {
                return vec![Self::reply(src, SgMsgType::JoinRep, SgMsgStatus::Wait, msg, gid, lastid)];
            }
            if !group.joining.contains(&joiner) {
                group.joining.push(joiner);
            }
            return vec![Self::reply(src, SgMsgType::JoinRep, SgMsgStatus::Pos, msg, gid, lastid)];
        }

        if group.sevent.is_some() {
            let (ours_leaving, ours_state) = {
                let sevent = group.sevent.as_ref().expect("checked above");
                (sevent.leaving, sevent.state)
            };
            if ours_leaving {
                // We're leaving. Past our checkpoint the join waits for the
                // leave to finish; before it, the leave unconditionally
                // defers: cancel it and admit the joiner (we're still a
                // member, so the answer is positive).
                let before_checkpoint = matches!(
                    ours_state,
                    SeState::LeaveBegin | SeState::LeaveAckWait | SeState::LeaveAcked
                );
                if !before_checkpoint {
                    return vec![Self::reply(src, SgMsgType::JoinRep, SgMsgStatus::Wait, msg, gid, lastid)];
                }
                warn!(sg = local_id, "cancelling our leave for a remote join");
                let sevent = group.sevent.as_mut().expect("checked above");
                sevent.state = SeState::LeaveBegin;
                sevent.waiting_from.clear();
                sevent.memb.clear();
                if !group.joining.contains(&joiner) {
                    group.joining.push(joiner);
                }
                return vec![
                    SgEffect::RetryLater { local_id },
                    Self::reply(src, SgMsgType::JoinRep, SgMsgStatus::Pos, msg, gid, lastid),
                ];
            }
            // Join against join: past our checkpoint the other side waits,
            // as it does when we hold the lower node id. Otherwise we back
            // off and let it go first (negative: we're not in the SG).
            let before_checkpoint = matches!(
                ours_state,
                SeState::JoinBegin | SeState::JoinAckWait | SeState::JoinAcked
            );
            if !before_checkpoint || our_id < src {
                return vec![Self::reply(src, SgMsgType::JoinRep, SgMsgStatus::Wait, msg, gid, lastid)];
            }
            warn!(sg = local_id, "cancelling our join for a remote join");
            let sevent = group.sevent.as_mut().expect("checked above");
            sevent.state = SeState::JoinBegin;
            sevent.waiting_from.clear();
            sevent.memb.clear();
            return vec![
                SgEffect::RetryLater { local_id },
                Self::reply(src, SgMsgType::JoinRep, SgMsgStatus::Neg, msg, gid, lastid),
            ];
        }

        if group.state == SgState::Run {
            if !group.joining.contains(&joiner) {
                group.joining.push(joiner);
            }
            return vec![Self::reply(src, SgMsgType::JoinRep, SgMsgStatus::Pos, msg, gid, lastid)];
        }
        // Registered but not a member: "fine by me".
        vec![Self::reply(src, SgMsgType::JoinRep, SgMsgStatus::Neg, msg, 0, lastid)]
    }

    fn on_join_rep(inner: &mut Inner, src: i32, msg: &SgMessage) -> Vec<SgEffect> {
        let our_id = inner.store.our_id();
        let Some(local_id) = Self::sevent_group(inner, msg.sevent_id, SeState::JoinAckWait) else {
            return Vec::new();
        };
        if msg.global_sgid != 0 {
            inner.by_global.insert(msg.global_sgid, local_id);
        }
        let group = inner.groups.get_mut(&local_id).expect("indexed group");
        if msg.status == Some(SgMsgStatus::Pos) && msg.global_sgid != 0 {
            group.global_id = msg.global_sgid;
        }
        let gid = group.global_id;
        let level = group.level;
        let sevent = group.sevent.as_mut().expect("matched above");
        if !sevent.waiting_from.remove(&src) {
            return Vec::new();
        }
        match msg.status {
            Some(SgMsgStatus::Pos) => sevent.memb.push(src.max(0) as u32),
            Some(SgMsgStatus::Wait) => sevent.delayed = true,
            _ => {}
        }
        if !sevent.waiting_from.is_empty() {
            return Vec::new();
        }

        if sevent.delayed {
            sevent.state = SeState::JoinBegin;
            sevent.memb.clear();
            sevent.delayed = false;
            return vec![SgEffect::RetryLater { local_id }];
        }
        if sevent.memb.is_empty() {
            return Self::become_first_member(inner, local_id);
        }

        // Existing members found: quiesce them.
        sevent.state = SeState::JstopAckWait;
        let peers: Vec<i32> = sevent.memb.iter().map(|&id| id as i32).collect();
        sevent.waiting_from = peers.iter().copied().collect();
        let count = sevent.memb.len() as u32 + 1;
        let msg_out = SgMessage {
            sevent_id: sevent.id,
            global_sgid: gid,
            sglevel: u16::from(level),
            payload: count.to_le_bytes().to_vec(),
            ..SgMessage::new(SgMsgType::JstopReq)
        };
        debug!(sg = local_id, ?peers, our = our_id, "join acked, stopping members");
        vec![SgEffect::Send {
            target: SgTarget::Nodes(peers),
            msg: msg_out,
        }]
    }

    /// JSTOP_REQ / LSTOP_REQ: quiesce for a remote join or leave.
    fn on_stop_req(inner: &mut Inner, src: i32, msg: &SgMessage, leaving: bool) -> Vec<SgEffect> {
        let our_id = inner.store.our_id();
        let lastid = inner.global_lastid;
        let rep_ty = if leaving {
            SgMsgType::LstopRep
        } else {
            SgMsgType::JstopRep
        };
        let Some(&local_id) = inner.by_global.get(&msg.global_sgid) else {
            return vec![Self::reply(src, rep_ty, SgMsgStatus::Neg, msg, 0, lastid)];
        };
        let group = inner.groups.get_mut(&local_id).expect("indexed group");
        let gid = group.global_id;

        if let Some(sevent) = group.sevent.as_mut() {
            // Sevent/uevent mutual exclusion: before the ACKWAIT checkpoint
            // our own attempt yields; at the checkpoint the lower node id
            // proceeds; beyond it the remote must wait.
            let ours_yields = match sevent.state {
                SeState::JoinBegin | SeState::LeaveBegin => true,
                SeState::JoinAckWait | SeState::LeaveAckWait => our_id > src,
                _ => false,
            };
            if !ours_yields {
                return vec![Self::reply(src, rep_ty, SgMsgStatus::Wait, msg, gid, lastid)];
            }
            sevent.state = if sevent.leaving {
                SeState::LeaveBegin
            } else {
                SeState::JoinBegin
            };
            sevent.waiting_from.clear();
            sevent.memb.clear();
            warn!(sg = local_id, "cancelling our own event for a remote one");
        }
        if group.uevent.is_some() || group.need_recovery {
            return vec![Self::reply(src, rep_ty, SgMsgStatus::Wait, msg, gid, lastid)];
        }

        let count = if msg.payload.len() >= 4 {
            u32::from_le_bytes([msg.payload[0], msg.payload[1], msg.payload[2], msg.payload[3]])
        } else {
            group.members.len() as u32
        };
        let barrier_name =
            event_barrier_name(group.global_id, src.max(0) as u32, msg.sevent_id, count);
        group.uevent = Some(Uevent {
            state: if leaving {
                UeState::LstartWaitCmd
            } else {
                UeState::JstartWaitCmd
            },
            remote_seid: msg.sevent_id,
            node_id: src,
            leaving,
            barrier_name: barrier_name.clone(),
        });
        group.state = SgState::Uevent;
        if !leaving && !group.joining.contains(&(src.max(0) as u32)) {
            group.joining.push(src.max(0) as u32);
        }
        let mut effects = vec![
            SgEffect::Stop { local_id },
            SgEffect::RegisterBarrier {
                name: barrier_name,
                expected: count,
            },
        ];
        let retry = if let Some(se) = group.sevent.as_ref() {
            se.delayed || se.state == SeState::JoinBegin || se.state == SeState::LeaveBegin
        } else {
            false
        };
        effects.push(Self::reply(src, rep_ty, SgMsgStatus::Pos, msg, group.global_id, lastid));
        if retry {
            effects.push(SgEffect::RetryLater { local_id });
        }
        effects
    }

    fn on_stop_rep(inner: &mut Inner, src: i32, msg: &SgMessage, leaving: bool) -> Vec<SgEffect> {
        let our_id = inner.store.our_id().max(0) as u32;
        let want = if leaving {
            SeState::LstopAckWait
        } else {
            SeState::JstopAckWait
        };
        let Some(local_id) = Self::sevent_group(inner, msg.sevent_id, want) else {
            return Vec::new();
        };
        let group = inner.groups.get_mut(&local_id).expect("indexed group");
        let gid = group.global_id;
        let level = group.level;
        let member_peers: Vec<i32> = group
            .members
            .iter()
            .map(|&id| id as i32)
            .filter(|&id| id != our_id as i32)
            .collect();
        let sevent = group.sevent.as_mut().expect("matched above");
        if !sevent.waiting_from.remove(&src) {
            return Vec::new();
        }
        if msg.status != Some(SgMsgStatus::Pos) {
            sevent.delayed = true;
        }
        if !sevent.waiting_from.is_empty() {
            return Vec::new();
        }
        if sevent.delayed {
            sevent.state = if leaving {
                SeState::LeaveBegin
            } else {
                SeState::JoinBegin
            };
            sevent.memb.clear();
            sevent.delayed = false;
            return vec![SgEffect::RetryLater { local_id }];
        }

        if leaving {
            // Everyone has stopped; tell the remaining members to restart
            // without us, stop our own instance, and wait for the first
            // completion signal.
            sevent.state = SeState::LstartWaitRemote;
            let msg_out = SgMessage {
                sevent_id: sevent.id,
                global_sgid: gid,
                sglevel: u16::from(level),
                ..SgMessage::new(SgMsgType::LstartCmd)
            };
            return vec![
                SgEffect::Stop { local_id },
                SgEffect::Send {
                    target: SgTarget::Nodes(member_peers),
                    msg: msg_out,
                },
            ];
        }

        // Join: everyone is stopped; command the restart with us included.
        let mut members = sevent.memb.clone();
        members.push(our_id);
        members.sort_unstable();
        let count = members.len() as u32;
        sevent.state = SeState::JstartServiceWait;
        sevent.barrier_name = event_barrier_name(gid, our_id, sevent.id, count);
        let barrier = sevent.barrier_name.clone();
        let event_id = u32::from(sevent.id);
        let peers: Vec<i32> = sevent.memb.iter().map(|&id| id as i32).collect();
        group.members = members.clone();
        group.joining.clear();
        let msg_out = SgMessage {
            sevent_id: msg.sevent_id,
            global_sgid: gid,
            sglevel: u16::from(level),
            payload: SgMessage::encode_node_ids(&members),
            ..SgMessage::new(SgMsgType::JstartCmd)
        };
        vec![
            SgEffect::RegisterBarrier {
                name: barrier,
                expected: count,
            },
            SgEffect::Send {
                target: SgTarget::Nodes(peers),
                msg: msg_out,
            },
            SgEffect::Start {
                local_id,
                event_id,
                members,
                reason: StartReason::Join,
            },
        ]
    }

    /// JSTART_CMD / LSTART_CMD: apply the membership change and restart.
    fn on_start_cmd(inner: &mut Inner, src: i32, msg: &SgMessage, leaving: bool) -> Vec<SgEffect> {
        let Some(&local_id) = inner.by_global.get(&msg.global_sgid) else {
            return Vec::new();
        };
        let group = inner.groups.get_mut(&local_id).expect("indexed group");
        let Some(uevent) = group.uevent.as_mut() else {
            return Vec::new();
        };
        if uevent.remote_seid != msg.sevent_id || uevent.node_id != src {
            return Vec::new();
        }
        let changed = src.max(0) as u32;
        if leaving {
            if uevent.state != UeState::LstartWaitCmd {
                return Vec::new();
            }
            uevent.state = UeState::LstartServiceWait;
            group.members.retain(|&id| id != changed);
        } else {
            if uevent.state != UeState::JstartWaitCmd {
                return Vec::new();
            }
            uevent.state = UeState::JstartServiceWait;
            if let Ok(ids) = SgMessage::decode_node_ids(&msg.payload) {
                if !ids.is_empty() {
                    group.members = ids;
                }
            }
            if !group.members.contains(&changed) {
                group.members.push(changed);
            }
            group.joining.retain(|&id| id != changed);
        }
        let mut members = group.member_ids();
        members.sort_unstable();
        vec![SgEffect::Start {
            local_id,
            event_id: u32::from(msg.sevent_id),
            members,
            reason: if leaving {
                StartReason::Leave
            } else {
                StartReason::Join
            },
        }]
    }

    fn on_leave_req(inner: &mut Inner, src: i32, msg: &SgMessage) -> Vec<SgEffect> {
        let our_id = inner.store.our_id();
        let lastid = inner.global_lastid;
        let Some(&local_id) = inner.by_global.get(&msg.global_sgid) else {
            return vec![Self::reply(src, SgMsgType::LeaveRep, SgMsgStatus::Neg, msg, 0, lastid)];
        };
        let group = inner.groups.get_mut(&local_id).expect("indexed group");
        let gid = group.global_id;

        // Only a current member can leave.
        if !group.members.contains(&(src.max(0) as u32)) {
            return vec![Self::reply(src, SgMsgType::LeaveRep, SgMsgStatus::Neg, msg, gid, lastid)];
        }
        if group.state == SgState::Recover || group.need_recovery {
            return vec![Self::reply(src, SgMsgType::LeaveRep, SgMsgStatus::Wait, msg, gid, lastid)];
        }

        if group.sevent.is_some() {
            let (ours_leaving, ours_state) = {
                let sevent = group.sevent.as_ref().expect("checked above");
                (sevent.leaving, sevent.state)
            };
            if ours_leaving {
                // Leave against leave: past our checkpoint the other side
                // waits, as it does when we hold the lower node id.
                // Otherwise we cancel and let it leave first.
                let before_checkpoint =
                    matches!(ours_state, SeState::LeaveBegin | SeState::LeaveAckWait);
                if !before_checkpoint || our_id < src {
                    return vec![Self::reply(src, SgMsgType::LeaveRep, SgMsgStatus::Wait, msg, gid, lastid)];
                }
                warn!(sg = local_id, "cancelling our leave for a remote leave");
                let sevent = group.sevent.as_mut().expect("checked above");
                sevent.state = SeState::LeaveBegin;
                sevent.waiting_from.clear();
                sevent.memb.clear();
                return vec![
                    SgEffect::RetryLater { local_id },
                    Self::reply(src, SgMsgType::LeaveRep, SgMsgStatus::Pos, msg, gid, lastid),
                ];
            }
            // We're joining. Past our checkpoint the leaver waits; before
            // it, our join unconditionally defers to the leave (negative:
            // we're not in the SG yet).
            let before_checkpoint =
                matches!(ours_state, SeState::JoinBegin | SeState::JoinAckWait);
            if !before_checkpoint {
                return vec![Self::reply(src, SgMsgType::LeaveRep, SgMsgStatus::Wait, msg, gid, lastid)];
            }
            warn!(sg = local_id, "cancelling our join for a remote leave");
            let sevent = group.sevent.as_mut().expect("checked above");
            sevent.state = SeState::JoinBegin;
            sevent.waiting_from.clear();
            sevent.memb.clear();
            return vec![
                SgEffect::RetryLater { local_id },
                Self::reply(src, SgMsgType::LeaveRep, SgMsgStatus::Neg, msg, gid, lastid),
            ];
        }

        if let Some(uevent) = group.uevent.as_ref() {
            // A leaver that backed out of its own uevent may retry; anyone
            // else waits for the event in flight.
            if uevent.node_id != src {
                return vec![Self::reply(src, SgMsgType::LeaveRep, SgMsgStatus::Wait, msg, gid, lastid)];
            }
        }
        vec![Self::reply(src, SgMsgType::LeaveRep, SgMsgStatus::Pos, msg, gid, lastid)]
    }

    fn on_leave_rep(inner: &mut Inner, src: i32, msg: &SgMessage) -> Vec<SgEffect> {
        let Some(local_id) = Self::sevent_group(inner, msg.sevent_id, SeState::LeaveAckWait) else {
            return Vec::new();
        };
        let group = inner.groups.get_mut(&local_id).expect("indexed group");
        let sevent = group.sevent.as_mut().expect("matched above");
        if !sevent.waiting_from.remove(&src) {
            return Vec::new();
        }
        if msg.status != Some(SgMsgStatus::Pos) {
            sevent.delayed = true;
        }
        if !sevent.waiting_from.is_empty() {
            return Vec::new();
        }
        if sevent.delayed {
            sevent.state = SeState::LeaveBegin;
            sevent.delayed = false;
            return vec![SgEffect::RetryLater { local_id }];
        }
        // All remaining members agreed; quiesce them.
        let our_id = inner.store.our_id();
        let group = inner.groups.get_mut(&local_id).expect("indexed group");
        let gid = group.global_id;
        let level = group.level;
        let peers: Vec<i32> = group
            .members
            .iter()
            .map(|&id| id as i32)
            .filter(|&id| id != our_id)
            .collect();
        let sevent = group.sevent.as_mut().expect("matched above");
        sevent.state = SeState::LstopAckWait;
        sevent.waiting_from = peers.iter().copied().collect();
        let remaining = peers.len() as u32;
        let msg_out = SgMessage {
            sevent_id: sevent.id,
            global_sgid: gid,
            sglevel: u16::from(level),
            payload: remaining.to_le_bytes().to_vec(),
            ..SgMessage::new(SgMsgType::LstopReq)
        };
        vec![SgEffect::Send {
            target: SgTarget::Nodes(peers),
            msg: msg_out,
        }]
    }

    fn on_lstart_done(inner: &mut Inner, _src: i32, msg: &SgMessage) -> Vec<SgEffect> {
        let Some(local_id) = Self::sevent_group(inner, msg.sevent_id, SeState::LstartWaitRemote)
        else {
            return Vec::new();
        };
        let group = inner.groups.get_mut(&local_id).expect("indexed group");
        let mut sevent = group.sevent.take().expect("matched above");
        group.members.clear();
        group.state = SgState::None;
        info!(sg = local_id, "left service group");
        if let Some(waiter) = sevent.waiter.take() {
            let _ = waiter.send(Ok(()));
        }
        Vec::new()
    }

    /// A peer is recovering an SG we also hold: fold ourselves in.
    fn on_recover_msg(inner: &mut Inner, msg: &SgMessage) -> Vec<SgEffect> {
        let Some(&local_id) = inner.by_global.get(&msg.global_sgid) else {
            return Vec::new();
        };
        let group = inner.groups.get(&local_id).expect("indexed group");
        if group.need_recovery {
            return Vec::new();
        }
        debug!(sg = local_id, "peer-announced recovery, joining it");
        Self::start_recovery(inner, vec![local_id], true)
    }

    /// Finds the group whose sevent has `id` in state `state`.
    fn sevent_group(inner: &Inner, id: u16, state: SeState) -> Option<u32> {
        inner
            .groups
            .values()
            .find(|g| {
                g.sevent
                    .as_ref()
                    .is_some_and(|se| se.id == id && se.state == state)
            })
            .map(|g| g.local_id)
    }

    // -----------------------------------------------------------------------
    // start_done and barriers
    // -----------------------------------------------------------------------

    /// The service finished a requested start.
    pub fn start_done(&self, local_id: u32) -> Vec<SgEffect> {
        let mut inner = self.inner.lock();
        let Some(group) = inner.groups.get_mut(&local_id) else {
            return Vec::new();
        };

        // Recovery takes precedence: the ladder owns the group.
        if group.state == SgState::Recover {
            if group.recover_state == RecoverState::Start {
                group.recover_state = RecoverState::StartDone;
                let name = recovery_barrier_name(group.global_id, 1, group.members.len() as u32);
                let expected = group.members.len() as u32;
                group.recover_state = RecoverState::BarrierWait;
                return vec![SgEffect::EnterBarrier { name, expected }];
            }
            return Vec::new();
        }

        let member_count = group.members.len().max(1) as u32;
        if let Some(sevent) = group.sevent.as_mut() {
            if sevent.state == SeState::JstartServiceWait {
                sevent.state = SeState::BarrierWait;
                return vec![SgEffect::EnterBarrier {
                    name: sevent.barrier_name.clone(),
                    expected: member_count,
                }];
            }
        }
        if let Some(uevent) = group.uevent.as_mut() {
            match uevent.state {
                UeState::JstartServiceWait => {
                    uevent.state = UeState::BarrierWait;
                    return vec![SgEffect::EnterBarrier {
                        name: uevent.barrier_name.clone(),
                        expected: member_count,
                    }];
                }
                UeState::LstartServiceWait => {
                    uevent.state = UeState::LbarrierWait;
                    return vec![SgEffect::EnterBarrier {
                        name: uevent.barrier_name.clone(),
                        expected: member_count,
                    }];
                }
                _ => {}
            }
        }
        Vec::new()
    }

    /// A service `start` callback failed: the in-flight event is void and
    /// the group must be recovered.
    pub fn start_failed(&self, local_id: u32) -> Vec<SgEffect> {
        let mut inner = self.inner.lock();
        let Some(group) = inner.groups.get_mut(&local_id) else {
            return Vec::new();
        };
        warn!(sg = local_id, "service start failed, forcing recovery");
        let mut effects = Vec::new();
        if let Some(mut sevent) = group.sevent.take() {
            if !sevent.barrier_name.is_empty() {
                effects.push(SgEffect::CancelBarrier {
                    name: sevent.barrier_name.clone(),
                });
            }
            if let Some(waiter) = sevent.waiter.take() {
                let _ = waiter.send(Err(ClusterError::Interrupted));
            }
        }
        if let Some(uevent) = group.uevent.take() {
            effects.push(SgEffect::CancelBarrier {
                name: uevent.barrier_name,
            });
        }
        effects.extend(Self::start_recovery(&mut inner, vec![local_id], false));
        effects
    }

    /// A barrier this engine entered has resolved.
    pub fn barrier_done(&self, name: &str, ok: bool) -> Vec<SgEffect> {
        let mut inner = self.inner.lock();
        let Some(local_id) = inner
            .groups
            .values()
            .find(|g| {
                g.sevent.as_ref().is_some_and(|se| se.barrier_name == name)
                    || g.uevent.as_ref().is_some_and(|ue| ue.barrier_name == name)
                    || (g.state == SgState::Recover
                        && (recovery_barrier_name(g.global_id, 0, g.members.len() as u32) == name
                            || recovery_barrier_name(g.global_id, 1, g.members.len() as u32)
                                == name))
            })
            .map(|g| g.local_id)
        else {
            return Vec::new();
        };
        let group = inner.groups.get_mut(&local_id).expect("indexed group");

        if group.state == SgState::Recover {
            return Self::recovery_barrier_done(&mut inner, local_id, name, ok);
        }

        if group
            .sevent
            .as_ref()
            .is_some_and(|se| se.barrier_name == name && se.state == SeState::BarrierWait)
        {
            let mut sevent = group.sevent.take().expect("checked");
            if ok {
                sevent.state = SeState::BarrierDone;
                group.state = SgState::Run;
                let event_id = u32::from(sevent.id);
                if let Some(waiter) = sevent.waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
                info!(sg = local_id, "join complete");
                return vec![SgEffect::Finish {
                    local_id,
                    event_id,
                }];
            }
            // Barrier failed: back out and retry the whole event.
            group.sevent = Some(sevent);
            let se = group.sevent.as_mut().expect("just stored");
            se.state = if se.leaving {
                SeState::LeaveBegin
            } else {
                SeState::JoinBegin
            };
            se.waiting_from.clear();
            se.memb.clear();
            return vec![SgEffect::RetryLater { local_id }];
        }

        if group
            .uevent
            .as_ref()
            .is_some_and(|ue| ue.barrier_name == name)
        {
            let uevent = group.uevent.take().expect("checked");
            if !ok {
                // The initiator will restart; forget this attempt.
                group.state = SgState::Run;
                return Vec::new();
            }
            group.state = SgState::Run;
            let mut effects = vec![SgEffect::Finish {
                local_id,
                event_id: u32::from(uevent.remote_seid),
            }];
            if uevent.leaving {
                effects.push(SgEffect::Send {
                    target: SgTarget::Nodes(vec![uevent.node_id]),
                    msg: SgMessage {
                        sevent_id: uevent.remote_seid,
                        global_sgid: group.global_id,
                        sglevel: u16::from(group.level),
                        ..SgMessage::new(SgMsgType::LstartDone)
                    },
                });
            }
            return effects;
        }
        Vec::new()
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Membership changed: groups that lost members enter recovery,
    /// processed in ascending level order.
    pub fn membership_update(&self, departed: &[u32]) -> Vec<SgEffect> {
        if departed.is_empty() {
            return Vec::new();
        }
        let mut inner = self.inner.lock();
        let affected: Vec<u32> = inner
            .groups
            .values()
            .filter(|g| g.members.iter().any(|id| departed.contains(id)))
            .map(|g| g.local_id)
            .collect();
        if affected.is_empty() {
            return Vec::new();
        }
        let mut effects = Vec::new();
        for &local_id in &affected {
            let group = inner.groups.get_mut(&local_id).expect("indexed group");
            group.members.retain(|id| !departed.contains(id));
            group.joining.retain(|id| !departed.contains(id));
            // In-flight events are invalid once the membership shifted.
            if let Some(uevent) = group.uevent.take() {
                effects.push(SgEffect::CancelBarrier {
                    name: uevent.barrier_name,
                });
            }
            if let Some(sevent) = group.sevent.as_mut() {
                if !sevent.barrier_name.is_empty() {
                    effects.push(SgEffect::CancelBarrier {
                        name: sevent.barrier_name.clone(),
                    });
                }
                sevent.state = if sevent.leaving {
                    SeState::LeaveBegin
                } else {
                    SeState::JoinBegin
                };
                sevent.waiting_from.clear();
                sevent.memb.clear();
                effects.push(SgEffect::RetryLater { local_id });
            }
        }
        effects.extend(Self::start_recovery(&mut inner, affected, false));
        effects
    }

    fn start_recovery(inner: &mut Inner, affected: Vec<u32>, from_peer: bool) -> Vec<SgEffect> {
        let mut effects = Vec::new();

        // Abandon an in-flight recovery: its barriers are now meaningless.
        if let Some(old) = inner.recovery.take() {
            for level in &old.levels {
                for &local_id in level {
                    if let Some(group) = inner.groups.get_mut(&local_id) {
                        if group.recover_state == RecoverState::BarrierWait {
                            // Either phase may be armed; cancel both.
                            for phase in 0..=1u8 {
                                effects.push(SgEffect::CancelBarrier {
                                    name: recovery_barrier_name(
                                        group.global_id,
                                        phase,
                                        group.members.len() as u32,
                                    ),
                                });
                            }
                        }
                        group.recover_state = RecoverState::Stop;
                    }
                }
            }
        }

        let id = inner.next_recovery;
        inner.next_recovery += 1;
        let mut levels: [Vec<u32>; 4] = Default::default();

        // The new event covers newly affected groups plus everything that
        // was already flagged.
        let mut all: HashSet<u32> = affected.iter().copied().collect();
        for group in inner.groups.values() {
            if group.need_recovery {
                all.insert(group.local_id);
            }
        }
        for &local_id in &all {
            let group = inner.groups.get_mut(&local_id).expect("indexed group");
            if !group.need_recovery {
                group.need_recovery = true;
                effects.push(SgEffect::Stop { local_id });
                if !from_peer {
                    effects.push(SgEffect::Send {
                        target: SgTarget::Multicast,
                        msg: SgMessage {
                            global_sgid: group.global_id,
                            sglevel: u16::from(group.level),
                            ..SgMessage::new(SgMsgType::Recover)
                        },
                    });
                }
            }
            group.state = SgState::Recover;
            group.recover_state = RecoverState::Stop;
            levels[usize::from(group.level)].push(local_id);
        }

        let first_level = levels.iter().position(|l| !l.is_empty()).unwrap_or(0);
        inner.recovery = Some(Recovery {
            id,
            levels,
            level: first_level,
        });
        info!(recovery = id, "starting service recovery");
        effects.extend(Self::advance_recovery_level(inner));
        effects
    }

    /// Arms phase-1 barriers for every group at the current level.
    fn advance_recovery_level(inner: &mut Inner) -> Vec<SgEffect> {
        let Some(recovery) = inner.recovery.as_ref() else {
            return Vec::new();
        };
        let level = recovery.level;
        let ids = recovery.levels[level].clone();
        let mut effects = Vec::new();
        for local_id in ids {
            let Some(group) = inner.groups.get_mut(&local_id) else {
                continue;
            };
            if group.recover_state != RecoverState::Stop {
                continue;
            }
            group.recover_state = RecoverState::BarrierWait;
            let count = group.members.len() as u32;
            let phase1 = recovery_barrier_name(group.global_id, 0, count);
            let phase2 = recovery_barrier_name(group.global_id, 1, count);
            effects.push(SgEffect::RegisterBarrier {
                name: phase1.clone(),
                expected: count,
            });
            effects.push(SgEffect::RegisterBarrier {
                name: phase2,
                expected: count,
            });
            effects.push(SgEffect::EnterBarrier {
                name: phase1,
                expected: count,
            });
        }
        effects
    }

    fn recovery_barrier_done(
        inner: &mut Inner,
        local_id: u32,
        name: &str,
        ok: bool,
    ) -> Vec<SgEffect> {
        if !ok {
            // A cancelled recovery barrier means a fresh failure arrived;
            // the new recovery event re-drives the ladder.
            return Vec::new();
        }
        let recovery_id = inner.recovery.as_ref().map(|r| r.id);
        let Some(group) = inner.groups.get_mut(&local_id) else {
            return Vec::new();
        };
        let count = group.members.len() as u32;
        let phase1 = recovery_barrier_name(group.global_id, 0, count);

        if name == phase1 {
            // Everyone is synchronised and stopped: restart the service.
            group.recover_state = RecoverState::Start;
            let members = group.member_ids();
            return vec![SgEffect::Start {
                local_id,
                event_id: recovery_id.unwrap_or(0),
                members,
                reason: StartReason::Failed,
            }];
        }

        // Phase 2: this group is recovered.
        group.recover_state = RecoverState::BarrierDone;
        group.need_recovery = false;
        group.state = SgState::Run;
        group.recover_state = RecoverState::None;
        let mut effects = vec![SgEffect::Finish {
            local_id,
            event_id: recovery_id.unwrap_or(0),
        }];
        info!(sg = local_id, "service group recovered");

        // Level complete? Move on; recovery done? Clear it.
        let advance = {
            let Some(recovery) = inner.recovery.as_ref() else {
                return effects;
            };
            recovery.levels[recovery.level].iter().all(|id| {
                inner
                    .groups
                    .get(id)
                    .map_or(true, |g| g.recover_state == RecoverState::None && !g.need_recovery)
            })
        };
        if advance {
            let recovery = inner.recovery.as_mut().expect("checked above");
            let next = recovery.levels[recovery.level + 1..]
                .iter()
                .position(|l| !l.is_empty())
                .map(|offset| recovery.level + 1 + offset);
            match next {
                Some(level) => {
                    recovery.level = level;
                    effects.extend(Self::advance_recovery_level(inner));
                }
                None => {
                    info!("service recovery complete");
                    inner.recovery = None;
                }
            }
        }
        effects
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
