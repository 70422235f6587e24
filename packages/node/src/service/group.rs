//! Service-group records and the callback contract with services.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::ClusterError;

/// Why a service's `start` callback is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartReason {
    /// A node is joining the group.
    Join,
    /// A node is leaving the group.
    Leave,
    /// Group members failed; this is a recovery start.
    Failed,
}

/// Callbacks a registered service provides.
///
/// `stop` must quiesce the service before membership changes; `start`
/// hands it the new member set (the service later confirms with
/// `start_done`); `finish` signals that every member completed the change.
#[async_trait]
pub trait ServiceOps: Send + Sync {
    async fn stop(&self);
    async fn start(
        &self,
        event_id: u32,
        members: &[u32],
        reason: StartReason,
    ) -> anyhow::Result<()>;
    async fn finish(&self, event_id: u32);
}

/// Group lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgState {
    None,
    Join,
    Run,
    Recover,
    Uevent,
}

/// Recovery ladder position of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverState {
    None,
    Stop,
    Start,
    StartDone,
    BarrierWait,
    BarrierDone,
}

/// Initiator-side (sevent) ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SeState {
    JoinBegin,
    JoinAckWait,
    JoinAcked,
    JstopAckWait,
    JstopAcked,
    JstartServiceWait,
    BarrierWait,
    BarrierDone,
    LeaveBegin,
    LeaveAckWait,
    LeaveAcked,
    LstopAckWait,
    LstartWaitRemote,
    LstartRemoteDone,
}

/// Responder-side (uevent) ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeState {
    Jstop,
    JstartWaitCmd,
    JstartServiceWait,
    BarrierWait,
    Lstop,
    LstartWaitCmd,
    LstartServiceWait,
    LbarrierWait,
}

/// One join or leave in flight, driven by the local node.
pub struct Sevent {
    pub id: u16,
    pub leaving: bool,
    pub state: SeState,
    /// Cluster members still expected to reply at the current stage.
    pub waiting_from: HashSet<i32>,
    /// SG members discovered from positive replies.
    pub memb: Vec<u32>,
    /// A reply asked us to back off and retry.
    pub delayed: bool,
    pub barrier_name: String,
    /// Wakes the blocked `join`/`leave` caller.
    pub waiter: Option<oneshot::Sender<Result<(), ClusterError>>>,
}

/// A remote node's join/leave that this member is answering.
pub struct Uevent {
    pub state: UeState,
    /// The sevent id on the initiating node.
    pub remote_seid: u16,
    /// The node joining or leaving.
    pub node_id: i32,
    pub leaving: bool,
    pub barrier_name: String,
}

/// One registered service group.
pub struct Group {
    pub local_id: u32,
    /// Cluster-wide id, `(level << 24) | counter`; 0 until known.
    pub global_id: u32,
    pub name: String,
    pub level: u8,
    pub state: SgState,
    pub refcount: u32,
    pub members: Vec<u32>,
    pub joining: Vec<u32>,
    pub ops: Arc<dyn ServiceOps>,
    pub sevent: Option<Sevent>,
    pub uevent: Option<Uevent>,
    pub need_recovery: bool,
    pub recover_state: RecoverState,
}

impl Group {
    /// The member set including ourselves, sorted for stable wire payloads.
    #[must_use]
    pub fn member_ids(&self) -> Vec<u32> {
        let mut ids = self.members.clone();
        ids.sort_unstable();
        ids
    }
}

/// Composes a join/leave barrier name:
/// `sm.<global_id>.<initiator>.<event>.<count>`.
#[must_use]
pub fn event_barrier_name(global_id: u32, initiator: u32, event: u16, count: u32) -> String {
    format!("sm.{global_id}.{initiator}.{event}.{count}")
}

/// Composes a recovery barrier name: `sm.<global_id>.<phase>.RECOV.<count>`.
#[must_use]
pub fn recovery_barrier_name(global_id: u32, phase: u8, count: u32) -> String {
    format!("sm.{global_id}.{phase}.RECOV.{count}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_names_are_deterministic() {
        assert_eq!(
            event_barrier_name((2 << 24) | 5, 3, 9, 4),
            "sm.33554437.3.9.4"
        );
        assert_eq!(recovery_barrier_name(7, 0, 2), "sm.7.0.RECOV.2");
        assert_eq!(recovery_barrier_name(7, 1, 2), "sm.7.1.RECOV.2");
    }
}
