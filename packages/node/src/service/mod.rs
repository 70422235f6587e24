//! The service-group engine: join/leave/recovery of application-level
//! groups layered on cluster membership.

pub mod daemon;
pub mod engine;
pub mod group;

pub use daemon::SgInput;
pub use engine::{ServiceEngine, SgEffect, SgTarget, RETRY_DELAY_SECS};
pub use group::{
    Group, RecoverState, SeState, ServiceOps, Sevent, SgState, StartReason, UeState, Uevent,
};
