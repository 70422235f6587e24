//! Conclave engine — the in-process cluster connection-and-service manager.
//!
//! Layered bottom-up:
//! - [`comms`]: endpoints, the sequenced reliable-delivery protocol, port
//!   demultiplexing, temporary node ids.
//! - [`membership`]: the node table, quorum, and the master-driven
//!   membership state machine.
//! - [`barrier`]: the cluster-wide two-phase barrier primitive.
//! - [`service`]: the service-group engine (join/leave/recovery of
//!   application-level groups).
//! - [`node`]: the [`ClusterNode`] that wires it all together and exposes
//!   the node-visible surface.
//!
//! The crate consumes already-bound datagram sockets; socket creation and
//! any syscall-boundary framing belong to the embedding binary.

pub mod barrier;
pub mod comms;
pub mod config;
pub mod error;
pub mod events;
pub mod membership;
pub mod node;
pub mod service;

pub use barrier::{BarrierAttr, BarrierFlags, BarrierRegistry, BarrierState};
pub use comms::{Comms, Delivery, EndpointRole, EndpointSet, Gate, PortTable, TempNodeIds};
pub use config::NodeConfig;
pub use error::{ClusterError, WaitOutcome};
pub use events::{ClusterEvent, OobNotice};
pub use membership::{ClusterView, MemberInfo, MembershipFsm, Node, NodeStore};
pub use node::ClusterNode;
pub use service::{ServiceEngine, ServiceOps, StartReason};
