//! The communications layer: endpoints, framing/sequencing, port
//! demultiplexing, and temporary node ids.

pub mod endpoint;
pub mod ports;
pub mod sequencer;
pub mod temp_nodes;

pub use endpoint::{
    addr_equal, decode_sockaddr, encode_sockaddr, low32_of_addr, Endpoint, EndpointRole,
    EndpointSet,
};
pub use ports::{DeliverStatus, Delivery, PortTable, NUM_PORTS};
pub use sequencer::{Comms, CommsHooks, Gate, QueuedMessage};
pub use temp_nodes::TempNodeIds;
