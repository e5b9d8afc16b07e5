//! qbabel: a Babel-family routing core with source-specific prefixes
//! and DSCP/TOS-qualified link cost.
//!
//! Main entry points:
//! - [`BabelNode`]: single-threaded routing node that tracks
//!   neighbors, enforces the feasibility condition and selects
//!   per-destination best routes.
//! - [`Config`]: parsed configuration consumed by [`BabelNode`].
//!
//! Lower-level modules are also exposed for advanced usage:
//! - [`tlv`]: TLV parsing/encoding, incl. source-prefix and TOS
//!   sub-TLVs
//! - [`packet`]: packet framing, send buffers, event translation
//! - [`neighbor`]: neighbor tracking and link-cost estimation
//! - [`source`]: feasibility memory
//! - [`routing`]: route table and route selection
//! - [`filter`]: input/output/redistribute/install filters
//! - [`tos`]: DSCP classification

pub mod config;
pub mod event;
pub mod fib;
pub mod filter;
pub mod interface;
pub mod neighbor;
pub mod node;
pub mod packet;
pub mod routing;
pub mod source;
pub mod tlv;
pub mod tos;
pub mod util;
pub mod xroute;

pub use crate::config::{Config, ConfigAction};
pub use crate::event::{LocalEvent, OutboundEvent, ProtocolEvent};
pub use crate::fib::{Fib, FibEntry, NullFib};
pub use crate::neighbor::{Neighbor, NeighborKey, NeighborTable};
pub use crate::node::{derive_router_id, BabelNode};
pub use crate::packet::{Packet, BABEL_PORT, MULTICAST_V4_ADDR, MULTICAST_V6_ADDR};
pub use crate::routing::{Route, RouteKey, RoutingTable};
pub use crate::tlv::Tlv;
pub use crate::tos::Tos;
pub use crate::util::INFINITY;
