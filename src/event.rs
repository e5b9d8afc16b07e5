// src/event.rs
//! Events crossing the core's boundaries.
//!
//! The packet codec turns received TLVs into [`ProtocolEvent`]s tagged
//! with the link they arrived on; the core replies with
//! [`OutboundEvent`]s for the codec to serialise. [`LocalEvent`]s feed
//! the management socket.

use std::net::Ipv6Addr;

use crate::routing::RouteKey;
use crate::util::RouterId;

/// A parsed protocol message, applied in order within a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Hello {
        seqno: u16,
        /// Centiseconds.
        interval: u16,
        unicast: bool,
    },
    Ihu {
        /// The peer's measured rxcost towards us; our txcost.
        rxcost: u16,
        /// Centiseconds.
        interval: u16,
        /// Address the IHU speaks about; `None` means wildcard.
        address: Option<Ipv6Addr>,
    },
    Update {
        router_id: RouterId,
        key: RouteKey,
        seqno: u16,
        metric: u16,
        /// Centiseconds until the peer's next scheduled update.
        interval: u16,
    },
    RouteRequest {
        /// `None` requests a full table dump.
        key: Option<RouteKey>,
    },
    SeqnoRequest {
        router_id: RouterId,
        key: RouteKey,
        seqno: u16,
        hop_count: u8,
    },
    Ack {
        opaque: u16,
    },
}

/// Where an outbound message should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Multicast { ifindex: u32 },
    Unicast { ifindex: u32, addr: Ipv6Addr },
}

impl Destination {
    pub fn ifindex(&self) -> u32 {
        match self {
            Destination::Multicast { ifindex } => *ifindex,
            Destination::Unicast { ifindex, .. } => *ifindex,
        }
    }
}

/// A message the core asks the codec to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Update {
        dest: Destination,
        router_id: RouterId,
        key: RouteKey,
        seqno: u16,
        metric: u16,
    },
    SeqnoRequest {
        dest: Destination,
        router_id: RouterId,
        key: RouteKey,
        seqno: u16,
        hop_count: u8,
    },
    Ihu {
        dest: Destination,
        addr: Ipv6Addr,
        rxcost: u16,
        /// Centiseconds.
        interval: u16,
    },
    Hello {
        dest: Destination,
        seqno: u16,
        /// Centiseconds.
        interval: u16,
    },
}

/// Kind of change reported to the management socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAction {
    Add,
    Change,
    Flush,
}

/// Observable state change, mirrored to local monitors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Neighbour {
        action: LocalAction,
        address: Ipv6Addr,
        ifindex: u32,
    },
    Route {
        action: LocalAction,
        key: RouteKey,
        metric: u16,
        installed: bool,
    },
    XRoute {
        action: LocalAction,
        key: RouteKey,
        metric: u16,
    },
}
