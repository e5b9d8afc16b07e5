// src/xroute.rs
//! Locally exported routes.
//!
//! An xroute is a prefix this node itself originates: a kernel address,
//! a static configuration entry or a redistributed kernel route. They
//! are advertised with the node's own router-id and seqno and never go
//! through the feasibility machinery.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use crate::routing::RouteKey;

/// Protocol tag for routes derived from local addresses.
pub const PROTO_LOCAL: i32 = -1;
/// Protocol tag for statically configured exports.
pub const PROTO_STATIC: i32 = -2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XRoute {
    pub key: RouteKey,
    pub metric: u16,
    pub ifindex: u32,
    pub proto: i32,
}

/// What changed during a reconcile pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct XRouteDiff {
    pub added: Vec<RouteKey>,
    pub removed: Vec<RouteKey>,
}

impl XRouteDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct XRouteTable {
    xroutes: HashMap<RouteKey, XRoute>,
}

impl XRouteTable {
    pub fn new() -> Self {
        XRouteTable {
            xroutes: HashMap::new(),
        }
    }

    pub fn find(&self, key: &RouteKey) -> Option<&XRoute> {
        self.xroutes.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &XRoute> {
        self.xroutes.values()
    }

    pub fn len(&self) -> usize {
        self.xroutes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xroutes.is_empty()
    }

    /// Insert or refresh an exported route. Returns true if anything
    /// changed, i.e. an update should be emitted.
    pub fn add(&mut self, xroute: XRoute) -> bool {
        match self.xroutes.get(&xroute.key) {
            Some(existing) if *existing == xroute => false,
            _ => {
                self.xroutes.insert(xroute.key.clone(), xroute);
                true
            }
        }
    }

    pub fn flush(&mut self, key: &RouteKey) -> Option<XRoute> {
        self.xroutes.remove(key)
    }

    /// Replace the set of routes carrying `proto` with `desired`.
    ///
    /// Used to reconcile against the kernel's current address list:
    /// entries of other protocols are untouched.
    pub fn reconcile(&mut self, proto: i32, desired: Vec<XRoute>) -> XRouteDiff {
        let mut diff = XRouteDiff::default();

        let desired_keys: std::collections::HashSet<&RouteKey> =
            desired.iter().map(|x| &x.key).collect();
        let stale: Vec<RouteKey> = self
            .xroutes
            .values()
            .filter(|x| x.proto == proto && !desired_keys.contains(&x.key))
            .map(|x| x.key.clone())
            .collect();
        for key in stale {
            self.xroutes.remove(&key);
            diff.removed.push(key);
        }

        for xroute in desired {
            debug_assert_eq!(xroute.proto, proto);
            let key = xroute.key.clone();
            if self.add(xroute) {
                diff.added.push(key);
            }
        }

        diff
    }
}

/// Build the host route corresponding to a local address.
pub fn local_address_xroute(addr: Ipv6Addr, ifindex: u32, tos: crate::tos::Tos) -> XRoute {
    XRoute {
        key: RouteKey {
            prefix: addr,
            plen: 128,
            src_prefix: Ipv6Addr::UNSPECIFIED,
            src_plen: 0,
            tos,
        },
        metric: 0,
        ifindex,
        proto: PROTO_LOCAL,
    }
}
