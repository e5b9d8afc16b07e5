// src/filter.rs
//! Declarative route filters.
//!
//! Filters are ordered first-match rule lists evaluated at four sites:
//! input (received updates), output (before emitting), redistribute
//! (importing kernel routes) and install (FIB parameters for the
//! winning route). Every present criterion must match; absent criteria
//! match anything.

use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use crate::routing::RouteKey;
use crate::tos::Tos;
use crate::util::{prefix_equal, RouterId, INFINITY};

/// What a matching rule does to the candidate.
///
/// `add_metric` 0 passes the route unchanged, [`INFINITY`] drops it,
/// anything between is an additive penalty. The optional fields carry
/// installation-time side effects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterResult {
    pub add_metric: u16,
    /// Reclassify the route under a different TOS.
    pub tos: Option<Tos>,
    /// Kernel routing table to install into.
    pub table: Option<u32>,
    /// Preferred source address for the installed route.
    pub pref_src: Option<Ipv6Addr>,
    /// Source-prefix override.
    pub src_prefix: Option<(Ipv6Addr, u8)>,
}

impl FilterResult {
    pub fn allow() -> Self {
        FilterResult::default()
    }

    pub fn deny() -> Self {
        FilterResult {
            add_metric: INFINITY,
            ..FilterResult::default()
        }
    }

    pub fn is_deny(&self) -> bool {
        self.add_metric >= INFINITY
    }
}

/// One filter rule: match criteria plus the action taken on match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    /// Interface name constraint.
    pub ifname: Option<String>,
    /// Interface index constraint.
    pub ifindex: Option<u32>,
    /// Originating router.
    pub router_id: Option<RouterId>,
    /// Destination prefix the candidate must lie within.
    pub prefix: Option<(Ipv6Addr, u8)>,
    /// Bounds on the candidate's destination prefix length.
    pub plen_ge: Option<u8>,
    pub plen_le: Option<u8>,
    /// Source prefix the candidate must lie within.
    pub src_prefix: Option<(Ipv6Addr, u8)>,
    pub src_plen_ge: Option<u8>,
    pub src_plen_le: Option<u8>,
    pub tos: Option<Tos>,
    /// Advertising neighbour.
    pub neigh: Option<Ipv6Addr>,
    /// Kernel protocol of redistributed routes.
    pub proto: Option<i32>,
    pub action: FilterResult,
}

/// Candidate attributes a rule is matched against.
#[derive(Debug, Clone, Copy)]
pub struct FilterContext<'a> {
    pub key: &'a RouteKey,
    pub router_id: Option<&'a RouterId>,
    pub neigh: Option<Ipv6Addr>,
    pub ifindex: u32,
    pub ifname: Option<&'a str>,
    pub proto: Option<i32>,
}

impl Filter {
    fn matches(&self, ctx: &FilterContext<'_>) -> bool {
        if let Some(ref ifname) = self.ifname {
            if ctx.ifname != Some(ifname.as_str()) {
                return false;
            }
        }
        if let Some(ifindex) = self.ifindex {
            if ctx.ifindex != ifindex {
                return false;
            }
        }
        if let Some(ref id) = self.router_id {
            if ctx.router_id != Some(id) {
                return false;
            }
        }
        if let Some((ref prefix, plen)) = self.prefix {
            if ctx.key.plen < plen || !prefix_equal(prefix, &ctx.key.prefix, plen) {
                return false;
            }
        }
        if let Some(ge) = self.plen_ge {
            if ctx.key.plen < ge {
                return false;
            }
        }
        if let Some(le) = self.plen_le {
            if ctx.key.plen > le {
                return false;
            }
        }
        if let Some((ref prefix, plen)) = self.src_prefix {
            if ctx.key.src_plen < plen || !prefix_equal(prefix, &ctx.key.src_prefix, plen) {
                return false;
            }
        }
        if let Some(ge) = self.src_plen_ge {
            if ctx.key.src_plen < ge {
                return false;
            }
        }
        if let Some(le) = self.src_plen_le {
            if ctx.key.src_plen > le {
                return false;
            }
        }
        if let Some(tos) = self.tos {
            if ctx.key.tos != tos {
                return false;
            }
        }
        if let Some(ref neigh) = self.neigh {
            if ctx.neigh.as_ref() != Some(neigh) {
                return false;
            }
        }
        if let Some(proto) = self.proto {
            if ctx.proto != Some(proto) {
                return false;
            }
        }
        true
    }
}

/// The four rule lists, evaluated independently per site.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filters {
    pub input: Vec<Filter>,
    pub output: Vec<Filter>,
    pub redistribute: Vec<Filter>,
    pub install: Vec<Filter>,
}

fn apply(rules: &[Filter], ctx: &FilterContext<'_>) -> FilterResult {
    for rule in rules {
        if rule.matches(ctx) {
            return rule.action.clone();
        }
    }
    // No rule matched: pass unchanged.
    FilterResult::allow()
}

impl Filters {
    pub fn input(&self, ctx: &FilterContext<'_>) -> FilterResult {
        apply(&self.input, ctx)
    }

    pub fn output(&self, ctx: &FilterContext<'_>) -> FilterResult {
        apply(&self.output, ctx)
    }

    pub fn redistribute(&self, ctx: &FilterContext<'_>) -> FilterResult {
        apply(&self.redistribute, ctx)
    }

    pub fn install(&self, ctx: &FilterContext<'_>) -> FilterResult {
        apply(&self.install, ctx)
    }
}
