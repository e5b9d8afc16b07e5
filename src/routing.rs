// src/routing.rs
//! Route table and best-route selection.
//!
//! For every qualified destination the table keeps one candidate route
//! per advertising neighbor. Selection picks the feasible candidate
//! with the lowest metric, with hysteresis so that marginal
//! improvements don't flap the installed route. Retracted routes
//! linger long enough to be re-announced with an infinite metric
//! before they are dropped.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use bitflags::bitflags;
use tracing::debug;

use crate::neighbor::NeighborKey;
use crate::source::SourceRef;
use crate::tos::Tos;
use crate::util::{add_metric, interval_to_msec, Timestamp, INFINITY};

/// Floor for route expiry, guarding against absurd advertised
/// intervals.
const MIN_HOLD_MS: u64 = 10_000;

/// Key identifying a qualified destination: destination prefix, source
/// prefix and TOS. Addresses are canonical 16-byte forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub prefix: Ipv6Addr,
    pub plen: u8,
    pub src_prefix: Ipv6Addr,
    pub src_plen: u8,
    pub tos: Tos,
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} from {}/{} tos {}",
            self.prefix, self.plen, self.src_prefix, self.src_plen, self.tos
        )
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RouteFlags: u8 {
        /// Mirrored into the FIB.
        const INSTALLED = 0x01;
        /// Passed the feasibility condition when last updated.
        const FEASIBLE = 0x02;
    }
}

/// One route learned from a neighbor via Update.
#[derive(Debug)]
pub struct Route {
    pub key: RouteKey,
    /// Next hop; a weak reference resolved through the neighbor table.
    pub neighbor: NeighborKey,
    /// Shared feasibility record.
    pub source: SourceRef,
    /// Seqno announced by the peer.
    pub seqno: u16,
    /// Metric announced by the peer.
    pub refmetric: u16,
    /// `refmetric` plus the link cost towards the neighbor.
    pub metric: u16,
    /// Slow-moving copy of `metric` used for switch damping.
    pub smoothed_metric: u16,
    /// When the last update for this route arrived.
    pub time: Timestamp,
    /// When the route goes stale and must be retracted.
    pub expires: Timestamp,
    pub flags: RouteFlags,
}

impl Route {
    pub fn installed(&self) -> bool {
        self.flags.contains(RouteFlags::INSTALLED)
    }

    /// Whether the route passed the feasibility condition when it was
    /// last updated. Evaluated at acceptance time: the source entry
    /// may since have absorbed this very route's announcement.
    pub fn feasible(&self) -> bool {
        self.flags.contains(RouteFlags::FEASIBLE)
    }

    pub fn retracted(&self) -> bool {
        self.refmetric >= INFINITY
    }

    /// Move the smoothed metric a quarter-step towards the current
    /// metric. Retractions propagate immediately.
    fn smooth(&mut self) {
        if self.metric >= INFINITY {
            self.smoothed_metric = INFINITY;
        } else if self.metric > self.smoothed_metric {
            self.smoothed_metric += ((self.metric - self.smoothed_metric) / 4).max(1);
        } else if self.metric < self.smoothed_metric {
            self.smoothed_metric -= ((self.smoothed_metric - self.metric) / 4).max(1);
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} via {} metric {} (ref {}) seqno {}{}",
            self.key,
            self.neighbor.address,
            self.metric,
            self.refmetric,
            self.seqno,
            if self.installed() { " installed" } else { "" }
        )
    }
}

/// Outcome of re-running selection for one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub key: RouteKey,
    pub old: Option<NeighborKey>,
    pub new: Option<NeighborKey>,
}

impl Selection {
    pub fn changed(&self) -> bool {
        self.old != self.new
    }
}

/// In-memory route table: per destination, one entry per advertising
/// neighbor.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<RouteKey, Vec<Route>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable {
            routes: HashMap::new(),
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &Route> {
        self.routes.values().flatten()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RouteKey> {
        self.routes.keys()
    }

    pub fn routes_for(&self, key: &RouteKey) -> &[Route] {
        self.routes.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find(&self, key: &RouteKey, neighbor: &NeighborKey) -> Option<&Route> {
        self.routes_for(key).iter().find(|r| &r.neighbor == neighbor)
    }

    pub fn installed(&self, key: &RouteKey) -> Option<&Route> {
        self.routes_for(key).iter().find(|r| r.installed())
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Record an update from a neighbor, creating or refreshing its
    /// candidate route. The caller has already computed the link cost,
    /// resolved the shared source entry and evaluated feasibility.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        key: &RouteKey,
        neighbor: NeighborKey,
        source: SourceRef,
        seqno: u16,
        refmetric: u16,
        cost: u16,
        interval: u16,
        feasible: bool,
        now: Timestamp,
    ) {
        let metric = add_metric(refmetric, cost);
        let hold = (interval_to_msec(interval) * 7 / 2).max(MIN_HOLD_MS);
        let entries = self.routes.entry(key.clone()).or_default();

        match entries.iter_mut().find(|r| r.neighbor == neighbor) {
            Some(route) => {
                route.source = source;
                route.seqno = seqno;
                route.refmetric = refmetric;
                route.metric = metric;
                route.time = now;
                route.expires = now + hold;
                route.flags.set(RouteFlags::FEASIBLE, feasible);
                route.smooth();
            }
            None => {
                let mut flags = RouteFlags::default();
                flags.set(RouteFlags::FEASIBLE, feasible);
                entries.push(Route {
                    key: key.clone(),
                    neighbor,
                    source,
                    seqno,
                    refmetric,
                    metric,
                    // Start pessimistic so a brand-new route has to
                    // prove itself before displacing the incumbent.
                    smoothed_metric: metric.max(INFINITY / 2),
                    time: now,
                    expires: now + hold,
                    flags,
                });
            }
        }
    }

    /// Refresh `metric` for every route through `neighbor` after its
    /// link cost changed. Returns the affected destinations.
    pub fn recompute_neighbor(
        &mut self,
        neighbor: &NeighborKey,
        mut cost: impl FnMut(Tos) -> u16,
    ) -> Vec<RouteKey> {
        let mut affected = Vec::new();
        for (key, entries) in self.routes.iter_mut() {
            for route in entries.iter_mut().filter(|r| &r.neighbor == neighbor) {
                let metric = add_metric(route.refmetric, cost(route.key.tos));
                if metric != route.metric {
                    route.metric = metric;
                    route.smooth();
                    affected.push(key.clone());
                }
            }
        }
        affected
    }

    /// Drop every route whose next hop is `neighbor` (neighbor flush
    /// cascade). Sources are released by dropping the entries.
    pub fn flush_neighbor(&mut self, neighbor: &NeighborKey) -> Vec<RouteKey> {
        let mut affected = Vec::new();
        self.routes.retain(|key, entries| {
            let before = entries.len();
            entries.retain(|r| &r.neighbor != neighbor);
            if entries.len() != before {
                affected.push(key.clone());
            }
            !entries.is_empty()
        });
        affected
    }

    /// Age routes: stale routes become retractions and are kept for one
    /// more hold period so the retraction gets announced; stale
    /// retractions are dropped. Returns destinations needing
    /// re-selection.
    pub fn expire(&mut self, now: Timestamp) -> Vec<RouteKey> {
        let mut affected = Vec::new();
        self.routes.retain(|key, entries| {
            let mut touched = false;
            entries.retain_mut(|route| {
                if now < route.expires {
                    return true;
                }
                if route.retracted() {
                    touched = true;
                    return false;
                }
                debug!(route = %route.summary(), "route expired, retracting");
                route.refmetric = INFINITY;
                route.metric = INFINITY;
                route.smoothed_metric = INFINITY;
                route.expires = now + MIN_HOLD_MS;
                touched = true;
                true
            });
            if touched {
                affected.push(key.clone());
            }
            !entries.is_empty()
        });
        affected
    }

    /// Re-run selection for one destination.
    ///
    /// Candidates must be live and flagged feasible. The installed
    /// route is only displaced by a candidate that is better on the
    /// instantaneous metric and either better smoothed as well or
    /// better by more than the damping ratio of 1.2.
    pub fn select(&mut self, key: &RouteKey) -> Selection {
        let entries = match self.routes.get_mut(key) {
            Some(entries) => entries,
            None => {
                return Selection {
                    key: key.clone(),
                    old: None,
                    new: None,
                }
            }
        };

        let old = entries.iter().find(|r| r.installed()).map(|r| r.neighbor);

        let mut best: Option<usize> = None;
        for (i, route) in entries.iter().enumerate() {
            if route.metric >= INFINITY || !route.feasible() {
                continue;
            }
            best = Some(match best {
                None => i,
                Some(j) => {
                    if better(&entries[i], &entries[j]) {
                        i
                    } else {
                        j
                    }
                }
            });
        }

        // Hysteresis: keep a healthy installed route unless the
        // challenger is convincingly better.
        let new = match (old, best) {
            (Some(old_key), Some(b)) if entries[b].neighbor != old_key => {
                let keep = entries.iter().position(|r| r.neighbor == old_key);
                match keep {
                    Some(o)
                        if !entries[o].retracted()
                            && entries[o].metric < INFINITY
                            && entries[o].feasible()
                            && !convincing(&entries[b], &entries[o]) =>
                    {
                        Some(o)
                    }
                    _ => Some(b),
                }
            }
            (_, b) => b,
        };

        let new_key = new.map(|i| entries[i].neighbor);
        if old != new_key {
            for route in entries.iter_mut() {
                route.flags.set(RouteFlags::INSTALLED, Some(route.neighbor) == new_key);
            }
            if let Some(i) = new {
                debug!(route = %entries[i].summary(), "route selected");
            }
        }

        Selection {
            key: key.clone(),
            old,
            new: new_key,
        }
    }
}

/// Strictly-better ordering between live candidates: metric, then
/// installed-route preference, then refmetric, then stable neighbor
/// order.
fn better(a: &Route, b: &Route) -> bool {
    if a.metric != b.metric {
        return a.metric < b.metric;
    }
    if a.installed() != b.installed() {
        return a.installed();
    }
    if a.refmetric != b.refmetric {
        return a.refmetric < b.refmetric;
    }
    a.neighbor < b.neighbor
}

/// Whether challenger `a` beats the installed route `b` through the
/// damping window.
fn convincing(a: &Route, b: &Route) -> bool {
    if a.metric >= b.metric {
        return false;
    }
    // Better by more than the 1.2 ratio, or persistently better.
    b.metric as u32 * 10 >= a.metric as u32 * 12 || a.smoothed_metric < b.smoothed_metric
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Source, SourceKey};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn key() -> RouteKey {
        RouteKey {
            prefix: "2001:db8::".parse().unwrap(),
            plen: 64,
            src_prefix: "::".parse().unwrap(),
            src_plen: 0,
            tos: Tos::DEFAULT,
        }
    }

    fn nkey(last: u16) -> NeighborKey {
        NeighborKey {
            ifindex: 1,
            address: format!("fe80::{:x}", last).parse().unwrap(),
        }
    }

    fn source() -> SourceRef {
        Rc::new(RefCell::new(Source {
            key: SourceKey {
                router_id: [1; 8],
                key: key(),
            },
            seqno: 0,
            metric: INFINITY,
            time: 0,
        }))
    }

    fn add(table: &mut RoutingTable, n: NeighborKey, refmetric: u16, cost: u16, now: Timestamp) {
        table.update(&key(), n, source(), 0, refmetric, cost, 400, true, now);
    }

    #[test]
    fn metric_is_refmetric_plus_cost() {
        let mut table = RoutingTable::new();
        add(&mut table, nkey(1), 100, 96, 0);
        let route = table.find(&key(), &nkey(1)).unwrap();
        assert_eq!(route.metric, 196);

        add(&mut table, nkey(2), 0xFFF0, 96, 0);
        let route = table.find(&key(), &nkey(2)).unwrap();
        assert_eq!(route.metric, INFINITY);
    }

    #[test]
    fn selects_minimum_metric() {
        let mut table = RoutingTable::new();
        add(&mut table, nkey(1), 200, 96, 0);
        add(&mut table, nkey(2), 100, 96, 0);

        let sel = table.select(&key());
        assert_eq!(sel.old, None);
        assert_eq!(sel.new, Some(nkey(2)));
        assert!(sel.changed());
        assert!(table.installed(&key()).unwrap().neighbor == nkey(2));
    }

    #[test]
    fn infeasible_candidates_are_skipped() {
        let mut table = RoutingTable::new();
        add(&mut table, nkey(1), 200, 96, 0);
        table.update(&key(), nkey(2), source(), 0, 100, 96, 400, false, 0);

        let sel = table.select(&key());
        assert_eq!(sel.new, Some(nkey(1)));
    }

    #[test]
    fn marginal_improvement_is_damped() {
        let mut table = RoutingTable::new();
        add(&mut table, nkey(1), 100, 96, 0);
        table.select(&key());

        // 10% better: inside the damping ratio, smoothed metric still
        // high, so the installed route stays.
        add(&mut table, nkey(2), 80, 96, 0);
        let sel = table.select(&key());
        assert_eq!(sel.new, Some(nkey(1)));
        assert!(!sel.changed());
    }

    #[test]
    fn convincing_improvement_switches() {
        let mut table = RoutingTable::new();
        add(&mut table, nkey(1), 100, 96, 0);
        table.select(&key());

        add(&mut table, nkey(2), 10, 10, 0);
        let sel = table.select(&key());
        assert_eq!(sel.new, Some(nkey(2)));
        assert!(sel.changed());
    }

    #[test]
    fn installed_route_loss_falls_back() {
        let mut table = RoutingTable::new();
        add(&mut table, nkey(1), 100, 96, 0);
        add(&mut table, nkey(2), 150, 96, 0);
        table.select(&key());
        assert_eq!(table.installed(&key()).unwrap().neighbor, nkey(1));

        let affected = table.flush_neighbor(&nkey(1));
        assert_eq!(affected, vec![key()]);
        let sel = table.select(&key());
        assert_eq!(sel.new, Some(nkey(2)));
    }

    #[test]
    fn expiry_retracts_then_drops() {
        let mut table = RoutingTable::new();
        add(&mut table, nkey(1), 100, 96, 0); // hold 14 s at interval 400
        assert!(table.expire(1_000).is_empty());

        let affected = table.expire(14_000);
        assert_eq!(affected, vec![key()]);
        let route = table.find(&key(), &nkey(1)).unwrap();
        assert!(route.retracted());
        assert_eq!(route.metric, INFINITY);

        // The retraction itself ages out later.
        let affected = table.expire(14_000 + MIN_HOLD_MS);
        assert_eq!(affected, vec![key()]);
        assert!(table.is_empty());
    }

    #[test]
    fn retraction_updates_are_accepted() {
        let mut table = RoutingTable::new();
        add(&mut table, nkey(1), 100, 96, 0);
        table.select(&key());

        // Retraction replaces the installed route's metric.
        table.update(&key(), nkey(1), source(), 0, INFINITY, 96, 400, true, 1000);
        let route = table.find(&key(), &nkey(1)).unwrap();
        assert!(route.retracted());

        let sel = table.select(&key());
        assert_eq!(sel.new, None);
        assert!(sel.changed());
    }

    #[test]
    fn smoothed_metric_converges() {
        let mut table = RoutingTable::new();
        add(&mut table, nkey(1), 400, 0, 0);
        for t in 1..100u64 {
            table.update(&key(), nkey(1), source(), 0, 100, 0, 400, true, t);
        }
        let route = table.find(&key(), &nkey(1)).unwrap();
        assert_eq!(route.metric, 100);
        assert_eq!(route.smoothed_metric, 100);
    }
}
