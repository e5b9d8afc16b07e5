// src/node.rs
//! The Babel node: root object owning every table and dispatching
//! decoded protocol events.
//!
//! The node is single-threaded and cooperative. The event loop
//! refreshes one monotonic `now` snapshot, hands it to a batch of
//! handlers, and sleeps until the wakeup the maintenance tick asks
//! for. Route re-selection is coalesced: within a batch each affected
//! destination is selected at most once.

use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tracing::{debug, info};

use crate::config::Config;
use crate::event::{Destination, LocalAction, LocalEvent, OutboundEvent, ProtocolEvent};
use crate::fib::{Fib, FibEntry, FibMirror};
use crate::filter::FilterContext;
use crate::interface::{Interface, InterfaceTable};
use crate::neighbor::{NeighborKey, NeighborTable};
use crate::routing::{RouteKey, RoutingTable};
use crate::source::{update_source, SourceKey, SourceTable};
use crate::tos::Tos;
use crate::util::{add_metric, seqno_less, seqno_plus, RouterId, Timestamp, INFINITY};
use crate::xroute::{local_address_xroute, XRoute, XRouteTable, PROTO_LOCAL};

/// Hop count used when originating seqno requests.
const SEQNO_REQUEST_HOPS: u8 = 127;

/// First retransmit delay for unanswered seqno requests; doubles per
/// attempt.
const RESEND_INTERVAL_MS: u64 = 2_000;
const RESEND_ATTEMPTS: u32 = 3;

/// A seqno request awaiting an answer, retransmitted with backoff.
#[derive(Debug)]
struct PendingRequest {
    key: RouteKey,
    router_id: RouterId,
    seqno: u16,
    dest: NeighborKey,
    next: Timestamp,
    interval: u64,
    attempts: u32,
}

/// Derive a router-id from a stable interface identity (name, MAC,
/// hardware serial). Deterministic across restarts for the same
/// identity, which preserves seqno monotonicity well enough for a
/// soft-state protocol.
pub fn derive_router_id(identity: &str) -> RouterId {
    let mut hasher = DefaultHasher::new();
    identity.hash(&mut hasher);
    hasher.finish().to_be_bytes()
}

/// A Babel routing node with source-specific and TOS-qualified routes.
pub struct BabelNode {
    config: Config,
    router_id: RouterId,
    /// Seqno for routes this node originates.
    update_seqno: u16,
    interfaces: InterfaceTable,
    neighbors: NeighborTable,
    sources: SourceTable,
    routes: RoutingTable,
    xroutes: XRouteTable,
    mirror: FibMirror,
    fib: Box<dyn Fib>,
    outbound: Vec<OutboundEvent>,
    local_events: Vec<LocalEvent>,
    /// Destinations awaiting coalesced re-selection.
    pending: BTreeSet<RouteKey>,
    /// Unanswered seqno requests scheduled for retransmission.
    resends: Vec<PendingRequest>,
}

impl BabelNode {
    pub fn new(config: Config, fib: Box<dyn Fib>) -> Self {
        let router_id = config
            .router_id
            .unwrap_or_else(|| rand::random::<u64>().to_be_bytes());
        info!(router_id = ?router_id, "starting babel node");
        BabelNode {
            config,
            router_id,
            update_seqno: 0,
            interfaces: InterfaceTable::new(),
            neighbors: NeighborTable::new(),
            sources: SourceTable::new(),
            routes: RoutingTable::new(),
            xroutes: XRouteTable::new(),
            mirror: FibMirror::new(),
            fib,
            outbound: Vec::new(),
            local_events: Vec::new(),
            pending: BTreeSet::new(),
            resends: Vec::new(),
        }
    }

    pub fn router_id(&self) -> RouterId {
        self.router_id
    }

    pub fn update_seqno(&self) -> u16 {
        self.update_seqno
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn xroutes(&self) -> &XRouteTable {
        &self.xroutes
    }

    pub fn sources(&self) -> &SourceTable {
        &self.sources
    }

    pub fn mirror(&self) -> &FibMirror {
        &self.mirror
    }

    // ===== interface lifecycle =====

    pub fn enable_interface(&mut self, name: &str, ifindex: u32) {
        let conf = self.config.interface(name);
        self.interfaces.add(Interface::new(name, ifindex, conf));
    }

    pub fn disable_interface(&mut self, ifindex: u32, now: Timestamp) {
        let gone: Vec<NeighborKey> = self
            .neighbors
            .iter()
            .map(|n| n.key)
            .filter(|k| k.ifindex == ifindex)
            .collect();
        for key in gone {
            self.flush_neighbor(&key, now);
        }
        self.interfaces.remove(ifindex);
        self.flush_selection(now);
    }

    /// Link state change reported by the kernel watcher.
    pub fn set_interface_up(&mut self, ifindex: u32, up: bool, now: Timestamp) {
        if !self.interfaces.set_up(ifindex, up) {
            return;
        }
        let affected: Vec<RouteKey> = self
            .routes
            .all()
            .filter(|r| r.neighbor.ifindex == ifindex)
            .map(|r| r.key.clone())
            .collect();
        self.pending.extend(affected);
        self.flush_selection(now);
    }

    // ===== event dispatch =====

    /// Apply one packet's worth of events in order, then run the
    /// coalesced re-selection.
    pub fn handle_packet(&mut self, from: NeighborKey, events: Vec<ProtocolEvent>, now: Timestamp) {
        for event in events {
            self.handle_event(from, event, now);
        }
        self.flush_selection(now);
    }

    pub fn handle_event(&mut self, from: NeighborKey, event: ProtocolEvent, now: Timestamp) {
        if self.interfaces.get(from.ifindex).is_none() {
            // Packet from a link we no longer serve.
            return;
        }

        match event {
            ProtocolEvent::Hello {
                seqno,
                interval,
                unicast,
            } => {
                self.ensure_neighbor(from, now);
                if self.neighbors.note_hello(&from, unicast, seqno, interval, now) {
                    self.neighbor_changed(&from, now);
                }
            }
            ProtocolEvent::Ihu {
                rxcost, interval, ..
            } => {
                self.ensure_neighbor(from, now);
                if let Some(neigh) = self.neighbors.get_mut(&from) {
                    neigh.note_ihu(rxcost, interval, now);
                }
                self.neighbor_changed(&from, now);
            }
            ProtocolEvent::Update {
                router_id,
                key,
                seqno,
                metric,
                interval,
            } => self.handle_update(from, router_id, key, seqno, metric, interval, now),
            ProtocolEvent::RouteRequest { key } => self.handle_route_request(from, key, now),
            ProtocolEvent::SeqnoRequest {
                router_id,
                key,
                seqno,
                hop_count,
            } => self.handle_seqno_request(from, router_id, key, seqno, hop_count, now),
            ProtocolEvent::Ack { .. } => {}
        }
    }

    /// Record an RTT sample for a neighbor (fed by the timestamp
    /// machinery in the codec).
    pub fn note_rtt(&mut self, from: NeighborKey, rtt_us: u32, now: Timestamp) {
        if let Some(neigh) = self.neighbors.get_mut(&from) {
            neigh.note_rtt(rtt_us, now);
            self.neighbor_changed(&from, now);
            self.flush_selection(now);
        }
    }

    /// Count a malformed or unauthenticated packet against a neighbor.
    /// Returns true when responses to it should be rate-limited.
    pub fn note_protocol_violation(&mut self, from: NeighborKey, now: Timestamp) -> bool {
        match self.neighbors.get_mut(&from) {
            Some(neigh) => neigh.note_bad_packet(now),
            None => false,
        }
    }

    fn ensure_neighbor(&mut self, from: NeighborKey, now: Timestamp) {
        let Some(iface) = self.interfaces.get(from.ifindex) else {
            return;
        };
        let (_, created) = self.neighbors.find_or_create(from, iface, now);
        if created {
            self.local_events.push(LocalEvent::Neighbour {
                action: LocalAction::Add,
                address: from.address,
                ifindex: from.ifindex,
            });
        }
    }

    /// Flush a neighbor: cascade-flush its routes and cancel pending
    /// retransmits towards it.
    pub fn flush_neighbor(&mut self, key: &NeighborKey, now: Timestamp) {
        if self.neighbors.remove(key).is_none() {
            return;
        }
        let affected = self.routes.flush_neighbor(key);
        self.pending.extend(affected);
        self.resends.retain(|r| &r.dest != key);
        self.local_events.push(LocalEvent::Neighbour {
            action: LocalAction::Flush,
            address: key.address,
            ifindex: key.ifindex,
        });
        let _ = now;
    }

    /// A neighbor's cost changed: refresh the metrics of routes
    /// through it and queue their destinations.
    fn neighbor_changed(&mut self, nkey: &NeighborKey, now: Timestamp) {
        let Self {
            routes,
            neighbors,
            interfaces,
            local_events,
            ..
        } = self;
        let (neigh, iface) = match (neighbors.get(nkey), interfaces.get(nkey.ifindex)) {
            (Some(n), Some(i)) => (n, i),
            _ => return,
        };
        let affected = routes.recompute_neighbor(nkey, |tos| neigh.cost(iface, tos, now));
        local_events.push(LocalEvent::Neighbour {
            action: LocalAction::Change,
            address: nkey.address,
            ifindex: nkey.ifindex,
        });
        self.pending.extend(affected);
    }

    // ===== updates and feasibility =====

    #[allow(clippy::too_many_arguments)]
    fn handle_update(
        &mut self,
        from: NeighborKey,
        router_id: RouterId,
        mut key: RouteKey,
        seqno: u16,
        metric: u16,
        interval: u16,
        now: Timestamp,
    ) {
        self.ensure_neighbor(from, now);

        let Some(iface_name) = self.interfaces.get(from.ifindex).map(|i| i.name.clone()) else {
            return;
        };
        let result = self.config.filters.input(&FilterContext {
            key: &key,
            router_id: Some(&router_id),
            neigh: Some(from.address),
            ifindex: from.ifindex,
            ifname: Some(iface_name.as_str()),
            proto: None,
        });
        if result.is_deny() {
            return;
        }
        let refmetric = add_metric(metric, result.add_metric);
        if let Some(tos) = result.tos {
            key.tos = tos;
        }

        let skey = SourceKey {
            router_id,
            key: key.clone(),
        };

        if refmetric >= INFINITY {
            // Retraction: always accepted, but only meaningful if we
            // know the route.
            if self.routes.find(&key, &from).is_some() {
                let src = self
                    .sources
                    .find(&skey, seqno, true, now)
                    .expect("create requested");
                let cost = self.link_cost(&from, key.tos, now);
                self.routes
                    .update(&key, from, src, seqno, INFINITY, cost, interval, true, now);
                self.pending.insert(key);
            }
            return;
        }

        // A refresh carrying the exact pair the source table already
        // absorbed from this very route stays feasible.
        let feasible = self.sources.feasible(&skey, seqno, refmetric, now)
            || self.routes.find(&key, &from).is_some_and(|r| {
                r.feasible() && r.seqno == seqno && r.refmetric == refmetric
            });
        let src = self
            .sources
            .find(&skey, seqno, true, now)
            .expect("create requested");
        let cost = self.link_cost(&from, key.tos, now);
        self.routes.update(
            &key,
            from,
            src.clone(),
            seqno,
            refmetric,
            cost,
            interval,
            feasible,
            now,
        );

        if feasible {
            update_source(&src, seqno, refmetric, now);
            // A fresh-enough seqno satisfies any outstanding request.
            self.resends.retain(|r| {
                !(r.key == key && r.router_id == router_id && !seqno_less(seqno, r.seqno))
            });
        } else {
            // The route is kept as an uninstallable candidate; ask the
            // advertising neighbor for a fresher seqno.
            let wanted = seqno_plus(src.borrow().seqno, 1);
            debug!(key = %key, seqno = wanted, "unfeasible update, requesting seqno");
            self.outbound.push(OutboundEvent::SeqnoRequest {
                dest: Destination::Unicast {
                    ifindex: from.ifindex,
                    addr: from.address,
                },
                router_id,
                key: key.clone(),
                seqno: wanted,
                hop_count: SEQNO_REQUEST_HOPS,
            });
            self.schedule_resend(key.clone(), router_id, wanted, from, now);
        }
        self.pending.insert(key);
    }

    /// Arm (or refresh) the retransmit entry for a seqno request.
    fn schedule_resend(
        &mut self,
        key: RouteKey,
        router_id: RouterId,
        seqno: u16,
        dest: NeighborKey,
        now: Timestamp,
    ) {
        if let Some(entry) = self
            .resends
            .iter_mut()
            .find(|r| r.key == key && r.router_id == router_id && r.dest == dest)
        {
            if seqno_less(entry.seqno, seqno) {
                entry.seqno = seqno;
                entry.interval = RESEND_INTERVAL_MS;
                entry.attempts = RESEND_ATTEMPTS;
            }
            entry.next = now + entry.interval;
            return;
        }
        self.resends.push(PendingRequest {
            key,
            router_id,
            seqno,
            dest,
            next: now + RESEND_INTERVAL_MS,
            interval: RESEND_INTERVAL_MS,
            attempts: RESEND_ATTEMPTS,
        });
    }

    /// Retransmit overdue seqno requests with exponential backoff.
    fn check_resends(&mut self, now: Timestamp) {
        let mut due = Vec::new();
        self.resends.retain_mut(|r| {
            if now < r.next {
                return true;
            }
            r.attempts -= 1;
            due.push(OutboundEvent::SeqnoRequest {
                dest: Destination::Unicast {
                    ifindex: r.dest.ifindex,
                    addr: r.dest.address,
                },
                router_id: r.router_id,
                key: r.key.clone(),
                seqno: r.seqno,
                hop_count: SEQNO_REQUEST_HOPS,
            });
            r.interval *= 2;
            r.next = now + r.interval;
            r.attempts > 0
        });
        self.outbound.extend(due);
    }

    fn link_cost(&self, nkey: &NeighborKey, tos: Tos, now: Timestamp) -> u16 {
        match (
            self.neighbors.get(nkey),
            self.interfaces.get(nkey.ifindex),
        ) {
            (Some(neigh), Some(iface)) => neigh.cost(iface, tos, now),
            _ => INFINITY,
        }
    }

    // ===== requests =====

    fn handle_route_request(
        &mut self,
        from: NeighborKey,
        key: Option<RouteKey>,
        now: Timestamp,
    ) {
        match key {
            // Wildcard: full dump onto the requesting link.
            None => self.send_full_dump(from.ifindex, now),
            Some(key) => {
                if self.xroutes.find(&key).is_some() || self.routes.installed(&key).is_some() {
                    self.emit_update_for(&key, from.ifindex);
                } else {
                    // We know nothing: answer with a retraction.
                    self.outbound.push(OutboundEvent::Update {
                        dest: Destination::Multicast {
                            ifindex: from.ifindex,
                        },
                        router_id: self.router_id,
                        key,
                        seqno: self.update_seqno,
                        metric: INFINITY,
                    });
                }
            }
        }
    }

    fn handle_seqno_request(
        &mut self,
        from: NeighborKey,
        router_id: RouterId,
        key: RouteKey,
        seqno: u16,
        hop_count: u8,
        now: Timestamp,
    ) {
        let _ = now;
        if router_id == self.router_id {
            // Our own route: bump the seqno if needed and re-announce.
            if self.xroutes.find(&key).is_some() {
                if seqno_less(self.update_seqno, seqno) {
                    self.update_seqno = seqno;
                }
                self.emit_update_for(&key, from.ifindex);
            }
            return;
        }

        // Answer from the table if our installed route already
        // satisfies the request.
        let installed = self
            .routes
            .installed(&key)
            .map(|r| (r.source.borrow().key.router_id, r.seqno, r.neighbor));
        if let Some((rid, route_seqno, next_hop)) = installed {
            if rid == router_id && !seqno_less(route_seqno, seqno) {
                self.emit_update_for(&key, from.ifindex);
                return;
            }
            // Otherwise forward towards the next hop.
            if hop_count >= 2 && next_hop != from {
                self.outbound.push(OutboundEvent::SeqnoRequest {
                    dest: Destination::Unicast {
                        ifindex: next_hop.ifindex,
                        addr: next_hop.address,
                    },
                    router_id,
                    key,
                    seqno,
                    hop_count: hop_count - 1,
                });
            }
        }
    }

    // ===== selection =====

    /// Run the coalesced re-selection for every queued destination.
    pub fn flush_selection(&mut self, now: Timestamp) {
        while let Some(key) = self.pending.pop_first() {
            self.reselect(&key, now);
        }
    }

    fn reselect(&mut self, key: &RouteKey, _now: Timestamp) {
        let selection = self.routes.select(key);
        if !selection.changed() {
            // The installed route may have been dropped wholesale
            // (neighbor flush); the mirror must not keep the orphan.
            if selection.old.is_none()
                && selection.new.is_none()
                && self.mirror.get(key).is_some()
            {
                self.mirror.withdraw(self.fib.as_mut(), key);
                self.local_events.push(LocalEvent::Route {
                    action: LocalAction::Flush,
                    key: key.clone(),
                    metric: INFINITY,
                    installed: false,
                });
                let rid = self.router_id;
                self.announce(key, rid, self.update_seqno, INFINITY);
            }
            return;
        }

        match selection.new {
            Some(nkey) => {
                let (rid, seqno, metric) = {
                    let route = self.routes.installed(key).expect("just selected");
                    (
                        route.source.borrow().key.router_id,
                        route.seqno,
                        route.metric,
                    )
                };
                let ifname = self.interfaces.get(nkey.ifindex).map(|i| i.name.clone());
                let result = self.config.filters.install(&FilterContext {
                    key,
                    router_id: Some(&rid),
                    neigh: Some(nkey.address),
                    ifindex: nkey.ifindex,
                    ifname: ifname.as_deref(),
                    proto: None,
                });
                self.mirror.replace(
                    self.fib.as_mut(),
                    FibEntry {
                        key: key.clone(),
                        next_hop: nkey.address,
                        ifindex: nkey.ifindex,
                        table: result.table.unwrap_or(0),
                        pref_src: result.pref_src,
                    },
                );
                self.local_events.push(LocalEvent::Route {
                    action: if selection.old.is_none() {
                        LocalAction::Add
                    } else {
                        LocalAction::Change
                    },
                    key: key.clone(),
                    metric,
                    installed: true,
                });
                self.announce(key, rid, seqno, metric);
            }
            None => {
                self.mirror.withdraw(self.fib.as_mut(), key);
                self.local_events.push(LocalEvent::Route {
                    action: LocalAction::Flush,
                    key: key.clone(),
                    metric: INFINITY,
                    installed: false,
                });
                // Propagate the loss as a retraction.
                let rid = self.router_id;
                self.announce(key, rid, self.update_seqno, INFINITY);
            }
        }
    }

    /// Triggered update to every interface whose output filter admits
    /// the route.
    fn announce(&mut self, key: &RouteKey, router_id: RouterId, seqno: u16, metric: u16) {
        let mut updates = Vec::new();
        for iface in self.interfaces.iter().filter(|i| i.up()) {
            let result = self.config.filters.output(&FilterContext {
                key,
                router_id: Some(&router_id),
                neigh: None,
                ifindex: iface.ifindex,
                ifname: Some(iface.name.as_str()),
                proto: None,
            });
            if result.is_deny() {
                continue;
            }
            updates.push(OutboundEvent::Update {
                dest: Destination::Multicast {
                    ifindex: iface.ifindex,
                },
                router_id,
                key: key.clone(),
                seqno,
                metric: add_metric(metric, result.add_metric),
            });
        }
        self.outbound.extend(updates);
    }

    fn emit_update_for(&mut self, key: &RouteKey, ifindex: u32) {
        if let Some(xroute) = self.xroutes.find(key) {
            self.outbound.push(OutboundEvent::Update {
                dest: Destination::Multicast { ifindex },
                router_id: self.router_id,
                key: key.clone(),
                seqno: self.update_seqno,
                metric: xroute.metric,
            });
            return;
        }
        if let Some(route) = self.routes.installed(key) {
            let rid = route.source.borrow().key.router_id;
            let (seqno, metric) = (route.seqno, route.metric);
            self.outbound.push(OutboundEvent::Update {
                dest: Destination::Multicast { ifindex },
                router_id: rid,
                key: key.clone(),
                seqno,
                metric,
            });
        }
    }

    fn send_full_dump(&mut self, ifindex: u32, _now: Timestamp) {
        let keys: Vec<RouteKey> = self
            .xroutes
            .iter()
            .map(|x| x.key.clone())
            .chain(
                self.routes
                    .all()
                    .filter(|r| r.installed())
                    .map(|r| r.key.clone()),
            )
            .collect();
        for key in keys {
            self.emit_update_for(&key, ifindex);
        }
    }

    // ===== exported routes =====

    /// Add a statically exported prefix (from configuration).
    pub fn add_xroute(&mut self, mut xroute: XRoute) -> bool {
        let result = self.config.filters.redistribute(&FilterContext {
            key: &xroute.key,
            router_id: None,
            neigh: None,
            ifindex: xroute.ifindex,
            ifname: None,
            proto: Some(xroute.proto),
        });
        if result.is_deny() {
            return false;
        }
        xroute.metric = add_metric(xroute.metric, result.add_metric);
        if let Some(tos) = result.tos {
            xroute.key.tos = tos;
        }

        let key = xroute.key.clone();
        let metric = xroute.metric;
        if !self.xroutes.add(xroute) {
            return false;
        }
        self.local_events.push(LocalEvent::XRoute {
            action: LocalAction::Add,
            key: key.clone(),
            metric,
        });
        let rid = self.router_id;
        self.announce(&key, rid, self.update_seqno, metric);
        true
    }

    pub fn flush_xroute(&mut self, key: &RouteKey) {
        if self.xroutes.flush(key).is_some() {
            self.local_events.push(LocalEvent::XRoute {
                action: LocalAction::Flush,
                key: key.clone(),
                metric: INFINITY,
            });
            let rid = self.router_id;
            self.announce(key, rid, self.update_seqno, INFINITY);
        }
    }

    /// Reconcile exported host routes against the kernel's address
    /// list, one qualified copy per enabled DSCP value.
    pub fn check_xroutes(&mut self, _now: Timestamp) {
        let mut desired = Vec::new();
        for iface in self.interfaces.iter() {
            for addr in self.fib.list_local_addresses(iface.ifindex, false) {
                let mut tosses = vec![Tos::DEFAULT];
                tosses.extend(self.config.dscp_values.iter().map(|&d| Tos(d)));
                for tos in tosses {
                    let candidate = local_address_xroute(addr, iface.ifindex, tos);
                    let result = self.config.filters.redistribute(&FilterContext {
                        key: &candidate.key,
                        router_id: None,
                        neigh: None,
                        ifindex: iface.ifindex,
                        ifname: Some(iface.name.as_str()),
                        proto: Some(PROTO_LOCAL),
                    });
                    if result.is_deny() {
                        continue;
                    }
                    let mut candidate = candidate;
                    candidate.metric = add_metric(candidate.metric, result.add_metric);
                    desired.push(candidate);
                }
            }
        }

        let diff = self.xroutes.reconcile(PROTO_LOCAL, desired);
        let rid = self.router_id;
        for key in diff.added {
            let metric = self.xroutes.find(&key).map(|x| x.metric).unwrap_or(0);
            self.local_events.push(LocalEvent::XRoute {
                action: LocalAction::Add,
                key: key.clone(),
                metric,
            });
            self.announce(&key, rid, self.update_seqno, metric);
        }
        for key in diff.removed {
            self.local_events.push(LocalEvent::XRoute {
                action: LocalAction::Flush,
                key: key.clone(),
                metric: INFINITY,
            });
            self.announce(&key, rid, self.update_seqno, INFINITY);
        }
    }

    // ===== maintenance =====

    /// Sweep neighbors; returns the next desired wakeup in
    /// milliseconds, capped at 50 s.
    pub fn check_neighbours(&mut self, now: Timestamp) -> u64 {
        let outcome = self.neighbors.check(now);
        for key in outcome.flushed {
            let affected = self.routes.flush_neighbor(&key);
            self.pending.extend(affected);
            self.resends.retain(|r| r.dest != key);
            self.local_events.push(LocalEvent::Neighbour {
                action: LocalAction::Flush,
                address: key.address,
                ifindex: key.ifindex,
            });
        }
        for key in &outcome.changed {
            self.neighbor_changed(key, now);
        }
        self.flush_selection(now);
        outcome.wakeup_ms
    }

    /// The full periodic sweep: neighbor aging, source GC, route
    /// expiry and retraction finalisation. Returns the next wakeup.
    pub fn periodic(&mut self, now: Timestamp) -> u64 {
        let wakeup = self.check_neighbours(now);
        self.sources.expire(now);
        let affected = self.routes.expire(now);
        self.pending.extend(affected);
        self.flush_selection(now);
        self.check_resends(now);
        self.periodic_transmit(now);
        wakeup
    }

    /// Emit scheduled hellos, IHUs and update dumps whose intervals
    /// have elapsed.
    fn periodic_transmit(&mut self, now: Timestamp) {
        let mut events = Vec::new();
        let mut dump_ifaces = Vec::new();

        for iface in self.interfaces.iter_mut().filter(|i| i.up()) {
            let hello_ms = iface.conf.hello_interval_ms as u64;
            if now.saturating_sub(iface.last_hello_time) >= hello_ms {
                iface.last_hello_time = now;
                let seqno = iface.hello_seqno;
                iface.hello_seqno = seqno_plus(seqno, 1);
                events.push(OutboundEvent::Hello {
                    dest: Destination::Multicast {
                        ifindex: iface.ifindex,
                    },
                    seqno,
                    interval: (iface.conf.hello_interval_ms / 10).max(1),
                });
            }
            let update_ms = iface.conf.update_interval_ms as u64;
            if now.saturating_sub(iface.last_update_time) >= update_ms {
                iface.last_update_time = now;
                dump_ifaces.push(iface.ifindex);
            }
        }

        // IHUs ride along with the hellos.
        for neigh in self.neighbors.iter() {
            if let Some(iface) = self.interfaces.get(neigh.key.ifindex) {
                if events.iter().any(|e| {
                    matches!(e, OutboundEvent::Hello { dest, .. } if dest.ifindex() == iface.ifindex)
                }) {
                    events.push(OutboundEvent::Ihu {
                        dest: Destination::Multicast {
                            ifindex: iface.ifindex,
                        },
                        addr: neigh.key.address,
                        rxcost: neigh.rxcost(iface, now),
                        interval: (iface.conf.hello_interval_ms / 10).max(1) * 3,
                    });
                }
            }
        }

        self.outbound.extend(events);
        for ifindex in dump_ifaces {
            self.send_full_dump(ifindex, now);
        }
    }

    // ===== output drains =====

    pub fn drain_outbound(&mut self) -> Vec<OutboundEvent> {
        std::mem::take(&mut self.outbound)
    }

    pub fn drain_local_events(&mut self) -> Vec<LocalEvent> {
        std::mem::take(&mut self.local_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fib::RecordingFib;
    use crate::filter::{Filter, FilterResult};
    use std::cell::RefCell;
    use std::net::Ipv6Addr;
    use std::rc::Rc;

    fn nkey(last: u16) -> NeighborKey {
        NeighborKey {
            ifindex: 1,
            address: format!("fe80::{:x}", last).parse().unwrap(),
        }
    }

    fn rkey() -> RouteKey {
        RouteKey {
            prefix: "2001:db8::".parse().unwrap(),
            plen: 64,
            src_prefix: "::".parse().unwrap(),
            src_plen: 0,
            tos: Tos::DEFAULT,
        }
    }

    fn node() -> (BabelNode, Rc<RefCell<RecordingFib>>) {
        let fib = Rc::new(RefCell::new(RecordingFib::default()));
        let mut config = Config::default();
        config.router_id = Some([0xEE; 8]);
        let mut node = BabelNode::new(config, Box::new(fib.clone()));
        node.enable_interface("if0", 1);
        (node, fib)
    }

    /// Bring a neighbor to a known-reachable, known-cost state.
    fn establish(node: &mut BabelNode, from: NeighborKey, now: Timestamp) {
        for i in 0..4u16 {
            node.handle_packet(
                from,
                vec![
                    ProtocolEvent::Hello {
                        seqno: i,
                        interval: 100,
                        unicast: false,
                    },
                    ProtocolEvent::Ihu {
                        rxcost: 96,
                        interval: 300,
                        address: None,
                    },
                ],
                now + i as u64 * 1000,
            );
        }
    }

    fn update(rid: RouterId, seqno: u16, metric: u16) -> ProtocolEvent {
        ProtocolEvent::Update {
            router_id: rid,
            key: rkey(),
            seqno,
            metric,
            interval: 400,
        }
    }

    #[test]
    fn hello_creates_neighbor_and_notifies() {
        let (mut node, _fib) = node();
        node.handle_packet(
            nkey(1),
            vec![ProtocolEvent::Hello {
                seqno: 0,
                interval: 100,
                unicast: false,
            }],
            1000,
        );
        assert_eq!(node.neighbors().len(), 1);
        let events = node.drain_local_events();
        assert!(events.contains(&LocalEvent::Neighbour {
            action: LocalAction::Add,
            address: "fe80::1".parse().unwrap(),
            ifindex: 1,
        }));
    }

    #[test]
    fn update_installs_route_with_composed_metric() {
        let (mut node, fib) = node();
        establish(&mut node, nkey(1), 0);
        node.handle_packet(nkey(1), vec![update([1; 8], 5, 100)], 4000);

        let route = node.routes().installed(&rkey()).expect("route installed");
        // refmetric 100 plus link cost 96.
        assert_eq!(route.metric, 196);
        assert_eq!(node.mirror().len(), 1);
        assert_eq!(fib.borrow().installed.len(), 1);
        assert_eq!(
            fib.borrow().installed[0].next_hop,
            "fe80::1".parse::<Ipv6Addr>().unwrap()
        );

        // The installed route is announced back out.
        let announced = node
            .drain_outbound()
            .into_iter()
            .any(|e| matches!(e, OutboundEvent::Update { metric: 196, .. }));
        assert!(announced);
    }

    #[test]
    fn unfeasible_update_is_stored_but_not_installed() {
        let (mut node, _fib) = node();
        establish(&mut node, nkey(1), 0);
        node.handle_packet(nkey(1), vec![update([1; 8], 5, 80)], 4000);
        node.drain_outbound();

        // Same seqno, worse metric: not feasible.
        establish(&mut node, nkey(2), 0);
        node.handle_packet(nkey(2), vec![update([1; 8], 5, 90)], 4000);

        assert!(node.routes().find(&rkey(), &nkey(2)).is_some());
        assert_eq!(node.routes().installed(&rkey()).unwrap().neighbor, nkey(1));

        // A seqno request for seqno 6 goes back upstream.
        let requests: Vec<_> = node
            .drain_outbound()
            .into_iter()
            .filter(|e| matches!(e, OutboundEvent::SeqnoRequest { seqno: 6, .. }))
            .collect();
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn retraction_always_accepted_and_propagated() {
        let (mut node, fib) = node();
        establish(&mut node, nkey(1), 0);
        node.handle_packet(nkey(1), vec![update([1; 8], 5, 80)], 4000);
        node.drain_outbound();
        assert_eq!(node.mirror().len(), 1);

        // Retraction with an old seqno would be unfeasible as a normal
        // update; it must still take effect.
        node.handle_packet(nkey(1), vec![update([1; 8], 3, INFINITY)], 5000);
        assert!(node.mirror().is_empty());
        assert_eq!(fib.borrow().removed.len(), 1);

        let retractions: Vec<_> = node
            .drain_outbound()
            .into_iter()
            .filter(|e| matches!(e, OutboundEvent::Update { metric: INFINITY, .. }))
            .collect();
        assert!(!retractions.is_empty());
    }

    #[test]
    fn input_filter_denies_and_remetrics() {
        let (fib, mut config) = (
            Rc::new(RefCell::new(RecordingFib::default())),
            Config::default(),
        );
        config.router_id = Some([0xEE; 8]);
        config.filters.input = vec![
            Filter {
                router_id: Some([66; 8]),
                action: FilterResult::deny(),
                ..Filter::default()
            },
            Filter {
                action: FilterResult {
                    add_metric: 1000,
                    ..FilterResult::default()
                },
                ..Filter::default()
            },
        ];
        let mut node = BabelNode::new(config, Box::new(fib.clone()));
        node.enable_interface("if0", 1);
        establish(&mut node, nkey(1), 0);

        node.handle_packet(nkey(1), vec![update([66; 8], 5, 100)], 4000);
        assert!(node.routes().is_empty());

        node.handle_packet(nkey(1), vec![update([1; 8], 5, 100)], 4000);
        let route = node.routes().installed(&rkey()).unwrap();
        assert_eq!(route.refmetric, 1100);
    }

    #[test]
    fn neighbor_flush_cascades_to_routes() {
        let (mut node, _fib) = node();
        establish(&mut node, nkey(1), 0);
        node.handle_packet(nkey(1), vec![update([1; 8], 5, 80)], 4000);
        assert_eq!(node.mirror().len(), 1);

        node.flush_neighbor(&nkey(1), 5000);
        node.flush_selection(5000);
        assert!(node.routes().is_empty());
        assert!(node.mirror().is_empty());
        let events = node.drain_local_events();
        assert!(events.iter().any(|e| matches!(
            e,
            LocalEvent::Neighbour {
                action: LocalAction::Flush,
                ..
            }
        )));
    }

    #[test]
    fn silent_neighbor_is_flushed_by_maintenance() {
        let (mut node, _fib) = node();
        establish(&mut node, nkey(1), 0);
        node.handle_packet(nkey(1), vec![update([1; 8], 5, 80)], 4000);
        assert_eq!(node.mirror().len(), 1);

        let wakeup = node.check_neighbours(4000 + 301_000);
        assert!(wakeup <= 50_000);
        assert!(node.neighbors().is_empty());
        assert!(node.routes().is_empty());
        assert!(node.mirror().is_empty());
    }

    #[test]
    fn seqno_request_for_own_route_bumps_seqno() {
        let (mut node, _fib) = node();
        node.add_xroute(XRoute {
            key: rkey(),
            metric: 0,
            ifindex: 1,
            proto: crate::xroute::PROTO_STATIC,
        });
        node.drain_outbound();
        assert_eq!(node.update_seqno(), 0);

        establish(&mut node, nkey(1), 0);
        let rid = node.router_id();
        node.handle_packet(
            nkey(1),
            vec![ProtocolEvent::SeqnoRequest {
                router_id: rid,
                key: rkey(),
                seqno: 1,
                hop_count: 64,
            }],
            4000,
        );
        assert_eq!(node.update_seqno(), 1);
        let answered = node
            .drain_outbound()
            .into_iter()
            .any(|e| matches!(e, OutboundEvent::Update { seqno: 1, .. }));
        assert!(answered);
    }

    #[test]
    fn foreign_seqno_request_is_forwarded_upstream() {
        let (mut node, _fib) = node();
        establish(&mut node, nkey(1), 0);
        node.handle_packet(nkey(1), vec![update([1; 8], 5, 80)], 4000);
        node.drain_outbound();

        establish(&mut node, nkey(2), 0);
        node.handle_packet(
            nkey(2),
            vec![ProtocolEvent::SeqnoRequest {
                router_id: [1; 8],
                key: rkey(),
                seqno: 6,
                hop_count: 64,
            }],
            5000,
        );
        let forwarded: Vec<_> = node
            .drain_outbound()
            .into_iter()
            .filter(|e| {
                matches!(e, OutboundEvent::SeqnoRequest { seqno: 6, hop_count: 63, dest, .. }
                    if matches!(dest, Destination::Unicast { addr, .. } if *addr == nkey(1).address))
            })
            .collect();
        assert_eq!(forwarded.len(), 1);
    }

    #[test]
    fn wildcard_route_request_dumps_tables() {
        let (mut node, _fib) = node();
        node.add_xroute(XRoute {
            key: rkey(),
            metric: 10,
            ifindex: 1,
            proto: crate::xroute::PROTO_STATIC,
        });
        node.drain_outbound();

        establish(&mut node, nkey(1), 0);
        node.handle_packet(
            nkey(1),
            vec![ProtocolEvent::RouteRequest { key: None }],
            4000,
        );
        let updates: Vec<_> = node
            .drain_outbound()
            .into_iter()
            .filter(|e| matches!(e, OutboundEvent::Update { metric: 10, .. }))
            .collect();
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn local_addresses_become_xroutes_per_dscp() {
        let fib = Rc::new(RefCell::new(RecordingFib::default()));
        fib.borrow_mut()
            .addresses
            .push((1, "2001:db8::1".parse().unwrap()));
        let mut config = Config::default();
        config.router_id = Some([0xEE; 8]);
        config.dscp_values = vec![crate::tos::DSCP_AF21];
        let mut node = BabelNode::new(config, Box::new(fib));
        node.enable_interface("if0", 1);

        node.check_xroutes(1000);
        // One unqualified plus one AF21-qualified export.
        assert_eq!(node.xroutes().len(), 2);

        // Stable on the second pass.
        node.drain_local_events();
        node.check_xroutes(2000);
        assert!(node.drain_local_events().is_empty());
    }

    #[test]
    fn periodic_emits_hellos_and_ihus() {
        let (mut node, _fib) = node();
        establish(&mut node, nkey(1), 0);
        node.drain_outbound();

        node.periodic(10_000);
        let events = node.drain_outbound();
        assert!(events
            .iter()
            .any(|e| matches!(e, OutboundEvent::Hello { .. })));
        assert!(events.iter().any(|e| matches!(e, OutboundEvent::Ihu { .. })));
    }

    #[test]
    fn unanswered_seqno_request_is_retransmitted_with_backoff() {
        let (mut node, _fib) = node();
        establish(&mut node, nkey(1), 0);
        node.handle_packet(nkey(1), vec![update([1; 8], 5, 80)], 4000);

        establish(&mut node, nkey(2), 0);
        node.handle_packet(nkey(2), vec![update([1; 8], 5, 90)], 4000);
        node.drain_outbound();

        // First retransmit after the initial backoff.
        node.periodic(4000 + RESEND_INTERVAL_MS);
        let resent = node
            .drain_outbound()
            .into_iter()
            .filter(|e| matches!(e, OutboundEvent::SeqnoRequest { seqno: 6, .. }))
            .count();
        assert_eq!(resent, 1);

        // A satisfying update cancels the remaining attempts.
        node.handle_packet(nkey(2), vec![update([1; 8], 6, 90)], 7000);
        node.periodic(60_000);
        let resent = node
            .drain_outbound()
            .into_iter()
            .filter(|e| matches!(e, OutboundEvent::SeqnoRequest { .. }))
            .count();
        assert_eq!(resent, 0);
    }

    #[test]
    fn maintenance_is_idempotent_without_input() {
        let (mut node, _fib) = node();
        establish(&mut node, nkey(1), 0);
        node.handle_packet(nkey(1), vec![update([1; 8], 5, 80)], 4000);

        node.check_neighbours(4500);
        let installed_before = node.mirror().len();
        let neighbors_before = node.neighbors().len();
        node.check_neighbours(4500);
        assert_eq!(node.mirror().len(), installed_before);
        assert_eq!(node.neighbors().len(), neighbors_before);
    }
}
