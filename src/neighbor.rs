// src/neighbor.rs
//! Neighbor tracking for a Babel node.
//!
//! This module handles:
//! - Tracking neighbors seen via Hello/IHU TLVs
//! - Reachability estimation (hello history bitmap)
//! - Link cost computation (rx/tx/rtt cost, TOS-qualified)
//! - Pruning unreachable and idle neighbors
//!
//! It is the logical layer above raw TLV parsing but below route
//! computation.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use tracing::{debug, warn};

use crate::interface::Interface;
use crate::packet::SendBuffer;
use crate::tos::Tos;
use crate::util::{interval_to_msec, seqno_minus, seqno_plus, Timestamp, INFINITY};

/// A neighbor with no hello for this long is flushed.
pub const NEIGHBOUR_IDLE_MS: u64 = 300_000;
/// Hello histories older than this contribute nothing to rxcost.
const HISTORY_STALE_MS: u64 = 180_000;
/// RTT samples older than this are discarded.
const RTT_STALE_MS: u64 = 180_000;
/// Protocol violations tolerated per window before responses are
/// rate-limited.
const BAD_PACKET_LIMIT: u32 = 10;
const BAD_PACKET_WINDOW_MS: u64 = 10_000;

/// Sliding window of recent hello receptions.
///
/// `reach` holds one bit per hello slot, MSB = most recent. `seqno` is
/// the last hello seqno heard; `None` until the first hello arrives.
/// `interval` is the advertised hello interval in centiseconds.
#[derive(Debug, Clone, Default)]
pub struct HelloHistory {
    pub seqno: Option<u16>,
    pub reach: u16,
    pub time: Timestamp,
    pub interval: u16,
}

impl HelloHistory {
    pub fn new() -> Self {
        HelloHistory::default()
    }

    /// Update the reachability bitmap.
    ///
    /// With `hello = None` this is the periodic sweep: slots the peer
    /// should have filled since `time` are shifted in as losses. With a
    /// concrete seqno the hello is recorded, handling peer reboots
    /// (seqno far in the past) and late, bufferbloated hellos (seqno
    /// slightly in the past). Returns whether cost-relevant state
    /// changed.
    pub fn update(&mut self, now: Timestamp, hello: Option<u16>, hello_interval: u16) -> bool {
        let mut changed = false;
        let mut missed: i32;

        match hello {
            None => {
                if self.interval > 0 {
                    let elapsed = now.saturating_sub(self.time) as i64;
                    missed = ((elapsed - self.interval as i64 * 7)
                        / (self.interval as i64 * 10)) as i32;
                } else {
                    missed = 16;
                }
                if missed <= 0 {
                    return false;
                }
                self.time += missed as u64 * interval_to_msec(self.interval);
            }
            Some(seqno) => {
                if let Some(prev) = self.seqno.filter(|_| self.reach > 0) {
                    missed = seqno_minus(seqno, prev) - 1;
                    if missed < -8 {
                        // Peer probably rebooted and lost its seqno.
                        self.reach = 0;
                        missed = 0;
                        changed = true;
                    } else if missed < 0 {
                        // Late hello, the link layer buffered packets
                        // during an outage.
                        self.reach <<= -missed;
                        missed = 0;
                        changed = true;
                    }
                } else {
                    missed = 0;
                }
                if hello_interval != 0 {
                    self.time = now;
                    self.interval = hello_interval;
                }
            }
        }

        if missed > 0 {
            if missed >= 16 {
                self.reach = 0;
            } else {
                self.reach >>= missed;
            }
            if let Some(prev) = self.seqno {
                self.seqno = Some(seqno_plus(prev, missed));
            }
            changed = true;
        }

        if let Some(seqno) = hello {
            self.seqno = Some(seqno);
            self.reach >>= 1;
            self.reach |= 0x8000;
            if (self.reach & 0xFC00) != 0xFC00 {
                changed = true;
            }
        }

        changed
    }
}

/// Identity of a neighbor: the link it lives on and its link-local
/// address. Routes refer to their next hop through this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NeighborKey {
    pub ifindex: u32,
    pub address: Ipv6Addr,
}

/// Representation of a Babel neighbor.
#[derive(Debug)]
pub struct Neighbor {
    pub key: NeighborKey,

    /// Multicast hello history.
    pub hello: HelloHistory,
    /// Unicast hello history.
    pub uhello: HelloHistory,

    /// Cost the peer reports for receiving from us, learned via IHU.
    pub txcost: u16,
    /// When the last IHU arrived (or txcost was reset).
    pub ihu_time: Timestamp,
    /// IHU interval advertised by the peer, centiseconds.
    pub ihu_interval: u16,

    /// Smoothed RTT estimate, microseconds. Only meaningful while
    /// [`Neighbor::valid_rtt`] holds.
    pub rtt: u32,
    /// When the last RTT sample was taken; 0 = never.
    pub rtt_time: Timestamp,

    /// Malformed or unauthenticated packets seen recently.
    pub bad_packets: u32,
    bad_packet_window: Timestamp,

    /// Deadlines for the external authentication layer's
    /// challenge/nonce exchange.
    pub challenge_deadline: Timestamp,
    pub challenge_request_limit: Timestamp,
    pub challenge_reply_limit: Timestamp,

    /// Outgoing TLVs pending for this neighbor.
    pub buf: SendBuffer,
}

impl Neighbor {
    fn new(key: NeighborKey, iface: &Interface, now: Timestamp) -> Self {
        Neighbor {
            key,
            hello: HelloHistory::new(),
            uhello: HelloHistory::new(),
            txcost: INFINITY,
            ihu_time: now,
            ihu_interval: 0,
            rtt: 0,
            rtt_time: 0,
            bad_packets: 0,
            bad_packet_window: 0,
            challenge_deadline: 0,
            challenge_request_limit: 0,
            challenge_reply_limit: 0,
            buf: SendBuffer::new(iface.conf.buf_size, iface.conf.flush_interval_ms),
        }
    }

    /// Record an IHU: the peer's rxcost is our txcost.
    pub fn note_ihu(&mut self, rxcost: u16, interval: u16, now: Timestamp) {
        self.txcost = rxcost;
        self.ihu_time = now;
        self.ihu_interval = interval;
    }

    /// Record an RTT sample, microseconds.
    pub fn note_rtt(&mut self, rtt: u32, now: Timestamp) {
        self.rtt = rtt;
        self.rtt_time = now;
    }

    /// Count a protocol violation; returns true once the neighbor is
    /// over threshold and responses should be rate-limited.
    pub fn note_bad_packet(&mut self, now: Timestamp) -> bool {
        if now.saturating_sub(self.bad_packet_window) > BAD_PACKET_WINDOW_MS {
            self.bad_packet_window = now;
            self.bad_packets = 0;
        }
        self.bad_packets += 1;
        self.bad_packets > BAD_PACKET_LIMIT
    }

    pub fn valid_rtt(&self, now: Timestamp) -> bool {
        self.rtt_time != 0 && now.saturating_sub(self.rtt_time) < RTT_STALE_MS
    }

    /// Age the txcost: with no recent IHU the advertised cost can no
    /// longer be trusted. Returns whether it changed.
    pub fn reset_txcost(&mut self, now: Timestamp) -> bool {
        let delay = now.saturating_sub(self.ihu_time);

        if self.ihu_interval > 0 && delay < interval_to_msec(self.ihu_interval) * 3 {
            return false;
        }

        // Losing a lot of packets means we probably lost an IHU too.
        if delay >= 180_000
            || (self.hello.reach & 0xFFF0) == 0
            || (self.ihu_interval > 0 && delay >= interval_to_msec(self.ihu_interval) * 10)
        {
            self.txcost = INFINITY;
            self.ihu_time = now;
            return true;
        }

        false
    }

    /// Receive cost estimated from the hello histories.
    pub fn rxcost(&self, iface: &Interface, now: Timestamp) -> u16 {
        let reach = self.hello.reach;
        let ureach = self.uhello.reach;
        let delay = now.saturating_sub(self.hello.time);
        let udelay = now.saturating_sub(self.uhello.time);

        if ((reach & 0xFFF0) == 0 || delay >= HISTORY_STALE_MS)
            && ((ureach & 0xFFF0) == 0 || udelay >= HISTORY_STALE_MS)
        {
            INFINITY
        } else if iface.link_quality() {
            // 15-bit signal reach, double-weighting the latest two slots.
            let sreach = ((reach & 0x8000) >> 2) + ((reach & 0x4000) >> 1) + (reach & 0x3FFF);
            let mut cost = (0x8000u64 * iface.conf.cost as u64) / (sreach as u64 + 1);
            if delay >= 40_000 {
                cost = (cost * (delay as u64 - 20_000) + 10_000) / 20_000;
            }
            cost.min(INFINITY as u64) as u16
        } else if two_three(reach) || two_three(ureach) {
            iface.conf.cost
        } else {
            INFINITY
        }
    }

    /// RTT penalty, qualified by the TOS class.
    pub fn rttcost(&self, iface: &Interface, tos: Tos, now: Timestamp) -> u32 {
        if iface.conf.max_rtt_penalty == 0 || !self.valid_rtt(now) {
            return 0;
        }

        // The unclassified sentinel coincides with DF, so unqualified
        // routes take the default profile.
        let profile = match tos.class().adjust(iface.rtt_profile()) {
            None => return 0,
            Some(p) => p,
        };

        if self.rtt <= profile.rtt_min {
            0
        } else if self.rtt <= profile.rtt_max {
            (profile.max_rtt_penalty as u64 * (self.rtt - profile.rtt_min) as u64
                / (profile.rtt_max - profile.rtt_min) as u64) as u32
        } else {
            profile.max_rtt_penalty
        }
    }

    /// Full link cost towards this neighbor for the given TOS.
    pub fn cost(&self, iface: &Interface, tos: Tos, now: Timestamp) -> u16 {
        if !iface.up() {
            return INFINITY;
        }

        let tx = self.txcost;
        if tx >= INFINITY {
            return INFINITY;
        }
        let rx = self.rxcost(iface, now);
        if rx >= INFINITY {
            return INFINITY;
        }

        let cost = if !iface.link_quality() || (tx < 256 && rx < 256) {
            tx as u64
        } else {
            // tx = 256/alpha, rx = 256/beta for delivery probabilities
            // alpha and beta; their product is plain ETX.
            let a = (tx as u64).max(256);
            let b = (rx as u64).max(256);
            (a * b + 128) >> 8
        };

        (cost + self.rttcost(iface, tos, now) as u64).min(INFINITY as u64) as u16
    }
}

/// To lose one hello is a misfortune, to lose two is carelessness.
fn two_three(reach: u16) -> bool {
    if (reach & 0xC000) == 0xC000 {
        true
    } else if (reach & 0xC000) == 0 {
        false
    } else {
        (reach & 0x2000) != 0
    }
}

/// Result of a maintenance sweep over the neighbor table.
#[derive(Debug, Default)]
pub struct CheckOutcome {
    /// Next desired wakeup, milliseconds.
    pub wakeup_ms: u64,
    /// Neighbors flushed; routes through them must be flushed too.
    pub flushed: Vec<NeighborKey>,
    /// Surviving neighbors whose cost-relevant state changed.
    pub changed: Vec<NeighborKey>,
}

/// Table of all known neighbors, keyed by (interface, address).
#[derive(Debug, Default)]
pub struct NeighborTable {
    neighbors: HashMap<NeighborKey, Neighbor>,
}

impl NeighborTable {
    pub fn new() -> Self {
        NeighborTable {
            neighbors: HashMap::new(),
        }
    }

    pub fn get(&self, key: &NeighborKey) -> Option<&Neighbor> {
        self.neighbors.get(key)
    }

    pub fn get_mut(&mut self, key: &NeighborKey) -> Option<&mut Neighbor> {
        self.neighbors.get_mut(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.values()
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Look up a neighbor, creating it on first contact. Returns the
    /// entry and whether it was created (the caller notifies monitors).
    pub fn find_or_create(
        &mut self,
        key: NeighborKey,
        iface: &Interface,
        now: Timestamp,
    ) -> (&mut Neighbor, bool) {
        let mut created = false;
        let neigh = self.neighbors.entry(key).or_insert_with(|| {
            debug!(address = %key.address, ifname = %iface.name, "creating neighbour");
            created = true;
            Neighbor::new(key, iface, now)
        });
        (neigh, created)
    }

    /// Drop a neighbor; the caller cascades route flush and the
    /// management notification.
    pub fn remove(&mut self, key: &NeighborKey) -> Option<Neighbor> {
        self.neighbors.remove(key)
    }

    /// Record a hello in the appropriate history. Returns whether
    /// cost-relevant state changed.
    pub fn note_hello(
        &mut self,
        key: &NeighborKey,
        unicast: bool,
        seqno: u16,
        interval: u16,
        now: Timestamp,
    ) -> bool {
        match self.neighbors.get_mut(key) {
            Some(neigh) => {
                let hist = if unicast {
                    &mut neigh.uhello
                } else {
                    &mut neigh.hello
                };
                if let Some(prev) = hist.seqno.filter(|_| hist.reach > 0) {
                    let d = seqno_minus(seqno, prev) - 1;
                    if (-8..0).contains(&d) {
                        warn!(address = %key.address, "late hello from bufferbloated neighbour");
                    }
                }
                hist.update(now, Some(seqno), interval)
            }
            None => false,
        }
    }

    /// Periodic sweep: age every history, reset stale txcosts and
    /// decide who must be flushed.
    ///
    /// The returned wakeup is capped at 50 s and reduced to the
    /// shortest advertised interval over surviving neighbors.
    pub fn check(&mut self, now: Timestamp) -> CheckOutcome {
        let mut out = CheckOutcome {
            wakeup_ms: 50_000,
            ..CheckOutcome::default()
        };

        let keys: Vec<NeighborKey> = self.neighbors.keys().copied().collect();
        for key in keys {
            let neigh = self.neighbors.get_mut(&key).expect("key just listed");

            let mut changed = neigh.hello.update(now, None, 0);
            changed |= neigh.uhello.update(now, None, 0);

            let hello_stale = neigh.hello.time > now // clock stepped
                || now.saturating_sub(neigh.hello.time) > NEIGHBOUR_IDLE_MS;
            if neigh.hello.reach == 0 || hello_stale {
                debug!(address = %key.address, "flushing neighbour");
                self.neighbors.remove(&key);
                out.flushed.push(key);
                continue;
            }

            let neigh = self.neighbors.get_mut(&key).expect("still present");
            changed |= neigh.reset_txcost(now);
            if changed {
                out.changed.push(key);
            }

            for interval in [
                neigh.hello.interval,
                neigh.uhello.interval,
                neigh.ihu_interval,
            ] {
                if interval > 0 {
                    out.wakeup_ms = out.wakeup_ms.min(interval_to_msec(interval));
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::InterfaceConfig;

    fn key() -> NeighborKey {
        NeighborKey {
            ifindex: 1,
            address: "fe80::1".parse().unwrap(),
        }
    }

    fn iface(cost: u16, lq: bool) -> Interface {
        Interface::new(
            "if0",
            1,
            InterfaceConfig {
                cost,
                link_quality: lq,
                ..InterfaceConfig::default()
            },
        )
    }

    fn iface_rtt(max_rtt_penalty: u32) -> Interface {
        Interface::new(
            "if0",
            1,
            InterfaceConfig {
                rtt_min: 10_000,
                rtt_max: 110_000,
                max_rtt_penalty,
                ..InterfaceConfig::default()
            },
        )
    }

    #[test]
    fn discovery_needs_two_hellos() {
        let iface = iface(96, false);
        let mut table = NeighborTable::new();
        let now = 10_000;

        let (neigh, created) = table.find_or_create(key(), &iface, now);
        assert!(created);
        assert_eq!(neigh.txcost, INFINITY);

        table.note_hello(&key(), false, 0, 100, now);
        let neigh = table.get(&key()).unwrap();
        assert_eq!(neigh.hello.reach, 0x8000);
        assert_eq!(neigh.rxcost(&iface, now), INFINITY);
        assert_eq!(neigh.cost(&iface, Tos::DEFAULT, now), INFINITY);

        table.note_hello(&key(), false, 1, 100, now + 1000);
        let neigh = table.get(&key()).unwrap();
        assert_eq!(neigh.hello.reach, 0xC000);
        assert_eq!(neigh.rxcost(&iface, now + 1000), 96);
    }

    #[test]
    fn late_hello_shifts_left() {
        let mut hist = HelloHistory {
            seqno: Some(10),
            reach: 0xFE00,
            time: 1000,
            interval: 100,
        };
        let changed = hist.update(2000, Some(8), 100);
        assert!(changed);
        // Left-shifted by the gap, then the late hello itself recorded.
        assert_eq!(hist.reach, 0xF800);
        assert_eq!(hist.seqno, Some(8));
    }

    #[test]
    fn rebooted_peer_resets_history() {
        let mut hist = HelloHistory {
            seqno: Some(1000),
            reach: 0xFF00,
            time: 1000,
            interval: 100,
        };
        let changed = hist.update(2000, Some(5), 100);
        assert!(changed);
        // Window cleared, then the new hello recorded.
        assert_eq!(hist.reach, 0x8000);
        assert_eq!(hist.seqno, Some(5));
    }

    #[test]
    fn sweep_ages_missed_slots() {
        let mut hist = HelloHistory {
            seqno: Some(7),
            reach: 0xFFFF,
            time: 0,
            interval: 100, // 1 s
        };
        // 3.5 intervals late: floor((3500 - 700) / 1000) = 2 missed.
        let changed = hist.update(3500, None, 0);
        assert!(changed);
        assert_eq!(hist.reach, 0x3FFF);
        assert_eq!(hist.seqno, Some(9));
        assert_eq!(hist.time, 2000);
    }

    #[test]
    fn sweep_within_interval_is_idempotent() {
        let mut hist = HelloHistory {
            seqno: Some(7),
            reach: 0xC000,
            time: 1000,
            interval: 100,
        };
        assert!(!hist.update(1500, None, 0));
        let before = hist.clone();
        assert!(!hist.update(1500, None, 0));
        assert_eq!(hist.reach, before.reach);
        assert_eq!(hist.seqno, before.seqno);
        assert_eq!(hist.time, before.time);
    }

    #[test]
    fn losing_a_hello_cannot_decrease_rxcost() {
        let iface = iface(96, true);
        let now = 1_000;
        let mut table = NeighborTable::new();
        table.find_or_create(key(), &iface, now);

        let full = {
            let neigh = table.get_mut(&key()).unwrap();
            neigh.hello = HelloHistory {
                seqno: Some(5),
                reach: 0xFFFF,
                time: now,
                interval: 100,
            };
            neigh.rxcost(&iface, now)
        };
        let lossy = {
            let neigh = table.get_mut(&key()).unwrap();
            neigh.hello.reach = 0xBFFF; // one recent hello lost
            neigh.rxcost(&iface, now)
        };
        assert!(lossy >= full);
    }

    #[test]
    fn rtt_penalty_follows_class_table() {
        let iface = iface_rtt(96);
        let now = 200_000;
        let mut table = NeighborTable::new();
        table.find_or_create(key(), &iface, now);
        let neigh = table.get_mut(&key()).unwrap();
        neigh.note_rtt(60_000, now); // 60 ms

        assert_eq!(neigh.rttcost(&iface, Tos::DEFAULT, now), 48);
        assert_eq!(neigh.rttcost(&iface, Tos(crate::tos::DSCP_AF21), now), 192);
        assert_eq!(neigh.rttcost(&iface, Tos(crate::tos::DSCP_AF11), now), 0);
    }

    #[test]
    fn stale_rtt_sample_is_ignored() {
        let iface = iface_rtt(96);
        let mut table = NeighborTable::new();
        table.find_or_create(key(), &iface, 0);
        let neigh = table.get_mut(&key()).unwrap();
        neigh.note_rtt(60_000, 1000);
        assert_eq!(neigh.rttcost(&iface, Tos::DEFAULT, 1000 + RTT_STALE_MS), 0);
    }

    #[test]
    fn txcost_reset_after_silence() {
        let iface = iface(96, false);
        let mut table = NeighborTable::new();
        table.find_or_create(key(), &iface, 0);
        let neigh = table.get_mut(&key()).unwrap();
        neigh.note_ihu(100, 400, 0); // 4 s IHU interval
        neigh.hello.reach = 0xFFFF;

        assert!(!neigh.reset_txcost(4_000));
        assert_eq!(neigh.txcost, 100);

        // 10 intervals of silence.
        assert!(neigh.reset_txcost(40_000));
        assert_eq!(neigh.txcost, INFINITY);
    }

    #[test]
    fn check_flushes_silent_neighbors() {
        let iface = iface(96, false);
        let mut table = NeighborTable::new();
        table.find_or_create(key(), &iface, 1000);
        table.note_hello(&key(), false, 0, 100, 1000);

        let out = table.check(1000 + NEIGHBOUR_IDLE_MS + 1_000);
        assert_eq!(out.flushed, vec![key()]);
        assert!(table.is_empty());
    }

    #[test]
    fn check_reduces_wakeup_to_hello_interval() {
        let iface = iface(96, false);
        let mut table = NeighborTable::new();
        table.find_or_create(key(), &iface, 1000);
        table.note_hello(&key(), false, 0, 100, 1000);

        let out = table.check(1500);
        assert!(table.get(&key()).is_some());
        assert_eq!(out.wakeup_ms, 1000);
    }

    #[test]
    fn bad_packet_rate_limit() {
        let iface = iface(96, false);
        let mut table = NeighborTable::new();
        table.find_or_create(key(), &iface, 0);
        let neigh = table.get_mut(&key()).unwrap();
        for _ in 0..BAD_PACKET_LIMIT {
            assert!(!neigh.note_bad_packet(100));
        }
        assert!(neigh.note_bad_packet(100));
        // A new window clears the counter.
        assert!(!neigh.note_bad_packet(100 + BAD_PACKET_WINDOW_MS + 1));
    }
}
