// src/interface.rs
//! Interface table for a Babel node.
//!
//! Each enabled link gets an [`Interface`] carrying its timers, nominal
//! cost and RTT penalty profile. Neighbours and exported routes refer to
//! interfaces by index.

use std::collections::HashMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::tos::RttProfile;
use crate::util::Timestamp;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct InterfaceFlags: u8 {
        /// Link is operationally up.
        const UP = 0x01;
        /// Estimate link quality from the hello bitmap (wireless-style).
        const LQ = 0x02;
        /// Timestamps enabled, RTT samples are collected.
        const TIMESTAMPS = 0x04;
    }
}

/// Per-interface configuration, as handed over by the config parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Multicast hello interval in milliseconds.
    pub hello_interval_ms: u16,
    /// Unicast hello interval in milliseconds (0 = no unicast hellos).
    pub uhello_interval_ms: u16,
    /// Update interval in milliseconds.
    pub update_interval_ms: u16,
    /// Nominal link cost.
    pub cost: u16,
    /// Estimate link quality (ETX-style) instead of the two-three rule.
    pub link_quality: bool,
    /// RTT below which no penalty applies, microseconds.
    pub rtt_min: u32,
    /// RTT above which the full penalty applies, microseconds.
    pub rtt_max: u32,
    /// Penalty added at `rtt_max`; 0 disables RTT-sensitive cost.
    pub max_rtt_penalty: u32,
    /// Send buffer size in bytes.
    pub buf_size: usize,
    /// Send buffer flush interval in milliseconds.
    pub flush_interval_ms: u16,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        InterfaceConfig {
            hello_interval_ms: 4000,
            uhello_interval_ms: 0,
            update_interval_ms: 16000,
            cost: 96,
            link_quality: false,
            rtt_min: 10_000,
            rtt_max: 120_000,
            max_rtt_penalty: 0,
            buf_size: 1400,
            flush_interval_ms: 40,
        }
    }
}

/// One enabled link.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub ifindex: u32,
    pub conf: InterfaceConfig,
    pub flags: InterfaceFlags,
    /// Seqno of the next multicast hello on this interface.
    pub hello_seqno: u16,
    /// When the last multicast hello went out.
    pub last_hello_time: Timestamp,
    /// When the last scheduled update went out.
    pub last_update_time: Timestamp,
}

impl Interface {
    pub fn new(name: &str, ifindex: u32, conf: InterfaceConfig) -> Self {
        let mut flags = InterfaceFlags::UP;
        if conf.link_quality {
            flags |= InterfaceFlags::LQ;
        }
        if conf.max_rtt_penalty > 0 {
            flags |= InterfaceFlags::TIMESTAMPS;
            // A sub-4µs rtt_min floors to 0 for the aggressive classes,
            // turning the penalty always-on for them.
            if conf.rtt_min < 4 {
                warn!(ifname = name, rtt_min = conf.rtt_min,
                      "rtt-min underflows per-class adjustment");
            }
        }
        Interface {
            name: name.to_string(),
            ifindex,
            conf,
            flags,
            hello_seqno: rand::random::<u16>(),
            last_hello_time: 0,
            last_update_time: 0,
        }
    }

    pub fn up(&self) -> bool {
        self.flags.contains(InterfaceFlags::UP)
    }

    pub fn link_quality(&self) -> bool {
        self.flags.contains(InterfaceFlags::LQ)
    }

    pub fn rtt_profile(&self) -> RttProfile {
        RttProfile {
            rtt_min: self.conf.rtt_min,
            rtt_max: self.conf.rtt_max,
            max_rtt_penalty: self.conf.max_rtt_penalty,
        }
    }
}

/// All enabled interfaces, keyed by kernel ifindex.
#[derive(Debug, Default)]
pub struct InterfaceTable {
    interfaces: HashMap<u32, Interface>,
}

impl InterfaceTable {
    pub fn new() -> Self {
        InterfaceTable {
            interfaces: HashMap::new(),
        }
    }

    pub fn add(&mut self, iface: Interface) -> &mut Interface {
        self.interfaces.entry(iface.ifindex).or_insert(iface)
    }

    pub fn get(&self, ifindex: u32) -> Option<&Interface> {
        self.interfaces.get(&ifindex)
    }

    pub fn get_mut(&mut self, ifindex: u32) -> Option<&mut Interface> {
        self.interfaces.get_mut(&ifindex)
    }

    /// Remove an interface on flush; the caller cascades neighbour and
    /// route cleanup.
    pub fn remove(&mut self, ifindex: u32) -> Option<Interface> {
        self.interfaces.remove(&ifindex)
    }

    pub fn set_up(&mut self, ifindex: u32, up: bool) -> bool {
        match self.interfaces.get_mut(&ifindex) {
            Some(iface) => {
                iface.flags.set(InterfaceFlags::UP, up);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Interface> {
        self.interfaces.values_mut()
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_interface_is_up() {
        let iface = Interface::new("eth0", 2, InterfaceConfig::default());
        assert!(iface.up());
        assert!(!iface.link_quality());
    }

    #[test]
    fn lq_config_sets_flag() {
        let conf = InterfaceConfig {
            link_quality: true,
            ..InterfaceConfig::default()
        };
        let iface = Interface::new("wlan0", 3, conf);
        assert!(iface.link_quality());
    }

    #[test]
    fn table_add_get_remove() {
        let mut table = InterfaceTable::new();
        table.add(Interface::new("eth0", 2, InterfaceConfig::default()));
        assert!(table.get(2).is_some());
        assert!(table.set_up(2, false));
        assert!(!table.get(2).unwrap().up());
        assert!(table.remove(2).is_some());
        assert!(table.get(2).is_none());
    }
}
