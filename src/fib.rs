// src/fib.rs
//! Forwarding-table adapter and the core-owned mirror of installed
//! routes.
//!
//! The kernel integration itself lives outside the core; the core
//! talks to it through the [`Fib`] trait and keeps a [`FibMirror`] of
//! what it believes is installed. The mirror is the authority: at most
//! one entry per qualified destination.

use std::collections::HashMap;
use std::io;
use std::net::Ipv6Addr;

use tracing::debug;

use crate::routing::RouteKey;

/// One installed forwarding entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibEntry {
    pub key: RouteKey,
    pub next_hop: Ipv6Addr,
    pub ifindex: u32,
    /// Kernel routing table, 0 = main.
    pub table: u32,
    pub pref_src: Option<Ipv6Addr>,
}

/// Host forwarding-table operations the core consumes.
pub trait Fib {
    fn install(&mut self, entry: &FibEntry) -> io::Result<()>;
    fn remove(&mut self, key: &RouteKey) -> io::Result<()>;
    /// Addresses currently assigned to an interface.
    fn list_local_addresses(&self, ifindex: u32, link_local: bool) -> Vec<Ipv6Addr>;
}

/// A no-op adapter for hosts where the daemon must not touch the
/// kernel.
#[derive(Debug, Default)]
pub struct NullFib;

impl Fib for NullFib {
    fn install(&mut self, _entry: &FibEntry) -> io::Result<()> {
        Ok(())
    }

    fn remove(&mut self, _key: &RouteKey) -> io::Result<()> {
        Ok(())
    }

    fn list_local_addresses(&self, _ifindex: u32, _link_local: bool) -> Vec<Ipv6Addr> {
        Vec::new()
    }
}

/// Shared handle, letting tests keep a view on the adapter the node
/// owns.
impl<F: Fib> Fib for std::rc::Rc<std::cell::RefCell<F>> {
    fn install(&mut self, entry: &FibEntry) -> io::Result<()> {
        self.borrow_mut().install(entry)
    }

    fn remove(&mut self, key: &RouteKey) -> io::Result<()> {
        self.borrow_mut().remove(key)
    }

    fn list_local_addresses(&self, ifindex: u32, link_local: bool) -> Vec<Ipv6Addr> {
        self.borrow().list_local_addresses(ifindex, link_local)
    }
}

/// The core's view of the forwarding table.
#[derive(Debug, Default)]
pub struct FibMirror {
    entries: HashMap<RouteKey, FibEntry>,
}

impl FibMirror {
    pub fn new() -> Self {
        FibMirror {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &RouteKey) -> Option<&FibEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FibEntry> {
        self.entries.values()
    }

    /// Install or replace the entry for a destination. A send failure
    /// is logged and the mirror still records the intent; the kernel
    /// converges on the next change.
    pub fn replace(&mut self, fib: &mut dyn Fib, entry: FibEntry) {
        if self.entries.get(&entry.key) == Some(&entry) {
            return;
        }
        if let Err(err) = fib.install(&entry) {
            debug!(%err, key = %entry.key, "fib install failed");
        }
        self.entries.insert(entry.key.clone(), entry);
    }

    pub fn withdraw(&mut self, fib: &mut dyn Fib, key: &RouteKey) {
        if self.entries.remove(key).is_some() {
            if let Err(err) = fib.remove(key) {
                debug!(%err, key = %key, "fib remove failed");
            }
        }
    }
}

/// Test adapter recording every call.
#[derive(Debug, Default)]
pub struct RecordingFib {
    pub installed: Vec<FibEntry>,
    pub removed: Vec<RouteKey>,
    pub addresses: Vec<(u32, Ipv6Addr)>,
}

impl Fib for RecordingFib {
    fn install(&mut self, entry: &FibEntry) -> io::Result<()> {
        self.installed.push(entry.clone());
        Ok(())
    }

    fn remove(&mut self, key: &RouteKey) -> io::Result<()> {
        self.removed.push(key.clone());
        Ok(())
    }

    fn list_local_addresses(&self, ifindex: u32, link_local: bool) -> Vec<Ipv6Addr> {
        self.addresses
            .iter()
            .filter(|(idx, addr)| {
                *idx == ifindex && ((addr.segments()[0] == 0xfe80) == link_local)
            })
            .map(|(_, addr)| *addr)
            .collect()
    }
}
