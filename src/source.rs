// src/source.rs
//! Source table: the feasibility memory of the protocol.
//!
//! For every (router-id, prefix, source prefix, TOS) a source records
//! the best (seqno, metric) pair this node has ever advertised or
//! accepted. The feasibility condition compares incoming updates
//! against it; refusing non-feasible updates is what keeps the
//! distance-vector computation loop-free.
//!
//! Routes hold strong references to their source; an entry is
//! garbage-collected once only the table itself still refers to it and
//! it has not been touched for [`SOURCE_GC_TIME_MS`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::routing::RouteKey;
use crate::util::{seqno_less, RouterId, Timestamp, INFINITY};

/// Unreferenced sources linger this long before collection.
pub const SOURCE_GC_TIME_MS: u64 = 200_000;

/// Identity of a source: the originating router and the qualified
/// destination it speaks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub router_id: RouterId,
    pub key: RouteKey,
}

#[derive(Debug)]
pub struct Source {
    pub key: SourceKey,
    pub seqno: u16,
    pub metric: u16,
    /// Last time this entry was updated or cited.
    pub time: Timestamp,
}

pub type SourceRef = Rc<RefCell<Source>>;

#[derive(Debug, Default)]
pub struct SourceTable {
    sources: HashMap<SourceKey, SourceRef>,
}

impl SourceTable {
    pub fn new() -> Self {
        SourceTable {
            sources: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, key: &SourceKey) -> Option<&SourceRef> {
        self.sources.get(key)
    }

    /// Look up a source, inserting a fresh entry with the given seqno
    /// and an infinite metric when `create` is set.
    pub fn find(
        &mut self,
        key: &SourceKey,
        seqno: u16,
        create: bool,
        now: Timestamp,
    ) -> Option<SourceRef> {
        if let Some(src) = self.sources.get(key) {
            return Some(src.clone());
        }
        if !create {
            return None;
        }
        let src = Rc::new(RefCell::new(Source {
            key: key.clone(),
            seqno,
            metric: INFINITY,
            time: now,
        }));
        self.sources.insert(key.clone(), src.clone());
        Some(src)
    }

    /// The feasibility condition. An update `(seqno, refmetric)` from
    /// the source's router is feasible iff it is a retraction, or
    /// strictly better than the recorded pair, or the record is stale.
    pub fn feasible(&self, key: &SourceKey, seqno: u16, refmetric: u16, now: Timestamp) -> bool {
        if refmetric >= INFINITY {
            // Retractions are always feasible.
            return true;
        }
        let src = match self.sources.get(key) {
            None => return true,
            Some(src) => src.borrow(),
        };
        if now.saturating_sub(src.time) >= SOURCE_GC_TIME_MS {
            // Never mind what is probably stale data.
            return true;
        }
        seqno_less(src.seqno, seqno) || (seqno == src.seqno && refmetric < src.metric)
    }

    /// Remove entries nobody references any more.
    pub fn expire(&mut self, now: Timestamp) {
        self.sources.retain(|_, src| {
            let expired =
                Rc::strong_count(src) == 1 && now.saturating_sub(src.borrow().time) >= SOURCE_GC_TIME_MS;
            if expired {
                debug!(?src, "expiring source");
            }
            !expired
        });
    }

    /// At teardown every route must have released its source.
    pub fn check_released(&self) {
        for src in self.sources.values() {
            debug_assert!(
                Rc::strong_count(src) == 1,
                "source still referenced at teardown: {:?}",
                src.borrow().key
            );
        }
    }
}

/// Feed a freshly accepted (seqno, metric) pair into a source.
///
/// Only improvements are recorded, unless the entry had gone stale, in
/// which case it is overwritten unconditionally. Retraction metrics are
/// never recorded.
pub fn update_source(src: &SourceRef, seqno: u16, metric: u16, now: Timestamp) {
    let mut src = src.borrow_mut();
    if metric >= INFINITY {
        return;
    }
    if now.saturating_sub(src.time) >= SOURCE_GC_TIME_MS
        || seqno_less(src.seqno, seqno)
        || (src.seqno == seqno && src.metric > metric)
    {
        src.seqno = seqno;
        src.metric = metric;
    }
    src.time = now;
}
