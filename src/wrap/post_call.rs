//! Post-call site table and its lock-free address cache.
//!
//! A post-call site is the address a `call` returns to. Entries snapshot
//! the bytes immediately preceding the site; when a later lookup sees
//! different bytes the code has changed and the entry is discarded rather
//! than invalidated eagerly on unload.

use crate::{
    consts::{POSTCALL_CACHE_SIZE, POST_CALL_PRIOR_BYTES},
    host::HostRuntime,
};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        RwLock,
    },
};

use tracing::{debug, trace};

/// Callback invoked when a new post-call site is registered, letting tools
/// persist call-site knowledge across runs.
pub type PostCallNotify = fn(pc: u64);

#[derive(Debug, Clone)]
struct PostCallEntry {
    /// Whether some translation already carries the return hook.
    existing_instrumented: bool,
    /// Code bytes preceding the site at registration time.
    prior: [u8; POST_CALL_PRIOR_BYTES],
}

/// Table of known post-call sites.
///
/// The emission-hot path goes through a small array of atomic cells first;
/// a stale cache hit is safe because every miss re-checks the
/// authoritative table under the lock.
#[derive(Debug, Default)]
pub(crate) struct PostCallTable {
    table: RwLock<HashMap<u64, PostCallEntry>>,
    cache: [AtomicU64; POSTCALL_CACHE_SIZE],
    cache_idx: AtomicUsize,
    notify: RwLock<Vec<PostCallNotify>>,
}

impl PostCallTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn snapshot_prior(host: &dyn HostRuntime, pc: u64) -> [u8; POST_CALL_PRIOR_BYTES] {
        let mut prior = [0u8; POST_CALL_PRIOR_BYTES];
        if !host.safe_read(pc.wrapping_sub(POST_CALL_PRIOR_BYTES as u64), &mut prior) {
            // Unreadable now: carry on and invalidate on the next lookup.
            prior = [0u8; POST_CALL_PRIOR_BYTES];
        }
        prior
    }

    /// Register `pc` as a post-call site. `external` marks tool-driven
    /// registration, which skips the notify callbacks.
    pub(crate) fn add(&self, host: &dyn HostRuntime, pc: u64, external: bool) {
        let entry = PostCallEntry {
            existing_instrumented: false,
            prior: Self::snapshot_prior(host, pc),
        };
        let inserted = {
            let mut table = self.table.write().expect("post-call table poisoned");
            use std::collections::hash_map::Entry;
            match table.entry(pc) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                    true
                }
            }
        };
        if inserted {
            debug!(pc, external, "post-call site registered");
            if !external {
                for cb in self.notify.read().expect("notify list poisoned").iter() {
                    cb(pc);
                }
            }
        }
    }

    /// Whether `pc` is a known post-call site, via the atomic cache.
    pub(crate) fn contains_cached(&self, pc: u64) -> bool {
        if self.cache.iter().any(|cell| cell.load(Ordering::Relaxed) == pc) {
            return true;
        }
        let hit = self
            .table
            .read()
            .expect("post-call table poisoned")
            .contains_key(&pc);
        if hit {
            let idx = self.cache_idx.fetch_add(1, Ordering::Relaxed) % POSTCALL_CACHE_SIZE;
            self.cache[idx].store(pc, Ordering::Relaxed);
        }
        hit
    }

    /// Lookup on the translation path: validates the prior-bytes snapshot,
    /// discarding the entry on mismatch, and marks the site instrumented
    /// on success.
    pub(crate) fn lookup_for_instru(&self, host: &dyn HostRuntime, pc: u64) -> bool {
        let consistent = {
            let table = self.table.read().expect("post-call table poisoned");
            match table.get(&pc) {
                None => return false,
                Some(entry) => entry.prior == Self::snapshot_prior(host, pc),
            }
        };
        if !consistent {
            // The code changed under us; drop the stale entry and purge
            // the cache.
            debug!(pc, "post-call prior bytes mismatch: discarding entry");
            let mut table = self.table.write().expect("post-call table poisoned");
            table.remove(&pc);
            for cell in &self.cache {
                let _ = cell.compare_exchange(pc, 0, Ordering::Relaxed, Ordering::Relaxed);
            }
            return false;
        }
        let mut table = self.table.write().expect("post-call table poisoned");
        if let Some(entry) = table.get_mut(&pc) {
            trace!(pc, "post-call site instrumented");
            entry.existing_instrumented = true;
        }
        true
    }

    /// Whether some translation already carries the return hook for `pc`.
    pub(crate) fn is_instrumented(&self, pc: u64) -> bool {
        self.table
            .read()
            .expect("post-call table poisoned")
            .get(&pc)
            .map_or(false, |e| e.existing_instrumented)
    }

    pub(crate) fn register_notify(&self, cb: PostCallNotify) {
        self.notify.write().expect("notify list poisoned").push(cb);
    }

    pub(crate) fn unregister_notify(&self, cb: PostCallNotify) -> bool {
        let mut list = self.notify.write().expect("notify list poisoned");
        let before = list.len();
        list.retain(|&existing| existing as usize != cb as usize);
        list.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::Emulator;

    #[test]
    fn add_lookup_and_discard_on_code_change() {
        let mut em = Emulator::new();
        em.map_bytes(0x3000, &[0xaa; 0x20]);
        let table = PostCallTable::new();
        table.add(&em, 0x3010, false);
        assert!(table.lookup_for_instru(&em, 0x3010));
        assert!(table.is_instrumented(0x3010));
        assert!(table.contains_cached(0x3010));

        // Change the bytes preceding the site: entry must be discarded.
        em.map_bytes(0x300a, &[0xbb; POST_CALL_PRIOR_BYTES]);
        assert!(!table.lookup_for_instru(&em, 0x3010));
        assert!(!table.contains_cached(0x3010));
    }

    #[test]
    fn external_add_skips_notify() {
        static NOTIFIED: AtomicUsize = AtomicUsize::new(0);
        fn count(_pc: u64) {
            NOTIFIED.fetch_add(1, Ordering::Relaxed);
        }
        let mut em = Emulator::new();
        em.map_bytes(0x4000, &[0x11; 0x20]);
        let table = PostCallTable::new();
        table.register_notify(count);
        table.add(&em, 0x4008, true);
        table.add(&em, 0x4010, false);
        assert_eq!(NOTIFIED.load(Ordering::Relaxed), 1);
        assert!(table.unregister_notify(count));
    }
}
