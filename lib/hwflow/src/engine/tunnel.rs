// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The tunnel registry.
//!
//! Hardware match registers are too narrow for a full tunnel 3-tuple,
//! so each distinct `(dst, src, tun_id)` is interned into a dense
//! 16-bit outer-id. Every offloaded flow matching on that tunnel holds
//! one reference; the id goes back to the pool when the last flow is
//! deleted. The reverse map serves the preprocessor, which must turn
//! an outer-id found in a miss context back into packet metadata.

use crate::engine::ids::IdPool;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::num::NonZeroU16;

/// Outer-ids come from `[1, 65536)`.
pub const OUTER_ID_BASE: u32 = 1;
pub const OUTER_ID_LIMIT: u32 = 65536;

/// The interned key: outer destination IP, source IP and tunnel id.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct TunnelTriple {
    pub ip_dst: Ipv4Addr,
    pub ip_src: Ipv4Addr,
    pub tun_id: u64,
}

impl fmt::Display for TunnelTriple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}->{}/{:#x}", self.ip_src, self.ip_dst, self.tun_id)
    }
}

/// A dense intern of one tunnel 3-tuple. The pool range starts at 1,
/// so the niche is free and `Option<OuterId>` costs nothing.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct OuterId(NonZeroU16);

impl OuterId {
    pub fn get(self) -> u16 {
        self.0.get()
    }
}

impl fmt::Display for OuterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "outer-id {}", self.0)
    }
}

#[derive(Clone, Copy, Debug)]
struct TunEntry {
    outer_id: OuterId,
    refs: u32,
}

#[derive(Debug)]
pub struct TunnelRegistry {
    by_key: DashMap<TunnelTriple, TunEntry>,
    by_id: DashMap<u16, TunnelTriple>,
    pool: IdPool,
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            by_key: DashMap::new(),
            by_id: DashMap::new(),
            pool: IdPool::new(OUTER_ID_BASE, OUTER_ID_LIMIT),
        }
    }

    /// Intern a tunnel 3-tuple: take a reference on the existing entry
    /// or allocate a fresh outer-id. Returns `None` when the pool is
    /// exhausted, in which case the registry is left untouched.
    pub fn get_or_alloc(&self, key: TunnelTriple) -> Option<OuterId> {
        match self.by_key.entry(key) {
            Entry::Occupied(mut e) => {
                e.get_mut().refs += 1;
                Some(e.get().outer_id)
            }
            Entry::Vacant(v) => {
                let raw = self.pool.alloc()? as u16;
                let outer_id = OuterId(NonZeroU16::new(raw).unwrap());
                self.by_id.insert(raw, key);
                let _ = v.insert(TunEntry { outer_id, refs: 1 });
                Some(outer_id)
            }
        }
    }

    /// Drop one reference. The entry is removed from both maps and the
    /// id returned to the pool when the count reaches zero.
    pub fn unref(&self, key: &TunnelTriple) {
        match self.by_key.entry(*key) {
            Entry::Occupied(mut e) => {
                e.get_mut().refs -= 1;
                if e.get().refs == 0 {
                    let id = e.get().outer_id.get();
                    self.by_id.remove(&id);
                    self.pool.free(id as u32);
                    e.remove();
                }
            }
            Entry::Vacant(_) => {
                panic!("tunnel refcount underflow for {key}");
            }
        }
    }

    /// Reverse lookup, used to restore packet metadata on a miss.
    pub fn lookup_by_id(&self, outer_id: OuterId) -> Option<TunnelTriple> {
        self.by_id.get(&outer_id.get()).map(|r| *r)
    }

    /// Number of live interned tuples.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn triple(dst: u32, src: u32, id: u64) -> TunnelTriple {
        TunnelTriple {
            ip_dst: Ipv4Addr::from(dst),
            ip_src: Ipv4Addr::from(src),
            tun_id: id,
        }
    }

    #[test]
    fn intern_hits_share_an_id() {
        let reg = TunnelRegistry::new();
        let a = reg.get_or_alloc(triple(1, 2, 100)).unwrap();
        let b = reg.get_or_alloc(triple(1, 2, 100)).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);

        let c = reg.get_or_alloc(triple(1, 2, 101)).unwrap();
        assert_ne!(a, c);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn last_unref_frees_both_maps_and_the_id() {
        let reg = TunnelRegistry::new();
        let key = triple(10, 20, 7);
        let id = reg.get_or_alloc(key).unwrap();
        reg.get_or_alloc(key).unwrap();

        reg.unref(&key);
        assert_eq!(reg.lookup_by_id(id), Some(key));

        reg.unref(&key);
        assert_eq!(reg.lookup_by_id(id), None);
        assert!(reg.is_empty());
        assert_eq!(reg.pool.in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn unref_of_unknown_tuple_panics() {
        let reg = TunnelRegistry::new();
        reg.unref(&triple(1, 1, 1));
    }

    #[test]
    fn exhaustion_returns_none_without_mutation() {
        let reg = TunnelRegistry::new();
        for i in 0..(OUTER_ID_LIMIT - OUTER_ID_BASE) as u64 {
            assert!(reg.get_or_alloc(triple(9, 9, i)).is_some());
        }

        let overflow = triple(9, 9, u64::MAX);
        assert_eq!(reg.get_or_alloc(overflow), None);
        assert_eq!(reg.len(), 65535);
        assert_eq!(reg.lookup_by_id(OuterId(NonZeroU16::new(1).unwrap())), Some(triple(9, 9, 0)));
        // The failed key was not half-inserted.
        assert!(reg.by_key.get(&overflow).is_none());
    }
}
