// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The hardware-table-id registry.
//!
//! Recirculation ids and physical port ids both intern into pipeline
//! table ids drawn from the dynamic range. The two key spaces are
//! independent maps sharing one pool. Allocation is lazy: the first
//! reference to a key claims a slot (for recirculation ids this is
//! where the hardware table would be created; port entries are
//! intern-only since a physical port dispatches through its own
//! table).

use crate::engine::ids::IdPool;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hwflow_api::DYNAMIC_TABLE_BASE;
use hwflow_api::DYNAMIC_TABLE_LIMIT;
use std::fmt;

/// A pipeline table id from the dynamic range.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HwTableId(pub u32);

impl fmt::Display for HwTableId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "table {}", self.0)
    }
}

#[derive(Clone, Copy, Debug)]
struct TblEntry {
    hw_id: HwTableId,
    refs: u32,
}

#[derive(Debug)]
pub struct TableIdRegistry {
    recirc: DashMap<u32, TblEntry>,
    port: DashMap<u32, TblEntry>,
    pool: IdPool,
}

impl Default for TableIdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TableIdRegistry {
    pub fn new() -> Self {
        Self {
            recirc: DashMap::new(),
            port: DashMap::new(),
            pool: IdPool::new(DYNAMIC_TABLE_BASE, DYNAMIC_TABLE_LIMIT),
        }
    }

    fn map(&self, is_port: bool) -> &DashMap<u32, TblEntry> {
        if is_port {
            &self.port
        } else {
            &self.recirc
        }
    }

    /// Reference the table id for `(key, is_port)`, allocating a slot
    /// on first use. Returns `None` when the pool is exhausted.
    pub fn get_or_alloc(&self, key: u32, is_port: bool) -> Option<HwTableId> {
        match self.map(is_port).entry(key) {
            Entry::Occupied(mut e) => {
                e.get_mut().refs += 1;
                Some(e.get().hw_id)
            }
            Entry::Vacant(v) => {
                let hw_id = HwTableId(self.pool.alloc()?);
                let _ = v.insert(TblEntry { hw_id, refs: 1 });
                Some(hw_id)
            }
        }
    }

    /// Drop one reference; the slot is returned to the pool at zero.
    pub fn unref(&self, key: u32, is_port: bool) {
        match self.map(is_port).entry(key) {
            Entry::Occupied(mut e) => {
                e.get_mut().refs -= 1;
                if e.get().refs == 0 {
                    self.pool.free(e.get().hw_id.0);
                    e.remove();
                }
            }
            Entry::Vacant(_) => {
                let space = if is_port { "port" } else { "recirc" };
                panic!("hw-table refcount underflow for {space} id {key}");
            }
        }
    }

    /// Number of live interned keys across both spaces.
    pub fn len(&self) -> usize {
        self.recirc.len() + self.port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recirc.is_empty() && self.port.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_spaces_are_independent() {
        let reg = TableIdRegistry::new();
        let a = reg.get_or_alloc(5, false).unwrap();
        let b = reg.get_or_alloc(5, true).unwrap();
        assert_ne!(a, b);
        assert!(a.0 >= DYNAMIC_TABLE_BASE && a.0 < DYNAMIC_TABLE_LIMIT);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn refs_share_the_slot() {
        let reg = TableIdRegistry::new();
        let a = reg.get_or_alloc(7, false).unwrap();
        let b = reg.get_or_alloc(7, false).unwrap();
        assert_eq!(a, b);

        reg.unref(7, false);
        reg.unref(7, false);
        assert!(reg.is_empty());

        // Slot is back in the pool for the next key.
        let c = reg.get_or_alloc(8, false).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn underflow_panics() {
        let reg = TableIdRegistry::new();
        reg.get_or_alloc(1, true).unwrap();
        reg.unref(1, false);
    }
}
