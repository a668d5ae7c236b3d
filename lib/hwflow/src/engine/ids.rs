// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Pools of small dense identifiers.

use parking_lot::Mutex;
use std::collections::BTreeSet;

/// A finite pool over the half-open range `[base, limit)`.
///
/// Allocation prefers the lowest free id. Freeing an id that was never
/// allocated, or freeing it twice, is a bug and panics.
#[derive(Debug)]
pub struct IdPool {
    base: u32,
    limit: u32,
    inner: Mutex<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    /// Ids below this cursor have been handed out at least once.
    next: u32,
    /// Returned ids available for reallocation.
    free: BTreeSet<u32>,
}

impl IdPool {
    pub fn new(base: u32, limit: u32) -> Self {
        assert!(base < limit, "empty id range [{base}, {limit})");
        Self { base, limit, inner: Mutex::new(PoolInner { next: base, free: BTreeSet::new() }) }
    }

    /// Hand out an id, or `None` when the pool is exhausted.
    pub fn alloc(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.free.first() {
            inner.free.remove(&id);
            return Some(id);
        }
        if inner.next < self.limit {
            let id = inner.next;
            inner.next += 1;
            return Some(id);
        }
        None
    }

    /// Return an id to the pool.
    pub fn free(&self, id: u32) {
        let mut inner = self.inner.lock();
        assert!(
            id >= self.base && id < inner.next,
            "freeing id {id} that was never allocated from [{}, {})",
            self.base,
            self.limit,
        );
        assert!(inner.free.insert(id), "double free of id {id}");
    }

    /// How many ids are currently handed out.
    pub fn in_use(&self) -> usize {
        let inner = self.inner.lock();
        (inner.next - self.base) as usize - inner.free.len()
    }
}
