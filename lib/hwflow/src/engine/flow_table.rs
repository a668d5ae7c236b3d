// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Per-flow offload bookkeeping.
//!
//! One logical flow may produce several hardware rules; a vxlan flow,
//! for example, installs one rule per physical uplink. The offload
//! record binds the flow id to that rule vector plus every shared
//! resource the rules consumed, so `flow_del` can return the system to
//! its prior state.

use crate::driver::Netdev;
use crate::driver::RuleHandle;
use crate::engine::tunnel::TunnelTriple;
use dashmap::DashMap;
use hwflow_api::DpPort;
use hwflow_api::FlowId;
use std::sync::Arc;
use tracing::debug;
use tracing::error;

/// One installed rule and the device that owns it.
pub struct RuleEntry {
    pub handle: RuleHandle,
    pub netdev: Arc<dyn Netdev>,
}

impl core::fmt::Debug for RuleEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{} on {}", self.handle, self.netdev.name())
    }
}

/// References into the shared registries that die with the flow.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowResources {
    /// A reference on the tunnel registry.
    pub outer: Option<TunnelTriple>,
    /// A reference on the table registry for the match-side
    /// recirculation id.
    pub match_table: Option<u32>,
    /// A reference on the table registry for the action side:
    /// `(key, is_port)`.
    pub action_table: Option<(u32, bool)>,
    /// A reference on the default rule of `(physical port, table)`.
    pub default_rule: Option<(DpPort, u32)>,
    /// The miss context registered for this flow's mark.
    pub miss_mark: Option<u32>,
}

/// Observable lifecycle of an offload record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OffloadState {
    Empty,
    Partial,
    Installed,
}

/// The hardware rules owned by one logical flow id.
#[derive(Debug)]
pub struct OffloadRecord {
    pub flow_id: FlowId,
    capacity: usize,
    rules: Vec<RuleEntry>,
    pub resources: FlowResources,
}

impl OffloadRecord {
    /// `capacity` is fixed at allocation: 1 for local rules, the
    /// physical-port count for tunnel rules that fan out.
    pub fn new(flow_id: FlowId, capacity: usize) -> Self {
        Self {
            flow_id,
            capacity,
            rules: Vec::with_capacity(capacity),
            resources: FlowResources::default(),
        }
    }

    /// Track one installed rule. A rule arriving past capacity is
    /// destroyed on the spot and dropped; the port set changed under
    /// us and software keeps handling the flow.
    pub fn add_rule(&mut self, handle: RuleHandle, netdev: Arc<dyn Netdev>) {
        if self.rules.len() < self.capacity {
            self.rules.push(RuleEntry { handle, netdev });
        } else {
            error!(
                flow_id = %self.flow_id,
                capacity = self.capacity,
                "offload record overflow, destroying surplus rule"
            );
            if let Err(e) = netdev.rule_destroy(handle) {
                error!(netdev = netdev.name(), error = %e, "rule destroy failed");
            }
        }
    }

    pub fn state(&self) -> OffloadState {
        if self.rules.is_empty() {
            OffloadState::Empty
        } else if self.rules.len() < self.capacity {
            OffloadState::Partial
        } else {
            OffloadState::Installed
        }
    }

    pub fn rules(&self) -> &[RuleEntry] {
        &self.rules
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Destroy every rule this record holds.
    pub(crate) fn destroy_rules(&mut self) {
        debug!(flow_id = %self.flow_id, n = self.rules.len(), "destroying flow rules");
        for entry in self.rules.drain(..) {
            if let Err(e) = entry.netdev.rule_destroy(entry.handle) {
                error!(
                    netdev = entry.netdev.name(),
                    error = %e,
                    "rule destroy failed"
                );
            }
        }
    }
}

/// A per-port map from flow id to offload record.
#[derive(Debug, Default)]
pub struct FlowTable {
    map: DashMap<FlowId, OffloadRecord>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. Any record already present for the flow id is
    /// handed back; the caller destroys its rules and releases its
    /// resources.
    pub fn put(&self, rec: OffloadRecord) -> Option<OffloadRecord> {
        self.map.insert(rec.flow_id, rec)
    }

    /// Unlink a record from the table. The caller is responsible for
    /// destroying the rules and releasing the resources.
    pub fn remove(&self, flow_id: FlowId) -> Option<OffloadRecord> {
        self.map.remove(&flow_id).map(|(_, rec)| rec)
    }

    pub fn contains(&self, flow_id: FlowId) -> bool {
        self.map.contains_key(&flow_id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Take every record out of the table, for port teardown.
    pub fn drain(&self) -> Vec<OffloadRecord> {
        let ids: Vec<FlowId> = self.map.iter().map(|r| r.flow_id).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}
