// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The datapath-port table.

use crate::driver::Netdev;
use crate::driver::RuleHandle;
use crate::driver::NETDEV_KIND_DPDK;
use crate::driver::NETDEV_KIND_VXLAN;
use crate::engine::flow_table::FlowTable;
use dashmap::DashMap;
use hwflow_api::DpPort;
use hwflow_api::MAX_PORT_TABLES;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortKind {
    Unknown,
    Dpdk,
    Vxlan,
}

impl PortKind {
    /// Classify from the netdev type string.
    pub fn from_type(ty: &str) -> Self {
        match ty {
            NETDEV_KIND_DPDK => Self::Dpdk,
            NETDEV_KIND_VXLAN => Self::Vxlan,
            _ => Self::Unknown,
        }
    }
}

/// One default rule, shared by every tunnel-pop flow that jumps from
/// its physical port into the slot's table.
#[derive(Clone, Copy, Debug)]
pub struct DefaultRule {
    pub handle: RuleHandle,
    pub refs: u32,
}

/// Per-datapath-port offload state.
pub struct PortRecord {
    pub dp_port: DpPort,
    pub kind: PortKind,
    pub netdev: Arc<dyn Netdev>,

    /// Physical ports only.
    pub hw_port_id: u16,
    pub n_rxq: u16,

    /// Virtual ports only.
    pub table_id: u32,
    pub exception_mark: u32,

    /// Default rules installed on this (physical) port, indexed by
    /// destination table id.
    pub(crate) default_rules: Mutex<[Option<DefaultRule>; MAX_PORT_TABLES]>,

    /// The flows whose in-port is this port.
    pub(crate) flows: FlowTable,
}

impl PortRecord {
    pub(crate) fn new(
        dp_port: DpPort,
        kind: PortKind,
        netdev: Arc<dyn Netdev>,
    ) -> Self {
        Self {
            dp_port,
            kind,
            netdev,
            hw_port_id: 0,
            n_rxq: 0,
            table_id: 0,
            exception_mark: 0,
            default_rules: Mutex::new([None; MAX_PORT_TABLES]),
            flows: FlowTable::new(),
        }
    }

    /// Destroy every default rule still installed on this port.
    pub(crate) fn destroy_default_rules(&self) {
        let mut slots = self.default_rules.lock();
        for slot in slots.iter_mut() {
            if let Some(rule) = slot.take() {
                if let Err(e) = self.netdev.rule_destroy(rule.handle) {
                    error!(
                        netdev = self.netdev.name(),
                        error = %e,
                        "default rule destroy failed"
                    );
                }
            }
        }
    }
}

impl core::fmt::Debug for PortRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("PortRecord")
            .field("dp_port", &self.dp_port)
            .field("kind", &self.kind)
            .field("netdev", &self.netdev.name())
            .field("n_flows", &self.flows.len())
            .finish()
    }
}

/// The process-wide port registry: dp-port to record, the mark
/// index the preprocessor uses, and the physical-port count that
/// sizes tunnel fan-out.
#[derive(Debug, Default)]
pub struct PortTable {
    ports: DashMap<u32, Arc<PortRecord>>,
    mark_to_port: DashMap<u32, Arc<PortRecord>>,
    n_phys: AtomicU32,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dp_port: DpPort) -> Option<Arc<PortRecord>> {
        self.ports.get(&dp_port.0).map(|r| Arc::clone(&r))
    }

    pub fn contains(&self, dp_port: DpPort) -> bool {
        self.ports.contains_key(&dp_port.0)
    }

    pub(crate) fn insert(&self, rec: Arc<PortRecord>) {
        if rec.kind == PortKind::Dpdk {
            self.n_phys.fetch_add(1, Ordering::Relaxed);
        }
        self.ports.insert(rec.dp_port.0, rec);
    }

    pub(crate) fn remove(&self, dp_port: DpPort) -> Option<Arc<PortRecord>> {
        let (_, rec) = self.ports.remove(&dp_port.0)?;
        if rec.kind == PortKind::Dpdk {
            self.n_phys.fetch_sub(1, Ordering::Relaxed);
        }
        Some(rec)
    }

    pub(crate) fn register_mark(&self, rec: &Arc<PortRecord>) {
        self.mark_to_port.insert(rec.exception_mark, Arc::clone(rec));
    }

    pub(crate) fn unregister_mark(&self, rec: &PortRecord) {
        self.mark_to_port.remove(&rec.exception_mark);
    }

    pub fn by_mark(&self, mark: u32) -> Option<Arc<PortRecord>> {
        self.mark_to_port.get(&mark).map(|r| Arc::clone(&r))
    }

    pub fn phys_count(&self) -> u32 {
        self.n_phys.load(Ordering::Relaxed)
    }

    /// Every physical uplink, the fan-out set for tunnel flows.
    pub fn uplinks(&self) -> Vec<Arc<PortRecord>> {
        self.ports
            .iter()
            .filter(|r| r.kind == PortKind::Dpdk && r.netdev.is_uplink())
            .map(|r| Arc::clone(&r))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_classification() {
        assert_eq!(PortKind::from_type("dpdk"), PortKind::Dpdk);
        assert_eq!(PortKind::from_type("vxlan"), PortKind::Vxlan);
        assert_eq!(PortKind::from_type("geneve"), PortKind::Unknown);
        assert_eq!(PortKind::from_type(""), PortKind::Unknown);
    }
}
