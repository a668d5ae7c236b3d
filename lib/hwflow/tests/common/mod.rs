// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A mock netdev that records every rule the engine installs.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use hwflow::driver::DriverError;
use hwflow::driver::Netdev;
use hwflow::driver::RuleHandle;
use hwflow::engine::rule::ActionItem;
use hwflow::engine::rule::EthSpec;
use hwflow::engine::rule::IcmpSpec;
use hwflow::engine::rule::Ipv4Spec;
use hwflow::engine::rule::PatternItem;
use hwflow::engine::rule::RuleAttr;
use hwflow::engine::rule::SctpSpec;
use hwflow::engine::rule::TcpSpec;
use hwflow::engine::rule::UdpSpec;
use hwflow::engine::rule::VlanSpec;
use hwflow::engine::rule::VxlanSpec;
use hwflow_api::PacketMeta;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

/// Owned snapshot of one pattern item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OwnedPattern {
    EthAny,
    Eth { spec: EthSpec, mask: EthSpec },
    Vlan { spec: VlanSpec, mask: VlanSpec },
    Ipv4 { spec: Ipv4Spec, mask: Ipv4Spec },
    Tcp { spec: TcpSpec, mask: TcpSpec },
    Udp { spec: UdpSpec, mask: UdpSpec },
    Sctp { spec: SctpSpec, mask: SctpSpec },
    Icmp { spec: IcmpSpec, mask: IcmpSpec },
    Vxlan { spec: VxlanSpec, mask: VxlanSpec },
    End,
}

/// Owned snapshot of one action item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OwnedAction {
    Jump(u32),
    Count,
    PortId(u16),
    Mark(u32),
    Rss(Vec<u16>),
    RawEncap(Vec<u8>),
    VxlanDecap,
    End,
}

#[derive(Clone, Debug)]
pub struct CreatedRule {
    pub handle: RuleHandle,
    pub attr: RuleAttr,
    pub patterns: Vec<OwnedPattern>,
    pub actions: Vec<OwnedAction>,
}

fn own_patterns(items: &[PatternItem<'_>]) -> Vec<OwnedPattern> {
    items
        .iter()
        .map(|item| match item {
            PatternItem::Eth(None) => OwnedPattern::EthAny,
            PatternItem::Eth(Some(p)) => {
                OwnedPattern::Eth { spec: *p.spec, mask: *p.mask }
            }
            PatternItem::Vlan(p) => {
                OwnedPattern::Vlan { spec: *p.spec, mask: *p.mask }
            }
            PatternItem::Ipv4(p) => {
                OwnedPattern::Ipv4 { spec: *p.spec, mask: *p.mask }
            }
            PatternItem::Tcp(p) => {
                OwnedPattern::Tcp { spec: *p.spec, mask: *p.mask }
            }
            PatternItem::Udp(p) => {
                OwnedPattern::Udp { spec: *p.spec, mask: *p.mask }
            }
            PatternItem::Sctp(p) => {
                OwnedPattern::Sctp { spec: *p.spec, mask: *p.mask }
            }
            PatternItem::Icmp(p) => {
                OwnedPattern::Icmp { spec: *p.spec, mask: *p.mask }
            }
            PatternItem::Vxlan(p) => {
                OwnedPattern::Vxlan { spec: *p.spec, mask: *p.mask }
            }
            PatternItem::End => OwnedPattern::End,
        })
        .collect()
}

fn own_actions(items: &[ActionItem<'_>]) -> Vec<OwnedAction> {
    items
        .iter()
        .map(|item| match item {
            ActionItem::Jump { group } => OwnedAction::Jump(*group),
            ActionItem::Count => OwnedAction::Count,
            ActionItem::PortId { id } => OwnedAction::PortId(*id),
            ActionItem::Mark { id } => OwnedAction::Mark(*id),
            ActionItem::Rss(conf) => OwnedAction::Rss(conf.queues.clone()),
            ActionItem::RawEncap(data) => OwnedAction::RawEncap(data.to_vec()),
            ActionItem::VxlanDecap => OwnedAction::VxlanDecap,
            ActionItem::End => OwnedAction::End,
        })
        .collect()
}

pub struct MockNetdev {
    name: String,
    kind: &'static str,
    hw_port_id: u16,
    n_rxq: u16,
    uplink: bool,
    next_handle: AtomicU64,
    pub fail_create: AtomicBool,
    pub created: Mutex<Vec<CreatedRule>>,
    pub destroyed: Mutex<Vec<RuleHandle>>,
    pub popped: AtomicUsize,
}

impl MockNetdev {
    pub fn phys(name: &str, hw_port_id: u16, n_rxq: u16) -> Self {
        Self {
            name: name.to_string(),
            kind: "dpdk",
            hw_port_id,
            n_rxq,
            uplink: true,
            next_handle: AtomicU64::new(1),
            fail_create: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            popped: AtomicUsize::new(0),
        }
    }

    pub fn vxlan(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: "vxlan",
            hw_port_id: 0,
            n_rxq: 0,
            uplink: false,
            next_handle: AtomicU64::new(1),
            fail_create: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            popped: AtomicUsize::new(0),
        }
    }

    pub fn created_rules(&self) -> Vec<CreatedRule> {
        self.created.lock().unwrap().clone()
    }

    /// Rules created and not yet destroyed.
    pub fn live_rules(&self) -> Vec<CreatedRule> {
        let destroyed = self.destroyed.lock().unwrap();
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !destroyed.contains(&r.handle))
            .cloned()
            .collect()
    }

    pub fn n_destroyed(&self) -> usize {
        self.destroyed.lock().unwrap().len()
    }

    pub fn n_popped(&self) -> usize {
        self.popped.load(Ordering::Relaxed)
    }
}

impl Netdev for MockNetdev {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        self.kind
    }

    fn n_rxq(&self) -> u16 {
        self.n_rxq
    }

    fn hw_port_id(&self) -> u16 {
        self.hw_port_id
    }

    fn is_uplink(&self) -> bool {
        self.uplink
    }

    fn rule_create(
        &self,
        attr: &RuleAttr,
        patterns: &[PatternItem<'_>],
        actions: &[ActionItem<'_>],
    ) -> Result<RuleHandle, DriverError> {
        if self.fail_create.load(Ordering::Relaxed) {
            return Err(DriverError::new(1, "injected failure"));
        }

        let handle = RuleHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.created.lock().unwrap().push(CreatedRule {
            handle,
            attr: *attr,
            patterns: own_patterns(patterns),
            actions: own_actions(actions),
        });
        Ok(handle)
    }

    fn rule_destroy(&self, handle: RuleHandle) -> Result<(), DriverError> {
        let created = self.created.lock().unwrap();
        if !created.iter().any(|r| r.handle == handle) {
            return Err(DriverError::new(2, "unknown handle"));
        }
        drop(created);

        let mut destroyed = self.destroyed.lock().unwrap();
        if destroyed.contains(&handle) {
            return Err(DriverError::new(3, "handle destroyed twice"));
        }
        destroyed.push(handle);
        Ok(())
    }

    fn pop_header(&self, pkt: &mut PacketMeta) {
        self.popped.fetch_add(1, Ordering::Relaxed);
        pkt.tunnel = Default::default();
    }
}
