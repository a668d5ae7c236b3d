// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Pattern and action lists, the shape the driver consumes.
//!
//! Items do not own their spec/mask/conf storage; they borrow it from
//! a caller-owned [`FlowItems`] arena (or, for action configuration,
//! from storage owned by the surrounding install). The borrow ends
//! when the driver call returns, which is exactly the lifetime the
//! hardware needs.

use hwflow_api::MacAddr;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::debug;

/// Initial capacity of a pattern or action list. Growth doubles.
const INITIAL_ITEMS: usize = 8;

/// Attributes of one rule: the pipeline table it lives in, its
/// priority within the table (lower wins), and direction/domain flags.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RuleAttr {
    pub group: u32,
    pub priority: u32,
    pub ingress: bool,
    pub egress: bool,
    pub transfer: bool,
}

/// A borrowed (spec, mask) pair for one pattern item.
#[derive(Debug)]
pub struct Pair<'a, T> {
    pub spec: &'a T,
    pub mask: &'a T,
}

// Derived Clone/Copy would demand `T: Copy`; the pair is two shared
// references and is always copiable.
impl<T> Clone for Pair<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Pair<'_, T> {}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EthSpec {
    pub src: MacAddr,
    pub dst: MacAddr,
    pub ether_type: u16,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VlanSpec {
    pub tci: u16,
    pub inner_type: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ipv4Spec {
    pub tos: u8,
    pub ttl: u8,
    pub next_proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Default for Ipv4Spec {
    fn default() -> Self {
        Self {
            tos: 0,
            ttl: 0,
            next_proto: 0,
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TcpSpec {
    pub src_port: u16,
    pub dst_port: u16,
    pub data_off: u8,
    pub flags: u8,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UdpSpec {
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SctpSpec {
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IcmpSpec {
    pub icmp_type: u8,
    pub icmp_code: u8,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VxlanSpec {
    pub flags: u8,
    pub vni: [u8; 3],
}

/// One pipeline match item. `Eth(None)` is the wildcard ethernet item:
/// some NICs refuse a rule with no L2 item at all, so "match any L2"
/// is expressed explicitly.
#[derive(Clone, Copy, Debug)]
pub enum PatternItem<'a> {
    Eth(Option<Pair<'a, EthSpec>>),
    Vlan(Pair<'a, VlanSpec>),
    Ipv4(Pair<'a, Ipv4Spec>),
    Tcp(Pair<'a, TcpSpec>),
    Udp(Pair<'a, UdpSpec>),
    Sctp(Pair<'a, SctpSpec>),
    Icmp(Pair<'a, IcmpSpec>),
    Vxlan(Pair<'a, VxlanSpec>),
    End,
}

impl fmt::Display for PatternItem<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Eth(None) => write!(f, "eth any"),
            Self::Eth(Some(p)) => write!(
                f,
                "eth spec src={} dst={} type={:#06x} / mask src={} dst={} type={:#06x}",
                p.spec.src, p.spec.dst, p.spec.ether_type,
                p.mask.src, p.mask.dst, p.mask.ether_type,
            ),
            Self::Vlan(p) => write!(
                f,
                "vlan spec tci={:#06x} / mask tci={:#06x} inner_type={:#06x}",
                p.spec.tci, p.mask.tci, p.mask.inner_type,
            ),
            Self::Ipv4(p) => write!(
                f,
                "ipv4 spec tos={:#x} ttl={} proto={} src={} dst={} / \
                 mask tos={:#x} ttl={:#x} proto={:#x} src={} dst={}",
                p.spec.tos, p.spec.ttl, p.spec.next_proto, p.spec.src, p.spec.dst,
                p.mask.tos, p.mask.ttl, p.mask.next_proto, p.mask.src, p.mask.dst,
            ),
            Self::Tcp(p) => write!(
                f,
                "tcp spec src={} dst={} flags={:#x} / mask src={:#06x} dst={:#06x} flags={:#x}",
                p.spec.src_port, p.spec.dst_port, p.spec.flags,
                p.mask.src_port, p.mask.dst_port, p.mask.flags,
            ),
            Self::Udp(p) => write!(
                f,
                "udp spec src={} dst={} / mask src={:#06x} dst={:#06x}",
                p.spec.src_port, p.spec.dst_port, p.mask.src_port, p.mask.dst_port,
            ),
            Self::Sctp(p) => write!(
                f,
                "sctp spec src={} dst={} / mask src={:#06x} dst={:#06x}",
                p.spec.src_port, p.spec.dst_port, p.mask.src_port, p.mask.dst_port,
            ),
            Self::Icmp(p) => write!(
                f,
                "icmp spec type={} code={} / mask type={:#x} code={:#x}",
                p.spec.icmp_type, p.spec.icmp_code, p.mask.icmp_type, p.mask.icmp_code,
            ),
            Self::Vxlan(p) => write!(
                f,
                "vxlan spec flags={:#x} vni={:02x}{:02x}{:02x} / mask vni={:02x}{:02x}{:02x}",
                p.spec.flags,
                p.spec.vni[0], p.spec.vni[1], p.spec.vni[2],
                p.mask.vni[0], p.mask.vni[1], p.mask.vni[2],
            ),
            Self::End => write!(f, "end"),
        }
    }
}

/// RSS configuration: spread across the given queue list with the
/// device's default hash.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RssConf {
    pub queues: Vec<u16>,
}

impl RssConf {
    pub fn all_queues(n: u16) -> Self {
        Self { queues: (0..n).collect() }
    }
}

/// One pipeline action item.
#[derive(Clone, Copy, Debug)]
pub enum ActionItem<'a> {
    /// Continue matching in another table. Targets must be numerically
    /// higher than the rule's own table.
    Jump { group: u32 },
    /// Count hits on this rule. One counter per rule, so no id.
    Count,
    /// Deliver to a hardware port.
    PortId { id: u16 },
    /// Tag the packet with a 24-bit mark that survives to software.
    Mark { id: u32 },
    /// Spread to receive queues.
    Rss(&'a RssConf),
    /// Prepend a raw precomputed header.
    RawEncap(&'a [u8]),
    /// Strip the outer vxlan encapsulation.
    VxlanDecap,
    End,
}

impl fmt::Display for ActionItem<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Jump { group } => write!(f, "jump group={group}"),
            Self::Count => write!(f, "count"),
            Self::PortId { id } => write!(f, "port_id {id}"),
            Self::Mark { id } => write!(f, "mark {id:#x}"),
            Self::Rss(conf) => write!(f, "rss over {} queues", conf.queues.len()),
            Self::RawEncap(data) => write!(f, "raw_encap {} bytes", data.len()),
            Self::VxlanDecap => write!(f, "vxlan_decap"),
            Self::End => write!(f, "end"),
        }
    }
}

/// A growable pattern list, terminated by [`PatternItem::End`] before
/// it reaches the driver.
#[derive(Debug, Default)]
pub struct PatternList<'a> {
    items: Vec<PatternItem<'a>>,
}

impl<'a> PatternList<'a> {
    pub fn new() -> Self {
        Self { items: Vec::with_capacity(INITIAL_ITEMS) }
    }

    pub fn push(&mut self, item: PatternItem<'a>) {
        debug!(item = %item, "flow pattern");
        self.items.push(item);
    }

    /// Append the end sentinel.
    pub fn finish(&mut self) {
        self.items.push(PatternItem::End);
    }

    pub fn items(&self) -> &[PatternItem<'a>] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A growable action list, terminated by [`ActionItem::End`].
#[derive(Debug, Default)]
pub struct ActionList<'a> {
    items: Vec<ActionItem<'a>>,
}

impl<'a> ActionList<'a> {
    pub fn new() -> Self {
        Self { items: Vec::with_capacity(INITIAL_ITEMS) }
    }

    pub fn push(&mut self, item: ActionItem<'a>) {
        debug!(item = %item, "flow action");
        self.items.push(item);
    }

    pub fn finish(&mut self) {
        self.items.push(ActionItem::End);
    }

    pub fn items(&self) -> &[ActionItem<'a>] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Storage for one rule's pattern specs and masks. The caller keeps
/// this alive until the install returns; the item lists only borrow
/// into it. Tuples are `(spec, mask)`.
#[derive(Debug, Default)]
pub struct FlowItems {
    pub eth: (EthSpec, EthSpec),
    pub vlan: (VlanSpec, VlanSpec),
    pub ipv4: (Ipv4Spec, Ipv4Spec),
    pub tcp: (TcpSpec, TcpSpec),
    pub udp: (UdpSpec, UdpSpec),
    pub sctp: (SctpSpec, SctpSpec),
    pub icmp: (IcmpSpec, IcmpSpec),
    pub vxlan: (VxlanSpec, VxlanSpec),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finish_appends_end() {
        let items = FlowItems::default();
        let mut patterns = PatternList::new();
        patterns.push(PatternItem::Eth(None));
        patterns.push(PatternItem::Ipv4(Pair {
            spec: &items.ipv4.0,
            mask: &items.ipv4.1,
        }));
        patterns.finish();

        assert_eq!(patterns.len(), 3);
        assert!(matches!(patterns.items()[2], PatternItem::End));
    }

    #[test]
    fn rss_covers_every_queue() {
        let rss = RssConf::all_queues(4);
        assert_eq!(rss.queues, vec![0, 1, 2, 3]);
    }

    #[test]
    fn empty_action_list_is_just_the_sentinel() {
        let mut actions = ActionList::new();
        actions.finish();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions.items()[0], ActionItem::End));
    }
}
