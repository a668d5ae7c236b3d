// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Pattern and action synthesis.
//!
//! Synthesis is two-phase: first the spec/mask values are written into
//! a [`FlowItems`] arena, then the item list is assembled borrowing
//! from it. The split keeps the borrow checker happy about the one
//! mutation the original hardware contract requires: once an L4 item
//! carries the protocol constraint, the IPv4 next-proto mask must be
//! cleared.

use crate::driver::DriverError;
use crate::driver::Netdev;
use crate::driver::RuleHandle;
use crate::engine::rule::ActionItem;
use crate::engine::rule::ActionList;
use crate::engine::rule::EthSpec;
use crate::engine::rule::FlowItems;
use crate::engine::rule::Ipv4Spec;
use crate::engine::rule::Pair;
use crate::engine::rule::PatternItem;
use crate::engine::rule::PatternList;
use crate::engine::rule::RssConf;
use crate::engine::rule::RuleAttr;
use crate::engine::Result;
use hwflow_api::Match;
use hwflow_api::OffloadError;
use hwflow_api::ETH_TYPE_IP;
use hwflow_api::IPPROTO_ICMP;
use hwflow_api::IPPROTO_SCTP;
use hwflow_api::IPPROTO_TCP;
use hwflow_api::IPPROTO_UDP;
use hwflow_api::ROOT_TABLE_ID;
use hwflow_api::UNKNOWN_TABLE_ID;
use hwflow_api::VLAN_CFI;
use tracing::debug;

/// Which items of a [`FlowItems`] arena a rule uses, in emit order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Layout {
    pub eth_spec: bool,
    pub vlan: bool,
    pub ipv4: bool,
    pub l4: Option<L4Kind>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum L4Kind {
    Tcp,
    Udp,
    Sctp,
    Icmp,
}

/// Fill the arena from a match and record which items apply.
pub fn match_flow_items(m: &Match, items: &mut FlowItems) -> Result<Layout> {
    let flow = &m.flow;
    let masks = &m.wc.masks;
    let mut layout = Layout::default();

    // Eth. A flow without L2 constraints still gets a wildcard eth
    // item at emit time; some NICs refuse rules with no L2 item.
    if !masks.dl_src.is_zero() || !masks.dl_dst.is_zero() {
        items.eth.0 = EthSpec {
            src: flow.dl_src,
            dst: flow.dl_dst,
            ether_type: flow.dl_type,
        };
        items.eth.1 = EthSpec {
            src: masks.dl_src,
            dst: masks.dl_dst,
            ether_type: masks.dl_type,
        };
        layout.eth_spec = true;
    }

    // VLAN.
    if masks.vlan_tci != 0 && flow.vlan_tci != 0 {
        items.vlan.0.tci = flow.vlan_tci & !VLAN_CFI;
        items.vlan.1.tci = masks.vlan_tci & !VLAN_CFI;
        // Match any inner protocol.
        items.vlan.1.inner_type = 0;
        layout.vlan = true;
    }

    // IPv4.
    let mut proto = 0;
    if flow.dl_type == ETH_TYPE_IP {
        items.ipv4.0 = Ipv4Spec {
            tos: flow.nw_tos,
            ttl: flow.nw_ttl,
            next_proto: flow.nw_proto,
            src: flow.nw_src,
            dst: flow.nw_dst,
        };
        items.ipv4.1 = Ipv4Spec {
            tos: masks.nw_tos,
            ttl: masks.nw_ttl,
            next_proto: masks.nw_proto,
            src: masks.nw_src,
            dst: masks.nw_dst,
        };
        layout.ipv4 = true;
        proto = flow.nw_proto & masks.nw_proto;
    }

    if !matches!(proto, IPPROTO_ICMP | IPPROTO_UDP | IPPROTO_SCTP | IPPROTO_TCP)
        && (masks.tp_src != 0 || masks.tp_dst != 0 || masks.tcp_flags != 0)
    {
        debug!(proto, "L4 protocol not supported");
        return Err(OffloadError::Unsupported("l4 protocol"));
    }

    if (masks.tp_src != 0 && masks.tp_src != u16::MAX)
        || (masks.tp_dst != 0 && masks.tp_dst != u16::MAX)
    {
        return Err(OffloadError::Unsupported("partial l4 port mask"));
    }

    match proto {
        IPPROTO_TCP => {
            items.tcp.0.src_port = flow.tp_src;
            items.tcp.0.dst_port = flow.tp_dst;
            items.tcp.0.data_off = (flow.tcp_flags >> 8) as u8;
            items.tcp.0.flags = flow.tcp_flags as u8;

            items.tcp.1.src_port = masks.tp_src;
            items.tcp.1.dst_port = masks.tp_dst;
            items.tcp.1.data_off = (masks.tcp_flags >> 8) as u8;
            items.tcp.1.flags = masks.tcp_flags as u8;

            // The TCP item is the proto constraint.
            items.ipv4.1.next_proto = 0;
            layout.l4 = Some(L4Kind::Tcp);
        }
        IPPROTO_UDP => {
            items.udp.0.src_port = flow.tp_src;
            items.udp.0.dst_port = flow.tp_dst;
            items.udp.1.src_port = masks.tp_src;
            items.udp.1.dst_port = masks.tp_dst;

            items.ipv4.1.next_proto = 0;
            layout.l4 = Some(L4Kind::Udp);
        }
        IPPROTO_SCTP => {
            items.sctp.0.src_port = flow.tp_src;
            items.sctp.0.dst_port = flow.tp_dst;
            items.sctp.1.src_port = masks.tp_src;
            items.sctp.1.dst_port = masks.tp_dst;

            items.ipv4.1.next_proto = 0;
            layout.l4 = Some(L4Kind::Sctp);
        }
        IPPROTO_ICMP => {
            items.icmp.0.icmp_type = flow.tp_src as u8;
            items.icmp.0.icmp_code = flow.tp_dst as u8;
            items.icmp.1.icmp_type = masks.tp_src as u8;
            items.icmp.1.icmp_code = masks.tp_dst as u8;

            items.ipv4.1.next_proto = 0;
            layout.l4 = Some(L4Kind::Icmp);
        }
        _ => {}
    }

    Ok(layout)
}

/// Assemble the pattern items a [`Layout`] selected.
pub fn emit_match<'a>(
    items: &'a FlowItems,
    layout: Layout,
    patterns: &mut PatternList<'a>,
) {
    if layout.eth_spec {
        patterns.push(PatternItem::Eth(Some(Pair {
            spec: &items.eth.0,
            mask: &items.eth.1,
        })));
    } else {
        patterns.push(PatternItem::Eth(None));
    }

    if layout.vlan {
        patterns.push(PatternItem::Vlan(Pair {
            spec: &items.vlan.0,
            mask: &items.vlan.1,
        }));
    }

    if layout.ipv4 {
        patterns.push(PatternItem::Ipv4(Pair {
            spec: &items.ipv4.0,
            mask: &items.ipv4.1,
        }));
    }

    match layout.l4 {
        Some(L4Kind::Tcp) => patterns.push(PatternItem::Tcp(Pair {
            spec: &items.tcp.0,
            mask: &items.tcp.1,
        })),
        Some(L4Kind::Udp) => patterns.push(PatternItem::Udp(Pair {
            spec: &items.udp.0,
            mask: &items.udp.1,
        })),
        Some(L4Kind::Sctp) => patterns.push(PatternItem::Sctp(Pair {
            spec: &items.sctp.0,
            mask: &items.sctp.1,
        })),
        Some(L4Kind::Icmp) => patterns.push(PatternItem::Icmp(Pair {
            spec: &items.icmp.0,
            mask: &items.icmp.1,
        })),
        None => {}
    }
}

/// The 3-byte VNI carried in the high 32 bits of a tunnel id.
pub fn vni_bytes(tun_id: u64) -> [u8; 3] {
    let v = ((tun_id >> 32) as u32).to_be_bytes();
    [v[1], v[2], v[3]]
}

/// Fill the arena with the outer-header items of a vxlan flow: IPv4
/// with the next protocol pinned to UDP, the UDP tunnel ports, and the
/// VNI.
pub fn vxlan_flow_items(m: &Match, items: &mut FlowItems) -> Result<()> {
    let tun = &m.flow.tunnel;
    let tun_masks = &m.wc.masks.tunnel;

    if m.flow.dl_type != ETH_TYPE_IP {
        return Err(OffloadError::Unsupported("non-ipv4 tunnel"));
    }

    items.ipv4.0 = Ipv4Spec {
        tos: tun.ip_tos,
        ttl: tun.ip_ttl,
        next_proto: IPPROTO_UDP,
        src: tun.ip_src,
        dst: tun.ip_dst,
    };
    items.ipv4.1 = Ipv4Spec {
        tos: tun_masks.ip_tos,
        ttl: tun_masks.ip_ttl,
        next_proto: 0xff,
        src: tun_masks.ip_src,
        dst: tun_masks.ip_dst,
    };

    items.udp.0.src_port = tun.tp_src;
    items.udp.0.dst_port = tun.tp_dst;
    items.udp.1.src_port = tun_masks.tp_src;
    items.udp.1.dst_port = tun_masks.tp_dst;

    items.vxlan.0.flags = tun.flags;
    items.vxlan.0.vni = vni_bytes(tun.tun_id);
    items.vxlan.1.vni = vni_bytes(tun_masks.tun_id);

    Ok(())
}

/// Assemble the outer vxlan items filled by [`vxlan_flow_items`].
pub fn emit_vxlan<'a>(items: &'a FlowItems, patterns: &mut PatternList<'a>) {
    patterns.push(PatternItem::Ipv4(Pair {
        spec: &items.ipv4.0,
        mask: &items.ipv4.1,
    }));
    patterns.push(PatternItem::Udp(Pair {
        spec: &items.udp.0,
        mask: &items.udp.1,
    }));
    patterns.push(PatternItem::Vxlan(Pair {
        spec: &items.vxlan.0,
        mask: &items.vxlan.1,
    }));
}

/// Install the default rule of a virtual port's table on a physical
/// port: match everything at the lowest priority, spread across every
/// receive queue, and mark the packet with the port's exception mark
/// so software can finish the decap.
pub fn install_default_rule(
    netdev: &dyn Netdev,
    n_rxq: u16,
    table_id: u32,
    exception_mark: u32,
) -> core::result::Result<RuleHandle, DriverError> {
    let attr = RuleAttr {
        group: table_id,
        priority: 1,
        ingress: true,
        egress: false,
        transfer: false,
    };

    let mut patterns = PatternList::new();
    patterns.finish();

    let rss = RssConf::all_queues(n_rxq);
    let mut actions = ActionList::new();
    actions.push(ActionItem::Rss(&rss));
    actions.push(ActionItem::Mark { id: exception_mark });
    actions.finish();

    netdev.rule_create(&attr, patterns.items(), actions.items())
}

/// Install the catch-all rule that forwards root-table traffic into
/// table 1, where encap rules live.
pub fn install_clone_jump(
    netdev: &dyn Netdev,
) -> core::result::Result<RuleHandle, DriverError> {
    let attr = RuleAttr {
        group: UNKNOWN_TABLE_ID,
        priority: 1,
        ingress: true,
        egress: false,
        transfer: true,
    };

    let mut patterns = PatternList::new();
    patterns.finish();

    let mut actions = ActionList::new();
    actions.push(ActionItem::Jump { group: ROOT_TABLE_ID });
    actions.finish();

    netdev.rule_create(&attr, patterns.items(), actions.items())
}

#[cfg(test)]
mod test {
    use super::*;
    use hwflow_api::MacAddr;
    use hwflow_api::Wildcards;
    use std::net::Ipv4Addr;

    fn udp_match() -> Match {
        let mut m =
            Match { flow: Default::default(), wc: Wildcards::exact_l3_l4() };
        m.flow.dl_type = ETH_TYPE_IP;
        m.flow.nw_proto = IPPROTO_UDP;
        m.flow.nw_src = Ipv4Addr::new(10, 0, 0, 1);
        m.flow.nw_dst = Ipv4Addr::new(10, 0, 0, 2);
        m.flow.tp_dst = 4789;
        m
    }

    #[test]
    fn udp_match_layout() {
        let m = udp_match();
        let mut items = FlowItems::default();
        let layout = match_flow_items(&m, &mut items).unwrap();

        assert!(!layout.eth_spec);
        assert!(layout.ipv4);
        assert_eq!(layout.l4, Some(L4Kind::Udp));
        assert_eq!(items.udp.0.dst_port, 4789);
        // The UDP item took over the proto constraint.
        assert_eq!(items.ipv4.1.next_proto, 0);
        assert_eq!(items.ipv4.0.next_proto, IPPROTO_UDP);

        let mut patterns = PatternList::new();
        emit_match(&items, layout, &mut patterns);
        patterns.finish();
        assert_eq!(patterns.len(), 4);
        assert!(matches!(patterns.items()[0], PatternItem::Eth(None)));
        assert!(matches!(patterns.items()[1], PatternItem::Ipv4(_)));
        assert!(matches!(patterns.items()[2], PatternItem::Udp(_)));
    }

    #[test]
    fn l2_masks_select_a_real_eth_item() {
        let mut m = udp_match();
        m.flow.dl_dst = MacAddr::from_const([0xA8, 0, 0, 0, 0, 1]);
        m.wc.masks.dl_dst = MacAddr::BROADCAST;

        let mut items = FlowItems::default();
        let layout = match_flow_items(&m, &mut items).unwrap();
        assert!(layout.eth_spec);
        assert_eq!(items.eth.0.dst, m.flow.dl_dst);
        assert_eq!(items.eth.1.dst, MacAddr::BROADCAST);
    }

    #[test]
    fn vlan_cfi_is_stripped() {
        let mut m = udp_match();
        m.flow.vlan_tci = 0x1064;
        m.wc.masks.vlan_tci = 0xffff;

        let mut items = FlowItems::default();
        let layout = match_flow_items(&m, &mut items).unwrap();
        assert!(layout.vlan);
        assert_eq!(items.vlan.0.tci, 0x0064);
        assert_eq!(items.vlan.1.tci, 0xefff);
        assert_eq!(items.vlan.1.inner_type, 0);
    }

    #[test]
    fn tcp_flags_split() {
        let mut m = udp_match();
        m.flow.nw_proto = IPPROTO_TCP;
        m.flow.tcp_flags = 0x0512;
        m.wc.masks.tcp_flags = 0x0fff;

        let mut items = FlowItems::default();
        let layout = match_flow_items(&m, &mut items).unwrap();
        assert_eq!(layout.l4, Some(L4Kind::Tcp));
        assert_eq!(items.tcp.0.data_off, 0x05);
        assert_eq!(items.tcp.0.flags, 0x12);
        assert_eq!(items.tcp.1.data_off, 0x0f);
        assert_eq!(items.tcp.1.flags, 0xff);
    }

    #[test]
    fn icmp_takes_type_and_code_from_ports() {
        let mut m = udp_match();
        m.flow.nw_proto = IPPROTO_ICMP;
        m.flow.tp_src = 8;
        m.flow.tp_dst = 0;

        let mut items = FlowItems::default();
        let layout = match_flow_items(&m, &mut items).unwrap();
        assert_eq!(layout.l4, Some(L4Kind::Icmp));
        assert_eq!(items.icmp.0.icmp_type, 8);
        assert_eq!(items.icmp.0.icmp_code, 0);
    }

    #[test]
    fn partial_port_masks_are_rejected() {
        let mut m = udp_match();
        m.wc.masks.tp_dst = 0x00ff;
        assert!(match_flow_items(&m, &mut FlowItems::default()).is_err());
    }

    #[test]
    fn l4_fields_without_l4_proto_are_rejected() {
        let mut m = udp_match();
        m.flow.nw_proto = 47; // GRE
        assert!(match_flow_items(&m, &mut FlowItems::default()).is_err());
    }

    #[test]
    fn pattern_determinism() {
        let m = udp_match();

        let mut items_a = FlowItems::default();
        let layout_a = match_flow_items(&m, &mut items_a).unwrap();
        let mut items_b = FlowItems::default();
        let layout_b = match_flow_items(&m, &mut items_b).unwrap();

        assert_eq!(layout_a, layout_b);
        assert_eq!(items_a.ipv4, items_b.ipv4);
        assert_eq!(items_a.udp, items_b.udp);
    }

    #[test]
    fn vni_is_the_high_word() {
        let tun_id = 0x0000_2a00_0000_0000u64;
        assert_eq!(vni_bytes(tun_id), [0x00, 0x2a, 0x00]);
        assert_eq!(vni_bytes(u64::MAX), [0xff, 0xff, 0xff]);
        assert_eq!(vni_bytes(0), [0, 0, 0]);
    }

    #[test]
    fn vxlan_outer_pins_udp() {
        let mut m = udp_match();
        m.flow.tunnel.ip_src = Ipv4Addr::new(192, 168, 0, 1);
        m.flow.tunnel.ip_dst = Ipv4Addr::new(192, 168, 0, 2);
        m.flow.tunnel.tp_dst = 4789;
        m.wc.masks.tunnel.ip_src = Ipv4Addr::BROADCAST;
        m.wc.masks.tunnel.ip_dst = Ipv4Addr::BROADCAST;
        m.wc.masks.tunnel.tp_dst = u16::MAX;

        let mut items = FlowItems::default();
        vxlan_flow_items(&m, &mut items).unwrap();
        assert_eq!(items.ipv4.0.next_proto, IPPROTO_UDP);
        assert_eq!(items.ipv4.1.next_proto, 0xff);
        assert_eq!(items.udp.0.dst_port, 4789);

        let mut patterns = PatternList::new();
        emit_vxlan(&items, &mut patterns);
        assert_eq!(patterns.len(), 3);
        assert!(matches!(patterns.items()[2], PatternItem::Vxlan(_)));
    }
}
