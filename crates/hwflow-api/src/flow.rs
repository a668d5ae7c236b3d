// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The match model: a flow key plus a wildcard mask over the same
//! fields, as supplied by the datapath's classifier.

use crate::DpPort;
use crate::MacAddr;
use bitflags::bitflags;
use core::net::Ipv4Addr;
use core::net::Ipv6Addr;
use serde::Deserialize;
use serde::Serialize;

pub const ETH_TYPE_IP: u16 = 0x0800;
pub const ETH_TYPE_VLAN: u16 = 0x8100;

/// The canonical-format-indicator bit of an 802.1Q TCI; never part of
/// a hardware VLAN match.
pub const VLAN_CFI: u16 = 0x1000;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_SCTP: u8 = 132;

bitflags! {
    /// Connection-tracking state bits.
    #[derive(
        Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
    )]
    pub struct CtState: u8 {
        const NEW = 0x01;
        const ESTABLISHED = 0x02;
        const RELATED = 0x04;
        const REPLY_DIR = 0x08;
        const INVALID = 0x10;
        const TRACKED = 0x20;
        const SRC_NAT = 0x40;
        const DST_NAT = 0x80;
    }
}

impl Default for CtState {
    fn default() -> Self {
        Self::empty()
    }
}

/// Tunnel metadata attached to a flow: the outer header fields of an
/// encapsulated packet.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct TunnelKey {
    pub ip_dst: Ipv4Addr,
    pub ip_src: Ipv4Addr,
    pub tun_id: u64,
    pub flags: u8,
    pub ip_tos: u8,
    pub ip_ttl: u8,
    pub tp_src: u16,
    pub tp_dst: u16,
}

impl Default for TunnelKey {
    fn default() -> Self {
        Self {
            ip_dst: Ipv4Addr::UNSPECIFIED,
            ip_src: Ipv4Addr::UNSPECIFIED,
            tun_id: 0,
            flags: 0,
            ip_tos: 0,
            ip_ttl: 0,
            tp_src: 0,
            tp_dst: 0,
        }
    }
}

impl TunnelKey {
    pub fn is_all_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Field-wise AND with a mask of the same shape.
    pub fn masked(&self, mask: &TunnelKey) -> TunnelKey {
        TunnelKey {
            ip_dst: and_ip4(self.ip_dst, mask.ip_dst),
            ip_src: and_ip4(self.ip_src, mask.ip_src),
            tun_id: self.tun_id & mask.tun_id,
            flags: self.flags & mask.flags,
            ip_tos: self.ip_tos & mask.ip_tos,
            ip_ttl: self.ip_ttl & mask.ip_ttl,
            tp_src: self.tp_src & mask.tp_src,
            tp_dst: self.tp_dst & mask.tp_dst,
        }
    }
}

pub(crate) fn and_ip4(a: Ipv4Addr, b: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(a) & u32::from(b))
}

/// The header fields a datapath flow may constrain. Mirrors the
/// OpenFlow-ish flow structure; the engine's validator decides which of
/// these are representable in hardware.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowKey {
    // Metadata.
    pub recirc_id: u32,
    pub in_port: DpPort,
    pub tunnel: TunnelKey,
    pub metadata: u64,
    pub skb_priority: u32,
    pub pkt_mark: u32,
    pub dp_hash: u32,
    pub conj_id: u32,
    pub actset_output: u32,

    // Connection tracking.
    pub ct_state: CtState,
    pub ct_zone: u16,
    pub ct_mark: u32,
    pub ct_label: u128,
    pub ct_nw_proto: u8,
    pub ct_nw_src: Ipv4Addr,
    pub ct_nw_dst: Ipv4Addr,
    pub ct_ipv6_src: Ipv6Addr,
    pub ct_ipv6_dst: Ipv6Addr,
    pub ct_tp_src: u16,
    pub ct_tp_dst: u16,

    // L2.
    pub dl_src: MacAddr,
    pub dl_dst: MacAddr,
    pub dl_type: u16,
    pub vlan_tci: u16,
    pub mpls_lse: [u32; 2],

    // L3.
    pub nw_src: Ipv4Addr,
    pub nw_dst: Ipv4Addr,
    pub ipv6_src: Ipv6Addr,
    pub ipv6_dst: Ipv6Addr,
    pub ipv6_label: u32,
    pub nw_tos: u8,
    pub nw_ttl: u8,
    pub nw_proto: u8,
    pub nw_frag: u8,
    pub nd_target: Ipv6Addr,
    pub nsh: [u8; 8],
    pub arp_sha: MacAddr,
    pub arp_tha: MacAddr,

    // L4.
    pub igmp_group_ip4: Ipv4Addr,
    pub tcp_flags: u16,
    pub tp_src: u16,
    pub tp_dst: u16,
}

impl Default for FlowKey {
    fn default() -> Self {
        Self {
            recirc_id: 0,
            in_port: DpPort(0),
            tunnel: TunnelKey::default(),
            metadata: 0,
            skb_priority: 0,
            pkt_mark: 0,
            dp_hash: 0,
            conj_id: 0,
            actset_output: 0,
            ct_state: CtState::empty(),
            ct_zone: 0,
            ct_mark: 0,
            ct_label: 0,
            ct_nw_proto: 0,
            ct_nw_src: Ipv4Addr::UNSPECIFIED,
            ct_nw_dst: Ipv4Addr::UNSPECIFIED,
            ct_ipv6_src: Ipv6Addr::UNSPECIFIED,
            ct_ipv6_dst: Ipv6Addr::UNSPECIFIED,
            ct_tp_src: 0,
            ct_tp_dst: 0,
            dl_src: MacAddr::ZERO,
            dl_dst: MacAddr::ZERO,
            dl_type: 0,
            vlan_tci: 0,
            mpls_lse: [0; 2],
            nw_src: Ipv4Addr::UNSPECIFIED,
            nw_dst: Ipv4Addr::UNSPECIFIED,
            ipv6_src: Ipv6Addr::UNSPECIFIED,
            ipv6_dst: Ipv6Addr::UNSPECIFIED,
            ipv6_label: 0,
            nw_tos: 0,
            nw_ttl: 0,
            nw_proto: 0,
            nw_frag: 0,
            nd_target: Ipv6Addr::UNSPECIFIED,
            nsh: [0; 8],
            arp_sha: MacAddr::ZERO,
            arp_tha: MacAddr::ZERO,
            igmp_group_ip4: Ipv4Addr::UNSPECIFIED,
            tcp_flags: 0,
            tp_src: 0,
            tp_dst: 0,
        }
    }
}

/// The wildcard mask half of a match. A set bit means the
/// corresponding flow bit is matched; a zero field is fully wildcarded.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Wildcards {
    pub masks: FlowKey,
}

impl Wildcards {
    /// A mask set that matches every field exactly for the supported
    /// subset, useful in tests.
    pub fn exact_l3_l4() -> Self {
        let mut masks = FlowKey::default();
        masks.dl_type = u16::MAX;
        masks.nw_proto = u8::MAX;
        masks.nw_src = Ipv4Addr::BROADCAST;
        masks.nw_dst = Ipv4Addr::BROADCAST;
        masks.tp_src = u16::MAX;
        masks.tp_dst = u16::MAX;
        Wildcards { masks }
    }
}

/// A (flow, wildcards) pair as handed over on `flow_put`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Match {
    pub flow: FlowKey,
    pub wc: Wildcards,
}

impl Match {
    /// The wildcard-stripped tunnel metadata: flow bits the mask
    /// actually constrains.
    pub fn masked_tunnel(&self) -> TunnelKey {
        self.flow.tunnel.masked(&self.wc.masks.tunnel)
    }

    /// The wildcard-stripped recirculation id.
    pub fn masked_recirc_id(&self) -> u32 {
        self.flow.recirc_id & self.wc.masks.recirc_id
    }

    /// The wildcard-stripped IP fragment bits.
    pub fn masked_nw_frag(&self) -> u8 {
        self.flow.nw_frag & self.wc.masks.nw_frag
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn masked_tunnel_strips_wildcarded_fields() {
        let mut m = Match::default();
        m.flow.tunnel.ip_dst = Ipv4Addr::new(10, 0, 0, 1);
        m.flow.tunnel.tun_id = 0x64;
        // Only the destination IP is matched.
        m.wc.masks.tunnel.ip_dst = Ipv4Addr::BROADCAST;

        let t = m.masked_tunnel();
        assert_eq!(t.ip_dst, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(t.tun_id, 0);
        assert!(!t.is_all_zero());
    }

    #[test]
    fn default_tunnel_is_zero() {
        assert!(TunnelKey::default().is_all_zero());
        assert_eq!(Match::default().masked_recirc_id(), 0);
    }
}
