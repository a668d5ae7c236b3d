// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Reject flows that constrain header fields the pipeline cannot
//! match.

use crate::engine::Result;
use hwflow_api::CtState;
use hwflow_api::Match;
use hwflow_api::OffloadError;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use tracing::debug;

fn unsupported(field: &'static str) -> OffloadError {
    debug!(field, "cannot offload flow, unsupported field");
    OffloadError::Unsupported(field)
}

/// Validate a match against hardware capability. `is_tun` is true for
/// flows arriving on a tunnel virtual port, where outer-header fields
/// are expected and legal.
pub fn validate(m: &Match, is_tun: bool) -> Result<()> {
    let masks = &m.wc.masks;

    if !is_tun && !m.masked_tunnel().is_all_zero() {
        return Err(unsupported("tunnel"));
    }

    if masks.metadata != 0
        || masks.skb_priority != 0
        || masks.pkt_mark != 0
        || masks.dp_hash != 0
    {
        return Err(unsupported("metadata"));
    }

    // A ct_state match must at least constrain the established bit.
    if !masks.ct_state.is_empty()
        && !masks.ct_state.contains(CtState::ESTABLISHED)
    {
        return Err(unsupported("ct_state"));
    }

    if masks.ct_nw_proto != 0
        || masks.ct_zone != 0
        || masks.ct_mark != 0
        || masks.ct_label != 0
    {
        return Err(unsupported("ct"));
    }

    if masks.conj_id != 0 || masks.actset_output != 0 {
        return Err(unsupported("conjunction"));
    }

    // Unsupported L2.
    if masks.mpls_lse != [0; 2] {
        return Err(unsupported("mpls"));
    }

    // Unsupported L3.
    if masks.ipv6_label != 0
        || masks.ct_nw_src != Ipv4Addr::UNSPECIFIED
        || masks.ct_nw_dst != Ipv4Addr::UNSPECIFIED
        || masks.ipv6_src != Ipv6Addr::UNSPECIFIED
        || masks.ipv6_dst != Ipv6Addr::UNSPECIFIED
        || masks.ct_ipv6_src != Ipv6Addr::UNSPECIFIED
        || masks.ct_ipv6_dst != Ipv6Addr::UNSPECIFIED
        || masks.nd_target != Ipv6Addr::UNSPECIFIED
        || masks.nsh != [0; 8]
        || !masks.arp_sha.is_zero()
        || !masks.arp_tha.is_zero()
    {
        return Err(unsupported("l3"));
    }

    // If fragmented, don't accelerate.
    if m.masked_nw_frag() != 0 {
        return Err(unsupported("nw_frag"));
    }

    // Unsupported L4.
    if masks.igmp_group_ip4 != Ipv4Addr::UNSPECIFIED
        || masks.ct_tp_src != 0
        || masks.ct_tp_dst != 0
    {
        return Err(unsupported("l4"));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use hwflow_api::Wildcards;
    use proptest::prelude::*;

    fn udp_match() -> Match {
        let mut m = Match { flow: Default::default(), wc: Wildcards::exact_l3_l4() };
        m.flow.dl_type = hwflow_api::ETH_TYPE_IP;
        m.flow.nw_proto = hwflow_api::IPPROTO_UDP;
        m.flow.nw_src = Ipv4Addr::new(10, 0, 0, 1);
        m.flow.nw_dst = Ipv4Addr::new(10, 0, 0, 2);
        m.flow.tp_dst = 4789;
        m
    }

    #[test]
    fn plain_udp_is_accepted() {
        assert!(validate(&udp_match(), false).is_ok());
    }

    #[test]
    fn ipv6_is_rejected() {
        let mut m = udp_match();
        m.wc.masks.ipv6_src = Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1);
        assert_eq!(validate(&m, false), Err(OffloadError::Unsupported("l3")));
    }

    #[test]
    fn tunnel_fields_need_is_tun() {
        let mut m = udp_match();
        m.flow.tunnel.ip_dst = Ipv4Addr::new(192, 168, 1, 1);
        m.wc.masks.tunnel.ip_dst = Ipv4Addr::BROADCAST;
        assert!(validate(&m, false).is_err());
        assert!(validate(&m, true).is_ok());
    }

    #[test]
    fn ct_state_mask_must_cover_established() {
        let mut m = udp_match();
        m.wc.masks.ct_state = CtState::ESTABLISHED;
        assert!(validate(&m, false).is_ok());

        // Supersets that still constrain the established bit pass.
        m.wc.masks.ct_state = CtState::ESTABLISHED | CtState::NEW;
        assert!(validate(&m, false).is_ok());

        // Masks that omit it do not.
        m.wc.masks.ct_state = CtState::TRACKED;
        assert!(validate(&m, false).is_err());
    }

    #[test]
    fn fragments_are_rejected() {
        let mut m = udp_match();
        m.flow.nw_frag = 1;
        m.wc.masks.nw_frag = 0xff;
        assert!(validate(&m, false).is_err());

        // Wildcarded frag bits don't count.
        m.wc.masks.nw_frag = 0;
        assert!(validate(&m, false).is_ok());
    }

    #[test]
    fn rejected_metadata_fields() {
        for f in ["metadata", "skb_priority", "pkt_mark", "dp_hash"] {
            let mut m = udp_match();
            match f {
                "metadata" => m.wc.masks.metadata = 1,
                "skb_priority" => m.wc.masks.skb_priority = 1,
                "pkt_mark" => m.wc.masks.pkt_mark = 1,
                _ => m.wc.masks.dp_hash = 1,
            }
            assert!(validate(&m, false).is_err(), "{f} must be rejected");
        }
    }

    proptest! {
        // Widening a validated match (clearing mask bits) keeps it
        // valid: validity is monotone in the mask set.
        #[test]
        fn widening_preserves_validity(
            clear_src in any::<bool>(),
            clear_dst in any::<bool>(),
            clear_tp in any::<bool>(),
            clear_proto in any::<bool>(),
        ) {
            let mut m = udp_match();
            if clear_src {
                m.wc.masks.nw_src = Ipv4Addr::UNSPECIFIED;
            }
            if clear_dst {
                m.wc.masks.nw_dst = Ipv4Addr::UNSPECIFIED;
            }
            if clear_tp {
                m.wc.masks.tp_src = 0;
                m.wc.masks.tp_dst = 0;
            }
            if clear_proto {
                m.wc.masks.nw_proto = 0;
            }
            prop_assert!(validate(&m, false).is_ok());
        }
    }
}
