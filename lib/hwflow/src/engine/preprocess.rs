// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Software recovery after a partial-offload hit.
//!
//! A packet that matched a hardware rule but then missed arrives in
//! software carrying the rule's mark. The hardware already consumed
//! metadata the software classifier needs (the outer tunnel header, a
//! jump position, conntrack state); the mark is the key to restoring
//! it so classification can resume from where the pipeline stopped.

use crate::engine::miss::CtMissCtx;
use crate::engine::miss::FlowMissCtx;
use crate::engine::miss::MissCtx;
use crate::engine::offload::Offload;
use crate::engine::port::PortKind;
use crate::engine::port::PortRecord;
use hwflow_api::PacketMeta;
use tracing::warn;

impl Offload {
    /// Restore the metadata a mark stands for. Runs on the packet fast
    /// path; never fails the packet, an unknown mark is logged and
    /// ignored.
    pub fn preprocess(&self, pkt: &mut PacketMeta, mark: u32) {
        // A port exception mark: the outer header matched in hardware
        // but the inner flow missed in the port's table.
        if let Some(port) = self.ports.by_mark(mark) {
            self.port_preprocess(&port, pkt);
            return;
        }

        match self.miss.lookup(mark) {
            Some(MissCtx::Ct(ctx)) => self.recover_ct(pkt, &ctx),
            Some(MissCtx::Flow(ctx)) | Some(MissCtx::FlowCt(ctx)) => {
                self.recover_flow(pkt, &ctx)
            }
            None => {
                warn!(mark, "mark with no miss context");
            }
        }
    }

    fn port_preprocess(&self, port: &PortRecord, pkt: &mut PacketMeta) {
        match port.kind {
            PortKind::Vxlan => {
                // The decap the jump rule implied never happened; do it
                // here and re-home the packet on the virtual port.
                port.netdev.pop_header(pkt);
                pkt.in_port = port.dp_port;
                pkt.reset_checksum_ol_flags();
            }
            PortKind::Dpdk | PortKind::Unknown => {
                warn!(kind = ?port.kind, "port kind has no pre-process");
            }
        }
    }

    fn recover_ct(&self, pkt: &mut PacketMeta, ctx: &CtMissCtx) {
        if let Some(outer_id) = ctx.outer_id {
            self.recover_tunnel(pkt, outer_id);
        }
        pkt.ct_state = ctx.ct_state;
        pkt.ct_zone = ctx.ct_zone;
        pkt.ct_mark = ctx.ct_mark;
    }

    fn recover_flow(&self, pkt: &mut PacketMeta, ctx: &FlowMissCtx) {
        if let Some(outer_id) = ctx.outer_id {
            self.recover_tunnel(pkt, outer_id);
        }
        pkt.in_port = ctx.in_port;
    }

    fn recover_tunnel(
        &self,
        pkt: &mut PacketMeta,
        outer_id: crate::engine::tunnel::OuterId,
    ) {
        if let Some(t) = self.tunnels.lookup_by_id(outer_id) {
            pkt.tunnel.ip_dst = t.ip_dst;
            pkt.tunnel.ip_src = t.ip_src;
            pkt.tunnel.tun_id = t.tun_id;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::miss::CtDirection;
    use crate::engine::tunnel::TunnelTriple;
    use crate::driver::RuleHandle;
    use hwflow_api::CtState;
    use hwflow_api::DpPort;
    use std::net::Ipv4Addr;

    #[test]
    fn unknown_mark_is_a_noop() {
        let off = Offload::new();
        let mut pkt = PacketMeta::default();
        let before = pkt;
        off.preprocess(&mut pkt, 0x99);
        assert_eq!(pkt, before);
    }

    #[test]
    fn ct_context_restores_conn_state_and_tunnel() {
        let off = Offload::new();
        let key = TunnelTriple {
            ip_dst: Ipv4Addr::new(10, 1, 1, 1),
            ip_src: Ipv4Addr::new(10, 1, 1, 2),
            tun_id: 0x64,
        };
        let outer_id = off.tunnels().get_or_alloc(key).unwrap();
        off.ct_miss_save(
            0x17,
            RuleHandle(5),
            0xbeef,
            0,
            CtState::ESTABLISHED | CtState::TRACKED,
            Some(outer_id),
            CtDirection::Init,
        )
        .unwrap();

        let mut pkt = PacketMeta::default();
        off.preprocess(&mut pkt, 0x17);

        assert_eq!(pkt.ct_mark, 0xbeef);
        assert_eq!(pkt.ct_state, CtState::ESTABLISHED | CtState::TRACKED);
        assert_eq!(pkt.tunnel.ip_dst, key.ip_dst);
        assert_eq!(pkt.tunnel.tun_id, 0x64);
    }

    #[test]
    fn flow_context_restores_in_port() {
        let off = Offload::new();
        off.miss_table().save_flow(0x21, 70, false, None, DpPort(4), false);

        let mut pkt = PacketMeta::default();
        off.preprocess(&mut pkt, 0x21);
        assert_eq!(pkt.in_port, DpPort(4));
    }
}
