// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The datapath action model.
//!
//! On the wire these arrive as a netlink-style TLV stream; the engine
//! consumes them as a closed enum, one variant per action kind, with
//! the CT sub-stream flattened into [`CtSpec`].

use crate::flow::TunnelKey;
use crate::DpPort;
use core::net::Ipv4Addr;
use serde::Deserialize;
use serde::Serialize;

/// One action of a datapath action list.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DpAction {
    /// Deliver to a datapath port. Must be the final action.
    Output(DpPort),

    /// Strip the tunnel header and continue processing as if the inner
    /// packet arrived on the given virtual port.
    TunnelPop(DpPort),

    /// Prepend a precomputed tunnel header and forward out the given
    /// port. Only meaningful inside a [`DpAction::Clone`].
    TunnelPush(TunnelHeader),

    /// Run a sub-list on a copy of the packet.
    Clone(Vec<DpAction>),

    /// Submit to connection tracking.
    Ct(CtSpec),

    /// Recirculate with the given id. Must be the final action.
    Recirc(u32),

    PushVlan { tpid: u16, tci: u16 },
    PopVlan,

    Set(FieldValue),
    SetMasked { value: FieldValue, mask: FieldValue },
}

/// A precomputed encapsulation header, as built by the datapath's
/// tunnel code.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TunnelHeader {
    pub header: Vec<u8>,
    pub out_port: DpPort,
}

/// The flattened CT sub-TLV stream.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CtSpec {
    pub commit: bool,
    pub force_commit: bool,
    pub zone: u16,
    pub helper: Option<String>,
    /// (value, mask) written to the connection mark on commit.
    pub mark: Option<(u32, u32)>,
    /// (value, mask) written to the connection label on commit.
    pub labels: Option<(u128, u128)>,
    pub eventmask: Option<u32>,
    pub nat: Option<NatSpec>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NatSpec {
    pub snat: bool,
    pub dnat: bool,
    pub addrs: Option<(Ipv4Addr, Ipv4Addr)>,
    pub ports: Option<(u16, u16)>,
}

/// A field rewrite carried by set / set_masked. None of these are
/// representable in the pipeline today; they exist so the classifier
/// can recognise and degrade them.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FieldValue {
    Eth { src: crate::MacAddr, dst: crate::MacAddr },
    Ipv4 { src: Ipv4Addr, dst: Ipv4Addr, tos: u8, ttl: u8 },
    Tunnel(Box<TunnelKey>),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ct_spec_defaults() {
        let ct = CtSpec::default();
        assert_eq!(ct.zone, 0);
        assert!(!ct.commit);
        assert!(ct.nat.is_none());
    }
}
