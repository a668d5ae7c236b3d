// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! API types shared between the hwflow engine and the datapath that
//! drives it.
//!
//! The engine translates logical datapath flows into rules across a
//! programmable NIC's multi-table pipeline. Everything the datapath
//! hands to the engine, and everything the engine hands back, is
//! defined here: flow identifiers, the match model, the action model,
//! the packet metadata touched by partial-offload recovery, and the
//! error surface.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod action;
pub mod error;
pub mod flow;
pub mod mac;
pub mod packet;

pub use action::*;
pub use error::*;
pub use flow::*;
pub use mac::*;
pub use packet::*;

/// The fixed pipeline tables, in wire order. Rule jumps must go from a
/// lower table id to a higher one.
///
/// Table 0 is skipped; it is usually claimed by entities other than the
/// datapath and serves only as the sentinel for "no table resolved".
pub const UNKNOWN_TABLE_ID: u32 = 0;
pub const ROOT_TABLE_ID: u32 = 1;
pub const VXLAN_TABLE_ID: u32 = 2;
pub const CT_TABLE_ID: u32 = 3;
pub const CT_NAT_TABLE_ID: u32 = 4;

/// Dynamically created per-recirculation / per-port tables live in
/// `[DYNAMIC_TABLE_BASE, DYNAMIC_TABLE_LIMIT)`.
pub const DYNAMIC_TABLE_BASE: u32 = 64;
pub const DYNAMIC_TABLE_LIMIT: u32 = 65280;

/// Bound on the per-port default-rule slots.
pub const MAX_PORT_TABLES: usize = 31;

/// Flow marks are 24-bit values carried by the NIC's mark action. The
/// top slice of the space is reserved for marks the engine assigns
/// itself rather than the datapath.
pub const MAX_FLOW_MARK: u32 = 0x00ff_ffff;
pub const MIN_RESERVED_MARK: u32 = 0x00ff_ff00;

/// The mark placed on packets that matched a tunnel-decap jump rule but
/// missed in the destination table.
pub const VXLAN_EXCEPTION_MARK: u32 = MIN_RESERVED_MARK;

/// The unique identifier the datapath assigns to a logical flow.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct FlowId(u128);

impl FlowId {
    pub const fn new(v: u128) -> Self {
        Self(v)
    }

    pub const fn as_u128(&self) -> u128 {
        self.0
    }
}

impl From<u128> for FlowId {
    fn from(v: u128) -> Self {
        Self(v)
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Datapaths conventionally print flow ids in UUID form.
        write!(f, "{}", uuid::Uuid::from_u128(self.0))
    }
}

/// A datapath port number.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct DpPort(pub u32);

impl Display for DpPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Install-time information exchanged with the datapath: the mark it
/// assigned to the flow, and whether the install achieved full offload.
/// `is_hwol` is false when the flow was degraded to a mark-and-RSS
/// partial offload.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct OffloadInfo {
    pub flow_mark: u32,
    pub is_hwol: bool,
}

impl OffloadInfo {
    pub fn new(flow_mark: u32) -> Self {
        Self { flow_mark, is_hwol: false }
    }
}

/// Flow statistics, as reported back to the datapath. Rule counters
/// live in the NIC; the engine leaves this untouched.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct FlowStats {
    pub n_packets: u64,
    pub n_bytes: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flow_id_display_is_uuid() {
        let fid = FlowId::new(0x1234_5678_9abc_def0_1122_3344_5566_7788);
        assert_eq!(fid.to_string(), "12345678-9abc-def0-1122-334455667788");
    }

    #[test]
    fn reserved_marks_sit_in_mark_space() {
        assert!(VXLAN_EXCEPTION_MARK <= MAX_FLOW_MARK);
        assert!(VXLAN_EXCEPTION_MARK >= MIN_RESERVED_MARK);
    }
}
