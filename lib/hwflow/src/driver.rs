// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The consumed NIC-driver surface.
//!
//! The vendor driver sits behind [`Netdev`]: one implementation per
//! device class. The engine only ever creates and destroys rules and
//! asks a handful of questions about the device; everything else
//! (queue setup, port bring-up) happens before a netdev reaches
//! `port_add`.

use crate::engine::rule::ActionItem;
use crate::engine::rule::PatternItem;
use crate::engine::rule::RuleAttr;
use hwflow_api::PacketMeta;
use std::fmt;

/// The netdev type string for DPDK-backed physical ports.
pub const NETDEV_KIND_DPDK: &str = "dpdk";

/// The netdev type string for vxlan virtual ports.
pub const NETDEV_KIND_VXLAN: &str = "vxlan";

/// An opaque token for one installed hardware rule. Only meaningful to
/// the [`Netdev`] that created it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RuleHandle(pub u64);

impl fmt::Display for RuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rule#{}", self.0)
    }
}

/// A rule-level failure reported by the driver: a vendor error code
/// plus a human-readable message.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("type {kind}: {msg}")]
pub struct DriverError {
    pub kind: u32,
    pub msg: String,
}

impl DriverError {
    pub fn new(kind: u32, msg: impl Into<String>) -> Self {
        Self { kind, msg: msg.into() }
    }
}

/// One datapath network device, physical or virtual.
///
/// Calls may block; none of them are made from the packet fast path
/// except [`Netdev::pop_header`].
pub trait Netdev: Send + Sync {
    /// The device name, for logs.
    fn name(&self) -> &str;

    /// The device type string, e.g. `"dpdk"` or `"vxlan"`.
    fn kind(&self) -> &str;

    /// Number of receive queues configured on the device.
    fn n_rxq(&self) -> u16;

    /// The hardware port id, for `port_id` actions.
    fn hw_port_id(&self) -> u16;

    /// Whether this physical port faces the external fabric.
    /// Tunnel-decap rules fan out across all uplinks.
    fn is_uplink(&self) -> bool;

    /// Install one rule. The pattern and action slices are terminated
    /// by their `End` sentinels and remain valid for the duration of
    /// the call only.
    fn rule_create(
        &self,
        attr: &RuleAttr,
        patterns: &[PatternItem<'_>],
        actions: &[ActionItem<'_>],
    ) -> Result<RuleHandle, DriverError>;

    /// Remove one previously installed rule.
    fn rule_destroy(&self, handle: RuleHandle) -> Result<(), DriverError>;

    /// Strip this device's encapsulation header from a packet that was
    /// received on an underlying physical port.
    fn pop_header(&self, pkt: &mut PacketMeta);
}
