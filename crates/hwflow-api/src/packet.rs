// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The slice of packet metadata the preprocessor may restore after a
//! partial-offload hit. The packet body itself never enters the
//! engine; tunnel-header removal is delegated back to the owning
//! netdev.

use crate::flow::CtState;
use crate::flow::TunnelKey;
use crate::DpPort;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PacketMeta {
    pub in_port: DpPort,
    pub tunnel: TunnelKey,
    pub ct_state: CtState,
    pub ct_zone: u16,
    pub ct_mark: u32,
    /// Checksum/offload flags from the NIC; stale once a header has
    /// been popped in software.
    pub ol_flags: u32,
}

impl PacketMeta {
    pub fn reset_checksum_ol_flags(&mut self) {
        self.ol_flags = 0;
    }
}
