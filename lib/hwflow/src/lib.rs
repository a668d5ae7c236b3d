// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! hwflow translates logical datapath flows into rules across a
//! programmable NIC's multi-table pipeline.
//!
//! For each `(match, action list, flow id)` tuple the engine validates
//! that the pair is representable, interns the shared identifiers it
//! needs (tunnel outer-ids, per-recirculation table ids), synthesises
//! one or more hardware rules, installs them through the driver seam
//! ([`driver::Netdev`]) and tracks them for atomic replace and
//! destroy. When a flow can only be partially offloaded, a per-packet
//! mark lets the software path recover the metadata the hardware rule
//! consumed; see [`engine::preprocess`].
//!
//! All engine state lives in one [`engine::offload::Offload`] value
//! created at startup and passed explicitly. There is no ambient
//! global state.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod driver;
pub mod engine;

pub use hwflow_api as api;
