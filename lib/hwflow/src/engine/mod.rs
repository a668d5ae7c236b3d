// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The offload engine.

pub mod classify;
pub mod flow_table;
pub mod ids;
pub mod miss;
pub mod offload;
pub mod port;
pub mod preprocess;
pub mod rule;
pub mod table;
pub mod translate;
pub mod tunnel;
pub mod validate;

use hwflow_api::OffloadError;

pub type Result<T> = core::result::Result<T, OffloadError>;
