// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use crate::DpPort;
use crate::FlowId;
use libc::c_int;

/// Everything that can go wrong between `flow_put` and the NIC.
///
/// Invariant violations (id double-free, refcount underflow) are not
/// represented here; they are bugs and panic at the site.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum OffloadError {
    /// The validator or classifier rejected the flow; nothing was
    /// installed and no state was mutated.
    #[error("flow not representable in hardware: {0}")]
    Unsupported(&'static str),

    /// An identifier pool ran dry; partial allocations were rolled
    /// back.
    #[error("{0} exhausted")]
    Exhausted(&'static str),

    /// The NIC rejected a rule.
    #[error("driver rejected rule on {netdev}: {msg}")]
    Driver { netdev: String, msg: String },

    /// The flow refers to a datapath port the engine is not tracking.
    #[error("datapath port {0} is not offload-capable")]
    InvalidPort(DpPort),

    /// `port_del` (or a post-index port lookup) found no port record.
    #[error("datapath port {0} not found")]
    PortNotFound(DpPort),

    /// `flow_del` found no record for the flow id.
    #[error("flow {0} not found")]
    FlowNotFound(FlowId),

    /// A tunnel flow arrived while no physical uplink exists.
    #[error("no uplink port available")]
    NoUplink,

    /// A CT miss-context direction was bound twice for one mark.
    #[error("ct context for mark {0:#x} already bound")]
    CtExists(u32),
}

impl OffloadError {
    /// Convert to the errno value reported to the datapath.
    pub fn to_errno(&self) -> c_int {
        match self {
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::Exhausted(_) => libc::ENOMEM,
            Self::Driver { .. } => libc::ENODEV,
            Self::InvalidPort(_) => libc::EINVAL,
            Self::PortNotFound(_) => libc::ENODEV,
            Self::FlowNotFound(_) => libc::EINVAL,
            Self::NoUplink => libc::ENODEV,
            Self::CtExists(_) => libc::EEXIST,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(
            OffloadError::Unsupported("ipv6").to_errno(),
            libc::EOPNOTSUPP
        );
        assert_eq!(
            OffloadError::Exhausted("outer-id pool").to_errno(),
            libc::ENOMEM
        );
        assert_eq!(
            OffloadError::FlowNotFound(FlowId::new(1)).to_errno(),
            libc::EINVAL
        );
        assert_eq!(
            OffloadError::PortNotFound(DpPort(9)).to_errno(),
            libc::ENODEV
        );
    }
}
