// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Tag a (match, action list) pair with the shape the translator will
//! synthesise.

use crate::engine::tunnel::TunnelTriple;
use crate::engine::Result;
use hwflow_api::DpAction;
use hwflow_api::DpPort;
use hwflow_api::Match;
use hwflow_api::OffloadError;

/// Where the flow's match anchors it in the pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MatchKind {
    /// Recirculation id zero, physical in-port.
    Root,
    /// Recirculation id zero, virtual in-port.
    VportRoot,
    /// Non-zero recirculation id; the flow continues in a dynamically
    /// allocated table.
    Recirc,
}

/// The dominant action of the list.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActionKind {
    TnlPop,
    Ct,
    Output,
}

/// CT parameters the translator needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CtCls {
    pub has_nat: bool,
    /// The recirculation id the flow continues with after conntrack,
    /// if the list ends in a recirc action.
    pub recirc_id: Option<u32>,
}

/// What the translator will install. `MarkRss` is the partial-offload
/// degradation for lists that are legal but not representable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Shape<'a> {
    TnlPop { vport: DpPort },
    Output { port: DpPort },
    CloneEncap { header: &'a [u8], port: DpPort },
    Ct(CtCls),
    MarkRss,
}

#[derive(Clone, Copy, Debug)]
pub struct ClsInfo<'a> {
    pub match_kind: MatchKind,
    pub recirc_id: u32,
    /// The wildcard-stripped tunnel triple, when the match constrains
    /// one.
    pub tunnel: Option<TunnelTriple>,
    pub action_kind: Option<ActionKind>,
    pub shape: Shape<'a>,
}

/// Classify a validated match and action list. Returns `Unsupported`
/// for action lists that are structurally invalid; lists that are
/// merely unrepresentable come back as [`Shape::MarkRss`].
pub fn classify<'a>(
    m: &Match,
    actions: &'a [DpAction],
    in_port_virtual: bool,
) -> Result<ClsInfo<'a>> {
    let recirc_id = m.masked_recirc_id();
    let tunnel = {
        let t = m.masked_tunnel();
        if t.is_all_zero() {
            None
        } else {
            Some(TunnelTriple {
                ip_dst: t.ip_dst,
                ip_src: t.ip_src,
                tun_id: t.tun_id,
            })
        }
    };

    let match_kind = if recirc_id != 0 {
        MatchKind::Recirc
    } else if in_port_virtual {
        MatchKind::VportRoot
    } else {
        MatchKind::Root
    };

    // Ordering and exclusivity checks over the raw list.
    let n = actions.len();
    let mut has_ct = false;
    for (i, a) in actions.iter().enumerate() {
        let last = i == n - 1;
        match a {
            DpAction::Output(_) if !last => {
                return Err(OffloadError::Unsupported("output must be final"));
            }
            DpAction::Recirc(_) if !last => {
                return Err(OffloadError::Unsupported("recirc must be final"));
            }
            DpAction::Recirc(_) if !has_ct => {
                return Err(OffloadError::Unsupported("recirc without ct"));
            }
            DpAction::TunnelPop(_) => {
                if n != 1 {
                    return Err(OffloadError::Unsupported(
                        "tunnel_pop mixed with other actions",
                    ));
                }
                if recirc_id != 0 || in_port_virtual {
                    return Err(OffloadError::Unsupported(
                        "tunnel_pop outside the root table",
                    ));
                }
            }
            DpAction::Ct(spec) => {
                // Zone 0 only for now.
                if spec.zone != 0 {
                    return Err(OffloadError::Unsupported("ct zone"));
                }
                has_ct = true;
            }
            _ => {}
        }
    }

    let action_kind = if actions.iter().any(|a| matches!(a, DpAction::TunnelPop(_))) {
        Some(ActionKind::TnlPop)
    } else if has_ct {
        Some(ActionKind::Ct)
    } else if matches!(actions.last(), Some(DpAction::Output(_))) {
        Some(ActionKind::Output)
    } else {
        None
    };

    let shape = match actions {
        [DpAction::TunnelPop(vport)] => Shape::TnlPop { vport: *vport },
        [DpAction::Output(port)] => Shape::Output { port: *port },
        [DpAction::Clone(sub)] if recirc_id == 0 && !in_port_virtual => {
            match sub.as_slice() {
                [DpAction::TunnelPush(hdr), DpAction::Output(port)] => {
                    Shape::CloneEncap { header: &hdr.header, port: *port }
                }
                _ => Shape::MarkRss,
            }
        }
        [DpAction::Ct(spec)] => Shape::Ct(CtCls {
            has_nat: spec.nat.is_some(),
            recirc_id: None,
        }),
        [DpAction::Ct(spec), DpAction::Recirc(rid)] => Shape::Ct(CtCls {
            has_nat: spec.nat.is_some(),
            recirc_id: Some(*rid),
        }),
        _ => Shape::MarkRss,
    };

    Ok(ClsInfo { match_kind, recirc_id, tunnel, action_kind, shape })
}
