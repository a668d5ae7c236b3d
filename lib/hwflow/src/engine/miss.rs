// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The miss-context table.
//!
//! A partially offloaded flow consumes metadata in hardware (tunnel
//! headers, conntrack state, the recirculation position) that software
//! needs back when the packet hits the rule but then misses. The rule
//! tags such packets with a mark; this table maps the mark to a
//! recovery record.
//!
//! A context holds a rule handle while the rule's mark keys the
//! context; the cycle is broken by lifecycle order: the context is
//! always deleted before the rule is destroyed.

use crate::driver::RuleHandle;
use crate::engine::tunnel::OuterId;
use crate::engine::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hwflow_api::CtState;
use hwflow_api::DpPort;
use hwflow_api::OffloadError;
use tracing::warn;

/// Conntrack offload direction. Initiator and reply rules of one
/// connection share a single miss context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CtDirection {
    Init,
    Reply,
}

impl CtDirection {
    fn index(self) -> usize {
        match self {
            Self::Init => 0,
            Self::Reply => 1,
        }
    }
}

/// Recovery record for a conntrack rule.
#[derive(Clone, Copy, Debug, Default)]
pub struct CtMissCtx {
    pub ct_mark: u32,
    pub ct_zone: u16,
    pub ct_state: CtState,
    pub outer_id: Option<OuterId>,
    /// Per-direction ingress port, `[init, reply]`.
    pub in_port: [Option<DpPort>; 2],
    /// Per-direction rule handle, `[init, reply]`.
    pub rules: [Option<RuleHandle>; 2],
}

/// Recovery record for a flow rule.
#[derive(Clone, Copy, Debug)]
pub struct FlowMissCtx {
    pub outer_id: Option<OuterId>,
    /// The hardware table the packet was headed for.
    pub hw_id: u32,
    /// Whether `hw_id` interns a port id rather than a recirc id.
    pub is_port: bool,
    pub in_port: DpPort,
}

/// What a mark recovers to.
#[derive(Clone, Copy, Debug)]
pub enum MissCtx {
    Ct(CtMissCtx),
    Flow(FlowMissCtx),
    FlowCt(FlowMissCtx),
}

/// Process-global map from mark value to recovery record.
#[derive(Debug, Default)]
pub struct MissTable {
    map: DashMap<u32, MissCtx>,
}

impl MissTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the recovery record for a flow rule's mark.
    pub fn save_flow(
        &self,
        mark: u32,
        hw_id: u32,
        is_port: bool,
        outer_id: Option<OuterId>,
        in_port: DpPort,
        has_ct: bool,
    ) {
        let ctx = FlowMissCtx { outer_id, hw_id, is_port, in_port };
        let ctx = if has_ct { MissCtx::FlowCt(ctx) } else { MissCtx::Flow(ctx) };
        self.map.insert(mark, ctx);
    }

    /// Register (or extend) the recovery record for a conntrack rule's
    /// mark. Both directions of a connection land in one entry; a
    /// direction can only be bound once.
    #[allow(clippy::too_many_arguments)]
    pub fn save_ct(
        &self,
        mark: u32,
        rule: RuleHandle,
        ct_mark: u32,
        ct_zone: u16,
        ct_state: CtState,
        outer_id: Option<OuterId>,
        dir: CtDirection,
    ) -> Result<()> {
        let idx = dir.index();
        match self.map.entry(mark) {
            Entry::Occupied(mut e) => match e.get_mut() {
                MissCtx::Ct(ctx) => {
                    if ctx.rules[idx].is_some() {
                        warn!(mark, ?dir, "ct rule already bound for mark");
                        return Err(OffloadError::CtExists(mark));
                    }
                    ctx.ct_mark = ct_mark;
                    ctx.ct_zone = ct_zone;
                    ctx.ct_state = ct_state;
                    ctx.outer_id = outer_id;
                    ctx.rules[idx] = Some(rule);
                    Ok(())
                }
                other => {
                    // The mark was re-purposed; start a fresh context.
                    warn!(mark, ?other, "replacing non-ct miss context");
                    let mut ctx = CtMissCtx {
                        ct_mark,
                        ct_zone,
                        ct_state,
                        outer_id,
                        ..Default::default()
                    };
                    ctx.rules[idx] = Some(rule);
                    *other = MissCtx::Ct(ctx);
                    Ok(())
                }
            },
            Entry::Vacant(v) => {
                let mut ctx = CtMissCtx {
                    ct_mark,
                    ct_zone,
                    ct_state,
                    outer_id,
                    ..Default::default()
                };
                ctx.rules[idx] = Some(rule);
                let _ = v.insert(MissCtx::Ct(ctx));
                Ok(())
            }
        }
    }

    pub fn lookup(&self, mark: u32) -> Option<MissCtx> {
        self.map.get(&mark).map(|r| *r)
    }

    pub fn delete(&self, mark: u32) {
        self.map.remove(&mark);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flow_context_round_trip() {
        let table = MissTable::new();
        table.save_flow(0x40, 70, false, None, DpPort(3), false);

        match table.lookup(0x40) {
            Some(MissCtx::Flow(ctx)) => {
                assert_eq!(ctx.hw_id, 70);
                assert!(!ctx.is_port);
                assert_eq!(ctx.in_port, DpPort(3));
            }
            other => panic!("unexpected context {other:?}"),
        }

        table.delete(0x40);
        assert!(table.lookup(0x40).is_none());
    }

    #[test]
    fn has_ct_selects_the_flow_ct_variant() {
        let table = MissTable::new();
        table.save_flow(0x41, 70, true, None, DpPort(3), true);
        assert!(matches!(table.lookup(0x41), Some(MissCtx::FlowCt(_))));
    }

    #[test]
    fn ct_directions_share_one_entry() {
        let table = MissTable::new();
        table
            .save_ct(0x50, RuleHandle(1), 7, 0, CtState::ESTABLISHED, None, CtDirection::Init)
            .unwrap();
        table
            .save_ct(0x50, RuleHandle(2), 7, 0, CtState::ESTABLISHED, None, CtDirection::Reply)
            .unwrap();

        assert_eq!(table.len(), 1);
        match table.lookup(0x50) {
            Some(MissCtx::Ct(ctx)) => {
                assert_eq!(ctx.rules, [Some(RuleHandle(1)), Some(RuleHandle(2))]);
                assert_eq!(ctx.ct_mark, 7);
            }
            other => panic!("unexpected context {other:?}"),
        }
    }

    #[test]
    fn double_binding_a_direction_fails() {
        let table = MissTable::new();
        table
            .save_ct(0x51, RuleHandle(1), 0, 0, CtState::empty(), None, CtDirection::Init)
            .unwrap();
        let err = table
            .save_ct(0x51, RuleHandle(3), 0, 0, CtState::empty(), None, CtDirection::Init)
            .unwrap_err();
        assert_eq!(err, OffloadError::CtExists(0x51));
    }
}
