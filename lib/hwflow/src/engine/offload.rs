// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The offload core: port and flow lifecycle over the shared
//! registries.
//!
//! One `Offload` value holds every process-wide map. Control
//! operations (`port_add`/`port_del`, `flow_put`/`flow_del`) may run
//! concurrently with each other and with `preprocess`; within a single
//! flow id the datapath serialises put and del above us.

use crate::driver::DriverError;
use crate::driver::Netdev;
use crate::driver::RuleHandle;
use crate::engine::classify;
use crate::engine::classify::ClsInfo;
use crate::engine::classify::CtCls;
use crate::engine::classify::MatchKind;
use crate::engine::classify::Shape;
use crate::engine::flow_table::FlowResources;
use crate::engine::flow_table::OffloadRecord;
use crate::engine::miss::CtDirection;
use crate::engine::miss::MissTable;
use crate::engine::port::DefaultRule;
use crate::engine::port::PortKind;
use crate::engine::port::PortRecord;
use crate::engine::port::PortTable;
use crate::engine::rule::ActionItem;
use crate::engine::rule::ActionList;
use crate::engine::rule::FlowItems;
use crate::engine::rule::PatternList;
use crate::engine::rule::RssConf;
use crate::engine::rule::RuleAttr;
use crate::engine::table::TableIdRegistry;
use crate::engine::translate;
use crate::engine::tunnel::OuterId;
use crate::engine::tunnel::TunnelRegistry;
use crate::engine::validate::validate;
use crate::engine::Result;
use dashmap::DashMap;
use hwflow_api::CtState;
use hwflow_api::DpAction;
use hwflow_api::DpPort;
use hwflow_api::FlowId;
use hwflow_api::FlowStats;
use hwflow_api::Match;
use hwflow_api::OffloadError;
use hwflow_api::OffloadInfo;
use hwflow_api::CT_NAT_TABLE_ID;
use hwflow_api::CT_TABLE_ID;
use hwflow_api::MAX_PORT_TABLES;
use hwflow_api::ROOT_TABLE_ID;
use hwflow_api::VXLAN_EXCEPTION_MARK;
use hwflow_api::VXLAN_TABLE_ID;
use std::mem;
use std::sync::Arc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// The engine. Create one at startup and pass it explicitly; there is
/// no ambient state.
#[derive(Default)]
pub struct Offload {
    pub(crate) ports: PortTable,
    /// Side index so `flow_del` can find the owning port map.
    flow_to_port: DashMap<FlowId, DpPort>,
    pub(crate) tunnels: TunnelRegistry,
    tables: TableIdRegistry,
    pub(crate) miss: MissTable,
}

impl Offload {
    pub fn new() -> Self {
        Self::default()
    }

    /// The port registry, for inspection.
    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    /// The tunnel registry, for inspection.
    pub fn tunnels(&self) -> &TunnelRegistry {
        &self.tunnels
    }

    /// The table-id registry, for inspection.
    pub fn tables(&self) -> &TableIdRegistry {
        &self.tables
    }

    /// The miss-context table, for inspection.
    pub fn miss_table(&self) -> &MissTable {
        &self.miss
    }

    /// Start tracking a datapath port. Ports of types the pipeline
    /// cannot serve are ignored.
    pub fn port_add(
        &self,
        netdev: Arc<dyn Netdev>,
        dp_port: DpPort,
    ) -> Result<()> {
        let kind = PortKind::from_type(netdev.kind());

        if kind == PortKind::Unknown {
            debug!(%dp_port, ty = netdev.kind(), "no offload for port type");
            return Ok(());
        }

        if self.ports.contains(dp_port) {
            debug!(%dp_port, "offload port already exists");
            return Ok(());
        }

        let mut rec = PortRecord::new(dp_port, kind, netdev);
        match kind {
            PortKind::Dpdk => {
                rec.n_rxq = rec.netdev.n_rxq();
                rec.hw_port_id = rec.netdev.hw_port_id();
                self.ports.insert(Arc::new(rec));
                info!(%dp_port, "dpdk offload port allocated");
            }
            PortKind::Vxlan => {
                rec.table_id = VXLAN_TABLE_ID;
                rec.exception_mark = VXLAN_EXCEPTION_MARK;
                let rec = Arc::new(rec);
                self.ports.insert(Arc::clone(&rec));
                self.ports.register_mark(&rec);
                info!(%dp_port, table_id = rec.table_id, "vxlan offload port allocated");
            }
            PortKind::Unknown => unreachable!(),
        }

        Ok(())
    }

    /// Stop tracking a datapath port, destroying every offload record
    /// and default rule installed through it.
    pub fn port_del(&self, dp_port: DpPort) -> Result<()> {
        let rec = self.ports.remove(dp_port).ok_or_else(|| {
            debug!(%dp_port, "port has no offload record");
            OffloadError::PortNotFound(dp_port)
        })?;

        debug!(%dp_port, n_flows = rec.flows.len(), "removing datapath port");

        for flow in rec.flows.drain() {
            self.flow_to_port.remove(&flow.flow_id);
            self.destroy_record(flow);
        }

        match rec.kind {
            PortKind::Dpdk => rec.destroy_default_rules(),
            PortKind::Vxlan => self.ports.unregister_mark(&rec),
            PortKind::Unknown => {}
        }

        Ok(())
    }

    /// Install (or atomically replace) the hardware rules for one
    /// logical flow.
    pub fn flow_put(
        &self,
        m: &Match,
        actions: &[DpAction],
        flow_id: FlowId,
        info: &mut OffloadInfo,
        stats: Option<&mut FlowStats>,
    ) -> Result<()> {
        let _ = stats;

        if actions.is_empty() {
            debug!(%flow_id, "skip flow offload without actions");
            return Ok(());
        }

        let in_port = m.flow.in_port;
        let port = self.ports.get(in_port).ok_or_else(|| {
            warn!(%in_port, "failed to find offload port");
            OffloadError::InvalidPort(in_port)
        })?;

        match port.kind {
            PortKind::Dpdk => self.put_phys(&port, m, actions, flow_id, info),
            PortKind::Vxlan => self.put_vport(&port, m, actions, flow_id, info),
            PortKind::Unknown => Err(OffloadError::InvalidPort(in_port)),
        }
    }

    /// Destroy the hardware rules of one logical flow.
    pub fn flow_del(
        &self,
        flow_id: FlowId,
        stats: Option<&mut FlowStats>,
    ) -> Result<()> {
        let _ = stats;

        let dp_port = self
            .flow_to_port
            .get(&flow_id)
            .map(|r| *r)
            .ok_or(OffloadError::FlowNotFound(flow_id))?;

        let port = self.ports.get(dp_port).ok_or_else(|| {
            error!(%dp_port, "failed to find port for offloaded flow");
            OffloadError::PortNotFound(dp_port)
        })?;

        self.flow_to_port.remove(&flow_id);
        if let Some(rec) = port.flows.remove(flow_id) {
            self.destroy_record(rec);
        }

        Ok(())
    }

    /// Bind a conntrack rule to its mark's miss context, so the
    /// preprocessor can restore connection state after a partial hit.
    #[allow(clippy::too_many_arguments)]
    pub fn ct_miss_save(
        &self,
        mark: u32,
        rule: RuleHandle,
        ct_mark: u32,
        ct_zone: u16,
        ct_state: CtState,
        outer_id: Option<OuterId>,
        dir: CtDirection,
    ) -> Result<()> {
        self.miss.save_ct(mark, rule, ct_mark, ct_zone, ct_state, outer_id, dir)
    }

    /// Drop a conntrack miss context. Call before the rules it refers
    /// to are destroyed.
    pub fn ct_miss_del(&self, mark: u32) {
        self.miss.delete(mark);
    }

    // ================================================================
    // Local (physical in-port) path
    // ================================================================

    fn put_phys(
        &self,
        port: &Arc<PortRecord>,
        m: &Match,
        actions: &[DpAction],
        flow_id: FlowId,
        info: &mut OffloadInfo,
    ) -> Result<()> {
        validate(m, false)?;
        let cls = classify::classify(m, actions, false)?;

        let mut res = FlowResources::default();
        let out = self.put_phys_install(port, m, flow_id, info, &cls, &mut res);
        if out.is_err() {
            self.release_resources(&mut res);
        }
        out
    }

    fn put_phys_install(
        &self,
        port: &Arc<PortRecord>,
        m: &Match,
        flow_id: FlowId,
        info: &mut OffloadInfo,
        cls: &ClsInfo<'_>,
        res: &mut FlowResources,
    ) -> Result<()> {
        let mut items = FlowItems::default();
        let layout = translate::match_flow_items(m, &mut items)?;

        // Resolve the table this match anchors in, taking the
        // registry references the flow will hold.
        let mut outer_id: Option<OuterId> = None;
        let group = match cls.match_kind {
            MatchKind::Root => ROOT_TABLE_ID,
            MatchKind::Recirc => {
                let hw = self
                    .tables
                    .get_or_alloc(cls.recirc_id, false)
                    .ok_or(OffloadError::Exhausted("hw-table-id pool"))?;
                res.match_table = Some(cls.recirc_id);

                if let Some(t) = cls.tunnel {
                    let id = self
                        .tunnels
                        .get_or_alloc(t)
                        .ok_or(OffloadError::Exhausted("outer-id pool"))?;
                    res.outer = Some(t);
                    outer_id = Some(id);
                }
                hw.0
            }
            MatchKind::VportRoot => {
                unreachable!("virtual in-ports dispatch to the vport path")
            }
        };

        let mut patterns = PatternList::new();
        translate::emit_match(&items, layout, &mut patterns);
        patterns.finish();

        match cls.shape {
            Shape::TnlPop { vport } => {
                let vrec = self
                    .ports
                    .get(vport)
                    .filter(|r| r.kind == PortKind::Vxlan)
                    .ok_or(OffloadError::InvalidPort(vport))?;

                let attr = RuleAttr {
                    group: ROOT_TABLE_ID,
                    priority: 0,
                    ingress: true,
                    egress: false,
                    transfer: true,
                };
                let mut acts = ActionList::new();
                acts.push(ActionItem::Jump { group: vrec.table_id });
                acts.push(ActionItem::Count);
                acts.finish();

                self.remove_flow(port, flow_id);
                let handle = port
                    .netdev
                    .rule_create(&attr, patterns.items(), acts.items())
                    .map_err(|e| self.driver_err(&*port.netdev, e))?;

                // The jump is useless unless the destination table has
                // its exception default rule; a miss there would
                // otherwise be dropped instead of handed to software.
                if let Err(e) = self.ref_default_rule(port, &vrec) {
                    if let Err(de) = port.netdev.rule_destroy(handle) {
                        error!(netdev = port.netdev.name(), error = %de,
                            "rule destroy failed");
                    }
                    return Err(e);
                }
                res.default_rule = Some((port.dp_port, vrec.table_id));

                let mut rec = OffloadRecord::new(flow_id, 1);
                rec.add_rule(handle, Arc::clone(&port.netdev));
                rec.resources = mem::take(res);
                self.insert_record(port, rec);
                info.is_hwol = true;
            }

            Shape::Output { port: out_port } => {
                let out = self
                    .ports
                    .get(out_port)
                    .ok_or(OffloadError::InvalidPort(out_port))?;

                let attr = RuleAttr {
                    group,
                    priority: 0,
                    ingress: true,
                    egress: false,
                    transfer: true,
                };
                let mut acts = ActionList::new();
                acts.push(ActionItem::Count);
                acts.push(ActionItem::PortId { id: out.hw_port_id });
                acts.finish();

                self.remove_flow(port, flow_id);
                let handle = port
                    .netdev
                    .rule_create(&attr, patterns.items(), acts.items())
                    .map_err(|e| self.driver_err(&*port.netdev, e))?;

                let mut rec = OffloadRecord::new(flow_id, 1);
                rec.add_rule(handle, Arc::clone(&port.netdev));
                rec.resources = mem::take(res);
                self.insert_record(port, rec);
                info.is_hwol = true;
            }

            Shape::CloneEncap { header, port: out_port } => {
                let out = self
                    .ports
                    .get(out_port)
                    .ok_or(OffloadError::InvalidPort(out_port))?;

                self.remove_flow(port, flow_id);

                // The encap rule performs better out of the root
                // table, so a catch-all in the NIC root forwards
                // everything there first.
                let jump = translate::install_clone_jump(&*port.netdev)
                    .map_err(|e| self.driver_err(&*port.netdev, e))?;

                let mut rec = OffloadRecord::new(flow_id, 2);
                rec.add_rule(jump, Arc::clone(&port.netdev));

                let attr = RuleAttr {
                    group: ROOT_TABLE_ID,
                    priority: 0,
                    ingress: true,
                    egress: false,
                    transfer: true,
                };
                let mut acts = ActionList::new();
                acts.push(ActionItem::RawEncap(header));
                acts.push(ActionItem::Count);
                acts.push(ActionItem::PortId { id: out.hw_port_id });
                acts.finish();

                match port.netdev.rule_create(&attr, patterns.items(), acts.items())
                {
                    Ok(handle) => rec.add_rule(handle, Arc::clone(&port.netdev)),
                    Err(e) => {
                        rec.destroy_rules();
                        return Err(self.driver_err(&*port.netdev, e));
                    }
                }

                rec.resources = mem::take(res);
                self.insert_record(port, rec);
                info.is_hwol = true;
            }

            Shape::Ct(ct) => {
                let (hw, is_port) = self.ref_ct_table(port, ct, res)?;
                let target =
                    if ct.has_nat { CT_NAT_TABLE_ID } else { CT_TABLE_ID };

                let attr = RuleAttr {
                    group,
                    priority: 0,
                    ingress: true,
                    egress: false,
                    transfer: true,
                };
                let mut acts = ActionList::new();
                acts.push(ActionItem::Mark { id: info.flow_mark });
                acts.push(ActionItem::Count);
                acts.push(ActionItem::Jump { group: target });
                acts.finish();

                self.remove_flow(port, flow_id);
                let handle = port
                    .netdev
                    .rule_create(&attr, patterns.items(), acts.items())
                    .map_err(|e| self.driver_err(&*port.netdev, e))?;

                self.miss.save_flow(
                    info.flow_mark,
                    hw,
                    is_port,
                    outer_id,
                    port.dp_port,
                    true,
                );
                res.miss_mark = Some(info.flow_mark);

                let mut rec = OffloadRecord::new(flow_id, 1);
                rec.add_rule(handle, Arc::clone(&port.netdev));
                rec.resources = mem::take(res);
                self.insert_record(port, rec);
                info.is_hwol = true;
            }

            Shape::MarkRss => {
                // Partial offload: tag and spread, software finishes
                // the actions.
                let attr = RuleAttr {
                    group,
                    priority: 0,
                    ingress: true,
                    egress: false,
                    transfer: false,
                };
                let rss = RssConf::all_queues(port.n_rxq);
                let mut acts = ActionList::new();
                acts.push(ActionItem::Mark { id: info.flow_mark });
                acts.push(ActionItem::Rss(&rss));
                acts.finish();

                self.remove_flow(port, flow_id);
                let handle = port
                    .netdev
                    .rule_create(&attr, patterns.items(), acts.items())
                    .map_err(|e| self.driver_err(&*port.netdev, e))?;

                let mut rec = OffloadRecord::new(flow_id, 1);
                rec.add_rule(handle, Arc::clone(&port.netdev));
                rec.resources = mem::take(res);
                self.insert_record(port, rec);
                info.is_hwol = false;
            }
        }

        Ok(())
    }

    // ================================================================
    // Tunnel (virtual in-port) path: fan out across the uplinks
    // ================================================================

    fn put_vport(
        &self,
        port: &Arc<PortRecord>,
        m: &Match,
        actions: &[DpAction],
        flow_id: FlowId,
        info: &mut OffloadInfo,
    ) -> Result<()> {
        validate(m, true)?;
        let cls = classify::classify(m, actions, true)?;

        let uplinks = self.ports.uplinks();
        if uplinks.is_empty() {
            warn!(%flow_id, "tunnel flow offload with no uplink ports");
            return Err(OffloadError::NoUplink);
        }

        let mut res = FlowResources::default();
        let out = self.put_vport_install(
            port, m, flow_id, info, &cls, &uplinks, &mut res,
        );
        if out.is_err() {
            self.release_resources(&mut res);
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn put_vport_install(
        &self,
        port: &Arc<PortRecord>,
        m: &Match,
        flow_id: FlowId,
        info: &mut OffloadInfo,
        cls: &ClsInfo<'_>,
        uplinks: &[Arc<PortRecord>],
        res: &mut FlowResources,
    ) -> Result<()> {
        // Tunnel and table references, taken once for the whole
        // fan-out.
        let mut outer_id: Option<OuterId> = None;
        if let Some(t) = cls.tunnel {
            let id = self
                .tunnels
                .get_or_alloc(t)
                .ok_or(OffloadError::Exhausted("outer-id pool"))?;
            res.outer = Some(t);
            outer_id = Some(id);
        }

        let decap = cls.match_kind == MatchKind::VportRoot;
        let group = match cls.match_kind {
            MatchKind::VportRoot => port.table_id,
            MatchKind::Recirc => {
                let hw = self
                    .tables
                    .get_or_alloc(cls.recirc_id, false)
                    .ok_or(OffloadError::Exhausted("hw-table-id pool"))?;
                res.match_table = Some(cls.recirc_id);
                hw.0
            }
            MatchKind::Root => {
                unreachable!("physical in-ports dispatch to the local path")
            }
        };

        // Outer header first, then the inner match.
        let mut outer_items = FlowItems::default();
        let mut inner_items = FlowItems::default();
        let inner_layout = translate::match_flow_items(m, &mut inner_items)?;

        let mut patterns = PatternList::new();
        if decap {
            translate::vxlan_flow_items(m, &mut outer_items)?;
            translate::emit_vxlan(&outer_items, &mut patterns);
        }
        translate::emit_match(&inner_items, inner_layout, &mut patterns);
        patterns.finish();

        // Shape-level lookups, before the old record is torn down.
        let mut out_hw_port: Option<u16> = None;
        let mut ct_target: Option<(u32, bool, u32)> = None;
        match cls.shape {
            Shape::Output { port: out_port } => {
                let out = self
                    .ports
                    .get(out_port)
                    .ok_or(OffloadError::InvalidPort(out_port))?;
                out_hw_port = Some(out.hw_port_id);
            }
            Shape::Ct(ct) => {
                let (hw, is_port) = self.ref_ct_table(port, ct, res)?;
                let target =
                    if ct.has_nat { CT_NAT_TABLE_ID } else { CT_TABLE_ID };
                ct_target = Some((hw, is_port, target));
            }
            Shape::MarkRss => {}
            Shape::TnlPop { .. } | Shape::CloneEncap { .. } => {
                unreachable!("rejected by the classifier on virtual ports")
            }
        }

        self.remove_flow(port, flow_id);

        // Pre-size to the physical-port count; rules land on uplinks
        // only.
        let mut rec =
            OffloadRecord::new(flow_id, self.ports.phys_count() as usize);
        let mut fully_offloaded = true;
        let mut failed: Option<(String, DriverError)> = None;

        for up in uplinks {
            let attr = RuleAttr {
                group,
                priority: 0,
                ingress: true,
                egress: false,
                transfer: !matches!(cls.shape, Shape::MarkRss),
            };

            let rss;
            let mut acts = ActionList::new();
            if decap {
                acts.push(ActionItem::VxlanDecap);
            }
            match cls.shape {
                Shape::Output { .. } => {
                    acts.push(ActionItem::Count);
                    acts.push(ActionItem::PortId { id: out_hw_port.unwrap() });
                }
                Shape::Ct(_) => {
                    let (_, _, target) = ct_target.unwrap();
                    acts.push(ActionItem::Mark { id: info.flow_mark });
                    acts.push(ActionItem::Count);
                    acts.push(ActionItem::Jump { group: target });
                }
                Shape::MarkRss => {
                    rss = RssConf::all_queues(up.n_rxq);
                    acts.push(ActionItem::Mark { id: info.flow_mark });
                    acts.push(ActionItem::Rss(&rss));
                    fully_offloaded = false;
                }
                Shape::TnlPop { .. } | Shape::CloneEncap { .. } => {
                    unreachable!()
                }
            }
            acts.finish();

            match up.netdev.rule_create(&attr, patterns.items(), acts.items()) {
                Ok(handle) => {
                    debug!(netdev = up.netdev.name(), "eSwitch offload succeeded");
                    rec.add_rule(handle, Arc::clone(&up.netdev));
                }
                Err(e) => {
                    error!(
                        netdev = up.netdev.name(),
                        error = %e,
                        "rule create offload error"
                    );

                    // The uplink rejected the full rule; degrade this
                    // uplink to decap + mark + RSS so software can
                    // finish the job.
                    fully_offloaded = false;
                    let frss = RssConf::all_queues(up.n_rxq);
                    let mut facts = ActionList::new();
                    if decap {
                        facts.push(ActionItem::VxlanDecap);
                    }
                    facts.push(ActionItem::Mark { id: info.flow_mark });
                    facts.push(ActionItem::Rss(&frss));
                    facts.finish();

                    let fattr = RuleAttr { transfer: false, ..attr };
                    match up.netdev.rule_create(
                        &fattr,
                        patterns.items(),
                        facts.items(),
                    ) {
                        Ok(handle) => {
                            debug!(
                                netdev = up.netdev.name(),
                                "NIC partial offload succeeded"
                            );
                            rec.add_rule(handle, Arc::clone(&up.netdev));
                        }
                        Err(e2) => {
                            error!(
                                netdev = up.netdev.name(),
                                error = %e2,
                                "partial offload failed too"
                            );
                            failed = Some((up.netdev.name().to_string(), e2));
                        }
                    }
                }
            }
        }

        if let Some((hw, is_port, _)) = ct_target {
            self.miss.save_flow(
                info.flow_mark,
                hw,
                is_port,
                outer_id,
                port.dp_port,
                true,
            );
            res.miss_mark = Some(info.flow_mark);
        }

        info.is_hwol = fully_offloaded && !matches!(cls.shape, Shape::MarkRss);
        rec.resources = mem::take(res);
        self.insert_record(port, rec);

        // Best effort: keep what installed, report the failure.
        match failed {
            Some((netdev, e)) => {
                Err(OffloadError::Driver { netdev, msg: e.to_string() })
            }
            None => Ok(()),
        }
    }

    // ================================================================
    // Shared plumbing
    // ================================================================

    /// Take the table-registry reference a CT continuation needs: the
    /// recirculation id's table, or the ingress port intern when the
    /// list does not recirculate.
    fn ref_ct_table(
        &self,
        port: &PortRecord,
        ct: CtCls,
        res: &mut FlowResources,
    ) -> Result<(u32, bool)> {
        match ct.recirc_id {
            Some(rid) => {
                let hw = self
                    .tables
                    .get_or_alloc(rid, false)
                    .ok_or(OffloadError::Exhausted("hw-table-id pool"))?;
                res.action_table = Some((rid, false));
                Ok((hw.0, false))
            }
            None => {
                let hw = self
                    .tables
                    .get_or_alloc(port.dp_port.0, true)
                    .ok_or(OffloadError::Exhausted("hw-table-id pool"))?;
                res.action_table = Some((port.dp_port.0, true));
                Ok((hw.0, true))
            }
        }
    }

    /// Install (or take another reference on) the default rule behind
    /// a (physical port, virtual-port table) pair.
    fn ref_default_rule(
        &self,
        phys: &PortRecord,
        vport: &PortRecord,
    ) -> Result<()> {
        let idx = vport.table_id as usize;
        assert!(idx < MAX_PORT_TABLES, "default rule slot {idx} out of range");

        let mut slots = phys.default_rules.lock();
        if let Some(rule) = slots[idx].as_mut() {
            rule.refs += 1;
            return Ok(());
        }

        let handle = translate::install_default_rule(
            &*phys.netdev,
            phys.n_rxq,
            vport.table_id,
            vport.exception_mark,
        )
        .map_err(|e| self.driver_err(&*phys.netdev, e))?;

        debug!(
            netdev = phys.netdev.name(),
            table_id = vport.table_id,
            "default exception rule installed"
        );
        slots[idx] = Some(DefaultRule { handle, refs: 1 });
        Ok(())
    }

    /// Drop one reference on a default rule, destroying it when the
    /// last tunnel-pop flow using it goes away.
    fn unref_default_rule(&self, dp_port: DpPort, table_id: u32) {
        // A missing port means port_del already swept the rule.
        let Some(port) = self.ports.get(dp_port) else {
            return;
        };

        let mut slots = port.default_rules.lock();
        let idx = table_id as usize;
        if let Some(rule) = slots[idx].as_mut() {
            rule.refs -= 1;
            if rule.refs == 0 {
                let handle = rule.handle;
                slots[idx] = None;
                if let Err(e) = port.netdev.rule_destroy(handle) {
                    error!(
                        netdev = port.netdev.name(),
                        error = %e,
                        "default rule destroy failed"
                    );
                }
            }
        }
    }

    /// Destroy the previous record for this flow id, if any. A hit
    /// means the put is a modification.
    fn remove_flow(&self, port: &PortRecord, flow_id: FlowId) {
        if let Some(rec) = port.flows.remove(flow_id) {
            debug!(%flow_id, "flow modification, destroying previous rules");
            self.flow_to_port.remove(&flow_id);
            self.destroy_record(rec);
        }
    }

    fn insert_record(&self, port: &PortRecord, rec: OffloadRecord) {
        let _ = self.flow_to_port.entry(rec.flow_id).or_insert(port.dp_port);
        if let Some(old) = port.flows.put(rec) {
            self.destroy_record(old);
        }
    }

    /// Tear down one offload record: miss context first (it refers to
    /// the rules), then the rules, then the registry references.
    fn destroy_record(&self, mut rec: OffloadRecord) {
        if let Some(mark) = rec.resources.miss_mark.take() {
            self.miss.delete(mark);
        }
        rec.destroy_rules();
        let mut res = rec.resources;
        self.release_resources(&mut res);
    }

    /// Give back every registry reference a put acquired.
    fn release_resources(&self, res: &mut FlowResources) {
        if let Some(mark) = res.miss_mark.take() {
            self.miss.delete(mark);
        }
        if let Some(t) = res.outer.take() {
            self.tunnels.unref(&t);
        }
        if let Some(rid) = res.match_table.take() {
            self.tables.unref(rid, false);
        }
        if let Some((key, is_port)) = res.action_table.take() {
            self.tables.unref(key, is_port);
        }
        if let Some((dp_port, table_id)) = res.default_rule.take() {
            self.unref_default_rule(dp_port, table_id);
        }
    }

    fn driver_err(&self, netdev: &dyn Netdev, e: DriverError) -> OffloadError {
        error!(netdev = netdev.name(), error = %e, "rule create offload error");
        OffloadError::Driver { netdev: netdev.name().to_string(), msg: e.to_string() }
    }
}

impl core::fmt::Debug for Offload {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Offload")
            .field("n_ports", &self.ports.len())
            .field("n_flows", &self.flow_to_port.len())
            .field("n_tunnels", &self.tunnels.len())
            .field("n_miss_ctx", &self.miss.len())
            .finish()
    }
}
