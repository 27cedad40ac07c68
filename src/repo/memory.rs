//! In-process store.
//!
//! A transaction reads from a private copy of the state and records its
//! writes. Commit replays those writes onto the current shared state, so
//! edits made by others in the meantime survive. A rolled-back or dropped
//! transaction leaves nothing behind.
//! The seeding methods stand in for the editing layer: they write inputs
//! and bump the data version the same way an outside writer would.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{Store, StoreTx};
use crate::demand::DemandFactorPoint;
use crate::domain::{
    BusSection, BusSectionId, CableCatalog, Circuit, CircuitCalc, CircuitId, Consumer, ConsumerId,
    Feed, FeedId, LoadRow, LoadRowId, Mode, ModeRule, Panel, PanelCalc, PanelId, PanelPhaseBalance,
    PhaseAssignment, PhaseSource, RowCalc, SectionCalc, Subsystem, TouchLookup, TouchScope,
};
use crate::error::{CalcError, CalcResult};

#[derive(Debug, Clone)]
struct StoreState {
    panels: BTreeMap<PanelId, Panel>,
    load_rows: BTreeMap<LoadRowId, LoadRow>,
    circuits: BTreeMap<CircuitId, Circuit>,
    catalog: CableCatalog,
    bus_sections: BTreeMap<BusSectionId, BusSection>,
    consumers: BTreeMap<ConsumerId, Consumer>,
    feeds: BTreeMap<FeedId, Feed>,
    mode_rules: BTreeMap<(ConsumerId, Mode), ModeRule>,
    demand_points: Vec<DemandFactorPoint>,
    touch_log_enabled: bool,
    touches: HashMap<(TouchScope, Subsystem), String>,

    row_calcs: BTreeMap<LoadRowId, RowCalc>,
    panel_calcs: BTreeMap<PanelId, PanelCalc>,
    circuit_calcs: BTreeMap<CircuitId, CircuitCalc>,
    section_calcs: BTreeMap<(PanelId, Mode, BusSectionId), SectionCalc>,
    phase_balances: BTreeMap<(PanelId, Mode), PanelPhaseBalance>,

    data_version: u64,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            panels: BTreeMap::new(),
            load_rows: BTreeMap::new(),
            circuits: BTreeMap::new(),
            catalog: CableCatalog::standard(),
            bus_sections: BTreeMap::new(),
            consumers: BTreeMap::new(),
            feeds: BTreeMap::new(),
            mode_rules: BTreeMap::new(),
            demand_points: Vec::new(),
            touch_log_enabled: true,
            touches: HashMap::new(),
            row_calcs: BTreeMap::new(),
            panel_calcs: BTreeMap::new(),
            circuit_calcs: BTreeMap::new(),
            section_calcs: BTreeMap::new(),
            phase_balances: BTreeMap::new(),
            data_version: 0,
        }
    }
}

/// Derived-record write held by a transaction until commit
#[derive(Debug, Clone)]
enum PendingWrite {
    Demand { rows: Vec<RowCalc>, panel: PanelCalc },
    CircuitCalc(CircuitCalc),
    Phases(Vec<PhaseAssignment>),
    PhaseBalance(PanelPhaseBalance),
    Sections {
        panel_id: PanelId,
        mode: Mode,
        calcs: Vec<SectionCalc>,
    },
}

impl PendingWrite {
    fn apply(&self, state: &mut StoreState) -> CalcResult<()> {
        match self {
            PendingWrite::Demand { rows, panel } => {
                for row in rows {
                    state.row_calcs.insert(row.row_id, row.clone());
                }
                state.panel_calcs.insert(panel.panel_id, panel.clone());
            }
            PendingWrite::CircuitCalc(calc) => {
                state.circuit_calcs.insert(calc.circuit_id, calc.clone());
            }
            PendingWrite::Phases(assignments) => {
                for assignment in assignments {
                    let circuit = state.circuits.get_mut(&assignment.circuit_id).ok_or_else(|| {
                        CalcError::state(format!("Circuit {} disappeared", assignment.circuit_id))
                    })?;
                    circuit.phase = Some(assignment.phase.to_string());
                    circuit.phase_source = PhaseSource::Auto;
                }
            }
            PendingWrite::PhaseBalance(balance) => {
                state
                    .phase_balances
                    .insert((balance.panel_id, balance.mode), balance.clone());
            }
            PendingWrite::Sections { panel_id, mode, calcs } => {
                state
                    .section_calcs
                    .retain(|(p, m, _), _| !(p == panel_id && m == mode));
                for calc in calcs {
                    state
                        .section_calcs
                        .insert((*panel_id, *mode, calc.bus_section_id), calc.clone());
                }
            }
        }
        Ok(())
    }
}

impl StoreState {
    fn consumer_ids(&self, panel_id: PanelId) -> Vec<ConsumerId> {
        self.consumers
            .values()
            .filter(|c| c.panel_id == panel_id)
            .map(|c| c.id)
            .collect()
    }
}

/// Shared in-memory store; clones are handles to the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn edit(&self, apply: impl FnOnce(&mut StoreState)) {
        let mut state = self.inner.write();
        apply(&mut state);
        state.data_version += 1;
    }

    pub fn insert_panel(&self, panel: Panel) {
        self.edit(|s| {
            s.panels.insert(panel.id, panel);
        });
    }

    pub fn insert_load_row(&self, row: LoadRow) {
        self.edit(|s| {
            s.load_rows.insert(row.id, row);
        });
    }

    pub fn remove_load_row(&self, row_id: LoadRowId) {
        self.edit(|s| {
            s.load_rows.remove(&row_id);
            s.row_calcs.remove(&row_id);
        });
    }

    pub fn insert_circuit(&self, circuit: Circuit) {
        self.edit(|s| {
            s.circuits.insert(circuit.id, circuit);
        });
    }

    /// Pin a circuit's phase by hand; the label is stored as given
    pub fn pin_circuit_phase(&self, circuit_id: CircuitId, phase: Option<&str>) {
        self.edit(|s| {
            if let Some(c) = s.circuits.get_mut(&circuit_id) {
                c.phase = phase.map(str::to_string);
                c.phase_source = PhaseSource::Manual;
            }
        });
    }

    pub fn set_cable_catalog(&self, catalog: CableCatalog) {
        self.edit(|s| s.catalog = catalog);
    }

    pub fn insert_bus_section(&self, section: BusSection) {
        self.edit(|s| {
            s.bus_sections.insert(section.id, section);
        });
    }

    pub fn insert_consumer(&self, consumer: Consumer) {
        self.edit(|s| {
            s.consumers.insert(consumer.id, consumer);
        });
    }

    pub fn insert_feed(&self, feed: Feed) {
        self.edit(|s| {
            s.feeds.insert(feed.id, feed);
        });
    }

    pub fn set_mode_rule(&self, rule: ModeRule) {
        self.edit(|s| {
            s.mode_rules.insert((rule.consumer_id, rule.mode), rule);
        });
    }

    pub fn set_demand_factor_points(&self, points: Vec<DemandFactorPoint>) {
        self.edit(|s| s.demand_points = points);
    }

    /// Record an input edit for (scope, subsystem)
    pub fn touch_input(&self, scope: TouchScope, subsystem: Subsystem, at: impl Into<String>) {
        let at = at.into();
        self.edit(|s| {
            s.touches.insert((scope, subsystem), at);
        });
    }

    /// Simulate a deployment without a touch log
    pub fn disable_touch_log(&self) {
        self.edit(|s| s.touch_log_enabled = false);
    }

    pub fn circuit(&self, circuit_id: CircuitId) -> Option<Circuit> {
        self.inner.read().circuits.get(&circuit_id).cloned()
    }

    pub fn stored_panel_calc(&self, panel_id: PanelId) -> Option<PanelCalc> {
        self.inner.read().panel_calcs.get(&panel_id).cloned()
    }

    pub fn stored_row_calc(&self, row_id: LoadRowId) -> Option<RowCalc> {
        self.inner.read().row_calcs.get(&row_id).cloned()
    }

    pub fn stored_circuit_calc(&self, circuit_id: CircuitId) -> Option<CircuitCalc> {
        self.inner.read().circuit_calcs.get(&circuit_id).cloned()
    }

    pub fn stored_phase_balance(&self, panel_id: PanelId, mode: Mode) -> Option<PanelPhaseBalance> {
        self.inner.read().phase_balances.get(&(panel_id, mode)).cloned()
    }

    pub fn stored_section_calcs(&self, panel_id: PanelId, mode: Mode) -> Vec<SectionCalc> {
        self.inner
            .read()
            .section_calcs
            .values()
            .filter(|c| c.panel_id == panel_id && c.mode == mode)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> CalcResult<Box<dyn StoreTx>> {
        let working = self.inner.read().clone();
        Ok(Box::new(MemoryTx {
            shared: Arc::clone(&self.inner),
            working,
            pending: Vec::new(),
        }))
    }

    async fn data_version(&self) -> CalcResult<u64> {
        Ok(self.inner.read().data_version)
    }
}

struct MemoryTx {
    shared: Arc<RwLock<StoreState>>,
    working: StoreState,
    pending: Vec<PendingWrite>,
}

impl MemoryTx {
    /// Apply to the working copy for read-your-writes, keep for commit
    fn write(&mut self, op: PendingWrite) -> CalcResult<()> {
        op.apply(&mut self.working)?;
        self.pending.push(op);
        Ok(())
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn panel(&mut self, panel_id: PanelId) -> CalcResult<Option<Panel>> {
        Ok(self.working.panels.get(&panel_id).cloned())
    }

    async fn load_rows(&mut self, panel_id: PanelId) -> CalcResult<Vec<LoadRow>> {
        Ok(self
            .working
            .load_rows
            .values()
            .filter(|r| r.panel_id == panel_id)
            .cloned()
            .collect())
    }

    async fn circuit(&mut self, circuit_id: CircuitId) -> CalcResult<Option<Circuit>> {
        Ok(self.working.circuits.get(&circuit_id).cloned())
    }

    async fn circuits(&mut self, panel_id: PanelId) -> CalcResult<Vec<Circuit>> {
        let mut circuits: Vec<Circuit> = self
            .working
            .circuits
            .values()
            .filter(|c| c.panel_id == panel_id)
            .cloned()
            .collect();
        circuits.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(circuits)
    }

    async fn cable_catalog(&mut self) -> CalcResult<CableCatalog> {
        Ok(self.working.catalog.clone())
    }

    async fn bus_sections(&mut self, panel_id: PanelId) -> CalcResult<Vec<BusSection>> {
        Ok(self
            .working
            .bus_sections
            .values()
            .filter(|s| s.panel_id == panel_id)
            .cloned()
            .collect())
    }

    async fn consumers(&mut self, panel_id: PanelId) -> CalcResult<Vec<Consumer>> {
        Ok(self
            .working
            .consumers
            .values()
            .filter(|c| c.panel_id == panel_id)
            .cloned()
            .collect())
    }

    async fn feeds(&mut self, panel_id: PanelId) -> CalcResult<Vec<Feed>> {
        let consumers = self.working.consumer_ids(panel_id);
        Ok(self
            .working
            .feeds
            .values()
            .filter(|f| consumers.contains(&f.consumer_id))
            .cloned()
            .collect())
    }

    async fn mode_rules(&mut self, panel_id: PanelId) -> CalcResult<Vec<ModeRule>> {
        let consumers = self.working.consumer_ids(panel_id);
        Ok(self
            .working
            .mode_rules
            .values()
            .filter(|r| consumers.contains(&r.consumer_id))
            .cloned()
            .collect())
    }

    async fn demand_factor_points(&mut self) -> CalcResult<Vec<DemandFactorPoint>> {
        Ok(self.working.demand_points.clone())
    }

    async fn input_touch(&mut self, scope: TouchScope, subsystem: Subsystem) -> CalcResult<TouchLookup> {
        if !self.working.touch_log_enabled {
            return Ok(TouchLookup::Unavailable);
        }
        Ok(match self.working.touches.get(&(scope, subsystem)) {
            Some(raw) => TouchLookup::Recorded(raw.clone()),
            None => TouchLookup::NotRecorded,
        })
    }

    async fn row_calcs(&mut self, panel_id: PanelId) -> CalcResult<Vec<RowCalc>> {
        let state = &self.working;
        Ok(state
            .load_rows
            .values()
            .filter(|r| r.panel_id == panel_id)
            .filter_map(|r| state.row_calcs.get(&r.id).cloned())
            .collect())
    }

    async fn panel_calc(&mut self, panel_id: PanelId) -> CalcResult<Option<PanelCalc>> {
        Ok(self.working.panel_calcs.get(&panel_id).cloned())
    }

    async fn circuit_calcs(&mut self, panel_id: PanelId) -> CalcResult<Vec<CircuitCalc>> {
        let state = &self.working;
        Ok(state
            .circuits
            .values()
            .filter(|c| c.panel_id == panel_id)
            .filter_map(|c| state.circuit_calcs.get(&c.id).cloned())
            .collect())
    }

    async fn section_calcs(&mut self, panel_id: PanelId, mode: Mode) -> CalcResult<Vec<SectionCalc>> {
        Ok(self
            .working
            .section_calcs
            .values()
            .filter(|c| c.panel_id == panel_id && c.mode == mode)
            .cloned()
            .collect())
    }

    async fn phase_balance(&mut self, panel_id: PanelId, mode: Mode) -> CalcResult<Option<PanelPhaseBalance>> {
        Ok(self.working.phase_balances.get(&(panel_id, mode)).cloned())
    }

    async fn replace_demand(&mut self, rows: &[RowCalc], panel: &PanelCalc) -> CalcResult<()> {
        self.write(PendingWrite::Demand {
            rows: rows.to_vec(),
            panel: panel.clone(),
        })
    }

    async fn replace_circuit_calc(&mut self, calc: &CircuitCalc) -> CalcResult<()> {
        self.write(PendingWrite::CircuitCalc(calc.clone()))
    }

    async fn assign_phases(&mut self, assignments: &[PhaseAssignment]) -> CalcResult<()> {
        self.write(PendingWrite::Phases(assignments.to_vec()))
    }

    async fn replace_phase_balance(&mut self, balance: &PanelPhaseBalance) -> CalcResult<()> {
        self.write(PendingWrite::PhaseBalance(balance.clone()))
    }

    async fn replace_section_calcs(&mut self, panel_id: PanelId, mode: Mode, calcs: &[SectionCalc]) -> CalcResult<()> {
        self.write(PendingWrite::Sections {
            panel_id,
            mode,
            calcs: calcs.to_vec(),
        })
    }

    async fn commit(self: Box<Self>) -> CalcResult<()> {
        let MemoryTx { shared, pending, .. } = *self;
        if pending.is_empty() {
            return Ok(());
        }
        let mut state = shared.write();
        // all or nothing: replay onto a copy of the current state
        let mut next = state.clone();
        for op in &pending {
            op.apply(&mut next)?;
        }
        next.data_version += 1;
        *state = next;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> CalcResult<()> {
        Ok(())
    }
}
