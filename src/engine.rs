//! Entry points that run each computation inside one store transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

use crate::config::{Config, DemandTableSource};
use crate::demand::{DemandCalculator, DemandFactorTable, DemandOutcome};
use crate::domain::{CircuitId, Mode, PanelId, Panel, Subsystem, TouchScope};
use crate::error::{CalcError, CalcResult};
use crate::phase_balance::{BalanceOutcome, PhaseBalancer};
use crate::repo::{finish, Store, StoreTx};
use crate::sections::{aggregate, SectionAggregation, SectionInputs};
use crate::staleness::{derive_status, format_timestamp, ChangeMonitor, StatusInfo, StatusSnapshot};
use crate::voltage_drop::{CircuitDrop, VoltageDropSolver};

/// Source of "now" for result timestamps
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Voltage-drop results of a whole panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelDrops {
    pub panel_id: PanelId,
    pub processed: usize,
    /// In circuit-name order
    pub circuits: Vec<CircuitDrop>,
}

/// Load-calculation engine over a shared store
pub struct CalcEngine<S: Store> {
    store: S,
    table: DemandFactorTable,
    balancer: PhaseBalancer,
    persist_sections: bool,
    clock: Clock,
}

impl<S: Store> CalcEngine<S> {
    /// Engine with the built-in demand table and default settings
    pub fn new(store: S) -> Self {
        Self {
            store,
            table: DemandFactorTable::standard(),
            balancer: PhaseBalancer::default(),
            persist_sections: true,
            clock: Arc::new(Utc::now),
        }
    }

    /// Engine configured from `config`, loading the demand table from the
    /// configured source.
    pub async fn from_config(store: S, config: &Config) -> CalcResult<Self> {
        let table = match config.demand.source {
            DemandTableSource::Builtin => DemandFactorTable::standard(),
            DemandTableSource::File => {
                let path = config.demand.table_path.as_ref().ok_or_else(|| {
                    CalcError::validation("demand.table_path is required when demand.source = \"file\"")
                })?;
                DemandFactorTable::from_file(path)?
            }
            DemandTableSource::Store => {
                let mut tx = store.begin().await?;
                let points = tx.demand_factor_points().await;
                let points = finish(tx, points).await?;
                if points.is_empty() {
                    return Err(CalcError::state("Store holds no demand factor table"));
                }
                DemandFactorTable::from_points(points)?
            }
        }
        .with_tolerance(config.demand.tolerance);

        info!(
            source = ?config.demand.source,
            rows = table.row_count(),
            respect_manual = config.phase_balance.respect_manual,
            "Calculation engine configured"
        );

        Ok(Self {
            store,
            table,
            balancer: PhaseBalancer::new(config.phase_balance.respect_manual),
            persist_sections: config.sections.persist,
            clock: Arc::new(Utc::now),
        })
    }

    pub fn with_table(mut self, table: DemandFactorTable) -> Self {
        self.table = table;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_balancer(mut self, balancer: PhaseBalancer) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn demand_table(&self) -> &DemandFactorTable {
        &self.table
    }

    /// Whether `aggregate_sections_default` writes its results
    pub fn persists_sections(&self) -> bool {
        self.persist_sections
    }

    pub async fn data_version(&self) -> CalcResult<u64> {
        self.store.data_version().await
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    // ========================================================================
    // Demand
    // ========================================================================

    /// Recompute and store the panel's row and panel demand results
    pub async fn compute_demand(&self, panel_id: PanelId) -> CalcResult<DemandOutcome> {
        let mut tx = self.store.begin().await?;
        let result = self.compute_demand_in(tx.as_mut(), panel_id).await;
        let outcome = finish(tx, result).await?;
        info!(
            panel_id = %panel_id,
            rows = outcome.rows.len(),
            pp_kw = outcome.panel.pp_kw,
            ip_a = outcome.panel.ip_a,
            "Demand computed"
        );
        Ok(outcome)
    }

    async fn compute_demand_in(&self, tx: &mut dyn StoreTx, panel_id: PanelId) -> CalcResult<DemandOutcome> {
        let panel = require_panel(tx, panel_id).await?;
        let rows = tx.load_rows(panel_id).await?;
        let outcome = DemandCalculator::new(&self.table).compute_panel(&panel, &rows, self.now())?;
        tx.replace_demand(&outcome.rows, &outcome.panel).await?;
        Ok(outcome)
    }

    // ========================================================================
    // Phase balance
    // ========================================================================

    /// Reassign automatic single-phase circuits and store the balance
    /// summary for (panel, mode).
    pub async fn balance_phases(&self, panel_id: PanelId, mode: Mode) -> CalcResult<BalanceOutcome> {
        let mut tx = self.store.begin().await?;
        let result = self.balance_phases_in(tx.as_mut(), panel_id, mode).await;
        let outcome = finish(tx, result).await?;
        info!(
            panel_id = %panel_id,
            mode = %mode,
            assigned = outcome.assignments_written(),
            unbalance_pct = outcome.balance.unbalance_pct,
            "Phases balanced"
        );
        Ok(outcome)
    }

    /// Same as [`balance_phases`](Self::balance_phases) for a textual mode
    pub async fn balance_phases_by_name(&self, panel_id: PanelId, mode: &str) -> CalcResult<BalanceOutcome> {
        self.balance_phases(panel_id, Mode::parse(mode)?).await
    }

    async fn balance_phases_in(&self, tx: &mut dyn StoreTx, panel_id: PanelId, mode: Mode) -> CalcResult<BalanceOutcome> {
        require_panel(tx, panel_id).await?;
        let circuits = tx.circuits(panel_id).await?;
        let emergency_sections = match mode {
            Mode::Emergency => tx.section_calcs(panel_id, Mode::Emergency).await?,
            Mode::Normal => Vec::new(),
        };
        let outcome = self
            .balancer
            .balance(panel_id, mode, &circuits, &emergency_sections, self.now())?;
        tx.assign_phases(&outcome.assignments).await?;
        tx.replace_phase_balance(&outcome.balance).await?;
        Ok(outcome)
    }

    // ========================================================================
    // Voltage drop
    // ========================================================================

    /// Select a cross-section for one circuit and store the result
    pub async fn compute_circuit_drop(&self, circuit_id: CircuitId) -> CalcResult<CircuitDrop> {
        let mut tx = self.store.begin().await?;
        let result = self.compute_circuit_drop_in(tx.as_mut(), circuit_id).await;
        finish(tx, result).await
    }

    async fn compute_circuit_drop_in(&self, tx: &mut dyn StoreTx, circuit_id: CircuitId) -> CalcResult<CircuitDrop> {
        let circuit = tx
            .circuit(circuit_id)
            .await?
            .ok_or_else(|| CalcError::validation(format!("Circuit {} not found", circuit_id)))?;
        let panel = require_panel(tx, circuit.panel_id).await?;
        let catalog = tx.cable_catalog().await?;
        let drop = VoltageDropSolver::new(&catalog).solve(&panel, &circuit, self.now())?;
        tx.replace_circuit_calc(&drop.calc).await?;
        Ok(drop)
    }

    /// Solve every circuit of a panel in name order; any failure discards
    /// the whole batch.
    pub async fn compute_panel_drops(&self, panel_id: PanelId) -> CalcResult<PanelDrops> {
        let mut tx = self.store.begin().await?;
        let result = self.compute_panel_drops_in(tx.as_mut(), panel_id).await;
        let drops = finish(tx, result).await?;
        let fallbacks = drops.circuits.iter().filter(|d| d.warning.is_some()).count();
        info!(panel_id = %panel_id, processed = drops.processed, fallbacks, "Voltage drop computed");
        Ok(drops)
    }

    async fn compute_panel_drops_in(&self, tx: &mut dyn StoreTx, panel_id: PanelId) -> CalcResult<PanelDrops> {
        let panel = require_panel(tx, panel_id).await?;
        let circuits = tx.circuits(panel_id).await?;
        let catalog = tx.cable_catalog().await?;
        let solver = VoltageDropSolver::new(&catalog);
        let at = self.now();

        let mut results = Vec::with_capacity(circuits.len());
        for circuit in &circuits {
            let drop = solver.solve(&panel, circuit, at)?;
            tx.replace_circuit_calc(&drop.calc).await?;
            results.push(drop);
        }
        Ok(PanelDrops {
            panel_id,
            processed: results.len(),
            circuits: results,
        })
    }

    // ========================================================================
    // Sections
    // ========================================================================

    /// Aggregate consumer loads per bus section for `mode`; with `persist`
    /// the panel's stored totals for that mode are replaced.
    pub async fn aggregate_sections(&self, panel_id: PanelId, mode: Mode, persist: bool) -> CalcResult<SectionAggregation> {
        let mut tx = self.store.begin().await?;
        let result = self.aggregate_sections_in(tx.as_mut(), panel_id, mode, persist).await;
        let aggregation = finish(tx, result).await?;
        info!(
            panel_id = %panel_id,
            mode = %mode,
            persist,
            sections = aggregation.sections.len(),
            skipped = aggregation.warnings.len(),
            "Sections aggregated"
        );
        Ok(aggregation)
    }

    /// [`aggregate_sections`](Self::aggregate_sections) with the configured persistence
    pub async fn aggregate_sections_default(&self, panel_id: PanelId, mode: Mode) -> CalcResult<SectionAggregation> {
        self.aggregate_sections(panel_id, mode, self.persist_sections).await
    }

    async fn aggregate_sections_in(
        &self,
        tx: &mut dyn StoreTx,
        panel_id: PanelId,
        mode: Mode,
        persist: bool,
    ) -> CalcResult<SectionAggregation> {
        require_panel(tx, panel_id).await?;
        let mut inputs = SectionInputs {
            bus_sections: tx.bus_sections(panel_id).await?,
            consumers: tx.consumers(panel_id).await?,
            feeds: tx.feeds(panel_id).await?,
            mode_rules: tx.mode_rules(panel_id).await?,
            referenced_calcs: HashMap::new(),
        };
        let referenced: Vec<PanelId> = inputs.consumers.iter().filter_map(|c| c.referenced_panel()).collect();
        for source in referenced {
            if inputs.referenced_calcs.contains_key(&source) {
                continue;
            }
            if let Some(calc) = tx.panel_calc(source).await? {
                inputs.referenced_calcs.insert(source, calc);
            }
        }

        let aggregation = aggregate(panel_id, mode, &inputs)?;
        if persist {
            let calcs = aggregation.to_calcs(self.now());
            tx.replace_section_calcs(panel_id, mode, &calcs).await?;
        }
        Ok(aggregation)
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Freshness of one subsystem's stored results. `mode` applies to the
    /// phase and sections subsystems. Never writes.
    pub async fn status(
        &self,
        panel_id: PanelId,
        subsystem: Subsystem,
        mode: Mode,
        external_change: bool,
    ) -> CalcResult<StatusInfo> {
        let mut tx = self.store.begin().await?;
        let result = snapshot(tx.as_mut(), panel_id, subsystem, mode).await;
        if let Err(error) = tx.rollback().await {
            warn!(panel_id = %panel_id, error = %error, "Rollback of status read failed");
        }
        Ok(derive_status(&result?, external_change))
    }

    /// Status of every subsystem, flagging external writes seen by `monitor`
    pub async fn panel_statuses(
        &self,
        panel_id: PanelId,
        mode: Mode,
        monitor: &ChangeMonitor,
    ) -> CalcResult<BTreeMap<Subsystem, StatusInfo>> {
        let external_change = monitor.is_external_change(self.data_version().await?);
        if external_change {
            warn!(panel_id = %panel_id, "Store changed outside this session");
        }
        let mut statuses = BTreeMap::new();
        for subsystem in [Subsystem::Demand, Subsystem::Phase, Subsystem::VoltageDrop, Subsystem::Sections] {
            let info = self.status(panel_id, subsystem, mode, external_change).await?;
            statuses.insert(subsystem, info);
        }
        Ok(statuses)
    }
}

async fn require_panel(tx: &mut dyn StoreTx, panel_id: PanelId) -> CalcResult<Panel> {
    let panel = tx
        .panel(panel_id)
        .await?
        .ok_or_else(|| CalcError::validation(format!("Panel {} not found", panel_id)))?;
    panel.validate()?;
    Ok(panel)
}

fn oldest(stamps: impl Iterator<Item = DateTime<Utc>>) -> Option<String> {
    stamps.min().map(format_timestamp)
}

async fn snapshot(tx: &mut dyn StoreTx, panel_id: PanelId, subsystem: Subsystem, mode: Mode) -> CalcResult<StatusSnapshot> {
    require_panel(tx, panel_id).await?;
    let panel_touch = Some(tx.input_touch(TouchScope::Panel(panel_id), subsystem).await?);

    let snapshot = match subsystem {
        Subsystem::Demand => {
            let rows = tx.load_rows(panel_id).await?;
            let calcs = tx.row_calcs(panel_id).await?;
            let panel_calc = tx.panel_calc(panel_id).await?;
            StatusSnapshot {
                applicable: true,
                input_count: rows.len(),
                expected_outputs: rows.len(),
                output_count: calcs.len(),
                calc_updated_at: panel_calc.map(|c| format_timestamp(c.updated_at)),
                panel_touch,
                ..Default::default()
            }
        }
        Subsystem::Phase => {
            let single_phase = tx
                .circuits(panel_id)
                .await?
                .iter()
                .filter(|c| c.is_single_phase())
                .count();
            let balance = tx.phase_balance(panel_id, mode).await?;
            StatusSnapshot {
                applicable: single_phase > 0,
                input_count: single_phase,
                expected_outputs: 1,
                output_count: usize::from(balance.is_some()),
                calc_updated_at: balance.map(|b| format_timestamp(b.updated_at)),
                panel_touch,
                ..Default::default()
            }
        }
        Subsystem::VoltageDrop => {
            let circuits = tx.circuits(panel_id).await?;
            let calcs = tx.circuit_calcs(panel_id).await?;
            let global_touch = Some(tx.input_touch(TouchScope::Global, subsystem).await?);
            StatusSnapshot {
                applicable: true,
                input_count: circuits.len(),
                expected_outputs: circuits.len(),
                output_count: calcs.len(),
                calc_updated_at: oldest(calcs.iter().map(|c| c.updated_at)),
                panel_touch,
                global_touch,
                upstream_calc_at: None,
            }
        }
        Subsystem::Sections => {
            let sections = tx.bus_sections(panel_id).await?;
            let calcs = tx.section_calcs(panel_id, mode).await?;
            let consumers = tx.consumers(panel_id).await?;
            let mut upstream: Option<DateTime<Utc>> = None;
            for source in consumers.iter().filter_map(|c| c.referenced_panel()) {
                if let Some(calc) = tx.panel_calc(source).await? {
                    upstream = upstream.max(Some(calc.updated_at));
                }
            }
            StatusSnapshot {
                applicable: true,
                input_count: sections.len(),
                expected_outputs: sections.len(),
                output_count: calcs.len(),
                calc_updated_at: oldest(calcs.iter().map(|c| c.updated_at)),
                panel_touch,
                global_touch: None,
                upstream_calc_at: upstream.map(format_timestamp),
            }
        }
    };
    Ok(snapshot)
}
