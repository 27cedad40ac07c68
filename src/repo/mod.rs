//! Transactional access to the shared project store.
//!
//! Every computation runs inside one [`StoreTx`]: it reads its inputs,
//! replaces the derived records it owns and commits, or rolls back on the
//! first failure so no partial result is ever visible.

use async_trait::async_trait;
use tracing::warn;

use crate::domain::{
    BusSection, CableCatalog, Circuit, CircuitCalc, CircuitId, Consumer, Feed, LoadRow, Mode, ModeRule, Panel,
    PanelCalc, PanelId, PanelPhaseBalance, PhaseAssignment, RowCalc, SectionCalc, Subsystem,
    TouchLookup, TouchScope,
};
use crate::demand::DemandFactorPoint;
use crate::error::CalcResult;

pub mod memory;
#[cfg(feature = "db")]
pub mod pg;

pub use memory::MemoryStore;
#[cfg(feature = "db")]
pub use pg::PgStore;

/// Handle to the shared store
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> CalcResult<Box<dyn StoreTx>>;

    /// Counter that changes whenever anyone commits a write
    async fn data_version(&self) -> CalcResult<u64>;
}

/// One all-or-nothing unit of work
#[async_trait]
pub trait StoreTx: Send {
    // Inputs

    async fn panel(&mut self, panel_id: PanelId) -> CalcResult<Option<Panel>>;
    async fn load_rows(&mut self, panel_id: PanelId) -> CalcResult<Vec<LoadRow>>;
    async fn circuit(&mut self, circuit_id: CircuitId) -> CalcResult<Option<Circuit>>;
    /// Circuits of a panel ordered by name
    async fn circuits(&mut self, panel_id: PanelId) -> CalcResult<Vec<Circuit>>;
    async fn cable_catalog(&mut self) -> CalcResult<CableCatalog>;
    async fn bus_sections(&mut self, panel_id: PanelId) -> CalcResult<Vec<BusSection>>;
    async fn consumers(&mut self, panel_id: PanelId) -> CalcResult<Vec<Consumer>>;
    /// Feeds of every consumer of a panel
    async fn feeds(&mut self, panel_id: PanelId) -> CalcResult<Vec<Feed>>;
    async fn mode_rules(&mut self, panel_id: PanelId) -> CalcResult<Vec<ModeRule>>;
    async fn demand_factor_points(&mut self) -> CalcResult<Vec<DemandFactorPoint>>;
    async fn input_touch(&mut self, scope: TouchScope, subsystem: Subsystem) -> CalcResult<TouchLookup>;

    // Derived records

    async fn row_calcs(&mut self, panel_id: PanelId) -> CalcResult<Vec<RowCalc>>;
    async fn panel_calc(&mut self, panel_id: PanelId) -> CalcResult<Option<PanelCalc>>;
    /// Voltage-drop results of the panel's current circuits
    async fn circuit_calcs(&mut self, panel_id: PanelId) -> CalcResult<Vec<CircuitCalc>>;
    async fn section_calcs(&mut self, panel_id: PanelId, mode: Mode) -> CalcResult<Vec<SectionCalc>>;
    async fn phase_balance(&mut self, panel_id: PanelId, mode: Mode) -> CalcResult<Option<PanelPhaseBalance>>;

    // Writes

    /// Upsert row results and the panel total
    async fn replace_demand(&mut self, rows: &[RowCalc], panel: &PanelCalc) -> CalcResult<()>;
    async fn replace_circuit_calc(&mut self, calc: &CircuitCalc) -> CalcResult<()>;
    async fn assign_phases(&mut self, assignments: &[PhaseAssignment]) -> CalcResult<()>;
    async fn replace_phase_balance(&mut self, balance: &PanelPhaseBalance) -> CalcResult<()>;
    /// Replace every section result of (panel, mode)
    async fn replace_section_calcs(&mut self, panel_id: PanelId, mode: Mode, calcs: &[SectionCalc]) -> CalcResult<()>;

    async fn commit(self: Box<Self>) -> CalcResult<()>;
    async fn rollback(self: Box<Self>) -> CalcResult<()>;
}

/// Commit on success, roll back on failure.
///
/// A failed rollback is logged; the computation error is returned.
pub async fn finish<T>(tx: Box<dyn StoreTx>, result: CalcResult<T>) -> CalcResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = tx.rollback().await {
                warn!(error = %rollback_error, "Rollback failed");
            }
            Err(error)
        }
    }
}
