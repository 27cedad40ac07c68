//! Greedy assignment of single-phase circuits to L1/L2/L3.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::domain::{
    BusSectionId, Circuit, Mode, PanelId, PanelPhaseBalance, PhaseAssignment, PhaseSource,
    PhaseTotals, SectionCalc,
};
use crate::error::{CalcResult, CalcWarning};

/// Result of one balancing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceOutcome {
    /// Phases to write back, in placement order
    pub assignments: Vec<PhaseAssignment>,
    pub balance: PanelPhaseBalance,
    /// Single-phase circuits that took part in the run
    pub circuits_considered: usize,
}

impl BalanceOutcome {
    pub fn assignments_written(&self) -> usize {
        self.assignments.len()
    }
}

/// Phase balancer.
///
/// Manual circuits keep their phase when `respect_manual` is set; every
/// other single-phase circuit is placed heaviest-first on the currently
/// lightest phase.
#[derive(Debug, Clone, Copy)]
pub struct PhaseBalancer {
    pub respect_manual: bool,
}

impl Default for PhaseBalancer {
    fn default() -> Self {
        Self {
            respect_manual: true,
        }
    }
}

impl PhaseBalancer {
    pub fn new(respect_manual: bool) -> Self {
        Self { respect_manual }
    }

    /// Balance a panel's single-phase circuits.
    ///
    /// `circuits` may include three-phase circuits; they are ignored. In
    /// EMERGENCY mode `emergency_sections` holds the stored EMERGENCY
    /// section totals of the panel: only circuits on a section carrying
    /// load take part, and when none were computed every circuit takes part
    /// under a panel-level warning.
    pub fn balance(
        &self,
        panel_id: PanelId,
        mode: Mode,
        circuits: &[Circuit],
        emergency_sections: &[SectionCalc],
        computed_at: DateTime<Utc>,
    ) -> CalcResult<BalanceOutcome> {
        let mut warnings = Vec::new();

        let mut selected: Vec<&Circuit> = circuits.iter().filter(|c| c.is_single_phase()).collect();

        if mode == Mode::Emergency {
            if emergency_sections.is_empty() {
                warn!(panel_id = %panel_id, "Emergency sections not computed, balancing all circuits");
                warnings.push(CalcWarning::EmergencySectionsNotComputed { panel_id });
            } else {
                let live: HashSet<BusSectionId> = emergency_sections
                    .iter()
                    .filter(|s| s.mode == Mode::Emergency && !s.load.is_zero())
                    .map(|s| s.bus_section_id)
                    .collect();
                selected.retain(|c| c.bus_section_id.is_some_and(|id| live.contains(&id)));
            }
        }

        let mut totals = PhaseTotals::default();
        let mut invalid_manual_count = 0u32;
        let mut automatic = Vec::with_capacity(selected.len());

        for circuit in &selected {
            let current_a = circuit.required_current()?;
            if self.respect_manual && circuit.phase_source == PhaseSource::Manual {
                match circuit.valid_phase() {
                    Some(phase) => totals.add(phase, current_a),
                    None => {
                        invalid_manual_count += 1;
                        warnings.push(CalcWarning::ManualInvalidPhase {
                            circuit_id: circuit.id,
                            name: circuit.name.clone(),
                            i_a: current_a,
                            phase: circuit.phase.clone(),
                            phase_source: circuit.phase_source,
                        });
                    }
                }
            } else {
                automatic.push((*circuit, current_a));
            }
        }

        let assignments = automatic
            .into_iter()
            .sorted_by(|(a, ia), (b, ib)| ib.total_cmp(ia).then_with(|| a.id.cmp(&b.id)))
            .map(|(circuit, current_a)| {
                let phase = totals.lightest();
                totals.add(phase, current_a);
                PhaseAssignment {
                    circuit_id: circuit.id,
                    phase,
                }
            })
            .collect::<Vec<_>>();

        // panel-level warnings first, then by circuit
        warnings.sort_by_key(|w| w.circuit_id());

        let unbalance_pct = totals.unbalance_pct();
        if invalid_manual_count > 0 {
            warn!(
                panel_id = %panel_id,
                invalid_manual_count,
                "Manual circuits with invalid phase excluded from totals"
            );
        }
        debug!(
            panel_id = %panel_id,
            mode = %mode,
            placed = assignments.len(),
            l1_a = totals.l1_a,
            l2_a = totals.l2_a,
            l3_a = totals.l3_a,
            unbalance_pct,
            "Phase balance computed"
        );

        Ok(BalanceOutcome {
            assignments,
            balance: PanelPhaseBalance {
                panel_id,
                mode,
                totals,
                unbalance_pct,
                invalid_manual_count,
                warnings,
                updated_at: computed_at,
            },
            circuits_considered: selected.len(),
        })
    }
}
