use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

use super::types::{BusSectionId, CircuitId, LoadRowId, Mode, PanelId, Phase};
use crate::error::CalcWarning;

// ============================================================================
// Demand
// ============================================================================

/// Per-row intermediate sums of the demand method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowCalc {
    pub row_id: LoadRowId,
    /// n * Pn
    pub pn_total_kw: f64,
    /// Ki * n * Pn
    pub ki_pn_kw: f64,
    /// Ki * n * Pn * tg(phi)
    pub ki_pn_tg_kvar: f64,
    /// n * Pn^2
    pub n_pn2: f64,
}

/// Panel-level design load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelCalc {
    pub panel_id: PanelId,
    pub sum_pn_kw: f64,
    pub sum_ki_pn_kw: f64,
    pub sum_ki_pn_tg_kvar: f64,
    pub sum_n_pn2: f64,
    /// Effective number of receivers
    pub ne: f64,
    /// Table row used for the factor lookup
    pub ne_tab: u32,
    /// Group utilization factor
    pub ki_group: f64,
    /// Demand factor
    pub kr: f64,
    pub pp_kw: f64,
    pub qp_kvar: f64,
    pub sp_kva: f64,
    pub ip_a: f64,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Voltage Drop
// ============================================================================

/// How the stored cross-section was chosen
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SelectionMethod {
    /// Smallest section within the limit
    Standard,
    /// No section met the limit; the largest one was taken
    MaxSectionFallback,
}

/// Voltage-drop result for one circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitCalc {
    pub circuit_id: CircuitId,
    pub i_calc_a: f64,
    pub du_v: f64,
    pub du_pct: f64,
    pub du_limit_pct: f64,
    pub s_mm2_selected: f64,
    pub method: SelectionMethod,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Phase Balance
// ============================================================================

/// Per-phase current totals
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PhaseTotals {
    pub l1_a: f64,
    pub l2_a: f64,
    pub l3_a: f64,
}

impl PhaseTotals {
    pub fn get(&self, phase: Phase) -> f64 {
        match phase {
            Phase::L1 => self.l1_a,
            Phase::L2 => self.l2_a,
            Phase::L3 => self.l3_a,
        }
    }

    pub fn add(&mut self, phase: Phase, current_a: f64) {
        match phase {
            Phase::L1 => self.l1_a += current_a,
            Phase::L2 => self.l2_a += current_a,
            Phase::L3 => self.l3_a += current_a,
        }
    }

    /// Least-loaded phase; ties resolve in L1, L2, L3 order
    pub fn lightest(&self) -> Phase {
        let mut best = Phase::L1;
        for phase in Phase::ALL {
            if self.get(phase) < self.get(best) {
                best = phase;
            }
        }
        best
    }

    pub fn max_a(&self) -> f64 {
        self.l1_a.max(self.l2_a).max(self.l3_a)
    }

    pub fn average_a(&self) -> f64 {
        (self.l1_a + self.l2_a + self.l3_a) / 3.0
    }

    /// 100 * (max - avg) / avg, or 0 when the panel carries no current
    pub fn unbalance_pct(&self) -> f64 {
        let avg = self.average_a();
        if avg == 0.0 {
            return 0.0;
        }
        100.0 * (self.max_a() - avg) / avg
    }
}

/// Stored phase-balance summary for (panel, mode)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelPhaseBalance {
    pub panel_id: PanelId,
    pub mode: Mode,
    pub totals: PhaseTotals,
    pub unbalance_pct: f64,
    pub invalid_manual_count: u32,
    pub warnings: Vec<CalcWarning>,
    pub updated_at: DateTime<Utc>,
}

/// Phase written back to an automatically placed circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseAssignment {
    pub circuit_id: CircuitId,
    pub phase: Phase,
}

// ============================================================================
// Sections
// ============================================================================

/// Active, reactive and apparent power plus current
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SectionLoad {
    pub p_kw: f64,
    pub q_kvar: f64,
    pub s_kva: f64,
    pub i_a: f64,
}

impl SectionLoad {
    pub fn is_zero(&self) -> bool {
        self.p_kw == 0.0 && self.q_kvar == 0.0 && self.s_kva == 0.0 && self.i_a == 0.0
    }
}

impl AddAssign for SectionLoad {
    fn add_assign(&mut self, rhs: Self) {
        self.p_kw += rhs.p_kw;
        self.q_kvar += rhs.q_kvar;
        self.s_kva += rhs.s_kva;
        self.i_a += rhs.i_a;
    }
}

impl From<&PanelCalc> for SectionLoad {
    fn from(calc: &PanelCalc) -> Self {
        Self {
            p_kw: calc.pp_kw,
            q_kvar: calc.qp_kvar,
            s_kva: calc.sp_kva,
            i_a: calc.ip_a,
        }
    }
}

/// Stored per-section totals for (panel, section, mode)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionCalc {
    pub panel_id: PanelId,
    pub bus_section_id: BusSectionId,
    pub mode: Mode,
    pub load: SectionLoad,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbalance_zero_when_idle() {
        let totals = PhaseTotals::default();
        assert_eq!(totals.unbalance_pct(), 0.0);
    }

    #[test]
    fn test_unbalance_pct() {
        let totals = PhaseTotals {
            l1_a: 30.0,
            l2_a: 20.0,
            l3_a: 10.0,
        };
        // avg 20, max 30
        assert!((totals.unbalance_pct() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_lightest_tie_break() {
        let mut totals = PhaseTotals::default();
        assert_eq!(totals.lightest(), Phase::L1);
        totals.add(Phase::L1, 5.0);
        assert_eq!(totals.lightest(), Phase::L2);
        totals.add(Phase::L2, 5.0);
        assert_eq!(totals.lightest(), Phase::L3);
        totals.add(Phase::L3, 5.0);
        assert_eq!(totals.lightest(), Phase::L1);
    }

    #[test]
    fn test_section_load_accumulates() {
        let mut load = SectionLoad::default();
        assert!(load.is_zero());
        load += SectionLoad {
            p_kw: 1.0,
            q_kvar: 0.5,
            s_kva: 1.2,
            i_a: 2.0,
        };
        load += SectionLoad {
            p_kw: 1.0,
            q_kvar: 0.5,
            s_kva: 1.2,
            i_a: 2.0,
        };
        assert!((load.p_kw - 2.0).abs() < 1e-12);
        assert!((load.i_a - 4.0).abs() < 1e-12);
        assert!(!load.is_zero());
    }
}
