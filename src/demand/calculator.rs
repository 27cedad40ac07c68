use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::factor_table::{DemandFactorResolution, DemandFactorTable};
use crate::domain::{LoadRow, Panel, PanelCalc, RowCalc, SystemType};
use crate::error::{CalcError, CalcResult, CalcWarning};

/// Reactive demand margin applied to small groups
pub const SMALL_GROUP_REACTIVE_MARGIN: f64 = 1.1;
/// Largest effective receiver count that still gets the reactive margin
pub const SMALL_GROUP_MAX_NE: f64 = 10.0;

/// Reactive/active ratio of a row.
///
/// An explicit tg(phi) wins; otherwise it is derived from cos(phi), which
/// must lie in (0, 1]. With neither the row contributes no reactive power.
pub fn reactive_ratio(tg_phi: Option<f64>, cos_phi: Option<f64>) -> CalcResult<f64> {
    if let Some(tg) = tg_phi {
        if !tg.is_finite() {
            return Err(CalcError::validation(format!("tg(phi) must be finite, got {}", tg)));
        }
        return Ok(tg);
    }
    match cos_phi {
        Some(cos) if cos > 0.0 && cos <= 1.0 => Ok(cos.acos().tan()),
        Some(cos) => Err(CalcError::validation(format!(
            "cos(phi) must be in (0, 1], got {}",
            cos
        ))),
        None => Ok(0.0),
    }
}

/// Intermediate sums for a single demand-table row
pub fn compute_row(row: &LoadRow) -> CalcResult<RowCalc> {
    if row.quantity <= 0 {
        return Err(CalcError::validation(format!(
            "Row {}: quantity must be positive, got {}",
            row.name, row.quantity
        )));
    }
    if !row.unit_power_kw.is_finite() || row.unit_power_kw < 0.0 {
        return Err(CalcError::validation(format!(
            "Row {}: unit power must be non-negative, got {}",
            row.name, row.unit_power_kw
        )));
    }
    if !row.ki.is_finite() {
        return Err(CalcError::validation(format!(
            "Row {}: utilization factor must be finite",
            row.name
        )));
    }
    row.validate_phase_fields()?;

    let n = row.quantity as f64;
    let pn = row.unit_power_kw;
    let tg = reactive_ratio(row.tg_phi, row.cos_phi)?;

    let pn_total_kw = n * pn;
    let ki_pn_kw = row.ki * pn_total_kw;
    Ok(RowCalc {
        row_id: row.id,
        pn_total_kw,
        ki_pn_kw,
        ki_pn_tg_kvar: ki_pn_kw * tg,
        n_pn2: n * pn * pn,
    })
}

/// Demand current from apparent power and the panel's supply voltage
pub fn demand_current(sp_kva: f64, panel: &Panel) -> CalcResult<f64> {
    match panel.system_type {
        SystemType::ThreePhase => {
            let u_ll = panel
                .u_ll_v
                .filter(|u| *u > 0.0)
                .ok_or_else(|| {
                    CalcError::validation(format!(
                        "Panel {}: three-phase demand current needs a positive line voltage",
                        panel.name
                    ))
                })?;
            Ok(sp_kva * 1000.0 / (3f64.sqrt() * u_ll))
        }
        SystemType::SinglePhase => {
            let u_ph = panel
                .phase_voltage()
                .filter(|u| *u > 0.0)
                .ok_or_else(|| {
                    CalcError::validation(format!(
                        "Panel {}: single-phase demand current needs a positive phase voltage",
                        panel.name
                    ))
                })?;
            Ok(sp_kva * 1000.0 / u_ph)
        }
    }
}

/// Everything a demand run produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandOutcome {
    pub rows: Vec<RowCalc>,
    pub panel: PanelCalc,
    pub resolution: DemandFactorResolution,
    pub warnings: Vec<CalcWarning>,
}

/// Panel design-load calculator (effective-count method)
pub struct DemandCalculator<'a> {
    table: &'a DemandFactorTable,
}

impl<'a> DemandCalculator<'a> {
    pub fn new(table: &'a DemandFactorTable) -> Self {
        Self { table }
    }

    /// Compute per-row sums and the panel total.
    ///
    /// Fails on an empty table, any invalid row, zero installed power, or a
    /// demand factor the table cannot resolve.
    pub fn compute_panel(
        &self,
        panel: &Panel,
        rows: &[LoadRow],
        computed_at: DateTime<Utc>,
    ) -> CalcResult<DemandOutcome> {
        if rows.is_empty() {
            return Err(CalcError::validation(format!(
                "Panel {} has no demand rows",
                panel.name
            )));
        }

        let row_calcs = rows.iter().map(compute_row).collect::<CalcResult<Vec<_>>>()?;

        let sum_pn_kw: f64 = row_calcs.iter().map(|r| r.pn_total_kw).sum();
        let sum_ki_pn_kw: f64 = row_calcs.iter().map(|r| r.ki_pn_kw).sum();
        let sum_ki_pn_tg_kvar: f64 = row_calcs.iter().map(|r| r.ki_pn_tg_kvar).sum();
        let sum_n_pn2: f64 = row_calcs.iter().map(|r| r.n_pn2).sum();

        if sum_n_pn2 <= 0.0 || sum_pn_kw <= 0.0 {
            return Err(CalcError::validation(format!(
                "Panel {}: installed power is zero",
                panel.name
            )));
        }

        let ne = sum_pn_kw * sum_pn_kw / sum_n_pn2;
        let ki_group = sum_ki_pn_kw / sum_pn_kw;
        let resolution = self.table.resolve(ne, ki_group)?;

        let mut warnings = Vec::new();
        if resolution.was_clamped() {
            warn!(
                panel = %panel.name,
                ki_group,
                ki_clamped = resolution.ki_clamped,
                "Group utilization factor outside table range, clamped"
            );
            warnings.push(CalcWarning::LoadFactorClamped {
                ki_input: ki_group,
                ki_clamped: resolution.ki_clamped,
            });
        }

        let largest_single_kw = rows
            .iter()
            .map(|r| r.unit_power_kw)
            .fold(0.0_f64, f64::max);
        let pp_kw = (resolution.kr * sum_ki_pn_kw).max(largest_single_kw);

        let qp_kvar = if ne <= SMALL_GROUP_MAX_NE {
            SMALL_GROUP_REACTIVE_MARGIN * sum_ki_pn_tg_kvar
        } else {
            sum_ki_pn_tg_kvar
        };
        let sp_kva = (pp_kw * pp_kw + qp_kvar * qp_kvar).sqrt();
        let ip_a = demand_current(sp_kva, panel)?;

        debug!(
            panel = %panel.name,
            ne,
            ki_group,
            kr = resolution.kr,
            pp_kw,
            ip_a,
            "Computed panel demand"
        );

        Ok(DemandOutcome {
            rows: row_calcs,
            panel: PanelCalc {
                panel_id: panel.id,
                sum_pn_kw,
                sum_ki_pn_kw,
                sum_ki_pn_tg_kvar,
                sum_n_pn2,
                ne,
                ne_tab: resolution.ne_tab,
                ki_group,
                kr: resolution.kr,
                pp_kw,
                qp_kvar,
                sp_kva,
                ip_a,
                updated_at: computed_at,
            },
            resolution,
            warnings,
        })
    }
}
