//! Voltage-drop check and cross-section selection for outgoing circuits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use validator::Validate;

use crate::domain::{CableCatalog, Circuit, CircuitCalc, Material, Panel, SelectionMethod, UnbalanceMode};
use crate::error::{CalcError, CalcResult, CalcWarning};

/// Copper resistivity, Ohm*mm2/m
pub const RHO_CU: f64 = 0.0225;
/// Aluminium resistivity, Ohm*mm2/m
pub const RHO_AL: f64 = 0.036;
/// Cable reactance per metre, Ohm/m
pub const X_PER_M: f64 = 0.00008;

/// Runs longer than this get a relaxed limit
pub const LONG_RUN_THRESHOLD_M: f64 = 100.0;
/// Extra allowed drop per metre beyond the threshold, %
pub const LONG_RUN_ALLOWANCE_PCT_PER_M: f64 = 0.005;
/// Cap on the long-run allowance, %
pub const LONG_RUN_ALLOWANCE_MAX_PCT: f64 = 0.5;

impl Material {
    pub fn resistivity(&self) -> f64 {
        match self {
            Material::Cu => RHO_CU,
            Material::Al => RHO_AL,
        }
    }
}

/// sin(phi) from a power factor in [0, 1]
pub fn sin_phi(cos_phi: f64) -> CalcResult<f64> {
    if !(0.0..=1.0).contains(&cos_phi) {
        return Err(CalcError::validation(format!(
            "cos(phi) must be in [0, 1], got {}",
            cos_phi
        )));
    }
    Ok((1.0 - cos_phi * cos_phi).max(0.0).sqrt())
}

/// Allowed drop for a run of `length_m`: the base limit, plus 0.005 % per
/// metre beyond 100 m, the addition capped at 0.5 %.
pub fn effective_du_limit(base_pct: f64, length_m: f64) -> CalcResult<f64> {
    if !base_pct.is_finite() || base_pct < 0.0 {
        return Err(CalcError::validation(format!(
            "Voltage drop limit must be non-negative, got {}",
            base_pct
        )));
    }
    if !length_m.is_finite() || length_m < 0.0 {
        return Err(CalcError::validation(format!(
            "Cable length must be non-negative, got {}",
            length_m
        )));
    }
    if length_m <= LONG_RUN_THRESHOLD_M {
        return Ok(base_pct);
    }
    let extra = (LONG_RUN_ALLOWANCE_PCT_PER_M * (length_m - LONG_RUN_THRESHOLD_M))
        .min(LONG_RUN_ALLOWANCE_MAX_PCT);
    Ok(base_pct + extra)
}

/// Return-path factor: 1 for balanced three-phase, 2 for single-phase or
/// fully unbalanced runs.
pub fn path_factor(phases: u8, unbalance_mode: UnbalanceMode) -> CalcResult<f64> {
    match (phases, unbalance_mode) {
        (3, UnbalanceMode::Normal) => Ok(1.0),
        (3, UnbalanceMode::FullUnbalanced) | (1, _) => Ok(2.0),
        (other, _) => Err(CalcError::validation(format!(
            "Circuit phases must be 1 or 3, got {}",
            other
        ))),
    }
}

/// Electrical parameters of a run that do not depend on cross-section
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    pub path_factor: f64,
    pub resistivity: f64,
    pub reactance_per_m: f64,
    pub length_m: f64,
    pub cos_phi: f64,
    pub sin_phi: f64,
    pub current_a: f64,
}

impl RunParameters {
    pub fn for_circuit(circuit: &Circuit) -> CalcResult<Self> {
        if !circuit.length_m.is_finite() || circuit.length_m < 0.0 {
            return Err(CalcError::validation(format!(
                "Circuit {}: length must be non-negative",
                circuit.name
            )));
        }
        Ok(Self {
            path_factor: path_factor(circuit.phases, circuit.unbalance_mode)?,
            resistivity: circuit.material.resistivity(),
            reactance_per_m: X_PER_M,
            length_m: circuit.length_m,
            cos_phi: circuit.cos_phi,
            sin_phi: sin_phi(circuit.cos_phi)?,
            current_a: circuit.required_current()?,
        })
    }

    /// Drop in volts across a conductor of `s_mm2`
    pub fn drop_volts(&self, s_mm2: f64) -> CalcResult<f64> {
        if s_mm2.is_nan() || s_mm2 <= 0.0 {
            return Err(CalcError::validation(format!(
                "Cross-section must be positive, got {}",
                s_mm2
            )));
        }
        let r = self.resistivity * self.length_m / s_mm2;
        let x = self.reactance_per_m * self.length_m;
        Ok(self.path_factor * (r * self.cos_phi + x * self.sin_phi) * self.current_a)
    }
}

/// Chosen cross-section and the drop it produces
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectionChoice {
    pub s_mm2: f64,
    pub du_v: f64,
    pub du_pct: f64,
    pub method: SelectionMethod,
}

/// Smallest catalog section whose drop stays within `limit_pct`, or the
/// largest section when none does.
pub fn select_section(
    catalog: &CableCatalog,
    run: &RunParameters,
    u_ph_v: f64,
    limit_pct: f64,
) -> CalcResult<SectionChoice> {
    if u_ph_v.is_nan() || u_ph_v <= 0.0 {
        return Err(CalcError::validation(format!(
            "Phase voltage must be positive, got {}",
            u_ph_v
        )));
    }
    let largest = catalog
        .largest()
        .ok_or_else(|| CalcError::state("Cable catalog is empty"))?;

    for &s_mm2 in catalog.sections() {
        let du_v = run.drop_volts(s_mm2)?;
        let du_pct = 100.0 * du_v / u_ph_v;
        if du_pct <= limit_pct {
            return Ok(SectionChoice {
                s_mm2,
                du_v,
                du_pct,
                method: SelectionMethod::Standard,
            });
        }
    }

    let du_v = run.drop_volts(largest)?;
    Ok(SectionChoice {
        s_mm2: largest,
        du_v,
        du_pct: 100.0 * du_v / u_ph_v,
        method: SelectionMethod::MaxSectionFallback,
    })
}

/// Result for one circuit plus the fallback warning, if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitDrop {
    pub calc: CircuitCalc,
    pub warning: Option<CalcWarning>,
}

/// Per-circuit voltage-drop solver
pub struct VoltageDropSolver<'a> {
    catalog: &'a CableCatalog,
}

impl<'a> VoltageDropSolver<'a> {
    pub fn new(catalog: &'a CableCatalog) -> Self {
        Self { catalog }
    }

    pub fn solve(&self, panel: &Panel, circuit: &Circuit, computed_at: DateTime<Utc>) -> CalcResult<CircuitDrop> {
        let u_ph_v = panel.u_ph_v.filter(|u| *u > 0.0).ok_or_else(|| {
            CalcError::state(format!("Panel {}: positive phase voltage required", panel.name))
        })?;
        circuit.validate()?;
        let run = RunParameters::for_circuit(circuit)?;
        let limit_pct = effective_du_limit(panel.du_limit_pct(circuit.load_kind), circuit.length_m)?;
        let choice = select_section(self.catalog, &run, u_ph_v, limit_pct)?;

        let warning = match choice.method {
            SelectionMethod::Standard => None,
            SelectionMethod::MaxSectionFallback => {
                warn!(
                    circuit = %circuit.name,
                    s_mm2 = choice.s_mm2,
                    du_pct = choice.du_pct,
                    limit_pct,
                    "No cross-section meets the drop limit, using largest"
                );
                Some(CalcWarning::MaxSectionFallback {
                    circuit_id: circuit.id,
                    s_mm2: choice.s_mm2,
                    du_pct: choice.du_pct,
                    du_limit_pct: limit_pct,
                })
            }
        };

        debug!(circuit = %circuit.name, s_mm2 = choice.s_mm2, du_pct = choice.du_pct, "Circuit drop solved");

        Ok(CircuitDrop {
            calc: CircuitCalc {
                circuit_id: circuit.id,
                i_calc_a: run.current_a,
                du_v: choice.du_v,
                du_pct: choice.du_pct,
                du_limit_pct: limit_pct,
                s_mm2_selected: choice.s_mm2,
                method: choice.method,
                updated_at: computed_at,
            },
            warning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LoadKind, PanelId};
    use crate::error::ErrorKind;
    use proptest::prelude::*;
    use rstest::rstest;

    fn circuit(length_m: f64, current_a: f64) -> Circuit {
        let mut c = Circuit::new(PanelId::new(), "C1", 1, current_a);
        c.length_m = length_m;
        c.cos_phi = 0.9;
        c
    }

    #[rstest]
    #[case(0.0, 5.0)]
    #[case(100.0, 5.0)]
    #[case(150.0, 5.25)]
    #[case(200.0, 5.5)]
    #[case(1000.0, 5.5)]
    fn test_effective_limit(#[case] length_m: f64, #[case] expected: f64) {
        let limit = effective_du_limit(5.0, length_m).unwrap();
        assert!((limit - expected).abs() < 1e-12);
    }

    #[test]
    fn test_effective_limit_rejects_negative() {
        assert!(effective_du_limit(-1.0, 10.0).is_err());
        assert!(effective_du_limit(3.0, -10.0).is_err());
    }

    #[test]
    fn test_path_factor() {
        assert_eq!(path_factor(3, UnbalanceMode::Normal).unwrap(), 1.0);
        assert_eq!(path_factor(3, UnbalanceMode::FullUnbalanced).unwrap(), 2.0);
        assert_eq!(path_factor(1, UnbalanceMode::Normal).unwrap(), 2.0);
        assert!(path_factor(2, UnbalanceMode::Normal).is_err());
    }

    #[test]
    fn test_sin_phi_range() {
        assert_eq!(sin_phi(1.0).unwrap(), 0.0);
        assert!((sin_phi(0.6).unwrap() - 0.8).abs() < 1e-12);
        assert!(sin_phi(1.1).is_err());
        assert!(sin_phi(-0.1).is_err());
    }

    #[test]
    fn test_drop_formula() {
        let run = RunParameters::for_circuit(&circuit(50.0, 16.0)).unwrap();
        let du = run.drop_volts(2.5).unwrap();
        let sin = (1.0f64 - 0.81).sqrt();
        let expected = 2.0 * ((0.0225 * 50.0 / 2.5) * 0.9 + 0.00008 * 50.0 * sin) * 16.0;
        assert!((du - expected).abs() < 1e-12);
        assert!(run.drop_volts(0.0).is_err());
    }

    #[test]
    fn test_selects_smallest_passing_section() {
        let catalog = CableCatalog::standard();
        let panel = Panel::new("P1");
        let c = circuit(30.0, 10.0);
        let result = VoltageDropSolver::new(&catalog).solve(&panel, &c, Utc::now()).unwrap();
        assert_eq!(result.calc.method, SelectionMethod::Standard);
        assert!(result.calc.du_pct <= result.calc.du_limit_pct);
        assert!(result.warning.is_none());

        // the next smaller section, if any, must fail the limit
        let run = RunParameters::for_circuit(&c).unwrap();
        if let Some(smaller) = catalog
            .sections()
            .iter()
            .rev()
            .find(|s| **s < result.calc.s_mm2_selected)
        {
            let du_pct = 100.0 * run.drop_volts(*smaller).unwrap() / 230.0;
            assert!(du_pct > result.calc.du_limit_pct);
        }
    }

    #[test]
    fn test_lighting_uses_lighting_limit() {
        let catalog = CableCatalog::standard();
        let panel = Panel::new("P1");
        let mut c = circuit(30.0, 10.0);
        c.load_kind = LoadKind::Lighting;
        let result = VoltageDropSolver::new(&catalog).solve(&panel, &c, Utc::now()).unwrap();
        assert_eq!(result.calc.du_limit_pct, 3.0);
    }

    #[test]
    fn test_fallback_to_largest_section() {
        let catalog = CableCatalog::new([1.5, 2.5]).unwrap();
        let panel = Panel::new("P1");
        let c = circuit(300.0, 63.0);
        let result = VoltageDropSolver::new(&catalog).solve(&panel, &c, Utc::now()).unwrap();
        assert_eq!(result.calc.method, SelectionMethod::MaxSectionFallback);
        assert_eq!(result.calc.s_mm2_selected, 2.5);
        assert!(result.calc.du_pct > result.calc.du_limit_pct);
        assert_eq!(result.warning.map(|w| w.reason()), Some("MAX_SECTION_FALLBACK"));
    }

    #[test]
    fn test_empty_catalog_is_state_error() {
        let catalog = CableCatalog::default();
        let panel = Panel::new("P1");
        let err = VoltageDropSolver::new(&catalog)
            .solve(&panel, &circuit(10.0, 10.0), Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateError);
    }

    #[rstest]
    #[case(None)]
    #[case(Some(0.0))]
    #[case(Some(-230.0))]
    fn test_missing_phase_voltage_is_state_error(#[case] u_ph_v: Option<f64>) {
        let catalog = CableCatalog::standard();
        let mut panel = Panel::new("P1");
        // line voltage alone is not enough for sizing
        panel.u_ll_v = Some(400.0);
        panel.u_ph_v = u_ph_v;
        let err = VoltageDropSolver::new(&catalog)
            .solve(&panel, &circuit(30.0, 10.0), Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateError);
    }

    #[test]
    fn test_aluminium_needs_larger_section() {
        let catalog = CableCatalog::standard();
        let panel = Panel::new("P1");
        let cu = circuit(80.0, 25.0);
        let mut al = cu.clone();
        al.material = Material::Al;
        let solver = VoltageDropSolver::new(&catalog);
        let s_cu = solver.solve(&panel, &cu, Utc::now()).unwrap().calc.s_mm2_selected;
        let s_al = solver.solve(&panel, &al, Utc::now()).unwrap().calc.s_mm2_selected;
        assert!(s_al >= s_cu);
    }

    proptest! {
        #[test]
        fn prop_longer_run_never_smaller_section(
            short in 0.0f64..400.0,
            extra in 0.0f64..400.0,
            current in 0.0f64..200.0,
            base in 0.5f64..10.0,
        ) {
            let catalog = CableCatalog::standard();
            let mut panel = Panel::new("P1");
            panel.du_limit_other_pct = base;
            let solver = VoltageDropSolver::new(&catalog);

            let near = solver.solve(&panel, &circuit(short, current), Utc::now()).unwrap();
            let far = solver.solve(&panel, &circuit(short + extra, current), Utc::now()).unwrap();
            prop_assert!(far.calc.s_mm2_selected >= near.calc.s_mm2_selected);
        }
    }
}
