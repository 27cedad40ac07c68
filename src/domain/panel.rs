use serde::{Deserialize, Serialize};
use validator::Validate;

use super::types::{LoadKind, LoadRowId, PanelId, PhaseLetter, PhaseMode, SystemType};
use crate::error::{CalcError, CalcResult};

pub const DEFAULT_DU_LIMIT_LIGHTING_PCT: f64 = 3.0;
pub const DEFAULT_DU_LIMIT_OTHER_PCT: f64 = 5.0;

/// Switchboard with its supply parameters and voltage-drop limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Panel {
    pub id: PanelId,
    #[validate(length(min = 1))]
    pub name: String,
    pub system_type: SystemType,
    /// Line-to-line voltage
    #[validate(range(min = 0.0))]
    pub u_ll_v: Option<f64>,
    /// Phase voltage; voltage-drop sizing requires it to be set and positive
    #[validate(range(min = 0.0))]
    pub u_ph_v: Option<f64>,
    #[validate(range(min = 0.0))]
    pub du_limit_lighting_pct: f64,
    #[validate(range(min = 0.0))]
    pub du_limit_other_pct: f64,
}

impl Panel {
    /// Three-phase 400 V panel with default drop limits
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: PanelId::new(),
            name: name.into(),
            system_type: SystemType::ThreePhase,
            u_ll_v: Some(400.0),
            u_ph_v: Some(230.0),
            du_limit_lighting_pct: DEFAULT_DU_LIMIT_LIGHTING_PCT,
            du_limit_other_pct: DEFAULT_DU_LIMIT_OTHER_PCT,
        }
    }

    /// Base voltage-drop limit for a load category
    pub fn du_limit_pct(&self, kind: LoadKind) -> f64 {
        match kind {
            LoadKind::Lighting => self.du_limit_lighting_pct,
            LoadKind::Other => self.du_limit_other_pct,
        }
    }

    /// Phase voltage for demand current, falling back to U_ll / sqrt(3)
    pub fn phase_voltage(&self) -> Option<f64> {
        self.u_ph_v
            .or_else(|| self.u_ll_v.map(|u_ll| u_ll / 3f64.sqrt()))
    }
}

/// One line of a panel's demand table: a group of identical receivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRow {
    pub id: LoadRowId,
    pub panel_id: PanelId,
    pub name: String,
    /// Receiver count (n)
    pub quantity: i64,
    /// Unit nominal power (Pn), kW
    pub unit_power_kw: f64,
    /// Utilization factor (Ki)
    pub ki: f64,
    pub cos_phi: Option<f64>,
    /// Explicit reactive ratio; takes precedence over `cos_phi`
    pub tg_phi: Option<f64>,
    pub phases: u8,
    pub phase_mode: PhaseMode,
    pub phase_fixed: Option<PhaseLetter>,
}

impl LoadRow {
    pub fn new(panel_id: PanelId, name: impl Into<String>, quantity: i64, unit_power_kw: f64, ki: f64) -> Self {
        Self {
            id: LoadRowId::new(),
            panel_id,
            name: name.into(),
            quantity,
            unit_power_kw,
            ki,
            cos_phi: None,
            tg_phi: None,
            phases: 3,
            phase_mode: PhaseMode::None,
            phase_fixed: None,
        }
    }

    /// Installed power of the group (n * Pn)
    pub fn installed_power_kw(&self) -> f64 {
        self.quantity as f64 * self.unit_power_kw
    }

    /// Check the row's phase configuration is self-consistent.
    ///
    /// Three-phase rows carry no phase policy; single-phase rows are either
    /// AUTO or FIXED, and only FIXED rows carry a phase letter.
    pub fn validate_phase_fields(&self) -> CalcResult<()> {
        match self.phases {
            3 => {
                if self.phase_mode != PhaseMode::None || self.phase_fixed.is_some() {
                    return Err(CalcError::validation(format!(
                        "Row {}: three-phase rows require phase_mode NONE and no fixed phase",
                        self.name
                    )));
                }
            }
            1 => match (self.phase_mode, self.phase_fixed) {
                (PhaseMode::Auto, None) | (PhaseMode::Fixed, Some(_)) => {}
                (PhaseMode::Fixed, None) => {
                    return Err(CalcError::validation(format!(
                        "Row {}: phase_mode FIXED requires a phase letter",
                        self.name
                    )));
                }
                (mode, _) => {
                    return Err(CalcError::validation(format!(
                        "Row {}: single-phase row has inconsistent phase_mode {}",
                        self.name, mode
                    )));
                }
            },
            other => {
                return Err(CalcError::validation(format!(
                    "Row {}: phases must be 1 or 3, got {}",
                    self.name, other
                )));
            }
        }
        Ok(())
    }
}
