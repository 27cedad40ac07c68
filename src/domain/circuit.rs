use serde::{Deserialize, Serialize};
use validator::Validate;

use super::types::{
    BusSectionId, CircuitId, LoadKind, Material, PanelId, Phase, PhaseSource, UnbalanceMode,
};
use crate::error::{CalcError, CalcResult};

/// Outgoing feeder of a panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Circuit {
    pub id: CircuitId,
    pub panel_id: PanelId,
    pub name: String,
    /// 1 or 3
    pub phases: u8,
    pub unbalance_mode: UnbalanceMode,
    #[validate(range(min = 0.0))]
    pub length_m: f64,
    pub material: Material,
    #[validate(range(min = 0.0, max = 1.0))]
    pub cos_phi: f64,
    pub load_kind: LoadKind,
    /// Design current, A
    pub current_a: Option<f64>,
    /// Stored phase label; may hold a value outside L1..L3 when set by hand
    pub phase: Option<String>,
    pub phase_source: PhaseSource,
    pub bus_section_id: Option<BusSectionId>,
}

impl Circuit {
    pub fn new(panel_id: PanelId, name: impl Into<String>, phases: u8, current_a: f64) -> Self {
        Self {
            id: CircuitId::new(),
            panel_id,
            name: name.into(),
            phases,
            unbalance_mode: UnbalanceMode::Normal,
            length_m: 0.0,
            material: Material::Cu,
            cos_phi: 1.0,
            load_kind: LoadKind::Other,
            current_a: Some(current_a),
            phase: None,
            phase_source: PhaseSource::Auto,
            bus_section_id: None,
        }
    }

    pub fn is_single_phase(&self) -> bool {
        self.phases == 1
    }

    /// The stored phase if it names a real supply phase
    pub fn valid_phase(&self) -> Option<Phase> {
        self.phase.as_deref().and_then(Phase::from_label)
    }

    /// Design current, rejecting missing or negative values
    pub fn required_current(&self) -> CalcResult<f64> {
        match self.current_a {
            Some(i) if i.is_finite() && i >= 0.0 => Ok(i),
            Some(i) => Err(CalcError::validation(format!(
                "Circuit {}: invalid current {}",
                self.name, i
            ))),
            None => Err(CalcError::validation(format!(
                "Circuit {}: current is missing",
                self.name
            ))),
        }
    }
}

/// Standard conductor cross-sections offered for selection, ascending
pub const STANDARD_SECTIONS_MM2: [f64; 15] = [
    1.5, 2.5, 4.0, 6.0, 10.0, 16.0, 25.0, 35.0, 50.0, 70.0, 95.0, 120.0, 150.0, 185.0, 240.0,
];

/// Ordered catalog of available cable cross-sections
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CableCatalog {
    sections_mm2: Vec<f64>,
}

impl CableCatalog {
    /// Build a catalog from arbitrary section values; sorts and drops duplicates
    pub fn new(sections: impl IntoIterator<Item = f64>) -> CalcResult<Self> {
        let mut sections_mm2: Vec<f64> = sections.into_iter().collect();
        if let Some(bad) = sections_mm2.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(CalcError::validation(format!(
                "Cable section must be positive, got {}",
                bad
            )));
        }
        sections_mm2.sort_by(f64::total_cmp);
        sections_mm2.dedup();
        Ok(Self { sections_mm2 })
    }

    pub fn standard() -> Self {
        Self {
            sections_mm2: STANDARD_SECTIONS_MM2.to_vec(),
        }
    }

    pub fn sections(&self) -> &[f64] {
        &self.sections_mm2
    }

    pub fn largest(&self) -> Option<f64> {
        self.sections_mm2.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.sections_mm2.is_empty()
    }
}
