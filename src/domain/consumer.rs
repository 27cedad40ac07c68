use serde::{Deserialize, Serialize};

use super::types::{BusSectionId, ConsumerId, FeedId, FeedRoleId, LoadRowId, Mode, PanelId};

/// Physical bus section of a panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSection {
    pub id: BusSectionId,
    pub panel_id: PanelId,
    pub name: String,
    /// Display/ordering key
    pub order: i32,
}

impl BusSection {
    pub fn new(panel_id: PanelId, name: impl Into<String>, order: i32) -> Self {
        Self {
            id: BusSectionId::new(),
            panel_id,
            name: name.into(),
            order,
        }
    }
}

/// Hand-entered load figures; every field must be present to aggregate
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ManualLoad {
    pub p_kw: Option<f64>,
    pub q_kvar: Option<f64>,
    pub s_kva: Option<f64>,
    pub i_a: Option<f64>,
}

impl ManualLoad {
    pub fn new(p_kw: f64, q_kvar: f64, s_kva: f64, i_a: f64) -> Self {
        Self {
            p_kw: Some(p_kw),
            q_kvar: Some(q_kvar),
            s_kva: Some(s_kva),
            i_a: Some(i_a),
        }
    }
}

/// Where a consumer's load figures come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "load_ref_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadReference {
    /// Totals of another panel's demand calculation
    RtmPanel { panel_id: PanelId },
    /// A single demand-table row
    RtmRow { row_id: LoadRowId },
    Manual(ManualLoad),
}

/// Load attached to a panel's bus sections through one or more feeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consumer {
    pub id: ConsumerId,
    pub panel_id: PanelId,
    pub name: String,
    pub load: LoadReference,
}

impl Consumer {
    pub fn new(panel_id: PanelId, name: impl Into<String>, load: LoadReference) -> Self {
        Self {
            id: ConsumerId::new(),
            panel_id,
            name: name.into(),
            load,
        }
    }

    /// Panel whose demand result this consumer reads, if any
    pub fn referenced_panel(&self) -> Option<PanelId> {
        match self.load {
            LoadReference::RtmPanel { panel_id } => Some(panel_id),
            _ => None,
        }
    }
}

/// Single-role feed designation used before named roles existed
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
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum LegacyFeedRole {
    Normal,
    Reserve,
}

impl LegacyFeedRole {
    /// Role that is live in the given mode
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Normal => LegacyFeedRole::Normal,
            Mode::Emergency => LegacyFeedRole::Reserve,
        }
    }
}

/// Connection of a consumer to a bus section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub id: FeedId,
    pub consumer_id: ConsumerId,
    pub bus_section_id: BusSectionId,
    pub legacy_role: Option<LegacyFeedRole>,
    pub role_id: Option<FeedRoleId>,
    /// Lower value wins among feeds of the same role
    pub priority: i32,
}

impl Feed {
    /// Feed tagged with a named role
    pub fn with_role(consumer_id: ConsumerId, bus_section_id: BusSectionId, role: FeedRoleId, priority: i32) -> Self {
        Self {
            id: FeedId::new(),
            consumer_id,
            bus_section_id,
            legacy_role: None,
            role_id: Some(role),
            priority,
        }
    }

    /// Feed tagged only with the legacy NORMAL/RESERVE marker
    pub fn legacy(consumer_id: ConsumerId, bus_section_id: BusSectionId, role: LegacyFeedRole) -> Self {
        Self {
            id: FeedId::new(),
            consumer_id,
            bus_section_id,
            legacy_role: Some(role),
            role_id: None,
            priority: 0,
        }
    }
}

/// Per-consumer override of which feed role is live in a mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeRule {
    pub consumer_id: ConsumerId,
    pub mode: Mode,
    pub active_role: FeedRoleId,
}

impl ModeRule {
    /// Role used when no rule is stored for (consumer, mode)
    pub fn default_role(mode: Mode) -> FeedRoleId {
        match mode {
            Mode::Normal => FeedRoleId::primary(),
            Mode::Emergency => FeedRoleId::reserve(),
        }
    }
}
