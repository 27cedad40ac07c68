use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CalcError, CalcResult};

// ============================================================================
// Entity Identifiers
// ============================================================================

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Switchboard identifier
    PanelId
);
entity_id!(
    /// Demand-table row identifier
    LoadRowId
);
entity_id!(
    /// Outgoing circuit identifier
    CircuitId
);
entity_id!(
    /// Bus section identifier
    BusSectionId
);
entity_id!(
    /// Consumer identifier
    ConsumerId
);
entity_id!(
    /// Consumer feed identifier
    FeedId
);

/// Named feed role (`MAIN`, `RESERVE`, or any project-defined role)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedRoleId(pub String);

impl FeedRoleId {
    pub const PRIMARY: &'static str = "MAIN";
    pub const RESERVE: &'static str = "RESERVE";

    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }

    pub fn primary() -> Self {
        Self::new(Self::PRIMARY)
    }

    pub fn reserve() -> Self {
        Self::new(Self::RESERVE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_primary(&self) -> bool {
        self.0 == Self::PRIMARY
    }
}

impl fmt::Display for FeedRoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Electrical Enumerations
// ============================================================================

/// Operating mode of the installation
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Mode {
    #[default]
    Normal,
    Emergency,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Normal, Mode::Emergency];

    /// Parse a mode string, rejecting anything other than NORMAL/EMERGENCY
    pub fn parse(raw: &str) -> CalcResult<Self> {
        Mode::from_str(raw.trim())
            .map_err(|_| CalcError::validation(format!("Invalid mode: {:?}", raw)))
    }
}

/// Panel supply system
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
#[strum(ascii_case_insensitive)]
pub enum SystemType {
    #[serde(rename = "3PH")]
    #[strum(serialize = "3PH")]
    ThreePhase,
    #[serde(rename = "1PH")]
    #[strum(serialize = "1PH")]
    SinglePhase,
}

/// Supply phase of a single-phase circuit
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    /// Tie-break order for the balancer
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    pub fn index(self) -> usize {
        match self {
            Phase::L1 => 0,
            Phase::L2 => 1,
            Phase::L3 => 2,
        }
    }

    /// Interpret a stored phase label; `None` for anything but exactly
    /// L1/L2/L3 after trimming
    pub fn from_label(raw: &str) -> Option<Self> {
        Phase::from_str(raw.trim()).ok()
    }
}

/// Who decided a circuit's phase
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum PhaseSource {
    #[default]
    Auto,
    Manual,
}

/// Phase assignment policy of a demand-table row
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum PhaseMode {
    #[default]
    Auto,
    Fixed,
    None,
}

/// Fixed phase letter of a single-phase demand-table row
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
#[strum(ascii_case_insensitive)]
pub enum PhaseLetter {
    A,
    B,
    C,
}

/// Conductor material
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Material {
    #[default]
    Cu,
    Al,
}

/// Load category selecting the panel's voltage-drop limit
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum LoadKind {
    Lighting,
    #[default]
    Other,
}

/// Current distribution assumed for the voltage-drop return path
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum UnbalanceMode {
    #[default]
    Normal,
    FullUnbalanced,
}

/// Independently recomputed part of a panel's results
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Subsystem {
    Demand,
    Phase,
    VoltageDrop,
    Sections,
}

/// Parse a stored enum label into its typed form, mapping failures to a
/// validation error that names the field.
pub fn parse_label<T: FromStr>(field: &str, raw: &str) -> CalcResult<T> {
    T::from_str(raw.trim())
        .map_err(|_| CalcError::validation(format!("Invalid {}: {:?}", field, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(Mode::parse("NORMAL").unwrap(), Mode::Normal);
        assert_eq!(Mode::parse("emergency").unwrap(), Mode::Emergency);
        assert_eq!(Mode::Emergency.to_string(), "EMERGENCY");

        let err = Mode::parse("RESERVE").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }

    #[test]
    fn test_system_type_labels() {
        assert_eq!(SystemType::ThreePhase.to_string(), "3PH");
        assert_eq!(parse_label::<SystemType>("system_type", "1ph").unwrap(), SystemType::SinglePhase);
        assert!(parse_label::<SystemType>("system_type", "2PH").is_err());
    }

    #[test]
    fn test_phase_from_label() {
        assert_eq!(Phase::from_label("L2"), Some(Phase::L2));
        assert_eq!(Phase::from_label(" L3 "), Some(Phase::L3));
        assert_eq!(Phase::from_label("l2"), None);
        assert_eq!(Phase::from_label("L4"), None);
        assert_eq!(Phase::from_label(""), None);
    }

    #[test]
    fn test_multiword_labels() {
        assert_eq!(UnbalanceMode::FullUnbalanced.to_string(), "FULL_UNBALANCED");
        assert_eq!(Subsystem::VoltageDrop.to_string(), "VOLTAGE_DROP");
        assert_eq!(Material::Al.as_ref(), "AL");
    }

    #[test]
    fn test_feed_role_primary() {
        assert!(FeedRoleId::primary().is_primary());
        assert!(!FeedRoleId::reserve().is_primary());
    }
}
