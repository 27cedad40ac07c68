use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{CircuitId, ConsumerId, Mode, PanelId, PhaseSource};

pub type CalcResult<T> = Result<T, CalcError>;

/// Failures that abort the enclosing computation.
///
/// Every variant rolls back the transaction it was raised in; no derived
/// record written before the failure survives.
#[derive(Debug, Error)]
pub enum CalcError {
    /// Malformed or out-of-range input (negative power, bad mode string, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The demand factor table cannot answer the query
    #[error("Lookup error: {0}")]
    Lookup(String),

    /// A dependency the computation needs is missing
    #[error("State error: {0}")]
    State(String),

    /// Recognized input shape that the core does not handle
    #[error("Not implemented: {0}")]
    Unsupported(String),

    /// The backing store failed
    #[error("Store error: {0}")]
    Store(String),
}

/// Stable error category names for callers that gate actions on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr, Serialize)]
pub enum ErrorKind {
    ValidationError,
    LookupError,
    StateError,
    UnsupportedError,
    StoreError,
}

impl CalcError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn lookup(msg: impl Into<String>) -> Self {
        Self::Lookup(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CalcError::Validation(_) => ErrorKind::ValidationError,
            CalcError::Lookup(_) => ErrorKind::LookupError,
            CalcError::State(_) => ErrorKind::StateError,
            CalcError::Unsupported(_) => ErrorKind::UnsupportedError,
            CalcError::Store(_) => ErrorKind::StoreError,
        }
    }
}

#[cfg(feature = "db")]
impl From<sqlx::Error> for CalcError {
    fn from(error: sqlx::Error) -> Self {
        CalcError::Store(format!("Database error: {}", error))
    }
}

impl From<validator::ValidationErrors> for CalcError {
    fn from(errors: validator::ValidationErrors) -> Self {
        CalcError::Validation(errors.to_string())
    }
}

/// Recoverable per-item condition attached to a successful result.
///
/// Serialized with a `reason` tag so the list can be persisted as JSON next
/// to the record it annotates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalcWarning {
    LoadFactorClamped {
        ki_input: f64,
        ki_clamped: f64,
    },
    ManualInvalidPhase {
        circuit_id: CircuitId,
        name: String,
        i_a: f64,
        phase: Option<String>,
        phase_source: PhaseSource,
    },
    EmergencySectionsNotComputed {
        panel_id: PanelId,
    },
    ConsumerWithoutFeed {
        consumer_id: ConsumerId,
        name: String,
        mode: Mode,
    },
    MaxSectionFallback {
        circuit_id: CircuitId,
        s_mm2: f64,
        du_pct: f64,
        du_limit_pct: f64,
    },
}

impl CalcWarning {
    pub fn reason(&self) -> &'static str {
        match self {
            CalcWarning::LoadFactorClamped { .. } => "LOAD_FACTOR_CLAMPED",
            CalcWarning::ManualInvalidPhase { .. } => "MANUAL_INVALID_PHASE",
            CalcWarning::EmergencySectionsNotComputed { .. } => "EMERGENCY_SECTIONS_NOT_COMPUTED",
            CalcWarning::ConsumerWithoutFeed { .. } => "CONSUMER_WITHOUT_FEED",
            CalcWarning::MaxSectionFallback { .. } => "MAX_SECTION_FALLBACK",
        }
    }

    /// Circuit the warning is attached to, if it is circuit-scoped
    pub fn circuit_id(&self) -> Option<CircuitId> {
        match self {
            CalcWarning::ManualInvalidPhase { circuit_id, .. }
            | CalcWarning::MaxSectionFallback { circuit_id, .. } => Some(*circuit_id),
            _ => None,
        }
    }
}
