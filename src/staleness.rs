//! Freshness of stored results relative to their inputs.
//!
//! Status derivation is a pure function over a [`StatusSnapshot`] read by
//! the engine; timestamps stay as raw text until they are parsed here so
//! that malformed values can be reported instead of failing the read.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::TouchLookup;

/// Formats accepted for stored timestamps besides RFC 3339
const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Freshness verdict for one subsystem of one panel
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
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CalcStatus {
    Ok,
    Stale,
    NoCalc,
    Unknown,
    /// Subsystem does not apply to the panel
    Hidden,
}

/// Why a status could not be decided
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UnknownReason {
    /// The store was written by someone else since our last write
    ExternalChange,
    /// The store keeps no input-touch log
    NoInputLog,
    /// The log exists but has no entry for this panel and subsystem
    NoRecordedTouch,
    BadTimestamp,
}

/// Everything the tracker needs to know about one subsystem
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusSnapshot {
    /// False when the subsystem does not apply (e.g. no single-phase circuits)
    pub applicable: bool,
    /// Number of input records the subsystem reads
    pub input_count: usize,
    /// Number of derived records expected for the current inputs
    pub expected_outputs: usize,
    /// Number of derived records present
    pub output_count: usize,
    /// Oldest relevant derived-record timestamp, raw
    pub calc_updated_at: Option<String>,
    pub panel_touch: Option<TouchLookup>,
    /// Store-wide touch, consulted for subsystems with shared inputs
    pub global_touch: Option<TouchLookup>,
    /// Newest demand result this subsystem consumed, raw
    pub upstream_calc_at: Option<String>,
}

/// Derived status with the timestamps it was decided on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub code: CalcStatus,
    pub calc_updated_at: Option<String>,
    pub effective_input_at: Option<String>,
    pub reason: Option<UnknownReason>,
}

impl StatusInfo {
    fn new(code: CalcStatus) -> Self {
        Self {
            code,
            calc_updated_at: None,
            effective_input_at: None,
            reason: None,
        }
    }

    fn unknown(reason: UnknownReason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::new(CalcStatus::Unknown)
        }
    }

    fn with_times(mut self, calc: Option<&str>, input: Option<&str>) -> Self {
        self.calc_updated_at = calc.map(str::to_string);
        self.effective_input_at = input.map(str::to_string);
        self
    }
}

/// Parse a stored timestamp: RFC 3339, or a naive date-time taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Render a timestamp the way it is compared and stored
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Combine a panel-scoped and a store-wide input timestamp.
///
/// The later of the two wins. A side that is missing or unparseable yields
/// to the other; when neither parses the panel value is returned raw so
/// the caller can report it.
pub fn effective_input_at<'a>(panel: Option<&'a str>, global: Option<&'a str>) -> Option<&'a str> {
    match (panel, global) {
        (None, None) => None,
        (Some(p), None) => Some(p),
        (None, Some(g)) => Some(g),
        (Some(p), Some(g)) => match (parse_timestamp(p), parse_timestamp(g)) {
            (Some(pt), Some(gt)) => Some(if gt > pt { g } else { p }),
            (Some(_), None) => Some(p),
            (None, Some(_)) => Some(g),
            (None, None) => Some(p),
        },
    }
}

/// Decide a subsystem's status. Checks run in a fixed order and the first
/// that applies wins.
pub fn derive_status(snapshot: &StatusSnapshot, external_change: bool) -> StatusInfo {
    if !snapshot.applicable {
        return StatusInfo::new(CalcStatus::Hidden);
    }
    if snapshot.input_count == 0 {
        return StatusInfo::new(CalcStatus::Ok);
    }

    let calc_raw = match snapshot.calc_updated_at.as_deref() {
        Some(raw) if snapshot.output_count >= snapshot.expected_outputs => raw,
        _ => return StatusInfo::new(CalcStatus::NoCalc),
    };

    if external_change {
        return StatusInfo::unknown(UnknownReason::ExternalChange).with_times(Some(calc_raw), None);
    }

    let panel_touch = match &snapshot.panel_touch {
        None | Some(TouchLookup::Unavailable) => {
            return StatusInfo::unknown(UnknownReason::NoInputLog).with_times(Some(calc_raw), None);
        }
        Some(lookup) => lookup.recorded(),
    };
    let global_touch = snapshot.global_touch.as_ref().and_then(TouchLookup::recorded);

    let Some(input_raw) = effective_input_at(panel_touch, global_touch) else {
        return StatusInfo::unknown(UnknownReason::NoRecordedTouch).with_times(Some(calc_raw), None);
    };

    let (Some(calc_ts), Some(input_ts)) = (parse_timestamp(calc_raw), parse_timestamp(input_raw)) else {
        return StatusInfo::unknown(UnknownReason::BadTimestamp)
            .with_times(Some(calc_raw), Some(input_raw));
    };

    let upstream_newer = snapshot
        .upstream_calc_at
        .as_deref()
        .and_then(parse_timestamp)
        .is_some_and(|upstream| calc_ts < upstream);

    let code = if calc_ts < input_ts || upstream_newer {
        CalcStatus::Stale
    } else {
        CalcStatus::Ok
    };
    StatusInfo::new(code).with_times(Some(calc_raw), Some(input_raw))
}

/// Detects writes to the store made by other processes.
///
/// Record the store's data version right after each of our own commits;
/// any later difference means someone else wrote.
#[derive(Debug, Clone, Default)]
pub struct ChangeMonitor {
    known_version: Option<u64>,
}

impl ChangeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_own_write(&mut self, version: u64) {
        self.known_version = Some(version);
    }

    pub fn known_version(&self) -> Option<u64> {
        self.known_version
    }

    /// False until a first own write has been recorded
    pub fn is_external_change(&self, current_version: u64) -> bool {
        self.known_version.is_some_and(|known| known != current_version)
    }
}
