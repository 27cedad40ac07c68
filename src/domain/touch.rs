use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::PanelId;

/// Scope of an input-touch record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TouchScope {
    Panel(PanelId),
    /// Edits that affect every panel (e.g. the cable catalog)
    Global,
}

impl TouchScope {
    pub const GLOBAL_KEY: &'static str = "*";

    /// Storage key: panel id text or `*`
    pub fn key(&self) -> String {
        match self {
            TouchScope::Panel(id) => id.to_string(),
            TouchScope::Global => Self::GLOBAL_KEY.to_string(),
        }
    }
}

impl fmt::Display for TouchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Result of asking the store when a subsystem's inputs were last edited
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TouchLookup {
    /// The store keeps no touch log at all
    Unavailable,
    NotRecorded,
    /// Raw timestamp text as written by the collaborator
    Recorded(String),
}

impl TouchLookup {
    pub fn recorded(&self) -> Option<&str> {
        match self {
            TouchLookup::Recorded(raw) => Some(raw.as_str()),
            _ => None,
        }
    }
}
