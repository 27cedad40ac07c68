//! Load calculations for low-voltage switchboards.
//!
//! Demand (Kr method), phase balancing, voltage drop with cable selection,
//! bus-section aggregation and staleness reporting over a shared
//! transactional store.

pub mod config;
pub mod demand;
pub mod domain;
pub mod engine;
pub mod error;
pub mod phase_balance;
pub mod repo;
pub mod sections;
pub mod staleness;
pub mod telemetry;
pub mod voltage_drop;

pub use engine::CalcEngine;
pub use error::{CalcError, CalcResult, CalcWarning, ErrorKind};
