pub mod calculator;
pub mod factor_table;

pub use calculator::{compute_row, demand_current, reactive_ratio, DemandCalculator, DemandOutcome};
pub use factor_table::{
    clamp_load_factor, DemandFactorPoint, DemandFactorResolution, DemandFactorTable, InterpolationBounds,
};
