//! Demand factor (Kr) lookup keyed by effective receiver count and
//! utilization factor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::error::{CalcError, CalcResult};

/// Lowest utilization factor the table covers
pub const KI_MIN: f64 = 0.10;
/// Highest utilization factor the table covers
pub const KI_MAX: f64 = 0.80;
/// Column match tolerance
pub const DEFAULT_TOLERANCE: f64 = 1e-12;

/// Utilization-factor columns of the built-in table
const STANDARD_KI: [f64; 9] = [0.10, 0.15, 0.20, 0.30, 0.40, 0.50, 0.60, 0.70, 0.80];

/// Built-in Kr values, one row per tabulated receiver count.
/// Rows shorter than the column list continue at 1.0.
const STANDARD_ROWS: &[(u32, &[f64])] = &[
    (1, &[8.00, 5.33, 4.00, 2.67, 2.00, 1.60, 1.33, 1.14, 1.00]),
    (2, &[6.22, 4.33, 3.39, 2.45, 1.98, 1.60, 1.33, 1.14, 1.00]),
    (3, &[4.05, 2.89, 2.31, 1.74, 1.45, 1.34, 1.22, 1.14, 1.00]),
    (4, &[3.24, 2.35, 1.91, 1.47, 1.25, 1.21, 1.12, 1.06, 1.00]),
    (5, &[2.84, 2.09, 1.72, 1.35, 1.16, 1.16, 1.08, 1.03, 1.00]),
    (6, &[2.64, 1.96, 1.62, 1.28, 1.14, 1.13, 1.06, 1.01]),
    (7, &[2.49, 1.86, 1.54, 1.23, 1.12, 1.10, 1.04]),
    (8, &[2.37, 1.78, 1.48, 1.19, 1.10, 1.08, 1.02]),
    (9, &[2.27, 1.71, 1.43, 1.16, 1.09, 1.07, 1.01]),
    (10, &[2.18, 1.65, 1.39, 1.13, 1.07, 1.05]),
    (11, &[2.11, 1.61, 1.35, 1.10, 1.06, 1.04]),
    (12, &[2.04, 1.56, 1.32, 1.08, 1.05, 1.03]),
    (13, &[1.99, 1.52, 1.29, 1.06, 1.04, 1.01]),
    (14, &[1.94, 1.49, 1.27, 1.05, 1.02]),
    (15, &[1.89, 1.46, 1.25, 1.03]),
    (16, &[1.85, 1.43, 1.23, 1.02]),
    (17, &[1.81, 1.41, 1.21]),
    (18, &[1.78, 1.39, 1.19]),
    (19, &[1.75, 1.36, 1.17]),
    (20, &[1.72, 1.35, 1.16]),
    (21, &[1.69, 1.33, 1.15]),
    (22, &[1.67, 1.31, 1.13]),
    (23, &[1.64, 1.30, 1.12]),
    (24, &[1.62, 1.28, 1.11]),
    (25, &[1.60, 1.27, 1.10]),
    (30, &[1.51, 1.21, 1.05]),
    (35, &[1.44, 1.16]),
    (40, &[1.40, 1.13]),
    (50, &[1.30, 1.07]),
    (60, &[1.25, 1.03]),
    (70, &[1.20]),
    (80, &[1.16]),
    (90, &[1.13]),
    (100, &[1.10]),
];

/// One tabulated (ne, Ki) -> Kr value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DemandFactorPoint {
    pub ne: u32,
    pub ki: f64,
    pub kr: f64,
}

/// Neighbouring columns used for an interpolated lookup
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InterpolationBounds {
    pub ki_lo: f64,
    pub ki_hi: f64,
    pub kr_lo: f64,
    pub kr_hi: f64,
}

/// Outcome of a demand factor lookup, with enough context to audit it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandFactorResolution {
    pub ne_input: f64,
    pub ki_input: f64,
    pub ki_clamped: f64,
    /// Tabulated row actually used
    pub ne_tab: u32,
    pub kr: f64,
    /// Present when Ki fell between two columns
    pub bounds: Option<InterpolationBounds>,
}

impl DemandFactorResolution {
    pub fn was_clamped(&self) -> bool {
        self.ki_clamped != self.ki_input
    }
}

/// Clamp a utilization factor into the table's covered range
pub fn clamp_load_factor(ki: f64) -> f64 {
    ki.clamp(KI_MIN, KI_MAX)
}

#[derive(Debug, Deserialize)]
struct TableFile {
    points: Vec<DemandFactorPoint>,
}

/// Two-dimensional demand factor table.
///
/// Rows are keyed by effective receiver count; each row holds its Ki
/// columns in ascending order.
#[derive(Debug, Clone, PartialEq)]
pub struct DemandFactorTable {
    rows: BTreeMap<u32, Vec<(f64, f64)>>,
    tolerance: f64,
}

impl DemandFactorTable {
    /// Build a table from individual points.
    ///
    /// Rejects non-finite values, a zero receiver count and duplicate
    /// columns within a row.
    pub fn from_points(points: impl IntoIterator<Item = DemandFactorPoint>) -> CalcResult<Self> {
        let mut rows: BTreeMap<u32, Vec<(f64, f64)>> = BTreeMap::new();
        for point in points {
            if point.ne == 0 {
                return Err(CalcError::validation("Demand factor table: ne must be positive"));
            }
            if !point.ki.is_finite() || !point.kr.is_finite() {
                return Err(CalcError::validation(format!(
                    "Demand factor table: non-finite value at ne={}",
                    point.ne
                )));
            }
            rows.entry(point.ne).or_default().push((point.ki, point.kr));
        }

        for (ne, columns) in rows.iter_mut() {
            columns.sort_by(|a, b| a.0.total_cmp(&b.0));
            if columns.windows(2).any(|w| w[0].0 == w[1].0) {
                return Err(CalcError::validation(format!(
                    "Demand factor table: duplicate Ki column in row ne={}",
                    ne
                )));
            }
        }

        Ok(Self {
            rows,
            tolerance: DEFAULT_TOLERANCE,
        })
    }

    /// The built-in reference table
    pub fn standard() -> Self {
        let rows = STANDARD_ROWS
            .iter()
            .map(|(ne, values)| {
                let columns = STANDARD_KI
                    .iter()
                    .enumerate()
                    .map(|(i, ki)| (*ki, values.get(i).copied().unwrap_or(1.0)))
                    .collect();
                (*ne, columns)
            })
            .collect();
        Self {
            rows,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Parse a TOML document with a `[[points]]` array
    pub fn from_toml_str(content: &str) -> CalcResult<Self> {
        let file: TableFile = toml::from_str(content)
            .map_err(|e| CalcError::validation(format!("Demand factor table: {}", e)))?;
        Self::from_points(file.points)
    }

    pub fn from_file(path: impl AsRef<Path>) -> CalcResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CalcError::validation(format!("Demand factor table {}: {}", path.display(), e))
        })?;
        let table = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), rows = table.row_count(), "Loaded demand factor table");
        Ok(table)
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Flatten back into points, ordered by (ne, Ki)
    pub fn points(&self) -> Vec<DemandFactorPoint> {
        self.rows
            .iter()
            .flat_map(|(ne, columns)| {
                columns.iter().map(move |(ki, kr)| DemandFactorPoint {
                    ne: *ne,
                    ki: *ki,
                    kr: *kr,
                })
            })
            .collect()
    }

    /// Resolve Kr for an effective receiver count and utilization factor.
    ///
    /// Ki is clamped to [0.10, 0.80]. The row is the smallest tabulated
    /// count not below `ne`; no interpolation happens across rows. Within
    /// the row an exact column wins, otherwise Kr is interpolated linearly
    /// between the nearest lower and higher columns.
    pub fn resolve(&self, ne: f64, ki: f64) -> CalcResult<DemandFactorResolution> {
        if !ne.is_finite() || ne <= 0.0 {
            return Err(CalcError::validation(format!(
                "Effective receiver count must be positive and finite, got {}",
                ne
            )));
        }
        if !ki.is_finite() {
            return Err(CalcError::validation(format!(
                "Utilization factor must be finite, got {}",
                ki
            )));
        }

        let ki_clamped = clamp_load_factor(ki);

        let min_row = ne.ceil();
        let covering = if min_row > u32::MAX as f64 {
            None
        } else {
            self.rows.range(min_row as u32..).next()
        };
        let (ne_tab, columns) = covering.ok_or_else(|| {
            CalcError::lookup(format!("No demand factor row covers ne={}", ne))
        })?;

        let resolution = |kr: f64, bounds: Option<InterpolationBounds>| DemandFactorResolution {
            ne_input: ne,
            ki_input: ki,
            ki_clamped,
            ne_tab: *ne_tab,
            kr,
            bounds,
        };

        if let Some((_, kr)) = columns
            .iter()
            .find(|(col, _)| (col - ki_clamped).abs() <= self.tolerance)
        {
            return Ok(resolution(*kr, None));
        }

        let lower = columns.iter().rev().find(|(col, _)| *col < ki_clamped);
        let upper = columns.iter().find(|(col, _)| *col > ki_clamped);

        match (lower, upper) {
            (Some(&(ki_lo, kr_lo)), Some(&(ki_hi, kr_hi))) => {
                let kr = kr_lo + (ki_clamped - ki_lo) / (ki_hi - ki_lo) * (kr_hi - kr_lo);
                Ok(resolution(
                    kr,
                    Some(InterpolationBounds {
                        ki_lo,
                        ki_hi,
                        kr_lo,
                        kr_hi,
                    }),
                ))
            }
            _ => Err(CalcError::lookup(format!(
                "Demand factor row ne={} has no columns around Ki={}",
                ne_tab, ki_clamped
            ))),
        }
    }

    /// Shorthand for `resolve(..).kr`
    pub fn factor(&self, ne: f64, ki: f64) -> CalcResult<f64> {
        self.resolve(ne, ki).map(|r| r.kr)
    }
}

impl Default for DemandFactorTable {
    fn default() -> Self {
        Self::standard()
    }
}
