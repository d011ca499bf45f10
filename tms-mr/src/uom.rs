//! Unit-of-measure normalization and variance arithmetic
//!
//! Quantities are compared in short tons. Only weight units are convertible;
//! anything else (volumes, counts) is unrecognized and yields `None` rather than
//! a silent zero.

/// Common unit quantities are normalized to
pub const BASE_UNIT: &str = "ton";

const POUNDS_PER_TON: f64 = 2000.0;
const KILOGRAMS_PER_TON: f64 = 907.184_74;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfMeasure {
    Ton,
    Pound,
    Kilogram,
}

impl UnitOfMeasure {
    /// Parse a free-text unit (case-insensitive, surrounding whitespace ignored)
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "ton" | "tons" | "tn" => Some(UnitOfMeasure::Ton),
            "lb" | "lbs" | "pound" | "pounds" => Some(UnitOfMeasure::Pound),
            "kg" | "kgs" | "kilogram" | "kilograms" => Some(UnitOfMeasure::Kilogram),
            _ => None,
        }
    }

    /// Conversion factor into tons
    pub fn tons_per_unit(self) -> f64 {
        match self {
            UnitOfMeasure::Ton => 1.0,
            UnitOfMeasure::Pound => 1.0 / POUNDS_PER_TON,
            UnitOfMeasure::Kilogram => 1.0 / KILOGRAMS_PER_TON,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitOfMeasure::Ton => "ton",
            UnitOfMeasure::Pound => "lb",
            UnitOfMeasure::Kilogram => "kg",
        }
    }
}

/// Convert `quantity` between two free-text units
///
/// Returns `None` when either unit is unrecognized.
pub fn convert_quantity(quantity: f64, from: &str, to: &str) -> Option<f64> {
    let from = UnitOfMeasure::parse(from)?;
    let to = UnitOfMeasure::parse(to)?;
    if from == to {
        return Some(quantity);
    }
    Some(quantity * from.tons_per_unit() / to.tons_per_unit())
}

/// Percentage difference of `actual` relative to `expected`
///
/// `None` when `expected` is not a positive finite number.
pub fn variance_pct(expected: f64, actual: f64) -> Option<f64> {
    if !expected.is_finite() || !actual.is_finite() || expected <= 0.0 {
        return None;
    }
    Some((actual - expected).abs() * 100.0 / expected)
}
