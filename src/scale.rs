use std::fmt;
use std::str::FromStr;

use metrics::Unit;
use serde::Deserialize;
use thiserror::Error;

use crate::metric::RawValue;

const UNITS: [Unit; 17] = [
    Unit::Count,
    Unit::Percent,
    Unit::Seconds,
    Unit::Milliseconds,
    Unit::Microseconds,
    Unit::Nanoseconds,
    Unit::Tebibytes,
    Unit::Gibibytes,
    Unit::Mebibytes,
    Unit::Kibibytes,
    Unit::Bytes,
    Unit::TerabitsPerSecond,
    Unit::GigabitsPerSecond,
    Unit::MegabitsPerSecond,
    Unit::KilobitsPerSecond,
    Unit::BitsPerSecond,
    Unit::CountPerSecond,
];

/// Physical dimension of a unit; conversions only happen within one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Count,
    Space,
    Time,
    BitRate,
    Rate,
    Percent,
}

/// A unit optionally multiplied by a power of ten, e.g. `count x 10^3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct UnitSpec {
    pub unit: Unit,
    pub exponent: i32,
}

impl UnitSpec {
    #[must_use]
    pub const fn new(unit: Unit) -> Self {
        UnitSpec { unit, exponent: 0 }
    }

    #[must_use]
    pub const fn dimension(&self) -> Dimension {
        dimension(self.unit)
    }

    /// Size of one of this unit expressed in the dimension's base unit.
    fn magnitude(&self) -> f64 {
        base_factor(self.unit) * 10f64.powi(self.exponent)
    }
}

impl FromStr for UnitSpec {
    type Err = ScaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (unit, exponent) = match s.split_once(" x 10^") {
            Some((unit, exponent)) => (
                unit.trim(),
                exponent
                    .trim()
                    .parse()
                    .map_err(|_| ScaleError::UnknownUnit(s.to_string()))?,
            ),
            None => (s, 0),
        };

        let unit = Unit::from_string(unit)
            .or_else(|| UNITS.into_iter().find(|u| u.as_canonical_label() == unit))
            .ok_or_else(|| ScaleError::UnknownUnit(s.to_string()))?;

        Ok(UnitSpec { unit, exponent })
    }
}

impl TryFrom<String> for UnitSpec {
    type Error = ScaleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for UnitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `Count` has an empty canonical label.
        let label = match self.unit.as_canonical_label() {
            "" => self.unit.as_str(),
            label => label,
        };

        match self.exponent {
            0 => f.write_str(label),
            exponent => write!(f, "{label} x 10^{exponent}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScaleError {
    #[error("Unknown unit; unit={0}")]
    UnknownUnit(String),
    #[error("Incompatible units; from={from}; to={to}")]
    Incompatible { from: UnitSpec, to: UnitSpec },
}

/// Multiplicative conversion applied to numeric values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    factor: f64,
}

impl Scale {
    pub const IDENTITY: Scale = Scale { factor: 1.0 };

    /// Conversion from values expressed in `from` into values expressed in `to`.
    ///
    /// # Errors
    ///
    /// Errors when the units measure different dimensions.
    pub fn between(from: UnitSpec, to: UnitSpec) -> Result<Scale, ScaleError> {
        if from.dimension() != to.dimension() {
            return Err(ScaleError::Incompatible { from, to });
        }

        Ok(Scale { factor: from.magnitude() / to.magnitude() })
    }

    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn is_identity(&self) -> bool {
        self.factor == 1.0
    }

    /// Scales numeric values, turning integers into floats when the scale is not the identity.
    ///
    /// Text passes through unchanged.
    #[must_use]
    pub fn apply(&self, value: RawValue) -> RawValue {
        if self.is_identity() {
            return value;
        }

        match value {
            RawValue::Summary(summary) => {
                let factor = self.factor;
                let scaled = summary.map_floats(|v| v * factor);

                RawValue::Summary(scaled)
            }
            RawValue::Text(_) => value,
            numeric => numeric
                .as_f64()
                .map_or(numeric, |v| RawValue::Float(v * self.factor)),
        }
    }
}

const fn dimension(unit: Unit) -> Dimension {
    match unit {
        Unit::Count => Dimension::Count,
        Unit::Percent => Dimension::Percent,
        Unit::Seconds | Unit::Milliseconds | Unit::Microseconds | Unit::Nanoseconds => {
            Dimension::Time
        }
        Unit::Tebibytes | Unit::Gibibytes | Unit::Mebibytes | Unit::Kibibytes | Unit::Bytes => {
            Dimension::Space
        }
        Unit::TerabitsPerSecond
        | Unit::GigabitsPerSecond
        | Unit::MegabitsPerSecond
        | Unit::KilobitsPerSecond
        | Unit::BitsPerSecond => Dimension::BitRate,
        Unit::CountPerSecond => Dimension::Rate,
    }
}

const fn base_factor(unit: Unit) -> f64 {
    match unit {
        Unit::Count | Unit::Percent | Unit::Seconds | Unit::Bytes => 1.0,
        Unit::BitsPerSecond | Unit::CountPerSecond => 1.0,
        Unit::Milliseconds => 1e-3,
        Unit::Microseconds => 1e-6,
        Unit::Nanoseconds => 1e-9,
        Unit::Kibibytes => 1024.0,
        Unit::Mebibytes => 1_048_576.0,
        Unit::Gibibytes => 1_073_741_824.0,
        Unit::Tebibytes => 1_099_511_627_776.0,
        Unit::KilobitsPerSecond => 1e3,
        Unit::MegabitsPerSecond => 1e6,
        Unit::GigabitsPerSecond => 1e9,
        Unit::TerabitsPerSecond => 1e12,
    }
}
