use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const HOURS_PER_DAY: f64 = 8.0;

/// A task/wave duration estimate, normalised internally to hours.
///
/// Parsed from the `"<n>h"` or `"<n>d"` forms used in task descriptors and
/// phase metadata (`1d == 8h`). Serialises back to hours so that arithmetic
/// (wave duration = max within wave, total = sum of waves) never has to
/// re-parse.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Estimate {
    hours: f64,
}

impl Estimate {
    pub fn from_hours(hours: f64) -> Self {
        Self { hours }
    }

    pub fn hours(&self) -> f64 {
        self.hours
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs_f64((self.hours * 3600.0).max(0.0))
    }

    pub fn zero() -> Self {
        Self { hours: 0.0 }
    }

    pub fn max(self, other: Self) -> Self {
        if other.hours > self.hours { other } else { self }
    }
}

impl FromStr for Estimate {
    type Err = EstimateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix('h').or_else(|| s.strip_suffix('H')) {
            let hours: f64 = n
                .trim()
                .parse()
                .map_err(|_| EstimateParseError(s.to_string()))?;
            return Ok(Self { hours });
        }
        if let Some(n) = s.strip_suffix('d').or_else(|| s.strip_suffix('D')) {
            let days: f64 = n
                .trim()
                .parse()
                .map_err(|_| EstimateParseError(s.to_string()))?;
            return Ok(Self {
                hours: days * HOURS_PER_DAY,
            });
        }
        // Bare number: treat as hours for leniency with numeric phase metadata.
        let hours: f64 = s.parse().map_err(|_| EstimateParseError(s.to_string()))?;
        Ok(Self { hours })
    }
}

impl fmt::Display for Estimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hours.fract() == 0.0 {
            write!(f, "{}h", self.hours as i64)
        } else {
            write!(f, "{}h", self.hours)
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid estimate '{0}', expected '<n>h' or '<n>d'")]
pub struct EstimateParseError(String);
