//! Prometheus-style durations ("90s", "1h30m", "30d")
//!
//! Pipeline definitions express every window and step in this notation. The
//! value serializes back to its canonical string so a definition survives a
//! load/save cycle unchanged.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationParseError {
    #[error("duration is empty")]
    Empty,
    #[error("invalid duration '{0}': expected <number><unit> pairs such as 90s, 5m, 1h30m")]
    Malformed(String),
    #[error("invalid duration '{input}': unknown unit '{unit}'")]
    UnknownUnit { input: String, unit: String },
}

/// Units in descending order, used for both parsing and canonical display.
const UNITS: &[(&str, u64)] = &[
    ("w", 7 * 24 * 3600 * 1000),
    ("d", 24 * 3600 * 1000),
    ("h", 3600 * 1000),
    ("m", 60 * 1000),
    ("s", 1000),
    ("ms", 1),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PromDuration(Duration);

impl PromDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub fn as_std(&self) -> Duration {
        self.0
    }

    pub fn as_millis(&self) -> u64 {
        self.0.as_millis() as u64
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.as_millis() as i64)
    }

    /// Number of whole `step`s that fit in this duration.
    pub fn steps_of(&self, step: PromDuration) -> u64 {
        if step.is_zero() {
            return 0;
        }
        self.as_millis() / step.as_millis()
    }
}

impl From<Duration> for PromDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl FromStr for PromDuration {
    type Err = DurationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input.is_empty() {
            return Err(DurationParseError::Empty);
        }

        let mut total: u64 = 0;
        let mut rest = input;
        while !rest.is_empty() {
            let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
            if digits == 0 {
                return Err(DurationParseError::Malformed(input.to_string()));
            }
            let value: u64 = rest[..digits]
                .parse()
                .map_err(|_| DurationParseError::Malformed(input.to_string()))?;
            rest = &rest[digits..];

            let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
            if unit_len == 0 {
                return Err(DurationParseError::Malformed(input.to_string()));
            }
            let unit = &rest[..unit_len];
            let millis = UNITS
                .iter()
                .find(|(name, _)| *name == unit)
                .map(|(_, millis)| *millis)
                .ok_or_else(|| DurationParseError::UnknownUnit {
                    input: input.to_string(),
                    unit: unit.to_string(),
                })?;
            rest = &rest[unit_len..];

            total = value
                .checked_mul(millis)
                .and_then(|v| total.checked_add(v))
                .ok_or_else(|| DurationParseError::Malformed(input.to_string()))?;
        }

        Ok(Self::from_millis(total))
    }
}

impl fmt::Display for PromDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut remaining = self.as_millis();
        if remaining == 0 {
            return f.write_str("0s");
        }
        // Weeks are accepted on input but days read better in output.
        for (name, millis) in UNITS.iter().filter(|(name, _)| *name != "w") {
            if remaining >= *millis {
                write!(f, "{}{}", remaining / millis, name)?;
                remaining %= millis;
            }
        }
        Ok(())
    }
}

impl Serialize for PromDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PromDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!("90s".parse::<PromDuration>().unwrap(), PromDuration::from_secs(90));
        assert_eq!("5m".parse::<PromDuration>().unwrap(), PromDuration::from_secs(300));
        assert_eq!("1d".parse::<PromDuration>().unwrap(), PromDuration::from_secs(86_400));
        assert_eq!("250ms".parse::<PromDuration>().unwrap(), PromDuration::from_millis(250));
    }

    #[test]
    fn test_parse_compound() {
        let d: PromDuration = "1h30m".parse().unwrap();
        assert_eq!(d, PromDuration::from_secs(5400));
    }

    #[test]
    fn test_display_is_canonical() {
        assert_eq!(PromDuration::from_secs(5400).to_string(), "1h30m");
        assert_eq!(PromDuration::from_secs(30 * 86_400).to_string(), "30d");
        assert_eq!(PromDuration::from_secs(0).to_string(), "0s");
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!("".parse::<PromDuration>(), Err(DurationParseError::Empty));
        assert!(matches!(
            "10".parse::<PromDuration>(),
            Err(DurationParseError::Malformed(_))
        ));
        assert!(matches!(
            "10y".parse::<PromDuration>(),
            Err(DurationParseError::UnknownUnit { .. })
        ));
        assert!("m5".parse::<PromDuration>().is_err());
    }

    #[test]
    fn test_steps_of() {
        let hour = PromDuration::from_secs(3600);
        assert_eq!(hour.steps_of(PromDuration::from_secs(60)), 60);
        assert_eq!(hour.steps_of(PromDuration::from_secs(0)), 0);
    }
}
