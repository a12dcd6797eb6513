//! Bounded user settings.
//!
//! Out-of-range values are rejected here, at the configuration boundary, so
//! the scheduler and evaluator only ever see valid settings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Rejected user input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid config: polling frequency must be between {min} and {max} minutes, got {got}")]
    PollingFrequency { got: i64, min: u32, max: u32 },

    #[error("invalid config: threshold must be between {min:.2} and {max:.2}, got {got}")]
    Threshold { got: f64, min: f64, max: f64 },

    #[error("invalid config: credential must not be empty")]
    EmptyCredential,

    #[error("invalid config: unparseable value {0:?}")]
    Unparseable(String),
}

/// Polling frequency in minutes, within `[MIN_MINUTES, MAX_MINUTES]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct PollingInterval(u32);

impl PollingInterval {
    pub const MIN_MINUTES: u32 = 1;
    pub const MAX_MINUTES: u32 = 1440;

    pub fn from_minutes(minutes: i64) -> Result<Self, ConfigError> {
        if minutes < Self::MIN_MINUTES as i64 || minutes > Self::MAX_MINUTES as i64 {
            return Err(ConfigError::PollingFrequency {
                got: minutes,
                min: Self::MIN_MINUTES,
                max: Self::MAX_MINUTES,
            });
        }
        Ok(Self(minutes as u32))
    }

    /// Parse user text such as `"15"`.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let minutes = input
            .trim()
            .parse::<i64>()
            .map_err(|_| ConfigError::Unparseable(input.trim().to_string()))?;
        Self::from_minutes(minutes)
    }

    #[inline]
    pub fn minutes(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.0 as u64 * 60)
    }
}

impl Default for PollingInterval {
    fn default() -> Self {
        Self(5)
    }
}

impl TryFrom<i64> for PollingInterval {
    type Error = ConfigError;

    fn try_from(minutes: i64) -> Result<Self, Self::Error> {
        Self::from_minutes(minutes)
    }
}

impl From<PollingInterval> for i64 {
    fn from(interval: PollingInterval) -> Self {
        interval.0 as i64
    }
}

impl fmt::Display for PollingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} min", self.0)
    }
}

/// Notification threshold: alert when a coefficient drops to or below it.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Threshold(f64);

impl Threshold {
    pub const MIN: f64 = 0.0;
    pub const MAX: f64 = 20.0;

    pub fn new(value: f64) -> Result<Self, ConfigError> {
        if !value.is_finite() || value < Self::MIN || value > Self::MAX {
            return Err(ConfigError::Threshold {
                got: value,
                min: Self::MIN,
                max: Self::MAX,
            });
        }
        Ok(Self(value))
    }

    /// Parse user text; accepts a decimal comma (`"1,5"`).
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let normalized = input.trim().replace(',', ".");
        let value = normalized
            .parse::<f64>()
            .map_err(|_| ConfigError::Unparseable(input.trim().to_string()))?;
        Self::new(value)
    }

    #[inline]
    pub fn value(self) -> f64 {
        self.0
    }

    /// True when `coefficient` is in the alerting zone (`<= threshold`).
    #[inline]
    pub fn admits(self, coefficient: f64) -> bool {
        coefficient <= self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(1.0)
    }
}

impl TryFrom<f64> for Threshold {
    type Error = ConfigError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Threshold> for f64 {
    fn from(threshold: Threshold) -> Self {
        threshold.0
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}
