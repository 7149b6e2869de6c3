//! Wire types for readings posted by devices.
//!
//! A metric omitted from the payload is recorded as 0, an explicit `null` is
//! kept as missing.

use crate::quality::thresholds::Metric;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The six metric values of one reading (or of a mean over readings).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    pub pm2_5: Option<f64>,
    pub pm10: Option<f64>,
    pub co2: Option<f64>,
    pub tvoc: Option<f64>,
    pub humidity: Option<f64>,
    pub temperature: Option<f64>,
}

impl MetricValues {
    pub fn from_fn(mut f: impl FnMut(Metric) -> Option<f64>) -> Self {
        MetricValues {
            pm2_5: f(Metric::Pm25),
            pm10: f(Metric::Pm10),
            co2: f(Metric::Co2),
            tvoc: f(Metric::Tvoc),
            humidity: f(Metric::Humidity),
            temperature: f(Metric::Temperature),
        }
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Pm25 => self.pm2_5,
            Metric::Pm10 => self.pm10,
            Metric::Co2 => self.co2,
            Metric::Tvoc => self.tvoc,
            Metric::Humidity => self.humidity,
            Metric::Temperature => self.temperature,
        }
    }
}

fn zero() -> Option<f64> {
    Some(0.0)
}

/// A reading as posted by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingInput {
    pub api_key: String,
    #[serde(default = "zero")]
    pub pm2_5: Option<f64>,
    #[serde(default = "zero")]
    pub pm10: Option<f64>,
    #[serde(default = "zero")]
    pub co2: Option<f64>,
    #[serde(default = "zero")]
    pub tvoc: Option<f64>,
    #[serde(default = "zero")]
    pub humidity: Option<f64>,
    #[serde(default = "zero")]
    pub temperature: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl ReadingInput {
    /// Parse one JSON object, naming the offending field on failure.
    pub fn from_json(raw: &str) -> Result<Self, String> {
        let de = &mut serde_json::Deserializer::from_str(raw);
        serde_path_to_error::deserialize(de).map_err(|e| {
            let path = e.path().to_string();
            if path == "." {
                format!("invalid reading: {}", e.inner())
            } else {
                format!("invalid reading at `{}`: {}", path, e.inner())
            }
        })
    }

    pub fn metrics(&self) -> MetricValues {
        MetricValues {
            pm2_5: self.pm2_5,
            pm10: self.pm10,
            co2: self.co2,
            tvoc: self.tvoc,
            humidity: self.humidity,
            temperature: self.temperature,
        }
    }
}
