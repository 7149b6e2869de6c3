use crate::models::reading::MetricValues;
use crate::quality::thresholds::{Metric, Tier};
use log::warn;
use serde::Serialize;

/// Tier and remediation advice for one metric value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub tier: Tier,
    pub advice: Option<&'static str>,
}

impl Verdict {
    pub const UNKNOWN: Verdict = Verdict {
        tier: Tier::Unknown,
        advice: None,
    };
}

/// Look `value` up in `metric`'s table. The first band containing it wins;
/// NaN and values in a table gap yield [`Verdict::UNKNOWN`].
pub fn classify(metric: Metric, value: f64) -> Verdict {
    metric
        .table()
        .iter()
        .find(|band| band.contains(value))
        .map(|band| Verdict {
            tier: band.tier,
            advice: Some(band.advice),
        })
        .unwrap_or(Verdict::UNKNOWN)
}

pub fn classify_optional(metric: Metric, value: Option<f64>) -> Verdict {
    value.map_or(Verdict::UNKNOWN, |v| classify(metric, v))
}

/// Classify by external metric name (`"PM2.5"`, `"Humidity"`, ...).
pub fn classify_named(name: &str, value: f64) -> Verdict {
    match Metric::from_name(name) {
        Some(metric) => classify(metric, value),
        None => {
            warn!("No threshold table for metric {:?}; reporting unknown", name);
            Verdict::UNKNOWN
        }
    }
}

/// Verdicts for the six metrics of one reading.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct ReadingVerdicts {
    pub pm2_5: Verdict,
    pub pm10: Verdict,
    pub co2: Verdict,
    pub tvoc: Verdict,
    pub humidity: Verdict,
    pub temperature: Verdict,
}

impl ReadingVerdicts {
    pub fn get(&self, metric: Metric) -> Verdict {
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

pub fn classify_reading(values: &MetricValues) -> ReadingVerdicts {
    let of = |metric| classify_optional(metric, values.get(metric));
    ReadingVerdicts {
        pm2_5: of(Metric::Pm25),
        pm10: of(Metric::Pm10),
        co2: of(Metric::Co2),
        tvoc: of(Metric::Tvoc),
        humidity: of(Metric::Humidity),
        temperature: of(Metric::Temperature),
    }
}
