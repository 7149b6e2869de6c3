//! Health-advisory threshold tables for the six measured metrics.
//!
//! Every table is a list of closed ranges `[low, high]` mapped to a tier and a
//! remediation advice. The ranges reproduce the advisory sheet as published,
//! including the holes it leaves between adjoining boundaries (PM2.5 has no
//! band for `25 < v < 26`, temperature none for `23.99 < v < 24.00`, and the
//! pollutant tables start at 0). Values inside a hole have no band; see
//! [`gaps`] and `quality::classify`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A measured quantity with its own threshold table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Metric {
    #[serde(rename = "PM2.5")]
    Pm25,
    #[serde(rename = "PM10")]
    Pm10,
    #[serde(rename = "CO2")]
    Co2,
    #[serde(rename = "TVOC")]
    Tvoc,
    Temperature,
    Humidity,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Pm25,
        Metric::Pm10,
        Metric::Co2,
        Metric::Tvoc,
        Metric::Humidity,
        Metric::Temperature,
    ];

    /// External name, as used by dashboards and advisory sheets.
    pub fn name(self) -> &'static str {
        match self {
            Metric::Pm25 => "PM2.5",
            Metric::Pm10 => "PM10",
            Metric::Co2 => "CO2",
            Metric::Tvoc => "TVOC",
            Metric::Temperature => "Temperature",
            Metric::Humidity => "Humidity",
        }
    }

    pub fn from_name(name: &str) -> Option<Metric> {
        Metric::ALL.into_iter().find(|m| m.name() == name)
    }

    pub fn table(self) -> &'static [Band] {
        match self {
            Metric::Pm25 => &PM2_5,
            Metric::Pm10 => &PM10,
            Metric::Co2 => &CO2,
            Metric::Tvoc => &TVOC,
            Metric::Temperature => &TEMPERATURE,
            Metric::Humidity => &HUMIDITY,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Air-quality tier. `Unknown` is the sentinel for values no band covers and
/// for metric names without a table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Good,
    Moderate,
    Hazardous,
    Unknown,
}

impl Tier {
    pub fn label(self) -> &'static str {
        match self {
            Tier::Good => "good",
            Tier::Moderate => "moderate",
            Tier::Hazardous => "hazardous",
            Tier::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Option<Tier> {
        match label {
            "good" => Some(Tier::Good),
            "moderate" => Some(Tier::Moderate),
            "hazardous" => Some(Tier::Hazardous),
            "unknown" => Some(Tier::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One closed range `[low, high]` of a threshold table.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Band {
    pub low: f64,
    pub high: f64,
    pub tier: Tier,
    pub advice: &'static str,
}

impl Band {
    const fn new(low: f64, high: f64, tier: Tier, advice: &'static str) -> Self {
        Band { low, high, tier, advice }
    }

    /// Both endpoints are inclusive. NaN is never contained.
    pub fn contains(&self, value: f64) -> bool {
        self.low <= value && value <= self.high
    }
}

/// Open interval `(after, before)` of values that no band of a table covers.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Gap {
    pub after: f64,
    pub before: f64,
}

impl Gap {
    pub fn contains(&self, value: f64) -> bool {
        self.after < value && value < self.before
    }
}

/// The uncovered open intervals of `metric`'s table, in ascending order.
pub fn gaps(metric: Metric) -> Vec<Gap> {
    let mut bands: Vec<&Band> = metric.table().iter().collect();
    bands.sort_by(|a, b| a.low.total_cmp(&b.low));

    let mut out = Vec::new();
    let mut covered_to = f64::NEG_INFINITY;
    for band in bands {
        if band.low > covered_to {
            out.push(Gap {
                after: covered_to,
                before: band.low,
            });
        }
        covered_to = covered_to.max(band.high);
    }
    if covered_to < f64::INFINITY {
        out.push(Gap {
            after: covered_to,
            before: f64::INFINITY,
        });
    }
    out
}

const INF: f64 = f64::INFINITY;
const NEG_INF: f64 = f64::NEG_INFINITY;

const NO_ACTION: &str = "No action needed.";

const PARTICLES_MODERATE: &str = "Wear a mask and clean the room.";
const PARTICLES_HAZARDOUS: &str =
    "A mask is required. Run an air purifier, clean the room and clean the air-conditioner filters.";

const CO2_MODERATE: &str = "Open a window or door for a while and use a fan to improve air exchange.";
const CO2_HAZARDOUS: &str = "Keep windows or doors open longer and use a fan to improve air exchange.";

const TVOC_MODERATE: &str = "Open a window or door for a while, use a fan to improve air exchange, \
     and find and remove odour or chemical sources from the room.";
const TVOC_HAZARDOUS: &str = "Keep windows or doors open longer, use a fan to improve air exchange, \
     and remove odour or chemical sources from the room immediately.";

const TEMPERATURE_MODERATE: &str = "Set the air conditioner to 24-26°C.";
const TEMPERATURE_COLD: &str = "Set the air conditioner to a suitable temperature. Check its settings; \
     if the air conditioner is malfunctioning, switch it off and call a technician.";
const TEMPERATURE_HOT: &str = "Set the air conditioner to a suitable temperature and use a fan to spread \
     the cool air. Check its settings; if the air conditioner is malfunctioning, switch it off and call a technician.";

const HUMIDITY_LOW: &str = "Run a humidifier to raise the humidity.";
const HUMIDITY_HIGH: &str = "Switch the air conditioner to dry mode to lower the humidity.";
const HUMIDITY_VERY_LOW: &str = "Run a humidifier continuously and do not use the air conditioner's cooling \
     mode. Check its settings; if the air conditioner is malfunctioning, switch it off and call a technician.";
const HUMIDITY_VERY_HIGH: &str = "Run the air conditioner in dry mode continuously. Check its settings; \
     if the air conditioner is malfunctioning, switch it off and call a technician.";

static PM2_5: [Band; 3] = [
    Band::new(0.0, 25.0, Tier::Good, NO_ACTION),
    Band::new(26.0, 35.0, Tier::Moderate, PARTICLES_MODERATE),
    Band::new(36.0, INF, Tier::Hazardous, PARTICLES_HAZARDOUS),
];

static PM10: [Band; 3] = [
    Band::new(0.0, 50.0, Tier::Good, NO_ACTION),
    Band::new(51.0, 75.0, Tier::Moderate, PARTICLES_MODERATE),
    Band::new(76.0, INF, Tier::Hazardous, PARTICLES_HAZARDOUS),
];

static CO2: [Band; 3] = [
    Band::new(0.0, 1000.0, Tier::Good, NO_ACTION),
    Band::new(1001.0, 1200.0, Tier::Moderate, CO2_MODERATE),
    Band::new(1201.0, INF, Tier::Hazardous, CO2_HAZARDOUS),
];

static TVOC: [Band; 3] = [
    Band::new(0.0, 1000.0, Tier::Good, NO_ACTION),
    Band::new(1001.0, 1100.0, Tier::Moderate, TVOC_MODERATE),
    Band::new(1101.0, INF, Tier::Hazardous, TVOC_HAZARDOUS),
];

static TEMPERATURE: [Band; 5] = [
    Band::new(24.00, 26.99, Tier::Good, NO_ACTION),
    Band::new(22.00, 23.99, Tier::Moderate, TEMPERATURE_MODERATE),
    Band::new(27.00, 28.99, Tier::Moderate, TEMPERATURE_MODERATE),
    Band::new(NEG_INF, 21.99, Tier::Hazardous, TEMPERATURE_COLD),
    Band::new(29.00, INF, Tier::Hazardous, TEMPERATURE_HOT),
];

static HUMIDITY: [Band; 5] = [
    Band::new(50.00, 65.99, Tier::Good, NO_ACTION),
    Band::new(45.00, 49.99, Tier::Moderate, HUMIDITY_LOW),
    Band::new(66.00, 70.99, Tier::Moderate, HUMIDITY_HIGH),
    Band::new(NEG_INF, 44.99, Tier::Hazardous, HUMIDITY_VERY_LOW),
    Band::new(71.00, INF, Tier::Hazardous, HUMIDITY_VERY_HIGH),
];
