//! Diesel model structs for devices, raw readings and the projections derived
//! from them.
//!
//! `latest_readings` and `latest_classifications` hold exactly one row per
//! device, `daily_averages` one row per device and UTC day.

use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::reading::{MetricValues, ReadingInput};
use crate::quality::classify::ReadingVerdicts;
use crate::schema;
use crate::utils::round2;

pub mod device_status {
    pub const ONLINE: &str = "online";
    pub const OFFLINE: &str = "offline";

    pub fn is_valid(status: &str) -> bool {
        status == ONLINE || status == OFFLINE
    }
}

pub const DEFAULT_SAMPLING_INTERVAL_SECS: i32 = 60;

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
pub struct Device {
    pub id: i64,
    pub api_key: String,
    pub name: String,
    pub location: String,
    pub status: String,
    pub sampling_interval_secs: i32,
    pub owner_user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
pub struct NewDevice {
    pub api_key: String,
    pub name: String,
    pub location: String,
    pub status: String,
    pub sampling_interval_secs: i32,
    pub owner_user_id: Option<i64>,
}

/// Partial device update; `None` leaves the column unchanged.
#[derive(Debug, Clone, Default, PartialEq, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
pub struct DeviceChanges {
    pub name: Option<String>,
    pub location: Option<String>,
    pub status: Option<String>,
    pub sampling_interval_secs: Option<i32>,
}

impl DeviceChanges {
    pub fn is_empty(&self) -> bool {
        self == &DeviceChanges::default()
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::readings)]
pub struct Reading {
    pub id: i64,
    pub api_key: String,
    pub pm2_5: Option<f64>,
    pub pm10: Option<f64>,
    pub co2: Option<f64>,
    pub tvoc: Option<f64>,
    pub humidity: Option<f64>,
    pub temperature: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
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

    /// UTC calendar day the reading belongs to.
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::readings)]
pub struct NewReading {
    pub api_key: String,
    pub pm2_5: Option<f64>,
    pub pm10: Option<f64>,
    pub co2: Option<f64>,
    pub tvoc: Option<f64>,
    pub humidity: Option<f64>,
    pub temperature: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl From<&ReadingInput> for NewReading {
    fn from(input: &ReadingInput) -> Self {
        NewReading {
            api_key: input.api_key.clone(),
            pm2_5: input.pm2_5,
            pm10: input.pm10,
            co2: input.co2,
            tvoc: input.tvoc,
            humidity: input.humidity,
            temperature: input.temperature,
            timestamp: input.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = schema::latest_readings)]
#[diesel(primary_key(api_key))]
#[diesel(treat_none_as_null = true)]
pub struct LatestReading {
    pub api_key: String,
    pub pm2_5: Option<f64>,
    pub pm10: Option<f64>,
    pub co2: Option<f64>,
    pub tvoc: Option<f64>,
    pub humidity: Option<f64>,
    pub temperature: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl LatestReading {
    pub fn from_reading(reading: &Reading) -> Self {
        LatestReading {
            api_key: reading.api_key.clone(),
            pm2_5: reading.pm2_5,
            pm10: reading.pm10,
            co2: reading.co2,
            tvoc: reading.tvoc,
            humidity: reading.humidity,
            temperature: reading.temperature,
            timestamp: reading.timestamp,
        }
    }
}

/// Tier labels are stored as text (`good`, `moderate`, `hazardous`, `unknown`).
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = schema::latest_classifications)]
#[diesel(primary_key(api_key))]
#[diesel(treat_none_as_null = true)]
pub struct LatestClassification {
    pub api_key: String,
    pub timestamp: DateTime<Utc>,
    pub pm2_5_tier: String,
    pub pm2_5_advice: Option<String>,
    pub pm10_tier: String,
    pub pm10_advice: Option<String>,
    pub co2_tier: String,
    pub co2_advice: Option<String>,
    pub tvoc_tier: String,
    pub tvoc_advice: Option<String>,
    pub humidity_tier: String,
    pub humidity_advice: Option<String>,
    pub temperature_tier: String,
    pub temperature_advice: Option<String>,
}

impl LatestClassification {
    pub fn from_verdicts(reading: &Reading, v: &ReadingVerdicts) -> Self {
        let advice = |a: Option<&'static str>| a.map(str::to_string);
        LatestClassification {
            api_key: reading.api_key.clone(),
            timestamp: reading.timestamp,
            pm2_5_tier: v.pm2_5.tier.label().to_string(),
            pm2_5_advice: advice(v.pm2_5.advice),
            pm10_tier: v.pm10.tier.label().to_string(),
            pm10_advice: advice(v.pm10.advice),
            co2_tier: v.co2.tier.label().to_string(),
            co2_advice: advice(v.co2.advice),
            tvoc_tier: v.tvoc.tier.label().to_string(),
            tvoc_advice: advice(v.tvoc.advice),
            humidity_tier: v.humidity.tier.label().to_string(),
            humidity_advice: advice(v.humidity.advice),
            temperature_tier: v.temperature.tier.label().to_string(),
            temperature_advice: advice(v.temperature.advice),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = schema::daily_averages)]
#[diesel(primary_key(api_key, day))]
pub struct DailyAverage {
    pub api_key: String,
    pub day: NaiveDate,
    pub avg_pm2_5: f64,
    pub avg_pm10: f64,
    pub avg_co2: f64,
    pub avg_tvoc: f64,
    pub avg_humidity: f64,
    pub avg_temperature: f64,
}

impl DailyAverage {
    /// Build the row from raw per-day means. A metric without any non-null
    /// reading that day is recorded as 0.
    pub fn from_means(api_key: &str, day: NaiveDate, means: &MetricValues) -> Self {
        let avg = |v: Option<f64>| round2(v.unwrap_or(0.0));
        DailyAverage {
            api_key: api_key.to_string(),
            day,
            avg_pm2_5: avg(means.pm2_5),
            avg_pm10: avg(means.pm10),
            avg_co2: avg(means.co2),
            avg_tvoc: avg(means.tvoc),
            avg_humidity: avg(means.humidity),
            avg_temperature: avg(means.temperature),
        }
    }
}
