//! Persistence seam for the ingest pipeline and the dashboard reads.
//!
//! Everything that mutates one device's data runs inside
//! [`Store::in_device_unit`]: units for the same API key are serialized and
//! each unit either commits all of its writes or none of them.

use crate::db::models::{
    DailyAverage, Device, DeviceChanges, LatestClassification, LatestReading, NewDevice, NewReading, Reading,
};
use crate::models::reading::MetricValues;
use chrono::{DateTime, NaiveDate, Utc};
use core::fmt;
use log::error;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Any database failure not covered by a more specific variant.
    Database(String),
    /// No pooled connection became available in time.
    Pool(String),
    /// Statement or lock wait exceeded the unit's time bound.
    Timeout(String),
    /// Serialization failure or deadlock; the unit was rolled back.
    Conflict(String),
    /// A projection holds a row count other than the one it must hold.
    Inconsistent { table: &'static str, key: String },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Pool(_) | StoreError::Timeout(_) | StoreError::Conflict(_))
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {}", e),
            StoreError::Pool(e) => write!(f, "connection pool error: {}", e),
            StoreError::Timeout(e) => write!(f, "timed out: {}", e),
            StoreError::Conflict(e) => write!(f, "conflicting transaction: {}", e),
            StoreError::Inconsistent { table, key } => {
                write!(f, "inconsistent {} rows for {}", table, key)
            }
        }
    }
}

impl Error for StoreError {}

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};

        match &value {
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => {
                StoreError::Conflict(value.to_string())
            }
            DieselError::DatabaseError(_, info) => {
                let message = info.message();
                if message.contains("statement timeout") || message.contains("lock timeout") {
                    StoreError::Timeout(message.to_string())
                } else if message.contains("deadlock detected") {
                    StoreError::Conflict(message.to_string())
                } else {
                    StoreError::Database(value.to_string())
                }
            }
            _ => StoreError::Database(value.to_string()),
        }
    }
}

/// Rows removed by a device delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CascadeCounts {
    pub readings: usize,
    pub latest_readings: usize,
    pub latest_classifications: usize,
    pub daily_averages: usize,
    pub devices: usize,
}

/// Operations available inside one device's unit of work.
pub trait DeviceUnit {
    fn find_device(&mut self, api_key: &str) -> Result<Option<Device>, StoreError>;
    fn insert_reading(&mut self, row: &NewReading) -> Result<Reading, StoreError>;
    fn upsert_latest_reading(&mut self, row: &LatestReading) -> Result<(), StoreError>;
    fn upsert_latest_classification(&mut self, row: &LatestClassification) -> Result<(), StoreError>;
    /// Per-metric mean over the device's readings in `day` (UTC), NULLs
    /// ignored. `None` for a metric with no non-null value.
    fn day_means(&mut self, api_key: &str, day: NaiveDate) -> Result<MetricValues, StoreError>;
    fn upsert_daily_average(&mut self, row: &DailyAverage) -> Result<(), StoreError>;
    fn update_device(&mut self, api_key: &str, changes: &DeviceChanges) -> Result<Option<Device>, StoreError>;
    fn delete_device_cascade(&mut self, api_key: &str) -> Result<CascadeCounts, StoreError>;
}

pub trait Store: Send + Sync {
    /// Run `work` as one unit for `api_key`. Commits when `work` returns `Ok`,
    /// rolls back otherwise.
    fn in_device_unit<T, E, F>(&self, api_key: &str, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn DeviceUnit) -> Result<T, E>,
        E: From<StoreError>;

    fn latest_reading(&self, api_key: &str) -> Result<Option<LatestReading>, StoreError>;
    fn latest_classification(&self, api_key: &str) -> Result<Option<LatestClassification>, StoreError>;
    fn latest_classifications(&self) -> Result<Vec<LatestClassification>, StoreError>;
    /// Ordered by day ascending.
    fn daily_averages(&self, api_key: &str) -> Result<Vec<DailyAverage>, StoreError>;

    fn device(&self, api_key: &str) -> Result<Option<Device>, StoreError>;
    fn insert_device(&self, row: &NewDevice) -> Result<Device, StoreError>;
    /// One page ordered by id, plus the total device count.
    fn devices_page(&self, offset: i64, limit: i64) -> Result<(Vec<Device>, i64), StoreError>;
    /// Delete raw readings strictly older than `cutoff`. Derived rows stay.
    fn delete_readings_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// A snapshot table holds at most one row per key.
pub fn at_most_one<T>(mut rows: Vec<T>, table: &'static str, key: &str) -> Result<Option<T>, StoreError> {
    match rows.len() {
        0 | 1 => Ok(rows.pop()),
        n => {
            error!("{} holds {} rows for {}; expected at most one", table, n, key);
            Err(StoreError::Inconsistent {
                table,
                key: key.to_string(),
            })
        }
    }
}

/// An upsert must touch exactly one row.
pub fn expect_single_row(affected: usize, table: &'static str, key: &str) -> Result<(), StoreError> {
    if affected == 1 {
        Ok(())
    } else {
        error!("upsert into {} for {} affected {} rows", table, key, affected);
        Err(StoreError::Inconsistent {
            table,
            key: key.to_string(),
        })
    }
}

/// Daily rows for one device carry distinct days.
pub fn ensure_distinct_days(rows: &[DailyAverage], key: &str) -> Result<(), StoreError> {
    for pair in rows.windows(2) {
        if pair[0].day == pair[1].day {
            error!("daily_averages holds duplicate day {} for {}", pair[0].day, key);
            return Err(StoreError::Inconsistent {
                table: "daily_averages",
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_variants() {
        assert!(StoreError::Pool("x".into()).is_retryable());
        assert!(StoreError::Timeout("x".into()).is_retryable());
        assert!(StoreError::Conflict("x".into()).is_retryable());
        assert!(!StoreError::Database("x".into()).is_retryable());
        assert!(
            !StoreError::Inconsistent {
                table: "readings",
                key: "k".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn snapshot_row_counts() {
        assert_eq!(at_most_one(Vec::<u8>::new(), "t", "k"), Ok(None));
        assert_eq!(at_most_one(vec![1u8], "t", "k"), Ok(Some(1)));
        assert_eq!(
            at_most_one(vec![1u8, 2], "latest_readings", "k"),
            Err(StoreError::Inconsistent {
                table: "latest_readings",
                key: "k".into()
            })
        );
        assert!(expect_single_row(1, "t", "k").is_ok());
        assert!(expect_single_row(0, "t", "k").is_err());
        assert!(expect_single_row(2, "t", "k").is_err());
    }

    #[test]
    fn not_found_maps_to_database() {
        let err: StoreError = diesel::result::Error::NotFound.into();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
