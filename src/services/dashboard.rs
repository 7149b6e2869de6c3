use crate::db::models::{DailyAverage, LatestClassification, LatestReading};
use crate::db::store::{Store, StoreError};
use core::fmt;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum LookupError {
    NotFound(String),
    Store(StoreError),
}

impl Display for LookupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::NotFound(what) => write!(f, "not found: {}", what),
            LookupError::Store(e) => write!(f, "lookup failed: {}", e),
        }
    }
}

impl Error for LookupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LookupError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for LookupError {
    fn from(value: StoreError) -> Self {
        LookupError::Store(value)
    }
}

pub fn get_latest_reading<S: Store>(store: &S, api_key: &str) -> Result<LatestReading, LookupError> {
    store
        .latest_reading(api_key)?
        .ok_or_else(|| LookupError::NotFound(format!("latest reading for {}", api_key)))
}

pub fn get_latest_classification<S: Store>(store: &S, api_key: &str) -> Result<LatestClassification, LookupError> {
    store
        .latest_classification(api_key)?
        .ok_or_else(|| LookupError::NotFound(format!("classification for {}", api_key)))
}

/// One row per day with data, oldest first.
pub fn get_daily_aggregates<S: Store>(store: &S, api_key: &str) -> Result<Vec<DailyAverage>, LookupError> {
    let rows = store.daily_averages(api_key)?;
    if rows.is_empty() {
        return Err(LookupError::NotFound(format!("daily averages for {}", api_key)));
    }
    Ok(rows)
}

/// Latest classification of every device that has reported.
pub fn list_scores<S: Store>(store: &S) -> Result<Vec<LatestClassification>, LookupError> {
    Ok(store.latest_classifications()?)
}
