//! In-process store used by the test suite.
//!
//! Units for one API key serialize on that key's mutex. A unit's writes are
//! staged and merged into the committed tables only when its work succeeds.

use crate::db::models::{
    device_status, DailyAverage, Device, DeviceChanges, LatestClassification, LatestReading, NewDevice, NewReading,
    Reading, DEFAULT_SAMPLING_INTERVAL_SECS,
};
use crate::db::store::{CascadeCounts, DeviceUnit, Store, StoreError};
use crate::models::reading::MetricValues;
use crate::quality::thresholds::Metric;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Tables {
    devices: Vec<Device>,
    readings: Vec<Reading>,
    latest_readings: BTreeMap<String, LatestReading>,
    latest_classifications: BTreeMap<String, LatestClassification>,
    daily_averages: BTreeMap<(String, NaiveDate), DailyAverage>,
}

impl Tables {
    fn remove_device_data(&mut self, api_key: &str) {
        self.devices.retain(|d| d.api_key != api_key);
        self.readings.retain(|r| r.api_key != api_key);
        self.latest_readings.remove(api_key);
        self.latest_classifications.remove(api_key);
        self.daily_averages.retain(|(key, _), _| key != api_key);
    }
}

#[derive(Default)]
struct Staged {
    deleted: BTreeSet<String>,
    devices: BTreeMap<String, Device>,
    readings: Vec<Reading>,
    latest_readings: BTreeMap<String, LatestReading>,
    latest_classifications: BTreeMap<String, LatestClassification>,
    daily_averages: BTreeMap<(String, NaiveDate), DailyAverage>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_id: AtomicI64,
    fail_daily_upsert: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with one offline device per key, owned by user 1.
    pub fn with_devices(keys: &[&str]) -> Self {
        let store = Self::new();
        for key in keys {
            let row = NewDevice {
                api_key: key.to_string(),
                name: format!("sensor {}", key),
                location: "lab".to_string(),
                status: device_status::OFFLINE.to_string(),
                sampling_interval_secs: DEFAULT_SAMPLING_INTERVAL_SECS,
                owner_user_id: Some(1),
            };
            if let Err(e) = store.insert_device(&row) {
                panic!("seeding device {} failed: {}", key, e);
            }
        }
        store
    }

    /// Make every following daily-average upsert fail.
    pub fn fail_daily_upserts(&self, fail: bool) {
        self.fail_daily_upsert.store(fail, Ordering::SeqCst);
    }

    pub fn readings_for(&self, api_key: &str) -> Vec<Reading> {
        self.tables()
            .readings
            .iter()
            .filter(|r| r.api_key == api_key)
            .cloned()
            .collect()
    }

    fn committed_device(&self, api_key: &str) -> Option<Device> {
        self.tables().devices.iter().find(|d| d.api_key == api_key).cloned()
    }

    /// Committed row counts held for `api_key` in every table.
    pub fn counts_for(&self, api_key: &str) -> CascadeCounts {
        let tables = self.tables();
        CascadeCounts {
            readings: tables.readings.iter().filter(|r| r.api_key == api_key).count(),
            latest_readings: usize::from(tables.latest_readings.contains_key(api_key)),
            latest_classifications: usize::from(tables.latest_classifications.contains_key(api_key)),
            daily_averages: tables.daily_averages.keys().filter(|(key, _)| key == api_key).count(),
            devices: tables.devices.iter().filter(|d| d.api_key == api_key).count(),
        }
    }

    fn days_for(&self, api_key: &str) -> BTreeSet<NaiveDate> {
        self.tables()
            .daily_averages
            .keys()
            .filter(|(key, _)| key == api_key)
            .map(|(_, day)| *day)
            .collect()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn device_lock(&self, api_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.device_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(api_key.to_string()).or_default().clone()
    }

    fn commit(&self, staged: Staged) {
        let mut tables = self.tables();
        for key in &staged.deleted {
            tables.remove_device_data(key);
        }
        for (key, device) in staged.devices {
            tables.devices.retain(|d| d.api_key != key);
            tables.devices.push(device);
        }
        tables.devices.sort_by_key(|d| d.id);
        tables.readings.extend(staged.readings);
        tables.latest_readings.extend(staged.latest_readings);
        tables.latest_classifications.extend(staged.latest_classifications);
        tables.daily_averages.extend(staged.daily_averages);
    }
}

struct MemoryUnit<'s> {
    store: &'s MemoryStore,
    staged: Staged,
}

impl MemoryUnit<'_> {
    fn visible_readings(&self, api_key: &str) -> Vec<Reading> {
        let mut rows = if self.staged.deleted.contains(api_key) {
            Vec::new()
        } else {
            self.store.readings_for(api_key)
        };
        rows.extend(self.staged.readings.iter().filter(|r| r.api_key == api_key).cloned());
        rows
    }
}

impl DeviceUnit for MemoryUnit<'_> {
    fn find_device(&mut self, api_key: &str) -> Result<Option<Device>, StoreError> {
        if let Some(device) = self.staged.devices.get(api_key) {
            return Ok(Some(device.clone()));
        }
        if self.staged.deleted.contains(api_key) {
            return Ok(None);
        }
        Ok(self.store.committed_device(api_key))
    }

    fn insert_reading(&mut self, row: &NewReading) -> Result<Reading, StoreError> {
        let reading = Reading {
            id: self.store.next_id(),
            api_key: row.api_key.clone(),
            pm2_5: row.pm2_5,
            pm10: row.pm10,
            co2: row.co2,
            tvoc: row.tvoc,
            humidity: row.humidity,
            temperature: row.temperature,
            timestamp: row.timestamp,
        };
        self.staged.readings.push(reading.clone());
        Ok(reading)
    }

    fn upsert_latest_reading(&mut self, row: &LatestReading) -> Result<(), StoreError> {
        self.staged.latest_readings.insert(row.api_key.clone(), row.clone());
        Ok(())
    }

    fn upsert_latest_classification(&mut self, row: &LatestClassification) -> Result<(), StoreError> {
        self.staged
            .latest_classifications
            .insert(row.api_key.clone(), row.clone());
        Ok(())
    }

    fn day_means(&mut self, api_key: &str, day: NaiveDate) -> Result<MetricValues, StoreError> {
        let rows: Vec<MetricValues> = self
            .visible_readings(api_key)
            .iter()
            .filter(|r| r.day() == day)
            .map(Reading::metrics)
            .collect();

        Ok(MetricValues::from_fn(|metric: Metric| {
            let values: Vec<f64> = rows.iter().filter_map(|m| m.get(metric)).collect();
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        }))
    }

    fn upsert_daily_average(&mut self, row: &DailyAverage) -> Result<(), StoreError> {
        if self.store.fail_daily_upsert.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected daily_averages failure".to_string()));
        }
        self.staged
            .daily_averages
            .insert((row.api_key.clone(), row.day), row.clone());
        Ok(())
    }

    fn update_device(&mut self, api_key: &str, changes: &DeviceChanges) -> Result<Option<Device>, StoreError> {
        let Some(mut device) = self.find_device(api_key)? else {
            return Ok(None);
        };
        if let Some(name) = &changes.name {
            device.name = name.clone();
        }
        if let Some(location) = &changes.location {
            device.location = location.clone();
        }
        if let Some(status) = &changes.status {
            device.status = status.clone();
        }
        if let Some(interval) = changes.sampling_interval_secs {
            device.sampling_interval_secs = interval;
        }
        device.updated_at = Utc::now();
        self.staged.devices.insert(api_key.to_string(), device.clone());
        Ok(Some(device))
    }

    fn delete_device_cascade(&mut self, api_key: &str) -> Result<CascadeCounts, StoreError> {
        let deleted = self.staged.deleted.contains(api_key);
        let (committed, mut days) = if deleted {
            (CascadeCounts::default(), BTreeSet::new())
        } else {
            (self.store.counts_for(api_key), self.store.days_for(api_key))
        };
        days.extend(
            self.staged
                .daily_averages
                .keys()
                .filter(|(key, _)| key == api_key)
                .map(|(_, day)| *day),
        );

        let counts = CascadeCounts {
            readings: self.visible_readings(api_key).len(),
            latest_readings: usize::from(
                committed.latest_readings > 0 || self.staged.latest_readings.contains_key(api_key),
            ),
            latest_classifications: usize::from(
                committed.latest_classifications > 0 || self.staged.latest_classifications.contains_key(api_key),
            ),
            daily_averages: days.len(),
            devices: usize::from(self.find_device(api_key)?.is_some()),
        };

        self.staged.deleted.insert(api_key.to_string());
        self.staged.devices.remove(api_key);
        self.staged.readings.retain(|r| r.api_key != api_key);
        self.staged.latest_readings.remove(api_key);
        self.staged.latest_classifications.remove(api_key);
        self.staged.daily_averages.retain(|(key, _), _| key != api_key);
        Ok(counts)
    }
}

impl Store for MemoryStore {
    fn in_device_unit<T, E, F>(&self, api_key: &str, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn DeviceUnit) -> Result<T, E>,
        E: From<StoreError>,
    {
        let lock = self.device_lock(api_key);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut unit = MemoryUnit {
            store: self,
            staged: Staged::default(),
        };
        let value = work(&mut unit)?;
        self.commit(unit.staged);
        Ok(value)
    }

    fn latest_reading(&self, api_key: &str) -> Result<Option<LatestReading>, StoreError> {
        Ok(self.tables().latest_readings.get(api_key).cloned())
    }

    fn latest_classification(&self, api_key: &str) -> Result<Option<LatestClassification>, StoreError> {
        Ok(self.tables().latest_classifications.get(api_key).cloned())
    }

    fn latest_classifications(&self) -> Result<Vec<LatestClassification>, StoreError> {
        Ok(self.tables().latest_classifications.values().cloned().collect())
    }

    fn daily_averages(&self, api_key: &str) -> Result<Vec<DailyAverage>, StoreError> {
        Ok(self
            .tables()
            .daily_averages
            .iter()
            .filter(|((key, _), _)| key == api_key)
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn device(&self, api_key: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.committed_device(api_key))
    }

    fn insert_device(&self, row: &NewDevice) -> Result<Device, StoreError> {
        let mut tables = self.tables();
        if tables.devices.iter().any(|d| d.api_key == row.api_key) {
            return Err(StoreError::Database(format!(
                "duplicate key value violates unique constraint on devices.api_key ({})",
                row.api_key
            )));
        }
        let now = Utc::now();
        let device = Device {
            id: self.next_id(),
            api_key: row.api_key.clone(),
            name: row.name.clone(),
            location: row.location.clone(),
            status: row.status.clone(),
            sampling_interval_secs: row.sampling_interval_secs,
            owner_user_id: row.owner_user_id,
            created_at: now,
            updated_at: now,
        };
        tables.devices.push(device.clone());
        Ok(device)
    }

    fn devices_page(&self, offset: i64, limit: i64) -> Result<(Vec<Device>, i64), StoreError> {
        let tables = self.tables();
        let total = tables.devices.len() as i64;
        let rows = tables
            .devices
            .iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((rows, total))
    }

    fn delete_readings_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.tables();
        let before = tables.readings.len();
        tables.readings.retain(|r| r.timestamp >= cutoff);
        Ok(before - tables.readings.len())
    }
}
