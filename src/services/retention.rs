use crate::db::store::{Store, StoreError};
use chrono::{DateTime, Days, NaiveDate, Utc};
use log::info;

/// Midnight UTC `days` days before `today`.
pub fn cutoff_from_days(today: NaiveDate, days: u32) -> DateTime<Utc> {
    today
        .checked_sub_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MIN)
        .and_time(chrono::NaiveTime::MIN)
        .and_utc()
}

/// Delete raw readings older than `cutoff`. Snapshots and daily averages
/// already derived from them are left as they are.
pub fn prune_readings<S: Store>(store: &S, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
    let removed = store.delete_readings_before(cutoff)?;
    info!("Pruned {} reading(s) older than {}", removed, cutoff);
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::models::reading::ReadingInput;
    use crate::services::ingest::ingest;
    use chrono::TimeZone;

    fn reading(day: u32, pm2_5: f64) -> ReadingInput {
        ReadingInput {
            api_key: "dev-a".to_string(),
            pm2_5: Some(pm2_5),
            pm10: Some(1.0),
            co2: Some(400.0),
            tvoc: Some(10.0),
            humidity: Some(55.0),
            temperature: Some(25.0),
            timestamp: Utc.with_ymd_and_hms(2024, 3, day, 6, 0, 0).unwrap(),
        }
    }

    #[test]
    fn cutoff_is_midnight() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(
            cutoff_from_days(today, 7),
            Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn pruning_keeps_derived_rows() {
        let store = MemoryStore::with_devices(&["dev-a"]);
        for (day, v) in [(1, 10.0), (2, 20.0), (3, 30.0)] {
            ingest(&store, &reading(day, v)).unwrap();
        }

        let cutoff = Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap();
        assert_eq!(prune_readings(&store, cutoff).unwrap(), 2);

        let counts = store.counts_for("dev-a");
        assert_eq!(counts.readings, 1);
        assert_eq!(counts.daily_averages, 3);
        assert_eq!(store.daily_averages("dev-a").unwrap()[0].avg_pm2_5, 10.0);
        assert_eq!(prune_readings(&store, cutoff).unwrap(), 0);
    }
}
