use crate::db::store::Store;
use crate::models::reading::ReadingInput;
use crate::services::ingest::ingest;
use crate::services::registry::{register_device, Caller, DeviceRegistration};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use log::{debug, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::f64::consts::PI;
use std::num::NonZeroU32;

const DEVICE_NAME: &str = "Demo sensor";
const DEVICE_LOCATION: &str = "Open-plan office";
const STEP_MINUTES: i64 = 15;
const SEED: u64 = 0x0A1B_2C3D_5EED_F00D;

#[derive(Debug, Clone, Serialize)]
pub struct FakeDataSummary {
    pub api_key: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub readings: usize,
}

/// Register a demo device and feed it `days` of synthetic readings ending at
/// `now`, one every 15 minutes, through the regular ingest path.
pub fn run<S: Store>(store: &S, caller: &Caller, days: NonZeroU32, now: DateTime<Utc>) -> Result<FakeDataSummary, String> {
    let start = align_to_step(now - Duration::days(i64::from(days.get())));
    let end = align_to_step(now);
    if start >= end {
        return Err("Fake data generator requires start earlier than end".to_string());
    }

    let registration = DeviceRegistration {
        name: DEVICE_NAME.to_string(),
        location: DEVICE_LOCATION.to_string(),
        sampling_interval_secs: Some((STEP_MINUTES * 60) as i32),
    };
    let device = register_device(store, caller, &registration).map_err(|e| format!("register demo device failed: {}", e))?;
    info!(
        "Fake data: generating readings for device {} from {} to {}",
        device.api_key, start, end
    );

    let mut rng = SmallRng::seed_from_u64(SEED);
    let mut ts = start;
    let mut inserted = 0usize;
    let mut last_logged_month: Option<(i32, u32)> = None;

    while ts < end {
        if ts.hour() == 0 && ts.minute() == 0 {
            let month_key = (ts.year(), ts.month());
            if last_logged_month != Some(month_key) {
                info!("Fake data: processing {:04}-{:02}", month_key.0, month_key.1);
                last_logged_month = Some(month_key);
            }
        }

        let input = synthesize(&device.api_key, ts, &mut rng);
        ingest(store, &input).map_err(|e| format!("fake data ingest at {} failed: {}", ts, e))?;
        inserted += 1;
        ts += Duration::minutes(STEP_MINUTES);
    }

    debug!("Fake data: {} reading(s) ingested", inserted);
    info!("Fake data: complete (days={}, readings={})", days, inserted);
    Ok(FakeDataSummary {
        api_key: device.api_key,
        from: start,
        to: end,
        readings: inserted,
    })
}

fn synthesize(api_key: &str, ts: DateTime<Utc>, rng: &mut SmallRng) -> ReadingInput {
    let day_fraction = ts.time().num_seconds_from_midnight() as f64 / 86_400.0;
    let annual_fraction = ts.ordinal0() as f64 / 365.0;
    let weekday = ts.weekday();
    let occupancy = occupancy_profile(day_fraction, weekday);

    let temperature = compute_temperature(day_fraction, annual_fraction, occupancy, rng);
    let humidity = compute_humidity(annual_fraction, occupancy, rng);
    let co2 = compute_co2(occupancy, rng);
    let pm2_5 = compute_pm2_5(day_fraction, annual_fraction, rng);
    let pm10 = compute_pm10(pm2_5, occupancy, rng);
    let tvoc = compute_tvoc(occupancy, co2, rng);

    ReadingInput {
        api_key: api_key.to_string(),
        pm2_5: Some(round1(pm2_5)),
        pm10: Some(round1(pm10)),
        co2: Some(co2.round()),
        tvoc: Some(tvoc.round()),
        humidity: Some(round1(humidity)),
        temperature: Some(round1(temperature)),
        timestamp: ts,
    }
}

fn align_to_step(ts: DateTime<Utc>) -> DateTime<Utc> {
    let step_seconds = STEP_MINUTES * 60;
    let aligned = (ts.timestamp() / step_seconds) * step_seconds;
    DateTime::<Utc>::from_timestamp(aligned, 0).unwrap_or(ts)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn compute_temperature(day_fraction: f64, annual_fraction: f64, occupancy: f64, rng: &mut SmallRng) -> f64 {
    let seasonal = (annual_fraction * 2.0 * PI).sin() * 1.5;
    let diurnal = ((day_fraction - 0.35) * 2.0 * PI).sin() * 1.2;
    let body_heat = occupancy * 0.6;
    let ac_fault = if rng.random_bool(0.01) {
        rng.random_range(3.0..=6.0)
    } else {
        0.0
    };
    let random = rng.random_range(-0.5..=0.5);
    (25.0 + seasonal + diurnal + body_heat + ac_fault + random).clamp(17.0, 35.0)
}

fn compute_humidity(annual_fraction: f64, occupancy: f64, rng: &mut SmallRng) -> f64 {
    let seasonal = ((annual_fraction + 0.1) * 2.0 * PI).cos() * 8.0;
    let breathing = occupancy * 2.5;
    let random = rng.random_range(-4.0..=4.0);
    (57.0 + seasonal + breathing + random).clamp(30.0, 85.0)
}

fn compute_co2(occupancy: f64, rng: &mut SmallRng) -> f64 {
    let baseline = 430.0;
    let people = occupancy * 420.0;
    let meeting = if rng.random_bool(0.03) {
        rng.random_range(300.0..=700.0)
    } else {
        0.0
    };
    let random = rng.random_range(-25.0..=25.0);
    (baseline + people + meeting + random).clamp(380.0, 2500.0)
}

fn compute_pm2_5(day_fraction: f64, annual_fraction: f64, rng: &mut SmallRng) -> f64 {
    // dry season haze peaks around the start of the year
    let seasonal = ((annual_fraction * 2.0 * PI).cos() + 1.0) * 9.0;
    let traffic = gaussian(day_fraction, 0.33, 0.05) * 8.0 + gaussian(day_fraction, 0.75, 0.06) * 6.0;
    let random = rng.random_range(-3.0..=3.0);
    let burning = if rng.random_bool(0.015) {
        rng.random_range(15.0..=40.0)
    } else {
        0.0
    };
    (6.0 + seasonal + traffic + random + burning).clamp(0.0, 150.0)
}

fn compute_pm10(pm2_5: f64, occupancy: f64, rng: &mut SmallRng) -> f64 {
    let coarse = occupancy * 6.0 + rng.random_range(0.0..=8.0);
    (pm2_5 * rng.random_range(1.3..=1.7) + coarse).clamp(0.0, 250.0)
}

fn compute_tvoc(occupancy: f64, co2: f64, rng: &mut SmallRng) -> f64 {
    let cleaning = if rng.random_bool(0.02) {
        rng.random_range(400.0..=900.0)
    } else {
        0.0
    };
    let people = occupancy * 120.0 + (co2 - 400.0).max(0.0) * 0.15;
    let random = rng.random_range(-20.0..=20.0);
    (90.0 + people + cleaning + random).clamp(0.0, 3000.0)
}

/// Relative number of people in the room, 0 when empty.
fn occupancy_profile(day_fraction: f64, weekday: Weekday) -> f64 {
    if is_weekend(weekday) {
        return 0.15 * gaussian(day_fraction, 0.5, 0.1);
    }
    let morning = gaussian(day_fraction, 0.42, 0.07) * 1.6;
    let afternoon = gaussian(day_fraction, 0.6, 0.08) * 1.8;
    let lunch_dip = -0.5 * gaussian(day_fraction, 0.52, 0.025);
    (morning + afternoon + lunch_dip).max(0.0)
}

fn gaussian(x: f64, center: f64, width: f64) -> f64 {
    let exponent = -((x - center) * (x - center)) / (2.0 * width * width);
    exponent.exp()
}

fn is_weekend(weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap()
    }

    #[test]
    fn generates_a_reading_every_quarter_hour() {
        let store = MemoryStore::new();
        let days = NonZeroU32::new(2).unwrap();
        let summary = run(&store, &Caller::operator(1), days, now()).unwrap();

        assert_eq!(summary.readings, 2 * 96);
        assert_eq!(summary.from, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(store.readings_for(&summary.api_key).len(), summary.readings);

        let daily = store.daily_averages(&summary.api_key).unwrap();
        assert_eq!(daily.len(), 2);
        for row in &daily {
            assert!(row.avg_co2 >= 380.0 && row.avg_co2 <= 2500.0);
            assert!(row.avg_temperature >= 17.0 && row.avg_temperature <= 35.0);
        }
        let latest = store.latest_reading(&summary.api_key).unwrap().unwrap();
        assert_eq!(latest.timestamp, now() - Duration::minutes(STEP_MINUTES));
    }

    #[test]
    fn synthetic_series_is_deterministic() {
        let mut a = SmallRng::seed_from_u64(SEED);
        let mut b = SmallRng::seed_from_u64(SEED);
        let ts = Utc.with_ymd_and_hms(2024, 1, 8, 10, 15, 0).unwrap();
        for step in 0..50 {
            let at = ts + Duration::minutes(STEP_MINUTES * step);
            assert_eq!(synthesize("k", at, &mut a), synthesize("k", at, &mut b));
        }
    }

    #[test]
    fn offices_are_empty_at_night_and_on_weekends() {
        assert!(occupancy_profile(0.1, Weekday::Tue) < 0.01);
        assert!(occupancy_profile(0.6, Weekday::Tue) > 1.0);
        assert!(occupancy_profile(0.6, Weekday::Sun) < 0.2);
    }
}
