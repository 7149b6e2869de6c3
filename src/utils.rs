use chrono::{DateTime, Days, NaiveDate, Utc};

/// Round to two decimals, to nearest on the exact binary value with ties to
/// even. `2.675` is stored as 2.67499.. and rounds down, `0.125` is an exact
/// tie and rounds to 0.12. Non-finite values pass through.
pub fn round2(value: f64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    format!("{:.2}", value).parse::<f64>().unwrap_or(value)
}

/// Half-open UTC bounds `[day 00:00, day+1 00:00)`.
pub fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day.and_time(chrono::NaiveTime::MIN).and_utc();
    let next = day.checked_add_days(Days::new(1)).unwrap_or(NaiveDate::MAX);
    (start, next.and_time(chrono::NaiveTime::MIN).and_utc())
}

/// Number of pages needed for `total` items.
pub fn page_count(total: i64, per_page: i64) -> i64 {
    if total <= 0 || per_page <= 0 {
        0
    } else {
        (total + per_page - 1) / per_page
    }
}
