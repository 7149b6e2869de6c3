//! PostgreSQL store backed by a diesel r2d2 pool.
//!
//! A device unit is one transaction that first bounds its own statement and
//! lock waits, then takes `pg_advisory_xact_lock` on a 64-bit hash of the API
//! key. Units for the same device queue on that lock; the lock is released on
//! commit or rollback.

use crate::db::models::{
    DailyAverage, Device, DeviceChanges, LatestClassification, LatestReading, NewDevice, NewReading, Reading,
};
use crate::db::store::{
    at_most_one, ensure_distinct_days, expect_single_row, CascadeCounts, DeviceUnit, Store, StoreError,
};
use crate::models::reading::MetricValues;
use crate::schema;
use crate::utils::day_bounds;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::dsl::avg;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_types::Text;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::num::NonZeroU32;
use std::time::Duration;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type PgPool = Pool<ConnectionManager<PgConnection>>;

pub struct PgStore {
    pool: PgPool,
    unit_timeout: Duration,
}

impl PgStore {
    /// Build the pool. Checkouts wait at most `unit_timeout`.
    pub fn connect(database_url: &str, pool_size: NonZeroU32, unit_timeout: Duration) -> Result<Self, String> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(pool_size.get())
            .connection_timeout(unit_timeout)
            .build(manager)
            .map_err(|e| format!("DB connection failed: {}", e))?;
        Ok(PgStore { pool, unit_timeout })
    }

    /// Apply pending embedded migrations, returning the applied versions.
    pub fn apply_migrations(&self) -> Result<Vec<String>, String> {
        let mut pooled = self.checkout().map_err(|e| e.to_string())?;
        let conn: &mut PgConnection = &mut pooled;
        conn.run_pending_migrations(MIGRATIONS)
            .map(|applied| applied.iter().map(|v| v.to_string()).collect())
            .map_err(|e| format!("Applying database migrations failed: {}", e))
    }

    fn checkout(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, StoreError> {
        self.pool.get().map_err(|e| StoreError::Pool(e.to_string()))
    }
}

enum UnitFailure<E> {
    Db(StoreError),
    Work(E),
}

impl<E> From<diesel::result::Error> for UnitFailure<E> {
    fn from(value: diesel::result::Error) -> Self {
        UnitFailure::Db(value.into())
    }
}

struct PgUnit<'c> {
    conn: &'c mut PgConnection,
}

impl DeviceUnit for PgUnit<'_> {
    fn find_device(&mut self, api_key: &str) -> Result<Option<Device>, StoreError> {
        use schema::devices::dsl as D;

        let rows = D::devices
            .filter(D::api_key.eq(api_key))
            .select(Device::as_select())
            .load(self.conn)?;
        at_most_one(rows, "devices", api_key)
    }

    fn insert_reading(&mut self, row: &NewReading) -> Result<Reading, StoreError> {
        use schema::readings::dsl as R;

        diesel::insert_into(R::readings)
            .values(row)
            .returning(Reading::as_returning())
            .get_result(self.conn)
            .map_err(StoreError::from)
    }

    fn upsert_latest_reading(&mut self, row: &LatestReading) -> Result<(), StoreError> {
        use schema::latest_readings::dsl as LR;

        let affected = diesel::insert_into(LR::latest_readings)
            .values(row)
            .on_conflict(LR::api_key)
            .do_update()
            .set(row)
            .execute(self.conn)?;
        expect_single_row(affected, "latest_readings", &row.api_key)
    }

    fn upsert_latest_classification(&mut self, row: &LatestClassification) -> Result<(), StoreError> {
        use schema::latest_classifications::dsl as LC;

        let affected = diesel::insert_into(LC::latest_classifications)
            .values(row)
            .on_conflict(LC::api_key)
            .do_update()
            .set(row)
            .execute(self.conn)?;
        expect_single_row(affected, "latest_classifications", &row.api_key)
    }

    fn day_means(&mut self, api_key: &str, day: NaiveDate) -> Result<MetricValues, StoreError> {
        use schema::readings::dsl as R;

        let (start, end) = day_bounds(day);
        let (pm2_5, pm10, co2, tvoc, humidity, temperature) = R::readings
            .filter(R::api_key.eq(api_key))
            .filter(R::timestamp.ge(start))
            .filter(R::timestamp.lt(end))
            .select((
                avg(R::pm2_5),
                avg(R::pm10),
                avg(R::co2),
                avg(R::tvoc),
                avg(R::humidity),
                avg(R::temperature),
            ))
            .get_result::<(Option<f64>, Option<f64>, Option<f64>, Option<f64>, Option<f64>, Option<f64>)>(self.conn)?;
        Ok(MetricValues {
            pm2_5,
            pm10,
            co2,
            tvoc,
            humidity,
            temperature,
        })
    }

    fn upsert_daily_average(&mut self, row: &DailyAverage) -> Result<(), StoreError> {
        use schema::daily_averages::dsl as DA;

        let affected = diesel::insert_into(DA::daily_averages)
            .values(row)
            .on_conflict((DA::api_key, DA::day))
            .do_update()
            .set(row)
            .execute(self.conn)?;
        expect_single_row(affected, "daily_averages", &row.api_key)
    }

    fn update_device(&mut self, api_key: &str, changes: &DeviceChanges) -> Result<Option<Device>, StoreError> {
        use schema::devices::dsl as D;

        diesel::update(D::devices.filter(D::api_key.eq(api_key)))
            .set((changes, D::updated_at.eq(Utc::now())))
            .returning(Device::as_returning())
            .get_result(self.conn)
            .optional()
            .map_err(StoreError::from)
    }

    fn delete_device_cascade(&mut self, api_key: &str) -> Result<CascadeCounts, StoreError> {
        use schema::daily_averages::dsl as DA;
        use schema::devices::dsl as D;
        use schema::latest_classifications::dsl as LC;
        use schema::latest_readings::dsl as LR;
        use schema::readings::dsl as R;

        let daily_averages = diesel::delete(DA::daily_averages.filter(DA::api_key.eq(api_key))).execute(self.conn)?;
        let latest_classifications =
            diesel::delete(LC::latest_classifications.filter(LC::api_key.eq(api_key))).execute(self.conn)?;
        let latest_readings = diesel::delete(LR::latest_readings.filter(LR::api_key.eq(api_key))).execute(self.conn)?;
        let readings = diesel::delete(R::readings.filter(R::api_key.eq(api_key))).execute(self.conn)?;
        let devices = diesel::delete(D::devices.filter(D::api_key.eq(api_key))).execute(self.conn)?;

        Ok(CascadeCounts {
            readings,
            latest_readings,
            latest_classifications,
            daily_averages,
            devices,
        })
    }
}

impl Store for PgStore {
    fn in_device_unit<T, E, F>(&self, api_key: &str, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn DeviceUnit) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut pooled = self.checkout()?;
        let conn: &mut PgConnection = &mut pooled;
        let timeout_ms = self.unit_timeout.as_millis();

        let outcome = conn.transaction::<T, UnitFailure<E>, _>(|conn| {
            diesel::sql_query(format!("SET LOCAL statement_timeout = {}", timeout_ms)).execute(conn)?;
            diesel::sql_query(format!("SET LOCAL lock_timeout = {}", timeout_ms)).execute(conn)?;
            diesel::sql_query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind::<Text, _>(api_key)
                .execute(conn)?;

            let mut unit = PgUnit { conn };
            work(&mut unit).map_err(UnitFailure::Work)
        });

        match outcome {
            Ok(value) => Ok(value),
            Err(UnitFailure::Db(e)) => Err(e.into()),
            Err(UnitFailure::Work(e)) => Err(e),
        }
    }

    fn latest_reading(&self, api_key: &str) -> Result<Option<LatestReading>, StoreError> {
        use schema::latest_readings::dsl as LR;

        let mut conn = self.checkout()?;
        let rows = LR::latest_readings
            .filter(LR::api_key.eq(api_key))
            .select(LatestReading::as_select())
            .load(&mut conn)?;
        at_most_one(rows, "latest_readings", api_key)
    }

    fn latest_classification(&self, api_key: &str) -> Result<Option<LatestClassification>, StoreError> {
        use schema::latest_classifications::dsl as LC;

        let mut conn = self.checkout()?;
        let rows = LC::latest_classifications
            .filter(LC::api_key.eq(api_key))
            .select(LatestClassification::as_select())
            .load(&mut conn)?;
        at_most_one(rows, "latest_classifications", api_key)
    }

    fn latest_classifications(&self) -> Result<Vec<LatestClassification>, StoreError> {
        use schema::latest_classifications::dsl as LC;

        let mut conn = self.checkout()?;
        LC::latest_classifications
            .order(LC::api_key.asc())
            .select(LatestClassification::as_select())
            .load(&mut conn)
            .map_err(StoreError::from)
    }

    fn daily_averages(&self, api_key: &str) -> Result<Vec<DailyAverage>, StoreError> {
        use schema::daily_averages::dsl as DA;

        let mut conn = self.checkout()?;
        let rows = DA::daily_averages
            .filter(DA::api_key.eq(api_key))
            .order(DA::day.asc())
            .select(DailyAverage::as_select())
            .load(&mut conn)?;
        ensure_distinct_days(&rows, api_key)?;
        Ok(rows)
    }

    fn device(&self, api_key: &str) -> Result<Option<Device>, StoreError> {
        use schema::devices::dsl as D;

        let mut conn = self.checkout()?;
        let rows = D::devices
            .filter(D::api_key.eq(api_key))
            .select(Device::as_select())
            .load(&mut conn)?;
        at_most_one(rows, "devices", api_key)
    }

    fn insert_device(&self, row: &NewDevice) -> Result<Device, StoreError> {
        use schema::devices::dsl as D;

        let mut conn = self.checkout()?;
        diesel::insert_into(D::devices)
            .values(row)
            .returning(Device::as_returning())
            .get_result(&mut conn)
            .map_err(StoreError::from)
    }

    fn devices_page(&self, offset: i64, limit: i64) -> Result<(Vec<Device>, i64), StoreError> {
        use schema::devices::dsl as D;

        let mut conn = self.checkout()?;
        let total: i64 = D::devices.count().get_result(&mut conn)?;
        let rows = D::devices
            .order(D::id.asc())
            .offset(offset)
            .limit(limit)
            .select(Device::as_select())
            .load(&mut conn)?;
        Ok((rows, total))
    }

    fn delete_readings_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        use schema::readings::dsl as R;

        let mut conn = self.checkout()?;
        diesel::delete(R::readings.filter(R::timestamp.lt(cutoff)))
            .execute(&mut conn)
            .map_err(StoreError::from)
    }
}
