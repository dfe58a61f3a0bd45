use crate::errors::{Error, Result};
use crate::metrics::STORAGE_FAILURES_TOTAL;
use crate::model::{Device, DeviceStatus, HistoryQuery, Mode, SensorSample};
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_ATTEMPTS: u32 = 5;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Device row as stored; columns are snake_case, enums are text
#[derive(Debug, sqlx::FromRow)]
struct DeviceRow {
    id: String,
    name: String,
    zone: String,
    zone_label: String,
    ip: Option<String>,
    status: String,
    temperature: Option<f64>,
    humidity: Option<f64>,
    soil_moisture: Option<i32>,
    pump_active: bool,
    mode: String,
    last_update: DateTime<Utc>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        let status: DeviceStatus = row.status.parse().unwrap_or_else(|e: String| {
            warn!(device_id = %row.id, "{}, treating as offline", e);
            Default::default()
        });
        let mode: Mode = row.mode.parse().unwrap_or_else(|e: String| {
            warn!(device_id = %row.id, "{}, treating as auto", e);
            Default::default()
        });

        Device {
            id: row.id,
            name: row.name,
            zone: row.zone,
            zone_label: row.zone_label,
            ip: row.ip,
            status,
            temperature: row.temperature,
            humidity: row.humidity,
            soil_moisture: row.soil_moisture,
            pump_active: row.pump_active,
            mode,
            last_update: row.last_update,
        }
    }
}

const SELECT_DEVICE: &str = r#"
    SELECT id, name, zone, zone_label, ip, status, temperature, humidity,
           soil_moisture, pump_active, mode, last_update
    FROM devices
"#;

const UPSERT_DEVICE: &str = r#"
    INSERT INTO devices (id, name, zone, zone_label, ip, status, temperature, humidity,
                         soil_moisture, pump_active, mode, last_update)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ON CONFLICT (id) DO UPDATE SET
        name = EXCLUDED.name,
        zone = EXCLUDED.zone,
        zone_label = EXCLUDED.zone_label,
        ip = EXCLUDED.ip,
        status = EXCLUDED.status,
        temperature = EXCLUDED.temperature,
        humidity = EXCLUDED.humidity,
        soil_moisture = EXCLUDED.soil_moisture,
        pump_active = EXCLUDED.pump_active,
        mode = EXCLUDED.mode,
        last_update = EXCLUDED.last_update
"#;

/// Postgres-backed storage
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(make_pool(database_url).await?))
    }

    async fn upsert_device(&self, device: &Device) -> Result<()> {
        let pool = &self.pool;
        with_retry("upsert device", || async move {
            sqlx::query(UPSERT_DEVICE)
                .bind(&device.id)
                .bind(&device.name)
                .bind(&device.zone)
                .bind(&device.zone_label)
                .bind(&device.ip)
                .bind(device.status.as_str())
                .bind(device.temperature)
                .bind(device.humidity)
                .bind(device.soil_moisture)
                .bind(device.pump_active)
                .bind(device.mode.as_str())
                .bind(device.last_update)
                .execute(pool)
                .await
                .map(|_| ())
        })
        .await
    }
}

#[async_trait]
impl Storage for PgStorage {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn insert_device(&self, device: &Device) -> Result<()> {
        self.upsert_device(device).await
    }

    async fn select_all_devices(&self) -> Result<Vec<Device>> {
        let query = format!("{} ORDER BY seq", SELECT_DEVICE);
        let rows = sqlx::query_as::<_, DeviceRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    async fn select_device_by_id(&self, id: &str) -> Result<Option<Device>> {
        let query = format!("{} WHERE id = $1", SELECT_DEVICE);
        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Device::from))
    }

    async fn update_device_fields(&self, device: &Device) -> Result<()> {
        self.upsert_device(device).await
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        let pool = &self.pool;
        with_retry("delete device", || async move {
            sqlx::query("DELETE FROM devices WHERE id = $1")
                .bind(id)
                .execute(pool)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn insert_sensor_samples(&self, samples: &[SensorSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let device_ids: Vec<&str> = samples.iter().map(|s| s.device_id.as_str()).collect();
        let timestamps: Vec<DateTime<Utc>> = samples.iter().map(|s| s.timestamp).collect();
        let temperatures: Vec<f64> = samples.iter().map(|s| s.temperature).collect();
        let humidities: Vec<f64> = samples.iter().map(|s| s.humidity).collect();
        let soil: Vec<i32> = samples.iter().map(|s| s.soil_moisture).collect();

        let query = r#"
            INSERT INTO sensor_data (device_id, ts, temperature, humidity, soil_moisture)
            SELECT * FROM UNNEST($1::text[], $2::timestamptz[], $3::float8[], $4::float8[], $5::int4[])
            ON CONFLICT (device_id, ts) DO NOTHING
        "#;

        let pool = &self.pool;
        let (device_ids, timestamps, temperatures, humidities, soil) =
            (&device_ids, &timestamps, &temperatures, &humidities, &soil);
        with_retry("insert sensor samples", || async move {
            sqlx::query(query)
                .bind(device_ids)
                .bind(timestamps)
                .bind(temperatures)
                .bind(humidities)
                .bind(soil)
                .execute(pool)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn query_sensor_history(
        &self,
        device_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<SensorSample>> {
        let mut samples = sqlx::query_as::<_, SensorSample>(
            r#"
            SELECT device_id, ts AS timestamp, temperature, humidity, soil_moisture
            FROM sensor_data
            WHERE device_id = $1
              AND ($2::timestamptz IS NULL OR ts >= $2)
              AND ($3::timestamptz IS NULL OR ts <= $3)
            ORDER BY ts DESC
            LIMIT $4
            "#,
        )
        .bind(device_id)
        .bind(query.start)
        .bind(query.end)
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        samples.reverse();
        Ok(samples)
    }
}

/// Runs a write, retrying transient connection failures with backoff
async fn with_retry<F, Fut>(operation: &str, mut attempt_fn: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), sqlx::Error>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match attempt_fn().await {
            Ok(()) => return Ok(()),
            Err(db_err) => {
                if attempts >= MAX_ATTEMPTS || !is_transient_error(&db_err) {
                    error!(
                        "Database {} failed permanently after {} attempts: {}",
                        operation, attempts, db_err
                    );
                    return Err(Error::Database(db_err));
                }

                let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                warn!(
                    "Database {} failed (attempt {}/{}), retrying in {}ms: {}",
                    operation, attempts, MAX_ATTEMPTS, wait_ms, db_err
                );
                STORAGE_FAILURES_TOTAL.inc();
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
        }
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
