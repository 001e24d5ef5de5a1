//! PostgreSQL persistence for analysis outcomes.
//!
//! Three tables are written here: `analysis_payloads` (the raw-event audit
//! trail), `alerts`, and `telemetry`. Reads are limited to device lookups,
//! which live in [`crate::device_repository`].

use crate::config::DatabaseConfig;
use crate::storage_event::StorageEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// How long a raised alert stays active before it expires.
pub const ALERT_TTL_MINUTES: i64 = 15;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{0} failed: {1}")]
    Query(&'static str, #[source] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    WeaponDetection,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::WeaponDetection => "WEAPON_DETECTION",
        }
    }
}

/// An alert ready to be persisted. The store assigns the row id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub device_id: Uuid,
    pub alert_type: AlertType,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl NewAlert {
    /// Weapon alert for a device, expiring [`ALERT_TTL_MINUTES`] after the
    /// decision was made.
    pub fn weapon_detection(
        device_id: Uuid,
        weapon_count: u32,
        object_key: &str,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            alert_type: AlertType::WeaponDetection,
            description: format!("{} weapons detected in {}", weapon_count, object_key),
            created_at: decided_at,
            expired_at: decided_at + chrono::Duration::minutes(ALERT_TTL_MINUTES),
        }
    }
}

/// A passenger-count reading ready to be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewTelemetry {
    pub device_id: Uuid,
    pub passenger_count: i32,
}

/// Write side of the analysis store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Record the inbound event verbatim for auditing. Returns the row id.
    async fn insert_raw_payload(&self, event: &StorageEvent) -> Result<Uuid, StoreError>;

    async fn insert_alert(&self, alert: &NewAlert) -> Result<Uuid, StoreError>;

    async fn insert_telemetry(&self, telemetry: &NewTelemetry) -> Result<Uuid, StoreError>;
}

pub struct PostgresAnalysisStore {
    pool: PgPool,
}

impl PostgresAnalysisStore {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(config.idle_timeout())
            .connect(&config.url)
            .await
            .map_err(StoreError::Connect)?;

        info!("Connected to PostgreSQL");

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Shared pool handle, for components that run their own queries.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AnalysisStore for PostgresAnalysisStore {
    #[instrument(skip(self, event), fields(object_key = %event.object_key))]
    async fn insert_raw_payload(&self, event: &StorageEvent) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();

        sqlx::query("INSERT INTO analysis_payloads (id, payload, inserted_at) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(Json(event))
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query("insert raw payload", e))?;

        debug!(payload_id = %id, "Raw payload recorded");

        Ok(id)
    }

    #[instrument(skip(self, alert), fields(device_id = %alert.device_id))]
    async fn insert_alert(&self, alert: &NewAlert) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO alerts (id, device_id, alert_type, description, created_at, expired_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(alert.device_id)
        .bind(alert.alert_type.as_str())
        .bind(&alert.description)
        .bind(alert.created_at)
        .bind(alert.expired_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query("insert alert", e))?;

        metrics::counter!("analysis.alerts.created").increment(1);

        info!(
            alert_id = %id,
            alert_type = alert.alert_type.as_str(),
            expired_at = %alert.expired_at,
            "Alert created"
        );

        Ok(id)
    }

    #[instrument(skip(self, telemetry), fields(device_id = %telemetry.device_id))]
    async fn insert_telemetry(&self, telemetry: &NewTelemetry) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO telemetry (id, device_id, passenger_count, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(telemetry.device_id)
        .bind(telemetry.passenger_count)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query("insert telemetry", e))?;

        metrics::counter!("analysis.telemetry.recorded").increment(1);

        debug!(telemetry_id = %id, passenger_count = telemetry.passenger_count, "Telemetry recorded");

        Ok(id)
    }
}
