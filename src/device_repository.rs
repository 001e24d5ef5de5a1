//! Device registry lookups.

use crate::analysis_store::StoreError;
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::{debug, instrument};
use uuid::Uuid;

/// A registered onboard device.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Device {
    pub id: Uuid,
    /// Code prefixing every object key the device uploads.
    pub code: String,
}

/// Resolves devices from the registry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Look up a device by exact code. Absence is a normal outcome, not an
    /// error.
    async fn find_by_code(&self, code: &str) -> Result<Option<Device>, StoreError>;
}

pub struct PostgresDeviceRepository {
    pool: PgPool,
}

impl PostgresDeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceRepository for PostgresDeviceRepository {
    #[instrument(skip(self))]
    async fn find_by_code(&self, code: &str) -> Result<Option<Device>, StoreError> {
        let device =
            sqlx::query_as::<_, Device>("SELECT id, code FROM devices WHERE code = $1 LIMIT 1")
                .bind(code)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Query("device lookup", e))?;

        debug!(code = %code, found = device.is_some(), "Device lookup");

        Ok(device)
    }
}
