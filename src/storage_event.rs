//! Inbound storage notification handling.
//!
//! The object store publishes S3-style bucket notifications to Kafka when a
//! camera frame lands. Only a small part of the record matters here: the
//! bucket name, the object key and the event timestamp. Object keys are
//! structured `<device_code>/<rest-of-path>`, and the device code prefix ties
//! the frame back to the onboard device that produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while interpreting an inbound notification
#[derive(Debug, Error)]
pub enum EventError {
    #[error("notification payload is not valid JSON: {0}")]
    InvalidPayload(String),

    #[error("notification carries no object record")]
    MissingObjectInfo,

    #[error("object key '{0}' has no device code prefix")]
    MissingDeviceCode(String),
}

/// Bucket notification payload as published by the object store
#[derive(Debug, Clone, Deserialize)]
pub struct StorageNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<NotificationRecord>,
}

/// One record inside a bucket notification
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationRecord {
    #[serde(rename = "eventTime")]
    pub event_time: DateTime<Utc>,
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Entity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectEntity {
    pub key: String,
}

impl StorageNotification {
    /// Parse a raw notification payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(payload).map_err(|e| EventError::InvalidPayload(e.to_string()))
    }
}

/// A stored-object event, one per invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEvent {
    /// Bucket the object was written to
    pub bucket_name: String,
    /// Full object key, `<device_code>/<path>`
    pub object_key: String,
    /// When the object store recorded the write
    pub event_time: DateTime<Utc>,
}

impl StorageEvent {
    /// Extract the event from a notification, taking the first record
    pub fn from_notification(notification: &StorageNotification) -> Result<Self, EventError> {
        let record = notification
            .records
            .first()
            .ok_or(EventError::MissingObjectInfo)?;

        Ok(Self {
            bucket_name: record.s3.bucket.name.clone(),
            object_key: record.s3.object.key.clone(),
            event_time: record.event_time,
        })
    }

    /// The device code is the object key prefix up to the first `/`.
    ///
    /// A key without that prefix is a malformed object reference, not an
    /// unknown device.
    pub fn device_code(&self) -> Result<&str, EventError> {
        match self.object_key.split_once('/') {
            Some((code, _)) if !code.is_empty() => Ok(code),
            _ => Err(EventError::MissingDeviceCode(self.object_key.clone())),
        }
    }
}
