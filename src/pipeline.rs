//! The detection-to-decision pipeline.
//!
//! One inbound storage event flows through fixed stages: parse, audit write,
//! label detection, aggregation, device resolution, then the alert/telemetry
//! decision. Writes are ordered so the audit trail exists before the
//! detection call is made; there is no rollback across stages, so a failure
//! leaves earlier writes in place and reports which stage gave up.

use crate::analysis_store::{AnalysisStore, NewAlert, NewTelemetry, StoreError};
use crate::device_repository::DeviceRepository;
use crate::label_counts::DomainCounts;
use crate::label_detector::{DetectorError, LabelDetector};
use crate::storage_event::{EventError, StorageEvent, StorageNotification};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The inbound payload had no usable object reference. Nothing was
    /// persisted; retrying the same payload cannot succeed.
    #[error("malformed storage event: {0}")]
    MalformedEvent(#[from] EventError),

    /// The detection call failed. The audit row is already durable.
    #[error("label detection failed: {0}")]
    Detection(#[from] DetectorError),

    /// A database operation failed. Writes from earlier stages stand.
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

/// How a successfully processed event concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDisposition {
    /// The device was resolved; telemetry was written, plus an alert when
    /// weapons were present.
    Recorded {
        device_id: Uuid,
        telemetry_id: Uuid,
        alert_id: Option<Uuid>,
    },
    /// No registered device matched the key prefix. Only the audit row was
    /// written.
    UnknownDevice { device_code: String },
}

/// Summary of one processed event.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub audit_id: Uuid,
    pub counts: DomainCounts,
    pub disposition: EventDisposition,
}

pub struct AnalysisPipeline {
    detector: Arc<dyn LabelDetector>,
    devices: Arc<dyn DeviceRepository>,
    store: Arc<dyn AnalysisStore>,
}

impl AnalysisPipeline {
    pub fn new(
        detector: Arc<dyn LabelDetector>,
        devices: Arc<dyn DeviceRepository>,
        store: Arc<dyn AnalysisStore>,
    ) -> Self {
        Self {
            detector,
            devices,
            store,
        }
    }

    /// Process one raw storage-event payload end to end.
    #[instrument(skip(self, payload))]
    pub async fn process(&self, payload: &[u8]) -> Result<AnalysisOutcome, PipelineError> {
        // Parse the payload and key prefix before any side effects, so a
        // malformed event leaves no partial writes behind.
        let notification = StorageNotification::from_slice(payload)?;
        let event = StorageEvent::from_notification(&notification)?;
        let device_code = event.device_code()?.to_string();

        debug!(
            bucket = %event.bucket_name,
            object_key = %event.object_key,
            "Processing storage event"
        );

        // The audit row must exist before the detection call is made.
        let audit_id = self.store.insert_raw_payload(&event).await?;

        let detection_started = Instant::now();
        let detection = self
            .detector
            .detect_labels(&event.bucket_name, &event.object_key)
            .await?;
        metrics::histogram!("analysis.detection.duration_seconds")
            .record(detection_started.elapsed().as_secs_f64());

        // Counts are derived from this invocation alone; nothing is carried
        // over from earlier events.
        let counts = DomainCounts::from_result(&detection);

        debug!(
            weapon_count = counts.weapon_count,
            person_count = counts.person_count,
            "Labels aggregated"
        );

        let device = match self.devices.find_by_code(&device_code).await? {
            Some(device) => device,
            None => {
                warn!(
                    device_code = %device_code,
                    object_key = %event.object_key,
                    "No registered device matches key prefix, skipping alert and telemetry"
                );
                metrics::counter!("analysis.events.unknown_device").increment(1);

                return Ok(AnalysisOutcome {
                    audit_id,
                    counts,
                    disposition: EventDisposition::UnknownDevice { device_code },
                });
            }
        };

        let decided_at = Utc::now();

        let alert = if counts.weapon_count > 0 {
            Some(NewAlert::weapon_detection(
                device.id,
                counts.weapon_count,
                &event.object_key,
                decided_at,
            ))
        } else {
            None
        };

        let telemetry = NewTelemetry {
            device_id: device.id,
            passenger_count: counts.person_count as i32,
        };

        let alert_id = match &alert {
            Some(alert) => Some(self.store.insert_alert(alert).await?),
            None => None,
        };
        let telemetry_id = self.store.insert_telemetry(&telemetry).await?;

        info!(
            audit_id = %audit_id,
            device_id = %device.id,
            weapon_count = counts.weapon_count,
            passenger_count = counts.person_count,
            alert_raised = alert_id.is_some(),
            "Storage event processed"
        );

        Ok(AnalysisOutcome {
            audit_id,
            counts,
            disposition: EventDisposition::Recorded {
                device_id: device.id,
                telemetry_id,
                alert_id,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis_store::{AlertType, MockAnalysisStore};
    use crate::device_repository::{Device, MockDeviceRepository};
    use crate::label_detector::{DetectedLabel, DetectionResult, LabelInstance, MockLabelDetector};

    fn payload(object_key: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "Records": [{
                "eventTime": "2026-03-01T10:15:00Z",
                "s3": {
                    "bucket": { "name": "fleet-frames" },
                    "object": { "key": object_key }
                }
            }]
        }))
        .unwrap()
    }

    fn label(name: &str, instance_count: usize) -> DetectedLabel {
        DetectedLabel {
            name: name.to_string(),
            confidence: 95.0,
            instances: vec![
                LabelInstance {
                    confidence: Some(95.0),
                    bounding_box: None,
                };
                instance_count
            ],
        }
    }

    fn detection(labels: Vec<DetectedLabel>) -> DetectionResult {
        DetectionResult { labels }
    }

    fn device(code: &str) -> Device {
        Device {
            id: Uuid::new_v4(),
            code: code.to_string(),
        }
    }

    fn pipeline(
        detector: MockLabelDetector,
        devices: MockDeviceRepository,
        store: MockAnalysisStore,
    ) -> AnalysisPipeline {
        AnalysisPipeline::new(Arc::new(detector), Arc::new(devices), Arc::new(store))
    }

    #[tokio::test]
    async fn test_weapon_event_creates_alert_and_telemetry() {
        let dev = device("dev42");
        let device_id = dev.id;
        let audit_id = Uuid::new_v4();
        let alert_id = Uuid::new_v4();
        let telemetry_id = Uuid::new_v4();

        let mut detector = MockLabelDetector::new();
        detector
            .expect_detect_labels()
            .withf(|bucket, key| bucket == "fleet-frames" && key == "dev42/cam1/frame001.jpg")
            .times(1)
            .returning(|_, _| Ok(detection(vec![label("Weapon", 2), label("Person", 1)])));

        let mut devices = MockDeviceRepository::new();
        devices
            .expect_find_by_code()
            .withf(|code| code == "dev42")
            .times(1)
            .returning(move |_| Ok(Some(dev.clone())));

        let mut store = MockAnalysisStore::new();
        store
            .expect_insert_raw_payload()
            .withf(|event| {
                event.bucket_name == "fleet-frames"
                    && event.object_key == "dev42/cam1/frame001.jpg"
            })
            .times(1)
            .returning(move |_| Ok(audit_id));
        store
            .expect_insert_alert()
            .withf(move |alert| {
                alert.device_id == device_id
                    && alert.alert_type == AlertType::WeaponDetection
                    && alert.description == "2 weapons detected in dev42/cam1/frame001.jpg"
                    && alert.expired_at - alert.created_at == chrono::Duration::minutes(15)
            })
            .times(1)
            .returning(move |_| Ok(alert_id));
        store
            .expect_insert_telemetry()
            .withf(move |telemetry| {
                telemetry.device_id == device_id && telemetry.passenger_count == 1
            })
            .times(1)
            .returning(move |_| Ok(telemetry_id));

        let outcome = pipeline(detector, devices, store)
            .process(&payload("dev42/cam1/frame001.jpg"))
            .await
            .unwrap();

        assert_eq!(outcome.audit_id, audit_id);
        assert_eq!(outcome.counts.weapon_count, 2);
        assert_eq!(outcome.counts.person_count, 1);
        assert_eq!(
            outcome.disposition,
            EventDisposition::Recorded {
                device_id,
                telemetry_id,
                alert_id: Some(alert_id),
            }
        );
    }

    #[tokio::test]
    async fn test_event_without_weapons_skips_alert() {
        let dev = device("dev42");
        let device_id = dev.id;

        let mut detector = MockLabelDetector::new();
        detector
            .expect_detect_labels()
            .times(1)
            .returning(|_, _| Ok(detection(vec![label("Person", 3)])));

        let mut devices = MockDeviceRepository::new();
        devices
            .expect_find_by_code()
            .times(1)
            .returning(move |_| Ok(Some(dev.clone())));

        let mut store = MockAnalysisStore::new();
        store
            .expect_insert_raw_payload()
            .times(1)
            .returning(|_| Ok(Uuid::new_v4()));
        store.expect_insert_alert().never();
        store
            .expect_insert_telemetry()
            .withf(move |telemetry| {
                telemetry.device_id == device_id && telemetry.passenger_count == 3
            })
            .times(1)
            .returning(|_| Ok(Uuid::new_v4()));

        let outcome = pipeline(detector, devices, store)
            .process(&payload("dev42/cam1/frame002.jpg"))
            .await
            .unwrap();

        assert_eq!(outcome.counts.weapon_count, 0);
        assert!(matches!(
            outcome.disposition,
            EventDisposition::Recorded { alert_id: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_device_records_audit_only() {
        let mut detector = MockLabelDetector::new();
        detector
            .expect_detect_labels()
            .times(1)
            .returning(|_, _| Ok(detection(vec![label("Weapon", 1)])));

        let mut devices = MockDeviceRepository::new();
        devices
            .expect_find_by_code()
            .withf(|code| code == "ghost9")
            .times(1)
            .returning(|_| Ok(None));

        let mut store = MockAnalysisStore::new();
        store
            .expect_insert_raw_payload()
            .times(1)
            .returning(|_| Ok(Uuid::new_v4()));
        store.expect_insert_alert().never();
        store.expect_insert_telemetry().never();

        let outcome = pipeline(detector, devices, store)
            .process(&payload("ghost9/cam1/frame001.jpg"))
            .await
            .unwrap();

        assert_eq!(outcome.counts.weapon_count, 1);
        assert_eq!(
            outcome.disposition,
            EventDisposition::UnknownDevice {
                device_code: "ghost9".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_json_fails_before_any_write() {
        let detector = MockLabelDetector::new();
        let devices = MockDeviceRepository::new();
        let mut store = MockAnalysisStore::new();
        store.expect_insert_raw_payload().never();

        let err = pipeline(detector, devices, store)
            .process(b"not json at all")
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::MalformedEvent(_)));
    }

    #[tokio::test]
    async fn test_key_without_device_prefix_fails_before_any_write() {
        let detector = MockLabelDetector::new();
        let devices = MockDeviceRepository::new();
        let mut store = MockAnalysisStore::new();
        store.expect_insert_raw_payload().never();

        let err = pipeline(detector, devices, store)
            .process(&payload("frame001.jpg"))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::MalformedEvent(_)));
    }

    #[tokio::test]
    async fn test_detection_failure_surfaces_after_audit_write() {
        let mut detector = MockLabelDetector::new();
        detector
            .expect_detect_labels()
            .times(1)
            .returning(|_, _| Err(DetectorError::Call("throttled".to_string())));

        let mut devices = MockDeviceRepository::new();
        devices.expect_find_by_code().never();

        let mut store = MockAnalysisStore::new();
        store
            .expect_insert_raw_payload()
            .times(1)
            .returning(|_| Ok(Uuid::new_v4()));
        store.expect_insert_alert().never();
        store.expect_insert_telemetry().never();

        let err = pipeline(detector, devices, store)
            .process(&payload("dev42/cam1/frame001.jpg"))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Detection(_)));
    }

    #[tokio::test]
    async fn test_alert_insert_failure_is_persistence_error() {
        let dev = device("dev42");

        let mut detector = MockLabelDetector::new();
        detector
            .expect_detect_labels()
            .times(1)
            .returning(|_, _| Ok(detection(vec![label("Gun", 1)])));

        let mut devices = MockDeviceRepository::new();
        devices
            .expect_find_by_code()
            .times(1)
            .returning(move |_| Ok(Some(dev.clone())));

        let mut store = MockAnalysisStore::new();
        store
            .expect_insert_raw_payload()
            .times(1)
            .returning(|_| Ok(Uuid::new_v4()));
        store
            .expect_insert_alert()
            .times(1)
            .returning(|_| Err(StoreError::Query("insert alert", sqlx::Error::PoolTimedOut)));
        store.expect_insert_telemetry().never();

        let err = pipeline(detector, devices, store)
            .process(&payload("dev42/cam1/frame001.jpg"))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_weapons_without_people_records_zero_passengers() {
        let dev = device("dev42");
        let device_id = dev.id;

        let mut detector = MockLabelDetector::new();
        detector
            .expect_detect_labels()
            .times(1)
            .returning(|_, _| Ok(detection(vec![label("Knife", 1)])));

        let mut devices = MockDeviceRepository::new();
        devices
            .expect_find_by_code()
            .times(1)
            .returning(move |_| Ok(Some(dev.clone())));

        let mut store = MockAnalysisStore::new();
        store
            .expect_insert_raw_payload()
            .times(1)
            .returning(|_| Ok(Uuid::new_v4()));
        store
            .expect_insert_alert()
            .withf(|alert| alert.description == "1 weapons detected in dev42/cam1/frame003.jpg")
            .times(1)
            .returning(|_| Ok(Uuid::new_v4()));
        store
            .expect_insert_telemetry()
            .withf(move |telemetry| {
                telemetry.device_id == device_id && telemetry.passenger_count == 0
            })
            .times(1)
            .returning(|_| Ok(Uuid::new_v4()));

        let outcome = pipeline(detector, devices, store)
            .process(&payload("dev42/cam1/frame003.jpg"))
            .await
            .unwrap();

        assert!(matches!(
            outcome.disposition,
            EventDisposition::Recorded {
                alert_id: Some(_),
                ..
            }
        ));
    }
}
