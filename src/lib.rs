//! Analysis service for the onboard-camera fleet.
//!
//! Consumes storage-bucket notifications from Kafka, records each event for
//! auditing, runs label detection on the referenced object, and turns the
//! detected labels into weapon alerts and passenger telemetry for the device
//! that produced the frame.

pub mod analysis_store;
pub mod config;
pub mod device_repository;
pub mod event_consumer;
pub mod label_counts;
pub mod label_detector;
pub mod pipeline;
pub mod storage_event;

pub use analysis_store::{AnalysisStore, PostgresAnalysisStore};
pub use config::Config;
pub use device_repository::{DeviceRepository, PostgresDeviceRepository};
pub use event_consumer::StorageEventConsumer;
pub use label_counts::DomainCounts;
pub use label_detector::{LabelDetector, RekognitionLabelDetector};
pub use pipeline::{AnalysisOutcome, AnalysisPipeline};
pub use storage_event::StorageEvent;
