//! Label detection backed by AWS Rekognition.
//!
//! The pipeline only ever talks to the `LabelDetector` trait so tests can
//! substitute a mock; `RekognitionLabelDetector` is the production
//! implementation.

use crate::config::DetectionConfig;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_rekognition::error::DisplayErrorContext;
use aws_sdk_rekognition::types::{
    DetectLabelsSettings, GeneralLabelsSettings, Image, Label, S3Object,
};
use aws_sdk_rekognition::Client as RekognitionClient;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Labels requested from the detection service. Everything else is filtered
/// out server-side, so downstream aggregation never sees unrelated labels.
pub const DETECTION_LABELS: [&str; 4] = ["Person", "Knife", "Gun", "Weapon"];

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("label detection call failed: {0}")]
    Call(String),
}

/// One detected occurrence of a label within the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelInstance {
    /// Per-instance confidence, when the service reports one.
    pub confidence: Option<f32>,
    /// Bounding box as `[left, top, width, height]`, normalized to 0..1.
    pub bounding_box: Option<[f32; 4]>,
}

/// A label the detection service found, with its individual instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedLabel {
    pub name: String,
    pub confidence: f32,
    pub instances: Vec<LabelInstance>,
}

/// Raw result of a single detection call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub labels: Vec<DetectedLabel>,
}

/// Runs label detection against a stored object.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LabelDetector: Send + Sync {
    /// Detect labels on the object at `bucket`/`object_key`.
    async fn detect_labels(
        &self,
        bucket: &str,
        object_key: &str,
    ) -> Result<DetectionResult, DetectorError>;
}

/// Production detector calling the Rekognition DetectLabels API.
pub struct RekognitionLabelDetector {
    client: RekognitionClient,
    min_confidence: f32,
}

impl RekognitionLabelDetector {
    pub async fn new(config: &DetectionConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_rekognition::config::Builder::from(&aws_config);

        // Custom endpoint for local development (e.g. LocalStack)
        if let Some(endpoint_url) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        let client = RekognitionClient::from_conf(builder.build());

        info!(
            region = %config.region,
            min_confidence = config.min_confidence,
            "Label detector initialized"
        );

        Self {
            client,
            min_confidence: f32::from(config.min_confidence),
        }
    }
}

#[async_trait]
impl LabelDetector for RekognitionLabelDetector {
    #[instrument(skip(self))]
    async fn detect_labels(
        &self,
        bucket: &str,
        object_key: &str,
    ) -> Result<DetectionResult, DetectorError> {
        let image = Image::builder()
            .s3_object(S3Object::builder().bucket(bucket).name(object_key).build())
            .build();

        let mut general_labels = GeneralLabelsSettings::builder();
        for label in DETECTION_LABELS {
            general_labels = general_labels.label_inclusion_filters(label);
        }

        let settings = DetectLabelsSettings::builder()
            .general_labels(general_labels.build())
            .build();

        let output = self
            .client
            .detect_labels()
            .image(image)
            .min_confidence(self.min_confidence)
            .settings(settings)
            .send()
            .await
            .map_err(|e| DetectorError::Call(format!("{}", DisplayErrorContext(e))))?;

        let labels: Vec<DetectedLabel> = output.labels().iter().map(convert_label).collect();

        debug!(label_count = labels.len(), "Detection call completed");

        Ok(DetectionResult { labels })
    }
}

fn convert_label(label: &Label) -> DetectedLabel {
    let instances = label
        .instances()
        .iter()
        .map(|instance| LabelInstance {
            confidence: instance.confidence(),
            bounding_box: instance.bounding_box().map(|b| {
                [
                    b.left().unwrap_or_default(),
                    b.top().unwrap_or_default(),
                    b.width().unwrap_or_default(),
                    b.height().unwrap_or_default(),
                ]
            }),
        })
        .collect();

    DetectedLabel {
        name: label.name().unwrap_or_default().to_string(),
        confidence: label.confidence().unwrap_or_default(),
        instances,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_rekognition::types::{BoundingBox, Instance};

    #[test]
    fn test_convert_label_maps_instances() {
        let label = Label::builder()
            .name("Weapon")
            .confidence(97.5)
            .instances(
                Instance::builder()
                    .confidence(96.0)
                    .bounding_box(
                        BoundingBox::builder()
                            .left(0.1)
                            .top(0.2)
                            .width(0.3)
                            .height(0.4)
                            .build(),
                    )
                    .build(),
            )
            .instances(Instance::builder().confidence(91.2).build())
            .build();

        let converted = convert_label(&label);

        assert_eq!(converted.name, "Weapon");
        assert_eq!(converted.confidence, 97.5);
        assert_eq!(converted.instances.len(), 2);
        assert_eq!(
            converted.instances[0].bounding_box,
            Some([0.1, 0.2, 0.3, 0.4])
        );
        assert_eq!(converted.instances[1].confidence, Some(91.2));
        assert_eq!(converted.instances[1].bounding_box, None);
    }

    #[test]
    fn test_convert_label_tolerates_missing_fields() {
        let label = Label::builder().build();

        let converted = convert_label(&label);

        assert_eq!(converted.name, "");
        assert_eq!(converted.confidence, 0.0);
        assert!(converted.instances.is_empty());
    }

    #[test]
    fn test_detection_labels_cover_weapons_and_people() {
        assert!(DETECTION_LABELS.contains(&"Person"));
        assert!(DETECTION_LABELS.contains(&"Knife"));
        assert!(DETECTION_LABELS.contains(&"Gun"));
        assert!(DETECTION_LABELS.contains(&"Weapon"));
    }
}
