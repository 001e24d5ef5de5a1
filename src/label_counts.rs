//! Aggregation of raw detection labels into domain counts.

use crate::label_detector::{DetectedLabel, DetectionResult};
use serde::{Deserialize, Serialize};

/// Label names that count toward the weapon total.
pub const WEAPON_LABELS: [&str; 3] = ["Weapon", "Knife", "Gun"];

/// Label names that count toward the passenger total.
pub const PERSON_LABELS: [&str; 1] = ["Person"];

/// Sum of instance counts across all labels whose name is in `names`.
/// A label with no instances contributes zero.
pub fn count_instances(labels: &[DetectedLabel], names: &[&str]) -> u32 {
    labels
        .iter()
        .filter(|label| names.contains(&label.name.as_str()))
        .map(|label| label.instances.len() as u32)
        .sum()
}

/// Domain-level counts derived from one detection result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCounts {
    pub weapon_count: u32,
    pub person_count: u32,
}

impl DomainCounts {
    pub fn from_result(result: &DetectionResult) -> Self {
        Self {
            weapon_count: count_instances(&result.labels, &WEAPON_LABELS),
            person_count: count_instances(&result.labels, &PERSON_LABELS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label_detector::LabelInstance;

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

    #[test]
    fn test_empty_result_counts_zero() {
        let result = DetectionResult::default();
        assert_eq!(DomainCounts::from_result(&result), DomainCounts::default());
    }

    #[test]
    fn test_weapon_count_sums_across_weapon_labels() {
        let result = DetectionResult {
            labels: vec![label("Weapon", 2), label("Gun", 1), label("Knife", 1)],
        };

        let counts = DomainCounts::from_result(&result);

        assert_eq!(counts.weapon_count, 4);
        assert_eq!(counts.person_count, 0);
    }

    #[test]
    fn test_person_count_ignores_weapon_labels() {
        let result = DetectionResult {
            labels: vec![label("Person", 3), label("Weapon", 1)],
        };

        let counts = DomainCounts::from_result(&result);

        assert_eq!(counts.person_count, 3);
        assert_eq!(counts.weapon_count, 1);
    }

    #[test]
    fn test_label_without_instances_contributes_zero() {
        let result = DetectionResult {
            labels: vec![label("Weapon", 0), label("Person", 0)],
        };

        assert_eq!(DomainCounts::from_result(&result), DomainCounts::default());
    }

    #[test]
    fn test_unrelated_labels_are_ignored() {
        let result = DetectionResult {
            labels: vec![label("Backpack", 2), label("Person", 1)],
        };

        let counts = DomainCounts::from_result(&result);

        assert_eq!(counts.weapon_count, 0);
        assert_eq!(counts.person_count, 1);
    }
}
