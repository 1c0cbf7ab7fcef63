use async_trait::async_trait;

use super::{Classifier, ClassifierError, LabelScore, Prediction, PredictionSource};
use crate::images::ImagePayload;

const CANNED: &[(&str, f64)] = &[
    ("babesia", 0.452),
    ("leishmania", 0.231),
    ("trypanosome", 0.158),
    ("basophil", 0.083),
    ("eosinophil", 0.042),
    ("lymphocyte", 0.021),
    ("malaria_parasitized", 0.008),
    ("malaria_uninfected", 0.003),
    ("monocyte", 0.001),
    ("neutrophil", 0.001),
];

/// Always answers with the same fixed prediction set.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockClassifier;

impl MockClassifier {
    pub fn prediction() -> Prediction {
        let all_predictions: Vec<LabelScore> = CANNED
            .iter()
            .map(|(label, confidence)| LabelScore {
                label: (*label).to_string(),
                confidence: *confidence,
            })
            .collect();
        Prediction {
            label: all_predictions[0].label.clone(),
            confidence: all_predictions[0].confidence,
            all_predictions,
            source: PredictionSource::Fallback,
        }
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, _image: &ImagePayload) -> Result<Prediction, ClassifierError> {
        Ok(Self::prediction())
    }

    fn describe(&self) -> String {
        "mock".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_set_is_sorted_and_sums_to_one() {
        let p = MockClassifier::prediction();
        assert_eq!(p.label, "babesia");
        assert_eq!(p.source, PredictionSource::Fallback);
        assert_eq!(p.all_predictions.len(), 10);
        assert!(p
            .all_predictions
            .windows(2)
            .all(|w| w[0].confidence >= w[1].confidence));
        let total: f64 = p.all_predictions.iter().map(|s| s.confidence).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
