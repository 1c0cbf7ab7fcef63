use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Classifier, ClassifierError, MockClassifier, Prediction};
use crate::images::ImagePayload;

/// Wraps a real classifier and substitutes the canned prediction when it fails.
pub struct FallbackClassifier {
    primary: Arc<dyn Classifier>,
}

impl FallbackClassifier {
    pub fn new(primary: Arc<dyn Classifier>) -> Self {
        Self { primary }
    }
}

#[async_trait]
impl Classifier for FallbackClassifier {
    async fn classify(&self, image: &ImagePayload) -> Result<Prediction, ClassifierError> {
        match self.primary.classify(image).await {
            Ok(p) => {
                info!(
                    source = p.source.as_str(),
                    label = %p.label,
                    confidence = p.confidence,
                    "prediction"
                );
                Ok(p)
            }
            Err(e) => {
                let p = MockClassifier::prediction();
                warn!(
                    source = p.source.as_str(),
                    classifier = %self.primary.describe(),
                    error = %e,
                    "classifier failed; substituting mock prediction"
                );
                Ok(p)
            }
        }
    }

    fn describe(&self) -> String {
        format!("fallback({})", self.primary.describe())
    }
}
