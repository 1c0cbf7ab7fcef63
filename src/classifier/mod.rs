//! Prediction bridge: turns an image into a disease label with confidences.
//!
//! Confidences are always in `0.0..=1.0` once they leave this module.

mod fallback;
mod mock;
mod subprocess;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fallback::FallbackClassifier;
pub use mock::MockClassifier;
pub use subprocess::{arg_payload_fits, SubprocessClassifier, MAX_ARG_PAYLOAD};

use crate::config::{ClassifierConfig, ClassifierMode};
use crate::images::ImagePayload;

/// Where a prediction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionSource {
    Model,
    Fallback,
}

impl PredictionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PredictionSource::Model => "model",
            PredictionSource::Fallback => "fallback",
        }
    }
}

impl std::str::FromStr for PredictionSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(Self::Model),
            "fallback" => Ok(Self::Fallback),
            other => anyhow::bail!("unknown prediction source {other:?}"),
        }
    }
}

/// One class and its score. Serialized with the `disease` key used on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    #[serde(rename = "disease")]
    pub label: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
    pub all_predictions: Vec<LabelScore>,
    pub source: PredictionSource,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("failed to start classifier process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("classifier process i/o failed: {0}")]
    Io(#[source] std::io::Error),

    #[error("image payload of {len} bytes exceeds the {limit} byte argument limit; set CLASSIFIER_INPUT=stdin")]
    ArgTooLong { len: usize, limit: usize },

    #[error("classifier process timed out after {0:?}")]
    Timeout(Duration),

    #[error("classifier process exited with code {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },

    #[error("malformed classifier output: {0}")]
    MalformedOutput(String),

    #[error("classifier reported an error: {0}")]
    Reported(String),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: &ImagePayload) -> Result<Prediction, ClassifierError>;

    /// Short name for health output and logs.
    fn describe(&self) -> String;
}

/// Build the classifier chosen by configuration.
pub fn from_config(cfg: &ClassifierConfig) -> Arc<dyn Classifier> {
    match (cfg.mode, cfg.fallback) {
        (ClassifierMode::Mock, _) => Arc::new(MockClassifier),
        (ClassifierMode::Subprocess, true) => Arc::new(FallbackClassifier::new(Arc::new(
            SubprocessClassifier::new(cfg),
        ))),
        (ClassifierMode::Subprocess, false) => Arc::new(SubprocessClassifier::new(cfg)),
    }
}

/// Bring raw scores onto the unit scale and order them best first.
///
/// Output where any score exceeds 1.0 is read as percentages. Anything still
/// outside `[0, 1]` after scaling is clamped.
pub fn normalize(
    label: String,
    confidence: f64,
    mut all: Vec<LabelScore>,
    source: PredictionSource,
) -> Result<Prediction, ClassifierError> {
    if label.trim().is_empty() {
        return Err(ClassifierError::MalformedOutput("empty label".into()));
    }
    if !confidence.is_finite() || all.iter().any(|p| !p.confidence.is_finite()) {
        return Err(ClassifierError::MalformedOutput(
            "non-finite confidence".into(),
        ));
    }

    let percent = confidence > 1.0 || all.iter().any(|p| p.confidence > 1.0);
    let scale = |c: f64| {
        let c = if percent { c / 100.0 } else { c };
        c.clamp(0.0, 1.0)
    };

    for p in &mut all {
        p.confidence = scale(p.confidence);
    }
    if all.is_empty() {
        all.push(LabelScore {
            label: label.clone(),
            confidence: scale(confidence),
        });
    }
    all.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    Ok(Prediction {
        label,
        confidence: scale(confidence),
        all_predictions: all,
        source,
    })
}
