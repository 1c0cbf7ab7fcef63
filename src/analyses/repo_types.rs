use serde::Serialize;
use sqlx::{types::Json, FromRow};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::classifier::{LabelScore, PredictionSource};

pub const STATUS_COMPLETED: &str = "completed";

/// How the image was obtained on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    Upload,
    Live,
}

impl AnalysisType {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisType::Upload => "upload",
            AnalysisType::Live => "live",
        }
    }
}

impl std::str::FromStr for AnalysisType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "upload" => Ok(Self::Upload),
            "live" | "capture" => Ok(Self::Live),
            other => Err(format!("unknown analysis_type {other:?}")),
        }
    }
}

/// Full analysis record, image included.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Analysis {
    pub id: Uuid,
    pub user_id: Uuid,
    pub image_payload: String,
    pub analysis_type: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Analysis without the image, for listings.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AnalysisSummary {
    pub id: Uuid,
    pub user_id: Uuid,
    pub analysis_type: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&Analysis> for AnalysisSummary {
    fn from(a: &Analysis) -> Self {
        Self {
            id: a.id,
            user_id: a.user_id,
            analysis_type: a.analysis_type.clone(),
            status: a.status.clone(),
            created_at: a.created_at,
        }
    }
}

/// Stored prediction. Wire names follow the browser client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub id: Uuid,
    pub analysis_id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "predicted_disease")]
    pub predicted_label: String,
    #[serde(rename = "confidence_score")]
    pub confidence: f64,
    pub all_predictions: Vec<LabelScore>,
    pub source: PredictionSource,
    pub notes: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, FromRow)]
pub struct ResultRow {
    pub id: Uuid,
    pub analysis_id: Uuid,
    pub user_id: Uuid,
    pub predicted_label: String,
    pub confidence: f64,
    pub all_predictions: Json<Vec<LabelScore>>,
    pub source: String,
    pub notes: String,
    pub created_at: OffsetDateTime,
}

impl TryFrom<ResultRow> for ResultRecord {
    type Error = anyhow::Error;

    fn try_from(r: ResultRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            analysis_id: r.analysis_id,
            user_id: r.user_id,
            predicted_label: r.predicted_label,
            confidence: r.confidence,
            all_predictions: r.all_predictions.0,
            source: r.source.parse()?,
            notes: r.notes,
            created_at: r.created_at,
        })
    }
}

/// The analysis side of a joined result row.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRef {
    pub id: Uuid,
    pub image_url: String,
    pub analysis_type: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&Analysis> for AnalysisRef {
    fn from(a: &Analysis) -> Self {
        Self {
            id: a.id,
            image_url: a.image_payload.clone(),
            analysis_type: a.analysis_type.clone(),
            status: a.status.clone(),
            created_at: a.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultWithAnalysis {
    #[serde(flatten)]
    pub result: ResultRecord,
    pub analyses: Option<AnalysisRef>,
}

#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub id: Uuid,
    pub user_id: Uuid,
    pub image_payload: String,
    pub analysis_type: AnalysisType,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewResult {
    pub id: Uuid,
    pub user_id: Uuid,
    pub predicted_label: String,
    pub confidence: f64,
    pub all_predictions: Vec<LabelScore>,
    pub source: PredictionSource,
    pub notes: String,
    pub created_at: OffsetDateTime,
}
