use serde::{Deserialize, Serialize};

use super::repo_types::ResultWithAnalysis;

/// POST /analyze body. Fields are optional so missing ones become 400s.
#[derive(Debug, Default, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub analysis_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub results: Vec<ResultWithAnalysis>,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub success: bool,
}
