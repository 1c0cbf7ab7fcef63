use serde::Serialize;

use crate::analyses::repo_types::{AnalysisSummary, ResultRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiseaseCount {
    pub disease: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineDay {
    /// UTC calendar day, `YYYY-MM-DD`.
    pub date: String,
    pub count: usize,
    pub positive: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub total_analyses: usize,
    pub month_analyses: usize,
    pub week_analyses: usize,
    pub positive_results: usize,
    pub disease_counts: Vec<DiseaseCount>,
    pub timeline: Vec<TimelineDay>,
    pub analyses: Vec<AnalysisSummary>,
    pub results: Vec<ResultRecord>,
}
