use std::collections::{BTreeMap, HashMap};

use time::{Duration, OffsetDateTime, UtcOffset};

use super::dto::{DiseaseCount, StatsResponse, TimelineDay};
use crate::analyses::{
    repo_types::{AnalysisSummary, ResultRecord},
    services::ensure_user,
};
use crate::error::{parse_id, AppResult};
use crate::state::AppState;

pub const MONTH_WINDOW: Duration = Duration::days(30);
pub const WEEK_WINDOW: Duration = Duration::days(7);

/// Case-insensitive substring match against the configured tokens.
/// Underscores in labels count as spaces (`malaria_parasitized`).
pub fn is_positive(label: &str, tokens: &[String]) -> bool {
    let label = label.to_lowercase().replace('_', " ");
    tokens.iter().any(|t| label.contains(t.as_str()))
}

/// Count entries with `created_at >= now - window`.
fn within(analyses: &[AnalysisSummary], now: OffsetDateTime, window: Duration) -> usize {
    let cutoff = now - window;
    analyses.iter().filter(|a| a.created_at >= cutoff).count()
}

pub fn disease_counts(results: &[ResultRecord]) -> Vec<DiseaseCount> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for r in results {
        *counts.entry(r.predicted_label.as_str()).or_default() += 1;
    }
    let mut out: Vec<DiseaseCount> = counts
        .into_iter()
        .map(|(disease, count)| DiseaseCount {
            disease: disease.to_string(),
            count,
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.disease.cmp(&b.disease)));
    out
}

pub fn timeline(results: &[ResultRecord], tokens: &[String]) -> Vec<TimelineDay> {
    let mut days: BTreeMap<time::Date, (usize, usize)> = BTreeMap::new();
    for r in results {
        let day = r.created_at.to_offset(UtcOffset::UTC).date();
        let entry = days.entry(day).or_default();
        entry.0 += 1;
        if is_positive(&r.predicted_label, tokens) {
            entry.1 += 1;
        }
    }
    days.into_iter()
        .map(|(date, (count, positive))| TimelineDay {
            date: date.to_string(),
            count,
            positive,
        })
        .collect()
}

pub fn compute_stats(
    now: OffsetDateTime,
    analyses: Vec<AnalysisSummary>,
    results: Vec<ResultRecord>,
    tokens: &[String],
) -> StatsResponse {
    StatsResponse {
        total_analyses: analyses.len(),
        month_analyses: within(&analyses, now, MONTH_WINDOW),
        week_analyses: within(&analyses, now, WEEK_WINDOW),
        positive_results: results
            .iter()
            .filter(|r| is_positive(&r.predicted_label, tokens))
            .count(),
        disease_counts: disease_counts(&results),
        timeline: timeline(&results, tokens),
        analyses,
        results,
    }
}

pub async fn get_stats(st: &AppState, raw_user_id: &str) -> AppResult<StatsResponse> {
    let user_id = parse_id(raw_user_id, "user_id")?;
    ensure_user(st, user_id).await?;

    let analyses = st.analyses.list_analyses(user_id).await?;
    let results = st.analyses.list_result_records(user_id).await?;
    Ok(compute_stats(
        OffsetDateTime::now_utc(),
        analyses,
        results,
        &st.config.positive_tokens,
    ))
}
