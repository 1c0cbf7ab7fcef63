use anyhow::Context;
use async_trait::async_trait;
use sqlx::{types::Json, FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::repo_types::{
    Analysis, AnalysisRef, AnalysisSummary, NewAnalysis, NewResult, ResultRecord, ResultRow,
    ResultWithAnalysis, STATUS_COMPLETED,
};

#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Write the analysis and its result together; either both land or neither.
    async fn insert_with_result(
        &self,
        analysis: &NewAnalysis,
        result: &NewResult,
    ) -> anyhow::Result<(Analysis, ResultRecord)>;

    async fn find_analysis(&self, id: Uuid) -> anyhow::Result<Option<Analysis>>;

    /// Newest first.
    async fn list_analyses(&self, user_id: Uuid) -> anyhow::Result<Vec<AnalysisSummary>>;

    /// Newest first, without the joined analysis.
    async fn list_result_records(&self, user_id: Uuid) -> anyhow::Result<Vec<ResultRecord>>;

    /// Newest first, each joined with its analysis.
    async fn list_results(&self, user_id: Uuid) -> anyhow::Result<Vec<ResultWithAnalysis>>;

    /// Removes the result only. Returns false when nothing matched.
    async fn delete_result(&self, id: Uuid) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub struct PgAnalysisStore {
    db: PgPool,
}

impl PgAnalysisStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[derive(Debug, FromRow)]
struct JoinedRow {
    #[sqlx(flatten)]
    result: ResultRow,
    a_id: Option<Uuid>,
    a_image_payload: Option<String>,
    a_analysis_type: Option<String>,
    a_status: Option<String>,
    a_created_at: Option<OffsetDateTime>,
}

impl TryFrom<JoinedRow> for ResultWithAnalysis {
    type Error = anyhow::Error;

    fn try_from(r: JoinedRow) -> Result<Self, Self::Error> {
        let analyses = match (r.a_id, r.a_image_payload, r.a_analysis_type, r.a_status, r.a_created_at) {
            (Some(id), Some(image_url), Some(analysis_type), Some(status), Some(created_at)) => {
                Some(AnalysisRef {
                    id,
                    image_url,
                    analysis_type,
                    status,
                    created_at,
                })
            }
            _ => None,
        };
        Ok(Self {
            result: r.result.try_into()?,
            analyses,
        })
    }
}

#[async_trait]
impl AnalysisStore for PgAnalysisStore {
    async fn insert_with_result(
        &self,
        analysis: &NewAnalysis,
        result: &NewResult,
    ) -> anyhow::Result<(Analysis, ResultRecord)> {
        let mut tx = self.db.begin().await.context("begin tx")?;

        let stored = sqlx::query_as::<_, Analysis>(
            r#"
            INSERT INTO analyses (id, user_id, image_payload, analysis_type, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, user_id, image_payload, analysis_type, status, created_at
            "#,
        )
        .bind(analysis.id)
        .bind(analysis.user_id)
        .bind(&analysis.image_payload)
        .bind(analysis.analysis_type.as_str())
        .bind(STATUS_COMPLETED)
        .bind(analysis.created_at)
        .fetch_one(&mut *tx)
        .await
        .context("insert analysis")?;

        let row = sqlx::query_as::<_, ResultRow>(
            r#"
            INSERT INTO results (id, analysis_id, user_id, predicted_label, confidence,
                                 all_predictions, source, notes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, analysis_id, user_id, predicted_label, confidence,
                      all_predictions, source, notes, created_at
            "#,
        )
        .bind(result.id)
        .bind(stored.id)
        .bind(result.user_id)
        .bind(&result.predicted_label)
        .bind(result.confidence)
        .bind(Json(&result.all_predictions))
        .bind(result.source.as_str())
        .bind(&result.notes)
        .bind(result.created_at)
        .fetch_one(&mut *tx)
        .await
        .context("insert result")?;

        tx.commit().await.context("commit tx")?;
        Ok((stored, row.try_into()?))
    }

    async fn find_analysis(&self, id: Uuid) -> anyhow::Result<Option<Analysis>> {
        let row = sqlx::query_as::<_, Analysis>(
            r#"
            SELECT id, user_id, image_payload, analysis_type, status, created_at
              FROM analyses
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find analysis")?;
        Ok(row)
    }

    async fn list_analyses(&self, user_id: Uuid) -> anyhow::Result<Vec<AnalysisSummary>> {
        let rows = sqlx::query_as::<_, AnalysisSummary>(
            r#"
            SELECT id, user_id, analysis_type, status, created_at
              FROM analyses
             WHERE user_id = $1
             ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .context("list analyses by user")?;
        Ok(rows)
    }

    async fn list_result_records(&self, user_id: Uuid) -> anyhow::Result<Vec<ResultRecord>> {
        let rows = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT id, analysis_id, user_id, predicted_label, confidence,
                   all_predictions, source, notes, created_at
              FROM results
             WHERE user_id = $1
             ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .context("list results by user")?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_results(&self, user_id: Uuid) -> anyhow::Result<Vec<ResultWithAnalysis>> {
        let rows = sqlx::query_as::<_, JoinedRow>(
            r#"
            SELECT r.id, r.analysis_id, r.user_id, r.predicted_label, r.confidence,
                   r.all_predictions, r.source, r.notes, r.created_at,
                   a.id AS a_id, a.image_payload AS a_image_payload,
                   a.analysis_type AS a_analysis_type, a.status AS a_status,
                   a.created_at AS a_created_at
              FROM results r
              LEFT JOIN analyses a ON a.id = r.analysis_id
             WHERE r.user_id = $1
             ORDER BY r.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await
        .context("list joined results by user")?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_result(&self, id: Uuid) -> anyhow::Result<bool> {
        let done = sqlx::query("DELETE FROM results WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .context("delete result")?;
        Ok(done.rows_affected() > 0)
    }
}
