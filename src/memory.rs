//! Process-local stores used with `STORE_BACKEND=memory` and in tests.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::analyses::{
    repo_types::{
        Analysis, AnalysisRef, AnalysisSummary, NewAnalysis, NewResult, ResultRecord,
        ResultWithAnalysis, STATUS_COMPLETED,
    },
    AnalysisStore,
};
use crate::auth::{
    repo_types::{NewUser, User},
    UserStore,
};

#[derive(Default)]
struct Inner {
    users: Vec<User>,
    analyses: Vec<Analysis>,
    results: Vec<ResultRecord>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every write completes under one guard, so a poisoned lock still holds whole records.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
impl MemoryStore {
    pub fn user_count(&self) -> usize {
        self.lock().users.len()
    }

    pub fn analysis_count(&self) -> usize {
        self.lock().analyses.len()
    }

    pub fn result_count(&self) -> usize {
        self.lock().results.len()
    }
}

fn newest_first<T>(items: &mut [T], key: impl Fn(&T) -> OffsetDateTime) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        Ok(self.lock().users.iter().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        Ok(self.lock().users.iter().find(|u| u.id == id).cloned())
    }

    async fn create(&self, new: &NewUser) -> anyhow::Result<Option<User>> {
        let mut inner = self.lock();
        if inner.users.iter().any(|u| u.email == new.email) {
            return Ok(None);
        }
        let user = User {
            id: Uuid::new_v4(),
            email: new.email.clone(),
            password_hash: new.password_hash.clone(),
            full_name: new.full_name.clone(),
            role: new.role.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        inner.users.push(user.clone());
        Ok(Some(user))
    }
}

#[async_trait]
impl AnalysisStore for MemoryStore {
    async fn insert_with_result(
        &self,
        analysis: &NewAnalysis,
        result: &NewResult,
    ) -> anyhow::Result<(Analysis, ResultRecord)> {
        let stored = Analysis {
            id: analysis.id,
            user_id: analysis.user_id,
            image_payload: analysis.image_payload.clone(),
            analysis_type: analysis.analysis_type.as_str().to_string(),
            status: STATUS_COMPLETED.to_string(),
            created_at: analysis.created_at,
        };
        let record = ResultRecord {
            id: result.id,
            analysis_id: stored.id,
            user_id: result.user_id,
            predicted_label: result.predicted_label.clone(),
            confidence: result.confidence,
            all_predictions: result.all_predictions.clone(),
            source: result.source,
            notes: result.notes.clone(),
            created_at: result.created_at,
        };

        let mut inner = self.lock();
        anyhow::ensure!(
            !inner.analyses.iter().any(|a| a.id == stored.id),
            "duplicate analysis id {}",
            stored.id
        );
        anyhow::ensure!(
            !inner.results.iter().any(|r| r.id == record.id),
            "duplicate result id {}",
            record.id
        );
        inner.analyses.push(stored.clone());
        inner.results.push(record.clone());
        Ok((stored, record))
    }

    async fn find_analysis(&self, id: Uuid) -> anyhow::Result<Option<Analysis>> {
        Ok(self.lock().analyses.iter().find(|a| a.id == id).cloned())
    }

    async fn list_analyses(&self, user_id: Uuid) -> anyhow::Result<Vec<AnalysisSummary>> {
        let mut out: Vec<AnalysisSummary> = self
            .lock()
            .analyses
            .iter()
            .filter(|a| a.user_id == user_id)
            .map(AnalysisSummary::from)
            .collect();
        newest_first(&mut out, |a| a.created_at);
        Ok(out)
    }

    async fn list_result_records(&self, user_id: Uuid) -> anyhow::Result<Vec<ResultRecord>> {
        let mut out: Vec<ResultRecord> = self
            .lock()
            .results
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        newest_first(&mut out, |r| r.created_at);
        Ok(out)
    }

    async fn list_results(&self, user_id: Uuid) -> anyhow::Result<Vec<ResultWithAnalysis>> {
        let inner = self.lock();
        let mut out: Vec<ResultWithAnalysis> = inner
            .results
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| ResultWithAnalysis {
                result: r.clone(),
                analyses: inner
                    .analyses
                    .iter()
                    .find(|a| a.id == r.analysis_id)
                    .map(AnalysisRef::from),
            })
            .collect();
        drop(inner);
        newest_first(&mut out, |r| r.result.created_at);
        Ok(out)
    }

    async fn delete_result(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut inner = self.lock();
        let before = inner.results.len();
        inner.results.retain(|r| r.id != id);
        Ok(inner.results.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyses::repo_types::AnalysisType;
    use crate::classifier::PredictionSource;

    fn pair(user_id: Uuid, at: OffsetDateTime) -> (NewAnalysis, NewResult) {
        (
            NewAnalysis {
                id: Uuid::new_v4(),
                user_id,
                image_payload: "img".into(),
                analysis_type: AnalysisType::Upload,
                created_at: at,
            },
            NewResult {
                id: Uuid::new_v4(),
                user_id,
                predicted_label: "monocyte".into(),
                confidence: 0.5,
                all_predictions: vec![],
                source: PredictionSource::Model,
                notes: String::new(),
                created_at: at,
            },
        )
    }

    #[tokio::test]
    async fn create_refuses_taken_email() {
        let store = MemoryStore::default();
        let new = NewUser {
            email: "a@x.com".into(),
            password_hash: "h".into(),
            full_name: "A".into(),
            role: "tech".into(),
        };
        assert!(store.create(&new).await.unwrap().is_some());
        assert!(store.create(&new).await.unwrap().is_none());
        assert_eq!(store.user_count(), 1);
    }

    #[tokio::test]
    async fn listings_sort_newest_first() {
        let store = MemoryStore::default();
        let user = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let (a_old, r_old) = pair(user, now - time::Duration::hours(2));
        let (a_new, r_new) = pair(user, now);
        store.insert_with_result(&a_old, &r_old).await.unwrap();
        store.insert_with_result(&a_new, &r_new).await.unwrap();

        let analyses = store.list_analyses(user).await.unwrap();
        assert_eq!(analyses[0].id, a_new.id);
        let results = store.list_result_records(user).await.unwrap();
        assert_eq!(results[0].id, r_new.id);
        assert_eq!(results[1].analysis_id, a_old.id);
    }

    #[tokio::test]
    async fn duplicate_ids_write_nothing() {
        let store = MemoryStore::default();
        let (a, r) = pair(Uuid::new_v4(), OffsetDateTime::now_utc());
        store.insert_with_result(&a, &r).await.unwrap();
        let (_, r2) = pair(a.user_id, OffsetDateTime::now_utc());
        assert!(store.insert_with_result(&a, &r2).await.is_err());
        assert_eq!(store.analysis_count(), 1);
        assert_eq!(store.result_count(), 1);
    }
}
