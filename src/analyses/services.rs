use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::dto::AnalyzeRequest;
use super::repo_types::{
    Analysis, AnalysisType, NewAnalysis, NewResult, ResultRecord, ResultWithAnalysis,
};
use crate::error::{parse_id, AppError, AppResult};
use crate::images::decode_image;
use crate::state::AppState;

pub const MAX_NOTES_LEN: usize = 4000;

pub(crate) async fn ensure_user(st: &AppState, user_id: Uuid) -> AppResult<()> {
    match st.users.find_by_id(user_id).await? {
        Some(_) => Ok(()),
        None => Err(AppError::NotFound("user")),
    }
}

/// Classify one image and persist the analysis with its result.
#[instrument(skip(st, req))]
pub async fn analyze(st: &AppState, req: AnalyzeRequest) -> AppResult<ResultRecord> {
    let user_id = parse_id(
        req.user_id
            .as_deref()
            .ok_or_else(|| AppError::validation("user_id is required"))?,
        "user_id",
    )?;
    let raw_image = req
        .image
        .ok_or_else(|| AppError::validation("image is required"))?;
    let analysis_type: AnalysisType = req
        .analysis_type
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(AppError::Validation)?;
    let notes = req.notes.unwrap_or_default().trim().to_string();
    if notes.chars().count() > MAX_NOTES_LEN {
        return Err(AppError::validation(format!(
            "notes must be at most {MAX_NOTES_LEN} characters"
        )));
    }

    ensure_user(st, user_id).await?;

    let image = decode_image(&raw_image, st.config.max_image_bytes)?;
    let prediction = st.classifier.classify(&image).await?;

    let now = OffsetDateTime::now_utc();
    let new_analysis = NewAnalysis {
        id: Uuid::new_v4(),
        user_id,
        image_payload: raw_image,
        analysis_type,
        created_at: now,
    };
    let new_result = NewResult {
        id: Uuid::new_v4(),
        user_id,
        predicted_label: prediction.label,
        confidence: prediction.confidence,
        all_predictions: prediction.all_predictions,
        source: prediction.source,
        notes,
        created_at: now,
    };

    let (analysis, result) = st
        .analyses
        .insert_with_result(&new_analysis, &new_result)
        .await?;

    info!(
        %user_id,
        analysis_id = %analysis.id,
        result_id = %result.id,
        mime = image.mime,
        label = %result.predicted_label,
        confidence = result.confidence,
        source = result.source.as_str(),
        "analysis stored"
    );
    Ok(result)
}

pub async fn list_results(st: &AppState, raw_user_id: &str) -> AppResult<Vec<ResultWithAnalysis>> {
    let user_id = parse_id(raw_user_id, "user_id")?;
    ensure_user(st, user_id).await?;
    Ok(st.analyses.list_results(user_id).await?)
}

pub async fn get_analysis(st: &AppState, raw_id: &str) -> AppResult<Analysis> {
    let id = parse_id(raw_id, "analysis_id")?;
    st.analyses
        .find_analysis(id)
        .await?
        .ok_or(AppError::NotFound("analysis"))
}

/// Deletes the result row only; its analysis stays.
pub async fn delete_result(st: &AppState, raw_id: &str) -> AppResult<()> {
    let id = parse_id(raw_id, "result_id")?;
    if !st.analyses.delete_result(id).await? {
        warn!(result_id = %id, "delete of unknown result");
        return Err(AppError::NotFound("result"));
    }
    info!(result_id = %id, "result deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::auth::{repo_types::NewUser, UserStore};
    use crate::classifier::{
        Classifier, ClassifierError, FallbackClassifier, Prediction, PredictionSource,
    };
    use crate::images::{sample_png_data_url, ImagePayload};

    struct Unavailable;

    #[async_trait]
    impl Classifier for Unavailable {
        async fn classify(&self, _image: &ImagePayload) -> Result<Prediction, ClassifierError> {
            Err(ClassifierError::ExitStatus {
                code: Some(1),
                stderr: "CUDA error".into(),
            })
        }
        fn describe(&self) -> String {
            "unavailable".into()
        }
    }

    async fn seed_user(st: &AppState, email: &str) -> Uuid {
        st.users
            .create(&NewUser {
                email: email.into(),
                password_hash: "x".into(),
                full_name: "Test".into(),
                role: "technician".into(),
            })
            .await
            .unwrap()
            .unwrap()
            .id
    }

    fn request(user_id: Uuid, notes: &str) -> AnalyzeRequest {
        AnalyzeRequest {
            image: Some(sample_png_data_url()),
            user_id: Some(user_id.to_string()),
            notes: Some(notes.into()),
            analysis_type: None,
        }
    }

    #[tokio::test]
    async fn analyze_stores_one_linked_pair() {
        let (st, mem) = AppState::fake_with_store();
        let user = seed_user(&st, "a@x.com").await;

        let res = analyze(&st, request(user, "thin film")).await.unwrap();

        assert_eq!(mem.analysis_count(), 1);
        assert_eq!(mem.result_count(), 1);
        let analysis = get_analysis(&st, &res.analysis_id.to_string()).await.unwrap();
        assert_eq!(analysis.user_id, user);
        assert_eq!(analysis.status, "completed");
        assert_eq!(analysis.analysis_type, "upload");
        assert!(analysis.image_payload.starts_with("data:image/png;base64,"));
        assert_eq!(res.notes, "thin film");
        assert!((0.0..=1.0).contains(&res.confidence));
    }

    #[tokio::test]
    async fn analyze_falls_back_when_classifier_fails() {
        let (mut st, mem) = AppState::fake_with_store();
        st.classifier = Arc::new(FallbackClassifier::new(Arc::new(Unavailable)));
        let user = seed_user(&st, "a@x.com").await;

        let res = analyze(&st, request(user, "")).await.unwrap();

        assert_eq!(res.source, PredictionSource::Fallback);
        assert_eq!(res.predicted_label, "babesia");
        assert_eq!(mem.analysis_count(), 1);
        assert_eq!(mem.result_count(), 1);
        assert!(res
            .all_predictions
            .iter()
            .all(|p| (0.0..=1.0).contains(&p.confidence)));
    }

    #[tokio::test]
    async fn strict_classifier_failure_stores_nothing() {
        let (mut st, mem) = AppState::fake_with_store();
        st.classifier = Arc::new(Unavailable);
        let user = seed_user(&st, "a@x.com").await;

        let err = analyze(&st, request(user, "")).await.unwrap_err();

        assert!(matches!(err, AppError::Classifier(_)));
        assert_eq!(mem.analysis_count(), 0);
        assert_eq!(mem.result_count(), 0);
    }

    #[tokio::test]
    async fn analyze_validates_input() {
        let (st, mem) = AppState::fake_with_store();
        let user = seed_user(&st, "a@x.com").await;

        let missing_image = AnalyzeRequest {
            image: None,
            ..request(user, "")
        };
        assert!(matches!(
            analyze(&st, missing_image).await,
            Err(AppError::Validation(_))
        ));

        let bad_id = AnalyzeRequest {
            user_id: Some("42".into()),
            ..request(user, "")
        };
        assert!(matches!(analyze(&st, bad_id).await, Err(AppError::Validation(_))));

        let bad_type = AnalyzeRequest {
            analysis_type: Some("fax".into()),
            ..request(user, "")
        };
        assert!(matches!(analyze(&st, bad_type).await, Err(AppError::Validation(_))));

        let not_image = AnalyzeRequest {
            image: Some("aGVsbG8gd29ybGQ=".into()),
            ..request(user, "")
        };
        assert!(matches!(analyze(&st, not_image).await, Err(AppError::Validation(_))));

        let stranger = request(Uuid::new_v4(), "");
        assert!(matches!(
            analyze(&st, stranger).await,
            Err(AppError::NotFound("user"))
        ));

        assert_eq!(mem.analysis_count(), 0);
    }

    #[tokio::test]
    async fn live_captures_are_tagged() {
        let (st, _mem) = AppState::fake_with_store();
        let user = seed_user(&st, "a@x.com").await;
        let req = AnalyzeRequest {
            analysis_type: Some("live".into()),
            ..request(user, "")
        };
        let res = analyze(&st, req).await.unwrap();
        let analysis = get_analysis(&st, &res.analysis_id.to_string()).await.unwrap();
        assert_eq!(analysis.analysis_type, "live");
    }

    #[tokio::test]
    async fn results_are_per_user_and_newest_first() {
        let (st, _mem) = AppState::fake_with_store();
        let alice = seed_user(&st, "alice@x.com").await;
        let bob = seed_user(&st, "bob@x.com").await;

        let first = analyze(&st, request(alice, "first")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = analyze(&st, request(alice, "second")).await.unwrap();
        analyze(&st, request(bob, "bob's")).await.unwrap();

        let listed = list_results(&st, &alice.to_string()).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].result.id, second.id);
        assert_eq!(listed[1].result.id, first.id);
        assert!(listed.iter().all(|r| r.result.user_id == alice));
        let joined = listed[0].analyses.as_ref().unwrap();
        assert_eq!(joined.id, second.analysis_id);
    }

    #[tokio::test]
    async fn deleting_result_keeps_analysis() {
        let (st, mem) = AppState::fake_with_store();
        let user = seed_user(&st, "a@x.com").await;
        let res = analyze(&st, request(user, "")).await.unwrap();

        delete_result(&st, &res.id.to_string()).await.unwrap();

        assert!(list_results(&st, &user.to_string()).await.unwrap().is_empty());
        let analysis = get_analysis(&st, &res.analysis_id.to_string()).await.unwrap();
        assert_eq!(analysis.id, res.analysis_id);
        assert_eq!(mem.analysis_count(), 1);

        let again = delete_result(&st, &res.id.to_string()).await.unwrap_err();
        assert!(matches!(again, AppError::NotFound("result")));
    }
}
