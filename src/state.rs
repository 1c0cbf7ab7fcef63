use crate::analyses::{AnalysisStore, PgAnalysisStore};
use crate::auth::{PgUserStore, UserStore};
use crate::classifier::{self, Classifier};
use crate::config::{AppConfig, ClassifierMode, PayloadInput, StoreBackend};
use crate::db;
use crate::memory::MemoryStore;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserStore>,
    pub analyses: Arc<dyn AnalysisStore>,
    pub classifier: Arc<dyn Classifier>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let (users, analyses): (Arc<dyn UserStore>, Arc<dyn AnalysisStore>) =
            match config.db.backend {
                StoreBackend::Postgres => {
                    let pool = db::connect(&config.db).await?;
                    db::migrate(&pool).await?;
                    (
                        Arc::new(PgUserStore::new(pool.clone())),
                        Arc::new(PgAnalysisStore::new(pool)),
                    )
                }
                StoreBackend::Memory => {
                    warn!("using in-memory store; data is lost on restart");
                    let store = MemoryStore::default();
                    (Arc::new(store.clone()), Arc::new(store))
                }
            };

        let classifier = classifier::from_config(&config.classifier);
        if config.classifier.mode == ClassifierMode::Subprocess
            && config.classifier.input == PayloadInput::Arg
            && !classifier::arg_payload_fits(config.max_image_bytes)
        {
            warn!(
                max_image_bytes = config.max_image_bytes,
                arg_limit = classifier::MAX_ARG_PAYLOAD,
                "large images will not fit in a CLASSIFIER_INPUT=arg argument"
            );
        }
        info!(
            store = ?config.db.backend,
            classifier = %classifier.describe(),
            "state initialized"
        );

        Ok(Self::from_parts(config, users, analyses, classifier))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        users: Arc<dyn UserStore>,
        analyses: Arc<dyn AnalysisStore>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            config,
            users,
            analyses,
            classifier,
        }
    }
}

#[cfg(test)]
impl AppState {
    pub fn fake() -> Self {
        Self::fake_with_store().0
    }

    /// Fake state plus a handle on its store for assertions.
    pub fn fake_with_store() -> (Self, MemoryStore) {
        use crate::config::{ClassifierConfig, ClassifierMode, DbConfig};
        use std::time::Duration;

        let config = Arc::new(AppConfig {
            db: DbConfig {
                backend: StoreBackend::Memory,
                url: String::new(),
                max_connections: 1,
                acquire_timeout: Duration::from_secs(1),
                statement_timeout_ms: 1000,
            },
            classifier: ClassifierConfig {
                mode: ClassifierMode::Mock,
                ..ClassifierConfig::default()
            },
            max_image_bytes: 1024 * 1024,
            positive_tokens: crate::config::default_positive_tokens(),
        });

        let store = MemoryStore::default();
        let state = Self::from_parts(
            config,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(classifier::MockClassifier),
        );
        (state, store)
    }
}
