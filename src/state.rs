use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{auth::SessionUser, config::AppConfig, db, services::notifier::Notifier};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub user_cache: Cache<Uuid, SessionUser>,
    pub notifier: Notifier,
}

impl AppState {
    /// Must be called inside the tokio runtime: the notification worker is
    /// spawned here.
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db_pool = db::build_pool(&config)?;
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        let user_cache = Cache::builder()
            .max_capacity(config.user_cache_max_entries)
            .time_to_live(Duration::from_secs(config.user_cache_ttl_seconds.max(1)))
            .build();
        let config = Arc::new(config);
        let notifier = Notifier::spawn(config.clone(), http_client);

        Ok(Self {
            config,
            db_pool,
            user_cache,
            notifier,
        })
    }
}
