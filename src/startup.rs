use std::sync::Arc;
use tokio::time::{Duration, interval};
use tracing::error;

use crate::presence::PresenceConfig;
use crate::sse::models::{ChangeSender, PresenceSender};
use crate::sse::{create_change_broadcaster, create_presence_broadcaster};
use crate::store::PgVoteStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PgVoteStore>,
    pub changes: ChangeSender,
    pub presence: PresenceSender,
    pub presence_config: PresenceConfig,
}

impl AppState {
    pub fn new(store: Arc<PgVoteStore>, presence_config: PresenceConfig) -> Self {
        let pool = store.pool().clone();
        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                match pool.acquire().await {
                    Ok(conn) => {
                        drop(conn);
                    }
                    Err(e) => {
                        error!("Database connection health check failed: {}", e);
                    }
                }
            }
        });

        AppState {
            store,
            changes: create_change_broadcaster(),
            presence: create_presence_broadcaster(),
            presence_config,
        }
    }
}
