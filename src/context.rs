use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::registry::BackendRegistry;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: Arc<BackendRegistry>,
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(config: AppConfig, registry: BackendRegistry) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            started_at: Instant::now(),
        }
    }
}
