use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::dbfiles::PgFileStore;
use crate::persistence::{spawn_autosave, FileStore, MemoryFileStore, PersistenceBridge};
use crate::registry::DocumentRegistry;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub registry: Arc<DocumentRegistry>,
    pub bridge: PersistenceBridge,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn FileStore>) -> Arc<Self> {
        let bridge = PersistenceBridge::new(store);
        let registry = DocumentRegistry::new(bridge.clone(), config.registry_config());
        Arc::new(Self {
            config,
            registry,
            bridge,
        })
    }

    /// Build state with the store picked by the configuration: Postgres when
    /// a database URL is set and reachable, memory otherwise.
    pub async fn from_config(config: Config) -> Arc<Self> {
        let store: Arc<dyn FileStore> = match &config.db_url {
            Some(db_url) => match PgFileStore::new(db_url).await {
                Ok(store) => {
                    if let Err(e) = store.ensure_schema().await {
                        error!("Failed to prepare database schema: {}", e);
                    }
                    info!("Database initialized successfully");
                    Arc::new(store)
                }
                Err(e) => {
                    error!("Failed to initialize database: {}", e);
                    warn!("Falling back to in-memory file storage");
                    Arc::new(MemoryFileStore::new())
                }
            },
            None => {
                warn!("No database URL configured - files are kept in memory only");
                warn!("The memory store starts empty, so saving a file returns 404 until DB_URL is set");
                Arc::new(MemoryFileStore::new())
            }
        };
        Self::new(config, store)
    }

    /// Start registry maintenance and, when configured, autosave.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self
            .registry
            .spawn_maintenance(self.registry.config().awareness_sweep)];
        if let Some(every) = self.config.autosave_interval() {
            info!("Autosaving dirty documents every {:?}", every);
            tasks.push(spawn_autosave(self.registry.clone(), self.bridge.clone(), every));
        }
        tasks
    }
}
