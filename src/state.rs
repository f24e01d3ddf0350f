use crate::client::{ApiTransport, FellowClient};
use crate::config::{ApiConfig, Credentials};
use crate::error::Result;
use crate::store::{FileStore, NodeStateStore};
use crate::trigger::WebhookLifecycle;
use crate::types::PendingEvent;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything needed to talk to one Fellow workspace.
pub struct Connection {
    pub api: Arc<dyn ApiTransport>,
    pub api_base: String,
    pub lifecycle: Arc<WebhookLifecycle>,
}

impl Connection {
    pub fn new(api: Arc<dyn ApiTransport>, api_base: String, store: Arc<dyn NodeStateStore>) -> Self {
        let lifecycle = Arc::new(WebhookLifecycle::new(api.clone(), store, api_base.clone()));
        Self {
            api,
            api_base,
            lifecycle,
        }
    }

    pub fn from_credentials(
        config: &ApiConfig,
        credentials: &Credentials,
        store: Arc<dyn NodeStateStore>,
    ) -> Result<Self> {
        let api_base = config.base_url(&credentials.subdomain)?;
        let client = FellowClient::new(credentials, config.skip_ssl_validation)?;
        Ok(Self::new(Arc::new(client), api_base, store))
    }
}

/// Runtime state, held behind Arc<RwLock<AppState>>.
pub struct AppState {
    pub store: Arc<FileStore>,
    pub config: ApiConfig,
    pub connection: Option<Arc<Connection>>,
    pub port: Option<u16>,
    /// Locally bound URL of the inbound server.
    pub base_url: String,
    /// Accepted deliveries from the HTTP server, not yet published to host.
    pub pending_rx: Option<mpsc::UnboundedReceiver<PendingEvent>>,
}

impl AppState {
    pub fn new(data_dir: PathBuf, config: ApiConfig) -> Self {
        Self {
            store: Arc::new(FileStore::new(data_dir)),
            config,
            connection: None,
            port: None,
            base_url: String::new(),
            pending_rx: None,
        }
    }

    /// Base URL the provider should call back on.
    pub fn callback_base(&self) -> &str {
        self.config.public_url.as_deref().unwrap_or(&self.base_url)
    }

    pub fn callback_url(&self, node_id: &str) -> String {
        format!("{}/hooks/{}", self.callback_base().trim_end_matches('/'), node_id)
    }
}
