use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::auth::TokenManager;
use crate::models::AppConfig;
use crate::proxy::call_log::CallLogger;
use crate::proxy::dispatcher::Dispatcher;
use crate::proxy::pool::AccountPool;
use crate::proxy::translate::RequestTranslator;
use crate::store::Store;

/// Everything the handlers need, built once at startup and cloned per
/// request. Tests construct a fresh state per case; nothing here is a
/// process-wide singleton.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<Store>,
    pub tokens: Arc<TokenManager>,
    pub pool: Arc<AccountPool>,
    pub call_log: Arc<CallLogger>,
    pub dispatcher: Arc<Dispatcher>,
    pub translator: Arc<dyn RequestTranslator>,
    /// Caller-facing model -> upstream model. Config aliases merged with
    /// the `model_mappings` table at startup; admin updates land here.
    pub aliases: Arc<RwLock<HashMap<String, String>>>,
}

impl AppState {
    pub async fn resolve_model(&self, caller_model: &str) -> String {
        let aliases = self.aliases.read().await;
        aliases
            .get(caller_model)
            .cloned()
            .unwrap_or_else(|| caller_model.to_string())
    }
}
