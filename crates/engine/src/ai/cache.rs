//! Provider factory and cache
//!
//! One provider instance per (kind, model). The cache is owned by the
//! orchestrator and injected; nothing here is global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{AiProvider, CloudProvider, LocalProvider, ProviderKind, ProviderSettings};
use crate::config::AiConfig;

type CacheKey = (ProviderKind, String);

#[derive(Default)]
pub struct ProviderCache {
    providers: Mutex<HashMap<CacheKey, Arc<dyn AiProvider>>>,
}

impl ProviderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider for the configuration, or `None` when disabled or misconfigured
    pub fn resolve(&self, config: &AiConfig) -> Option<Arc<dyn AiProvider>> {
        if !config.enabled {
            return None;
        }
        if let Err(e) = config.provider.validate() {
            warn!("AI provider misconfigured, using rule-based generation only: {}", e);
            return None;
        }
        let (kind, model) = match (config.provider.kind(), config.provider.model()) {
            (Some(kind), Some(model)) => (kind, model.to_string()),
            _ => return None,
        };

        let key = (kind, model);
        if let Some(existing) = self.providers.lock().get(&key) {
            return Some(Arc::clone(existing));
        }

        let provider = build_provider(config)?;
        let mut providers = self.providers.lock();
        let entry = providers.entry(key).or_insert(provider);
        Some(Arc::clone(entry))
    }

    /// Register a provider under an explicit key
    pub fn insert(&self, kind: ProviderKind, model: &str, provider: Arc<dyn AiProvider>) {
        self.providers.lock().insert((kind, model.to_string()), provider);
    }

    /// Drop cached providers of one kind, or all
    pub fn invalidate(&self, kind: Option<ProviderKind>) {
        let mut providers = self.providers.lock();
        match kind {
            Some(kind) => providers.retain(|(k, _), _| *k != kind),
            None => providers.clear(),
        }
        debug!("Provider cache invalidated ({} remaining)", providers.len());
    }

    pub fn len(&self) -> usize {
        self.providers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_provider(config: &AiConfig) -> Option<Arc<dyn AiProvider>> {
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let built: Result<Arc<dyn AiProvider>, super::ProviderError> = match &config.provider {
        ProviderSettings::Disabled => return None,
        ProviderSettings::Local { endpoint, model } => {
            LocalProvider::new(endpoint, model, timeout).map(|p| Arc::new(p) as Arc<dyn AiProvider>)
        }
        ProviderSettings::Cloud {
            endpoint,
            model,
            api_key_env,
        } => match std::env::var(api_key_env) {
            Ok(key) => CloudProvider::new(endpoint, model, key, timeout)
                .map(|p| Arc::new(p) as Arc<dyn AiProvider>),
            Err(_) => {
                warn!("Environment variable {} is not set; AI generation disabled", api_key_env);
                return None;
            }
        },
    };

    match built {
        Ok(provider) => {
            info!(kind = ?provider.kind(), model = provider.model(), "AI provider initialised");
            Some(provider)
        }
        Err(e) => {
            warn!("Failed to initialise AI provider: {}", e);
            None
        }
    }
}
