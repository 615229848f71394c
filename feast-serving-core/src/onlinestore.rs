mod memory;
mod redis;

use crate::config::OnlineStoreConfig;
use crate::key_codec::{FeatureKeyCodec, LookupKey};
use crate::registry::FeatureSetRegistry;
use crate::types::StoredFeature;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub use memory::MemoryOnlineStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// The store could not be reached at all (connection refused, dropped, timed out).
    Unavailable(String),
    /// The store answered but this lookup failed (e.g. a value that does not decode).
    Failed(String),
}

impl LookupError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LookupError::Unavailable(_))
    }
}

impl Display for LookupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::Unavailable(message) => write!(f, "online store unavailable: {}", message),
            LookupError::Failed(message) => write!(f, "online store lookup failed: {}", message),
        }
    }
}

impl std::error::Error for LookupError {}

pub type LookupResult = std::result::Result<Option<StoredFeature>, LookupError>;

#[async_trait]
pub trait OnlineStore: Send + Sync + 'static {
    async fn get(&self, key: &LookupKey) -> LookupResult;

    /// Fetch a batch of keys, one result per key in the same order. An outer error means
    /// no key in the batch could be served.
    async fn multi_get(
        &self,
        keys: &[LookupKey],
    ) -> std::result::Result<Vec<LookupResult>, LookupError> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await);
        }
        Ok(results)
    }

    /// Whether `multi_get` is served in a single round trip.
    fn supports_multi_get(&self) -> bool {
        false
    }
}

pub async fn get_online_store(
    online_store_config: &OnlineStoreConfig,
    codec: &FeatureKeyCodec,
    registry: &dyn FeatureSetRegistry,
    cwd: Option<&str>,
) -> Result<Arc<dyn OnlineStore>> {
    match online_store_config {
        OnlineStoreConfig::Memory { seed_path } => {
            debug!("Create in-memory online store");
            let store = MemoryOnlineStore::new();
            if let Some(seed_path) = seed_path {
                let mut full_path = PathBuf::new();
                full_path.push(cwd.unwrap_or(""));
                full_path.push(seed_path);
                let text = tokio::fs::read_to_string(&full_path)
                    .await
                    .with_context(|| format!("Failed to read online store seed {:?}", full_path))?;
                let loaded = store.load_json_lines(codec, registry, &text).await?;
                info!(records = loaded, "Seeded in-memory online store from {:?}", full_path);
            }
            Ok(Arc::new(store))
        }
        OnlineStoreConfig::Redis {
            redis_type,
            connection_string,
        } => {
            debug!("Create Redis online store");
            redis::new(redis_type.clone(), connection_string.clone()).await
        }
    }
}
