//! Secret value cache.
//!
//! Absorbs secret-store latency on the request path. Entries are keyed
//! `<tenant>/<secret-id>`, live five minutes, and are evicted lazily plus by
//! a background sweeper. Store errors pass through unchanged, including
//! NotFound.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::TtlCache;
use crate::store::{SecretRecord, SecretStore, StoreError};

const SECRET_TTL: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct SecretsCache {
    cache: Arc<TtlCache<SecretRecord>>,
    store: Arc<dyn SecretStore>,
}

impl SecretsCache {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        let cache = Arc::new(TtlCache::new(SECRET_TTL));
        TtlCache::spawn_sweeper(&cache, SWEEP_INTERVAL);
        Self { cache, store }
    }

    /// Fetch a secret by tenant and id, from memory when fresh. Concurrent
    /// misses on the same key may each hit the store; the later insert wins.
    pub async fn get_secret(&self, tenant: &str, id: &str) -> Result<SecretRecord, StoreError> {
        let key = format!("{tenant}/{id}");

        if let Some(record) = self.cache.get(&key) {
            return Ok(record);
        }

        let record = self.store.get(&key).await?;
        self.cache.insert(key, record.clone());
        debug!(id, "fetched secret from store");
        Ok(record)
    }
}
