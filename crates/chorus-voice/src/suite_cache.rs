use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use chorus_crypto::{AeadKind, CryptoSuite};

/// Per-room crypto-suite cache with single-flight creation.
///
/// The shared `moka` cache is authoritative: `get_with` guarantees at most
/// one generator runs per room and every concurrent joiner observes the
/// winner's suite. When the cache is unavailable the per-process map takes
/// over with a warning, because co-located control-plane instances will
/// then disagree on keys.
pub struct SuiteCache {
    cache: Option<moka::future::Cache<i64, Arc<CryptoSuite>>>,
    fallback: Mutex<HashMap<i64, Arc<CryptoSuite>>>,
    default_aead: AeadKind,
}

impl SuiteCache {
    pub fn new(ttl: Duration, default_aead: AeadKind, enabled: bool) -> Self {
        let cache = enabled.then(|| {
            moka::future::Cache::builder()
                .max_capacity(100_000)
                .time_to_live(ttl)
                .build()
        });
        if cache.is_none() {
            warn!("crypto-suite cache disabled; falling back to process-local suites");
        }
        Self {
            cache,
            fallback: Mutex::new(HashMap::new()),
            default_aead,
        }
    }

    /// Fetch the room's suite, creating it on first use.
    pub async fn get_or_create(&self, room_id: i64) -> Arc<CryptoSuite> {
        if let Some(cache) = &self.cache {
            let aead = self.default_aead;
            return cache
                .get_with(room_id, async move {
                    Arc::new(CryptoSuite::generate(aead))
                })
                .await;
        }

        let mut fallback = self.fallback.lock().unwrap();
        fallback
            .entry(room_id)
            .or_insert_with(|| {
                warn!(
                    room_id,
                    "generating crypto suite in local fallback; co-located servers will disagree"
                );
                Arc::new(CryptoSuite::generate(self.default_aead))
            })
            .clone()
    }

    /// Drop the room's suite so the next join mints a fresh generation.
    pub async fn invalidate(&self, room_id: i64) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&room_id).await;
        }
        self.fallback.lock().unwrap().remove(&room_id);
    }
}
