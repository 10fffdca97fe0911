use reqwest::Url;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{
    data_model::FederationMetadata,
    error::{FederationError, FederationResult},
    metadata::MetadataSource,
};

/// Default lifetime of a cached metadata document.
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(12 * 60 * 60);
/// Default bound on a single metadata fetch.
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct CachedMetadata {
    metadata: Arc<FederationMetadata>,
    fetched_at: Instant,
}

type Slot = Arc<tokio::sync::Mutex<Option<CachedMetadata>>>;

/// Caches metadata per address and lets only one fetch per address run at a time.
///
/// Callers for the same address queue on that address's slot. The first one fetches and stores
/// the document, everyone queued behind it finds the fresh copy and returns without touching
/// the network. Failures are not cached.
#[derive(Debug)]
pub struct MetadataCache {
    source: Arc<dyn MetadataSource>,
    ttl: Duration,
    timeout: Duration,
    slots: Mutex<HashMap<Url, Slot>>,
}

impl MetadataCache {
    pub fn new(source: Arc<dyn MetadataSource>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            source,
            ttl,
            timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, address: &Url) -> Slot {
        // a poisoned map only means another caller panicked mid-insert, the map itself is fine
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(address.clone()).or_default().clone()
    }

    #[tracing::instrument(skip_all, fields(address = %address), err(level = "warn"))]
    pub async fn fetch(&self, address: &Url) -> FederationResult<Arc<FederationMetadata>> {
        let slot = self.slot(address);
        let mut cached = slot.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl {
                tracing::trace!("serving cached federation metadata");
                return Ok(entry.metadata.clone());
            }
        }

        tracing::info!("fetching federation metadata");
        let metadata = tokio::time::timeout(self.timeout, self.source.fetch_metadata(address))
            .await
            .map_err(|_| {
                FederationError::MetadataUnreachable(format!(
                    "no response within {:?}",
                    self.timeout
                ))
            })??;
        let metadata = Arc::new(metadata);
        *cached = Some(CachedMetadata {
            metadata: metadata.clone(),
            fetched_at: Instant::now(),
        });
        Ok(metadata)
    }

    /// Drops the cached copy so the next [`MetadataCache::fetch`] goes to the network.
    pub async fn invalidate(&self, address: &Url) {
        let slot = self.slot(address);
        slot.lock().await.take();
    }
}
