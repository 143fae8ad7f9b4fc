//! Typed access to the persisted job collection.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::jobs::model::Job;
use crate::store::traits::BlobStore;

/// Key the collection is written to.
pub const JOBS_KEY: &str = "ecocompute_jobs_v1";

/// Older key still honoured on read.
pub const LEGACY_JOBS_KEY: &str = "jobs";

/// Keys checked on load, in order.
const READ_KEYS: &[&str] = &[JOBS_KEY, LEGACY_JOBS_KEY];

/// Ordered job collection (most recently created first) over a blob store.
///
/// `load()` and `save()` are whole-collection operations. There is no
/// compare-and-swap: concurrent writers each replace the collection wholesale.
#[derive(Clone)]
pub struct JobStore {
    blobs: Arc<dyn BlobStore>,
}

impl JobStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Load the collection. Absent or corrupt entries are skipped and the
    /// next key is tried; when nothing usable is found the collection is empty.
    pub async fn load(&self) -> Vec<Job> {
        for key in READ_KEYS {
            let raw = match self.blobs.get(key).await {
                Ok(Some(raw)) if !raw.trim().is_empty() => raw,
                Ok(_) => continue,
                Err(e) => {
                    warn!(key, error = %e, "Failed to read job collection, trying next key");
                    continue;
                }
            };
            match serde_json::from_str::<Vec<Job>>(&raw) {
                Ok(jobs) => {
                    debug!(key, count = jobs.len(), "Loaded job collection");
                    return jobs;
                }
                Err(e) => {
                    warn!(key, error = %e, "Ignoring unreadable job collection");
                }
            }
        }
        Vec::new()
    }

    /// Replace the whole collection under the canonical key.
    pub async fn save(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(jobs)?;
        self.blobs.set(JOBS_KEY, &raw).await
    }
}
