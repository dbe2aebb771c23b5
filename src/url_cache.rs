//! URL Cache Module
//! Resolved remote urls keyed by media id, valid until their TTL runs out

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::database::{unix_now, Database};
use crate::error::Result;
use crate::media_id::MediaId;

#[derive(Clone)]
pub struct UrlCache {
    db: Arc<Mutex<Database>>,
}

impl UrlCache {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// Cached url, or `None` when absent or expired.
    pub fn get(&self, id: &MediaId) -> Result<Option<String>> {
        Ok(self.db.lock().get_resolved_url(id.as_str(), unix_now())?)
    }

    /// Store `url` for `id`, replacing any previous value and expiry.
    pub fn put(&self, id: &MediaId, url: &str, ttl: Duration) -> Result<()> {
        let expires_at = unix_now().saturating_add(ttl.as_secs() as i64);
        self.db.lock().put_resolved_url(id.as_str(), url, expires_at)?;
        Ok(())
    }

    /// Drop a url the upstream host has rejected.
    pub fn invalidate(&self, id: &MediaId) -> Result<()> {
        if self.db.lock().delete_resolved_url(id.as_str())? {
            log::debug!("invalidated cached url for {}", id);
        }
        Ok(())
    }
}
