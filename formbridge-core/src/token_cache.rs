//! Opt-in access token cache.
//!
//! Keyed by audience host. Each key has its own async lock, so concurrent
//! callers for the same audience share one acquisition while different
//! audiences proceed independently.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::token::AccessToken;

/// Default number of minutes before expiry at which a token is refreshed.
pub const DEFAULT_EXPIRY_BUFFER_MINUTES: i64 = 5;

type Slot = Arc<tokio::sync::Mutex<Option<AccessToken>>>;

/// Audience-keyed cache with single-flight acquisition.
#[derive(Debug)]
pub struct TokenCache {
    expiry_buffer: chrono::Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self {
            expiry_buffer: chrono::Duration::minutes(DEFAULT_EXPIRY_BUFFER_MINUTES),
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl TokenCache {
    /// Create a cache that treats tokens as stale `expiry_buffer` before expiry.
    pub fn new(expiry_buffer: Duration) -> Self {
        Self {
            expiry_buffer: chrono::Duration::from_std(expiry_buffer)
                .unwrap_or_else(|_| chrono::Duration::minutes(DEFAULT_EXPIRY_BUFFER_MINUTES)),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, audience: &str) -> Slot {
        self.slots
            .lock()
            .entry(audience.to_ascii_lowercase())
            .or_default()
            .clone()
    }

    /// Return a fresh cached token for `audience`, or run `acquire` and cache
    /// its result.
    ///
    /// Failed acquisitions are not cached.
    pub async fn get_or_acquire<F, Fut, E>(&self, audience: &str, acquire: F) -> Result<AccessToken, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken, E>>,
    {
        let slot = self.slot(audience);
        let mut cached = slot.lock().await;

        if let Some(token) = cached.as_ref() {
            if !token.expires_within(self.expiry_buffer) {
                debug!("Using cached token for {}", audience);
                return Ok(token.clone());
            }
            debug!("Cached token for {} is stale", audience);
        }

        let token = acquire().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token for `audience` if it is still `rejected`.
    ///
    /// The slot stays registered, so a token acquired concurrently lands
    /// where later callers look and is not discarded.
    pub async fn invalidate(&self, audience: &str, rejected: &AccessToken) {
        let slot = self.slots.lock().get(&audience.to_ascii_lowercase()).cloned();
        let Some(slot) = slot else {
            return;
        };

        let mut cached = slot.lock().await;
        if cached
            .as_ref()
            .is_some_and(|token| token.secret() == rejected.secret())
        {
            *cached = None;
            debug!("Invalidated cached token for {}", audience);
        }
    }
}
