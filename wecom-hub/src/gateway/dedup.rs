use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

/// Identity of one webhook delivery attempt. The provider resends the exact
/// same triple when it retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryKey {
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
}

impl DeliveryKey {
    pub fn new(
        signature: impl Into<String>,
        timestamp: impl Into<String>,
        nonce: impl Into<String>,
    ) -> Self {
        Self {
            signature: signature.into(),
            timestamp: timestamp.into(),
            nonce: nonce.into(),
        }
    }
}

struct SeenDelivery {
    last_seen: Instant,
    /// Body answered to the first delivery, once it is known
    response: Option<String>,
}

/// Time-windowed idempotency guard. Entries expire `window` after they were
/// last seen; expired entries are only dropped by [`DedupCache::purge_expired`].
pub struct DedupCache {
    window: Duration,
    seen: DashMap<DeliveryKey, SeenDelivery>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: DashMap::new(),
        }
    }

    /// Record `key` and report whether it was already seen within the window.
    pub fn is_duplicate(&self, key: &DeliveryKey) -> bool {
        self.check(key).is_some()
    }

    /// Record `key`; for a repeat within the window, return the response
    /// cached for the first delivery. A repeat that arrives before that
    /// response was recorded gets an empty body.
    pub fn check(&self, key: &DeliveryKey) -> Option<String> {
        self.check_at(key, Instant::now())
    }

    pub(crate) fn check_at(&self, key: &DeliveryKey, now: Instant) -> Option<String> {
        match self.seen.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let seen = entry.get_mut();
                let fresh = now.saturating_duration_since(seen.last_seen) < self.window;
                seen.last_seen = now;
                if fresh {
                    Some(seen.response.clone().unwrap_or_default())
                } else {
                    seen.response = None;
                    None
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(SeenDelivery {
                    last_seen: now,
                    response: None,
                });
                None
            }
        }
    }

    /// Remember the response given to the first delivery of `key`.
    pub fn record_response(&self, key: &DeliveryKey, body: String) {
        if let Some(mut seen) = self.seen.get_mut(key) {
            seen.response = Some(body);
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub(crate) fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, seen| now.saturating_duration_since(seen.last_seen) < self.window);
        let removed = before.saturating_sub(self.seen.len());
        if removed > 0 {
            debug!("[Dedup] Purged {} expired delivery keys", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
