use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Stable internal id; never reused within a process.
pub type EntryId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    /// Enclosure URL handed to the torrent client
    pub url: String,
    pub episode_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// An available item together with its current display key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedItem {
    pub key: usize,
    pub item: FeedItem,
}

/// Discovered feed items. Holding the guard from [`FeedCache::lock`] is the
/// only way to read or mutate, so a poll can keep it across its fetch.
#[derive(Default)]
pub struct FeedCache {
    state: Mutex<FeedState>,
}

impl FeedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().await
    }
}

/// Two views over the same entries: `seen` titles only ever grow, while the
/// arena holds the currently available items. Display keys are positions in
/// `projection` plus one, so they stay dense after any removal.
#[derive(Debug, Default)]
pub struct FeedState {
    next_id: EntryId,
    seen: HashSet<String>,
    arena: BTreeMap<EntryId, FeedItem>,
    projection: Vec<EntryId>,
}

impl FeedState {
    pub fn is_seen(&self, title: &str) -> bool {
        self.seen.contains(title)
    }

    /// Add a newly discovered item. Titles seen before (even if since
    /// evicted) are ignored and yield `None`.
    pub fn insert(&mut self, item: FeedItem) -> Option<KeyedItem> {
        if !self.seen.insert(item.title.clone()) {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.arena.insert(id, item.clone());
        self.projection.push(id);
        let key = self.projection.len();
        debug!("[FeedCache] [{}] {}", key, item.title);
        Some(KeyedItem { key, item })
    }

    pub fn get(&self, key: usize) -> Option<&FeedItem> {
        let id = self.projection.get(key.checked_sub(1)?)?;
        self.arena.get(id)
    }

    pub fn by_episode(&self, episode_id: &str) -> Option<KeyedItem> {
        self.list()
            .into_iter()
            .find(|k| k.item.episode_id.as_deref() == Some(episode_id))
    }

    pub fn list(&self) -> Vec<KeyedItem> {
        self.projection
            .iter()
            .enumerate()
            .filter_map(|(idx, id)| {
                self.arena.get(id).map(|item| KeyedItem {
                    key: idx + 1,
                    item: item.clone(),
                })
            })
            .collect()
    }

    /// Drop available items received before `cutoff` and renumber the rest.
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.arena.len();
        self.arena.retain(|_, item| {
            let keep = item.received_at >= cutoff;
            if !keep {
                info!("[FeedCache] Evicting '{}' (received {})", item.title, item.received_at);
            }
            keep
        });
        self.rebuild();
        before - self.arena.len()
    }

    /// Forget every available item; seen titles are kept.
    pub fn clear_available(&mut self) -> usize {
        let removed = self.arena.len();
        self.arena.clear();
        self.rebuild();
        removed
    }

    pub fn available_len(&self) -> usize {
        self.projection.len()
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    fn rebuild(&mut self) {
        // BTreeMap iterates ids in ascending order, which is insertion order.
        self.projection = self.arena.keys().copied().collect();
    }
}
