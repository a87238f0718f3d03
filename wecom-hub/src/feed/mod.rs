//! RSS feed ingestion: the keyed item cache, the poller that fills it and
//! the download hand-off used by the feed commands and `/feed/add`.

pub mod cache;
pub mod poller;
pub mod rss;

use std::sync::Arc;

use tracing::info;

pub use cache::{FeedCache, FeedItem, FeedState, KeyedItem};
pub use poller::{FeedPoller, FeedSource, HttpFeedSource};
pub use rss::{episode_id, parse_rss, FeedEntry};

use crate::error::{HubError, HubResult};
use crate::torrent::TorrentClient;

/// Resolves cached items and hands their URLs to the torrent client.
pub struct FeedDownloads {
    cache: Arc<FeedCache>,
    torrent: Arc<dyn TorrentClient>,
}

impl FeedDownloads {
    pub fn new(cache: Arc<FeedCache>, torrent: Arc<dyn TorrentClient>) -> Self {
        Self { cache, torrent }
    }

    pub async fn by_key(&self, key: usize) -> HubResult<String> {
        // Clone out so the cache lock is not held during the download call.
        let item = self.cache.lock().await.get(key).cloned();
        let item = item.ok_or_else(|| HubError::NotFound(format!("Item {} not found", key)))?;
        self.start(&item).await
    }

    pub async fn by_episode(&self, episode_id: &str) -> HubResult<String> {
        let keyed = self.cache.lock().await.by_episode(episode_id);
        let keyed = keyed.ok_or_else(|| {
            HubError::NotFound(format!("Episode {} not found", episode_id))
        })?;
        self.start(&keyed.item).await
    }

    pub async fn by_url(&self, url: &str) -> HubResult<String> {
        self.torrent.add_url(url).await?;
        Ok(format!("Added torrent from {}", url))
    }

    async fn start(&self, item: &FeedItem) -> HubResult<String> {
        self.torrent.add_url(&item.url).await?;
        info!("[FeedDownloads] Started '{}'", item.title);
        Ok(format!("Added torrent of {}", item.title))
    }
}
