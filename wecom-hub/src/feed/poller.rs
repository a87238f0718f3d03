use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use itertools::Itertools;
use tracing::{info, trace, warn};

use super::cache::{FeedCache, FeedItem, FeedState, KeyedItem};
use super::rss::{episode_id, parse_rss, FeedEntry};
use crate::config::FeedConfig;
use crate::error::HubResult;
use crate::scheduler::{job_action, Scheduler, TriggerPolicy};
use crate::wecom::OutboundSender;

pub const REFRESH_JOB: &str = "feed-refresh";
pub const EVICT_JOB: &str = "feed-evict";

#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self) -> HubResult<Vec<FeedEntry>>;
}

pub struct HttpFeedSource {
    http: reqwest::Client,
    url: String,
}

impl HttpFeedSource {
    pub fn new(url: impl Into<String>) -> HubResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self) -> HubResult<Vec<FeedEntry>> {
        let body = self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_rss(&body)
    }
}

/// Polls the feed into the cache and broadcasts digests of new items.
pub struct FeedPoller {
    cache: Arc<FeedCache>,
    source: Arc<dyn FeedSource>,
    outbound: Arc<dyn OutboundSender>,
    agent_id: u64,
    recipients: String,
    public_host: Option<String>,
    retention: chrono::Duration,
}

impl FeedPoller {
    pub fn new(
        config: &FeedConfig,
        cache: Arc<FeedCache>,
        source: Arc<dyn FeedSource>,
        outbound: Arc<dyn OutboundSender>,
    ) -> Self {
        Self {
            cache,
            source,
            outbound,
            agent_id: config.agent_id,
            recipients: config.recipients.clone(),
            public_host: config
                .public_host
                .as_ref()
                .map(|h| h.trim_end_matches('/').to_string()),
            retention: config.retention(),
        }
    }

    pub fn cache(&self) -> &Arc<FeedCache> {
        &self.cache
    }

    /// Fetch and ingest under the cache lock; returns the newly added items.
    pub async fn poll(&self) -> HubResult<Vec<KeyedItem>> {
        let mut state = self.cache.lock().await;
        self.poll_locked(&mut state).await
    }

    async fn poll_locked(&self, state: &mut FeedState) -> HubResult<Vec<KeyedItem>> {
        let entries = self.source.fetch().await?;
        info!("[FeedPoller] Fetched {} entries", entries.len());

        let mut added = Vec::new();
        for entry in entries {
            let Some(url) = entry.enclosure_url else {
                warn!("[FeedPoller] Entry without enclosure skipped: {}", entry.title);
                continue;
            };
            if state.is_seen(&entry.title) {
                trace!("[FeedPoller] Already seen: {}", entry.title);
                continue;
            }
            let item = FeedItem {
                episode_id: episode_id(&url),
                title: entry.title,
                url,
                received_at: Utc::now(),
            };
            if let Some(keyed) = state.insert(item) {
                info!(
                    "[FeedPoller] New item [{}]: {} ({})",
                    keyed.key, keyed.item.title, keyed.item.url
                );
                added.push(keyed);
            }
        }
        Ok(added)
    }

    /// Scheduled path: fetch failures only warn and leave the cache as is.
    pub async fn poll_and_notify(&self) -> usize {
        let added = match self.poll().await {
            Ok(added) => added,
            Err(e) => {
                warn!("[FeedPoller] Feed fetch failed, will retry next run: {}", e);
                return 0;
            }
        };
        self.notify(&added).await;
        added.len()
    }

    /// Empty the available view and re-poll without releasing the lock.
    pub async fn force_refresh(&self) -> HubResult<usize> {
        let added = {
            let mut state = self.cache.lock().await;
            let cleared = state.clear_available();
            info!("[FeedPoller] Force refresh cleared {} items", cleared);
            self.poll_locked(&mut state).await?
        };
        self.notify(&added).await;
        Ok(added.len())
    }

    pub async fn evict_expired(&self) -> usize {
        let cutoff = Utc::now() - self.retention;
        let removed = self.cache.lock().await.evict_older_than(cutoff);
        if removed > 0 {
            info!("[FeedPoller] Evicted {} expired items", removed);
        }
        removed
    }

    pub async fn clear_all(&self) -> usize {
        self.cache.lock().await.clear_available()
    }

    pub async fn list(&self) -> Vec<KeyedItem> {
        self.cache.lock().await.list()
    }

    pub fn render_item(&self, keyed: &KeyedItem) -> String {
        let line = format!("{}: {}", keyed.key, keyed.item.title);
        match (&self.public_host, &keyed.item.episode_id) {
            (Some(host), Some(id)) => format!("{}\n{}/feed/add?episode_id={}", line, host, id),
            _ => line,
        }
    }

    /// Items separated by blank lines; `None` when there is nothing to say.
    pub fn digest(&self, items: &[KeyedItem]) -> Option<String> {
        if items.is_empty() {
            return None;
        }
        Some(items.iter().map(|k| self.render_item(k)).join("\n\n"))
    }

    async fn notify(&self, added: &[KeyedItem]) {
        let Some(content) = self.digest(added) else {
            return;
        };
        info!(
            "[FeedPoller] Sending {} new items to {}",
            added.len(),
            self.recipients
        );
        if let Err(e) = self
            .outbound
            .send_text(self.agent_id, &self.recipients, &content)
            .await
        {
            warn!("[FeedPoller] Digest delivery failed: {}", e);
        }
    }

    /// Arm the refresh and eviction jobs on `scheduler`.
    pub fn register_jobs(
        self: &Arc<Self>,
        scheduler: &Scheduler,
        config: &FeedConfig,
    ) -> HubResult<()> {
        let poller = self.clone();
        let refresh = job_action(move || {
            let poller = poller.clone();
            async move {
                poller.poll_and_notify().await;
                Ok(())
            }
        });
        scheduler.arm(
            REFRESH_JOB,
            TriggerPolicy::try_from(config.refresh)?,
            Duration::from_millis(config.jitter_ms),
            refresh,
        )?;

        let poller = self.clone();
        let evict = job_action(move || {
            let poller = poller.clone();
            async move {
                poller.evict_expired().await;
                Ok(())
            }
        });
        scheduler.arm(
            EVICT_JOB,
            TriggerPolicy::try_from(config.evict)?,
            Duration::ZERO,
            evict,
        )?;
        Ok(())
    }
}
