//! Composition root: builds every shared component from a [`HubConfig`]
//! and owns their lifetimes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::config::{HandlerKind, HubConfig};
use crate::error::{HubError, HubResult};
use crate::feed::{FeedCache, FeedDownloads, FeedPoller, HttpFeedSource};
use crate::gateway::{
    serve, DedupCache, Dispatcher, GatewayState, HandlerRegistry, MessageHandler, WorkerPool,
};
use crate::handlers::{FeedHandler, SubscriptionHandler, TorrentHandler};
use crate::market::{EastmoneyClient, MarketDataSource};
use crate::notification::NotificationService;
use crate::scheduler::{job_action, Scheduler, TriggerPolicy};
use crate::subscription::{InMemorySubscriptionStore, SubscriptionService, SubscriptionStore};
use crate::torrent::{QbittorrentClient, TorrentClient, TorrentManager};
use crate::wecom::{Keyring, OutboundSender, WeComClient};

pub const DEDUP_PURGE_JOB: &str = "dedup-purge";

pub struct HubApp {
    config: HubConfig,
    scheduler: Scheduler,
    dedup: Arc<DedupCache>,
    workers: Arc<WorkerPool>,
    registry: Arc<HandlerRegistry>,
    state: GatewayState,
    feed: Option<Arc<FeedPoller>>,
    notifications: Option<Arc<NotificationService>>,
}

impl HubApp {
    /// Build against the real provider API.
    pub fn build(config: HubConfig) -> HubResult<Self> {
        let outbound: Arc<dyn OutboundSender> = Arc::new(WeComClient::new(&config.wecom)?);
        Self::build_with_sender(config, outbound)
    }

    /// Build with a custom outbound channel (dry runs, tests). Starts the
    /// worker pool, so it must be called inside a tokio runtime.
    pub fn build_with_sender(
        config: HubConfig,
        outbound: Arc<dyn OutboundSender>,
    ) -> HubResult<Self> {
        config.validate()?;

        let keyring = Keyring::from_apps(&config.wecom.corp_id, &config.wecom.apps)?;
        let dedup = Arc::new(DedupCache::new(config.dedup.window()));
        let workers = Arc::new(WorkerPool::start(&config.workers, outbound.clone()));

        let feed = match &config.feed {
            Some(feed_config) => {
                let source = Arc::new(HttpFeedSource::new(feed_config.url.clone())?);
                Some(Arc::new(FeedPoller::new(
                    feed_config,
                    Arc::new(FeedCache::new()),
                    source,
                    outbound.clone(),
                )))
            }
            None => None,
        };
        // One client so a site switch in the torrent app also moves feed downloads.
        let torrent = match &config.torrent {
            Some(torrent) => Some(Arc::new(QbittorrentClient::new(torrent)?)),
            None => None,
        };
        let feed_downloads = match (&feed, &torrent) {
            (Some(poller), Some(client)) => {
                let client: Arc<dyn TorrentClient> = client.clone();
                Some(Arc::new(FeedDownloads::new(poller.cache().clone(), client)))
            }
            _ => None,
        };

        let wants_market = config.notification.is_some()
            || config
                .wecom
                .apps
                .iter()
                .any(|a| a.handler == Some(HandlerKind::Subscription));
        let bonds = if wants_market {
            let store: Arc<dyn SubscriptionStore> = match &config.subscriptions.snapshot_path {
                Some(path) => Arc::new(InMemorySubscriptionStore::with_snapshot(path)?),
                None => Arc::new(InMemorySubscriptionStore::new()),
            };
            let market: Arc<dyn MarketDataSource> = Arc::new(EastmoneyClient::new(&config.market)?);
            Some((store, market))
        } else {
            None
        };

        let notifications = match (&config.notification, &bonds) {
            (Some(notification), Some((store, market))) => {
                Some(Arc::new(NotificationService::new(
                    notification,
                    store.clone(),
                    market.clone(),
                    outbound.clone(),
                )))
            }
            _ => None,
        };

        let mut registry = HandlerRegistry::new();
        for app in &config.wecom.apps {
            let Some(kind) = app.handler else {
                continue;
            };
            match kind {
                HandlerKind::Feed => {
                    let poller = feed.clone();
                    let downloads = feed_downloads.clone();
                    registry.register(app.agent_id, move || {
                        let poller = poller.clone().ok_or_else(|| {
                            HubError::Config(
                                "feed handler configured without a [feed] section".to_string(),
                            )
                        })?;
                        let handler: Arc<dyn MessageHandler> =
                            Arc::new(FeedHandler::new(poller, downloads.clone()));
                        Ok(handler)
                    })?;
                }
                HandlerKind::Subscription => {
                    let bonds = bonds.clone();
                    registry.register(app.agent_id, move || {
                        let (store, market) = bonds.clone().ok_or_else(|| {
                            HubError::Config("subscription store unavailable".to_string())
                        })?;
                        let service = Arc::new(SubscriptionService::new(store, market));
                        let handler: Arc<dyn MessageHandler> =
                            Arc::new(SubscriptionHandler::new(service));
                        Ok(handler)
                    })?;
                }
                HandlerKind::Torrent => {
                    let client = torrent.clone();
                    let hidden_words = config
                        .torrent
                        .as_ref()
                        .map(|t| t.hidden_words.clone())
                        .unwrap_or_default();
                    registry.register(app.agent_id, move || {
                        let client: Arc<dyn TorrentManager> = client.clone().ok_or_else(|| {
                            HubError::Config(
                                "torrent handler configured without a [torrent] section"
                                    .to_string(),
                            )
                        })?;
                        let handler: Arc<dyn MessageHandler> =
                            Arc::new(TorrentHandler::new(client, hidden_words.clone()));
                        Ok(handler)
                    })?;
                }
            }
        }
        let registry = Arc::new(registry);

        let dispatcher = Arc::new(Dispatcher::new(
            keyring,
            dedup.clone(),
            registry.clone(),
            workers.clone(),
            outbound,
        ));
        let state = GatewayState {
            dispatcher,
            feed_downloads,
        };

        Ok(Self {
            config,
            scheduler: Scheduler::new(),
            dedup,
            workers,
            registry,
            state,
            feed,
            notifications,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn state(&self) -> GatewayState {
        self.state.clone()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// Build every registered handler once, surfacing factory errors early.
    pub fn check(&self) -> HubResult<()> {
        for agent_id in self.registry.agent_ids() {
            if self.registry.resolve(agent_id)?.is_none() {
                return Err(HubError::Config(format!(
                    "agent {} has no handler after build",
                    agent_id
                )));
            }
        }
        Ok(())
    }

    /// Arm the dedup purge, feed and notification jobs.
    pub fn start_jobs(&self) -> HubResult<()> {
        let purge_every = Duration::from_secs(self.config.dedup.purge_interval_secs);
        let dedup = self.dedup.clone();
        self.scheduler.arm(
            DEDUP_PURGE_JOB,
            TriggerPolicy::interval(purge_every, purge_every)?,
            Duration::ZERO,
            job_action(move || {
                let dedup = dedup.clone();
                async move {
                    dedup.purge_expired();
                    Ok(())
                }
            }),
        )?;

        if let (Some(poller), Some(feed_config)) = (&self.feed, &self.config.feed) {
            poller.register_jobs(&self.scheduler, feed_config)?;
        }
        if let (Some(service), Some(notification)) = (&self.notifications, &self.config.notification)
        {
            service.register_jobs(&self.scheduler, notification)?;
        }
        info!("[HubApp] Jobs armed: {}", self.scheduler.job_names().join(", "));
        Ok(())
    }

    /// Serve until `shutdown` resolves, then stop jobs and drain the workers.
    pub async fn run<F>(&self, shutdown: F) -> HubResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.check()?;
        self.start_jobs()?;
        let served = serve(&self.config.server.bind_addr, self.state(), shutdown).await;
        if let Err(e) = &served {
            error!("[HubApp] Gateway stopped with error: {}", e);
        }
        self.shutdown().await;
        served
    }

    /// Stop the jobs and drain the workers, waiting at most
    /// `workers.drain_grace_ms` for work already queued.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        if self.workers.drain().await {
            info!("[HubApp] Shutdown complete");
        } else {
            info!("[HubApp] Shutdown complete, background work left running");
        }
    }
}
