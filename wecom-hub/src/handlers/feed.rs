use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::normalize;
use crate::error::{HubError, HubResult};
use crate::feed::{FeedDownloads, FeedPoller};
use crate::gateway::{HandlerOutcome, MessageHandler};
use crate::wecom::{OutboundSender, ReceiveMessage};

pub const FEED_HELP: &str = "Available commands:\n\
ALL - list available items\n\
REFRESH - poll the feed now\n\
FORCEREFRESH - clear available items and poll again\n\
CLEAR - remove expired items\n\
CLEARALL - remove all available items\n\
<number> - download the item with that number\n\
ADD <url> - download a torrent URL";

static ADD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^add\s+(\S+)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    All,
    Refresh,
    ForceRefresh,
    Clear,
    ClearAll,
    Download(usize),
    Add(String),
}

impl FeedCommand {
    pub fn parse(content: &str) -> Option<Self> {
        let text = normalize(content);
        if let Ok(key) = text.parse::<usize>() {
            return Some(FeedCommand::Download(key));
        }
        if let Some(caps) = ADD_RE.captures(&text) {
            return Some(FeedCommand::Add(caps[1].to_string()));
        }
        match text.to_ascii_uppercase().as_str() {
            "ALL" => Some(FeedCommand::All),
            "REFRESH" => Some(FeedCommand::Refresh),
            "FORCEREFRESH" => Some(FeedCommand::ForceRefresh),
            "CLEAR" => Some(FeedCommand::Clear),
            "CLEARALL" => Some(FeedCommand::ClearAll),
            _ => None,
        }
    }
}

/// Feed maintenance and download commands. Every recognised command runs on
/// the worker pool; its result is pushed back to the sender.
pub struct FeedHandler {
    poller: Arc<FeedPoller>,
    downloads: Option<Arc<FeedDownloads>>,
}

impl FeedHandler {
    pub fn new(poller: Arc<FeedPoller>, downloads: Option<Arc<FeedDownloads>>) -> Self {
        Self { poller, downloads }
    }

    /// Execute a command and return the text reported to the user.
    pub async fn execute(&self, command: FeedCommand) -> HubResult<Option<String>> {
        let text = match command {
            FeedCommand::All => {
                let items = self.poller.list().await;
                if items.is_empty() {
                    "No items available".to_string()
                } else {
                    items.iter().map(|k| self.poller.render_item(k)).join("\n\n")
                }
            }
            FeedCommand::Refresh => {
                // New items are broadcast by the poller itself.
                let added = self.poller.poll_and_notify().await;
                format!("Refresh done, {} new items", added)
            }
            FeedCommand::ForceRefresh => {
                let added = self.poller.force_refresh().await?;
                format!("Force refresh done, {} new items", added)
            }
            FeedCommand::Clear => {
                let removed = self.poller.evict_expired().await;
                format!("Removed {} expired items", removed)
            }
            FeedCommand::ClearAll => {
                let removed = self.poller.clear_all().await;
                format!("Removed {} items", removed)
            }
            FeedCommand::Download(key) => self.downloads()?.by_key(key).await?,
            FeedCommand::Add(url) => self.downloads()?.by_url(&url).await?,
        };
        Ok(Some(text))
    }

    fn downloads(&self) -> HubResult<&Arc<FeedDownloads>> {
        self.downloads
            .as_ref()
            .ok_or_else(|| HubError::Config("no torrent client configured".to_string()))
    }
}

#[async_trait]
impl MessageHandler for FeedHandler {
    fn name(&self) -> &str {
        "feed"
    }

    async fn handle(
        &self,
        message: &ReceiveMessage,
        _outbound: Arc<dyn OutboundSender>,
    ) -> HubResult<HandlerOutcome> {
        let Some(command) = FeedCommand::parse(&message.content) else {
            return Ok(HandlerOutcome::Reply(FEED_HELP.to_string()));
        };
        debug!("[FeedHandler] {} -> {:?}", message.from_user_name, command);

        let handler = FeedHandler {
            poller: self.poller.clone(),
            downloads: self.downloads.clone(),
        };
        Ok(HandlerOutcome::Background(Box::pin(async move {
            handler.execute(command).await
        })))
    }
}
