use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::normalize;
use crate::error::{HubError, HubResult};
use crate::gateway::{HandlerOutcome, MessageHandler};
use crate::torrent::{TorrentInfo, TorrentManager};
use crate::wecom::{OutboundSender, ReceiveMessage};

pub const TORRENT_HELP: &str = "Available commands:\n\
L - list torrents\n\
A <url> - add a torrent URL\n\
D <id> - delete a torrent\n\
DF <id> - delete a torrent and its files\n\
P <id> - pause a torrent\n\
R <id> - resume a torrent\n\
S - list sites\n\
S <name> - switch to a site\n\
T - toggle the name filter";

static ADD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^a\s+(\S+)$").unwrap());
static ITEM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(df|d|p|r)\s+(\d+)$").unwrap());
static SITE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^s\s+([-\w]+)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentCommand {
    List,
    Add(String),
    Delete { id: usize, with_files: bool },
    Pause(usize),
    Resume(usize),
    Sites,
    SwitchSite(String),
    ToggleFilter,
}

impl TorrentCommand {
    pub fn parse(content: &str) -> Option<Self> {
        let text = normalize(content);
        if let Some(caps) = ITEM_RE.captures(&text) {
            let id = caps[2].parse::<usize>().ok()?;
            return match caps[1].to_ascii_uppercase().as_str() {
                "D" => Some(TorrentCommand::Delete {
                    id,
                    with_files: false,
                }),
                "DF" => Some(TorrentCommand::Delete {
                    id,
                    with_files: true,
                }),
                "P" => Some(TorrentCommand::Pause(id)),
                _ => Some(TorrentCommand::Resume(id)),
            };
        }
        if let Some(caps) = ADD_RE.captures(&text) {
            return Some(TorrentCommand::Add(caps[1].to_string()));
        }
        if let Some(caps) = SITE_RE.captures(&text) {
            return Some(TorrentCommand::SwitchSite(caps[1].to_string()));
        }
        match text.to_ascii_uppercase().as_str() {
            "L" => Some(TorrentCommand::List),
            "S" => Some(TorrentCommand::Sites),
            "T" => Some(TorrentCommand::ToggleFilter),
            _ => None,
        }
    }

    /// Site and filter commands touch local state only and are answered
    /// inline; everything else calls the Web API.
    fn is_local(&self) -> bool {
        matches!(
            self,
            TorrentCommand::Sites | TorrentCommand::SwitchSite(_) | TorrentCommand::ToggleFilter
        )
    }
}

/// Torrent management app. Torrents are numbered from 1 in the order the
/// client lists them, so a number is only meaningful until the list changes.
#[derive(Clone)]
pub struct TorrentHandler {
    client: Arc<dyn TorrentManager>,
    hidden_words: Arc<Vec<String>>,
    filter_on: Arc<AtomicBool>,
}

impl TorrentHandler {
    pub fn new(client: Arc<dyn TorrentManager>, hidden_words: Vec<String>) -> Self {
        Self {
            client,
            hidden_words: Arc::new(hidden_words),
            filter_on: Arc::new(AtomicBool::new(true)),
        }
    }

    pub async fn execute(&self, command: TorrentCommand) -> HubResult<Option<String>> {
        let text = match command {
            TorrentCommand::List => {
                let torrents = self.client.list().await?;
                if torrents.is_empty() {
                    "Item list is empty".to_string()
                } else {
                    torrents
                        .iter()
                        .enumerate()
                        .map(|(idx, t)| self.render(idx + 1, t))
                        .join("\n\n")
                }
            }
            TorrentCommand::Add(url) => {
                self.client.add_url(&url).await?;
                format!("Added {}", url)
            }
            TorrentCommand::Delete { id, with_files } => {
                let torrent = self.by_id(id).await?;
                self.client.delete(&torrent.hash, with_files).await?;
                if with_files {
                    format!("Deleted {} with its files", self.display_name(&torrent.name))
                } else {
                    format!("Deleted {}", self.display_name(&torrent.name))
                }
            }
            TorrentCommand::Pause(id) => {
                let torrent = self.by_id(id).await?;
                self.client.pause(&torrent.hash).await?;
                format!("Paused {}", self.display_name(&torrent.name))
            }
            TorrentCommand::Resume(id) => {
                let torrent = self.by_id(id).await?;
                self.client.resume(&torrent.hash).await?;
                format!("Resumed {}", self.display_name(&torrent.name))
            }
            TorrentCommand::Sites => self
                .client
                .sites()
                .iter()
                .map(|site| {
                    let mut line = site.name.clone();
                    if site.active {
                        line.push_str(" [active]");
                    }
                    if site.default {
                        line.push_str(" [default]");
                    }
                    line
                })
                .join("\n"),
            TorrentCommand::SwitchSite(name) => {
                let name = self.client.switch_site(&name)?;
                format!("Active site is now {}", name)
            }
            TorrentCommand::ToggleFilter => {
                let was_on = self.filter_on.fetch_xor(true, Ordering::SeqCst);
                format!("Filter is now {}", if was_on { "off" } else { "on" })
            }
        };
        Ok(Some(text))
    }

    async fn by_id(&self, id: usize) -> HubResult<TorrentInfo> {
        let torrents = self.client.list().await?;
        id.checked_sub(1)
            .and_then(|idx| torrents.into_iter().nth(idx))
            .ok_or_else(|| HubError::NotFound(format!("Item {} not found", id)))
    }

    fn display_name(&self, name: &str) -> String {
        if !self.filter_on.load(Ordering::SeqCst) {
            return name.to_string();
        }
        self.hidden_words
            .iter()
            .filter(|w| !w.is_empty())
            .fold(name.to_string(), |acc, word| acc.replace(word.as_str(), "**"))
    }

    fn render(&self, id: usize, torrent: &TorrentInfo) -> String {
        format!(
            "[{}] {} {} <{}> <{}%>",
            id,
            state_label(&torrent.state),
            self.display_name(&torrent.name),
            human_size(torrent.size),
            two_decimals(torrent.progress * 100.0)
        )
    }
}

fn state_label(state: &str) -> &'static str {
    match state {
        "error" | "missingFiles" => "error",
        "uploading" | "forcedUP" => "seeding",
        "pausedUP" | "stoppedUP" => "done",
        "stalledUP" => "seeding (stalled)",
        "queuedUP" => "seeding (queued)",
        "checkingUP" | "checkingDL" | "checkingResumeData" => "checking",
        "downloading" | "forcedDL" | "metaDL" => "downloading",
        "pausedDL" | "stoppedDL" => "paused",
        "stalledDL" => "stalled",
        "queuedDL" => "queued",
        _ => "unknown",
    }
}

fn human_size(bytes: i64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{}{}", two_decimals(value), UNITS[unit])
}

/// At most two decimals, without trailing zeros.
fn two_decimals(value: f64) -> String {
    let fixed = format!("{:.2}", value);
    fixed
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

#[async_trait]
impl MessageHandler for TorrentHandler {
    fn name(&self) -> &str {
        "torrent"
    }

    async fn handle(
        &self,
        message: &ReceiveMessage,
        _outbound: Arc<dyn OutboundSender>,
    ) -> HubResult<HandlerOutcome> {
        let Some(command) = TorrentCommand::parse(&message.content) else {
            return Ok(HandlerOutcome::Reply(TORRENT_HELP.to_string()));
        };
        debug!("[TorrentHandler] {} -> {:?}", message.from_user_name, command);

        if command.is_local() {
            let text = match self.execute(command).await {
                Ok(text) => text.unwrap_or_default(),
                Err(e) => e.to_string(),
            };
            return Ok(HandlerOutcome::Reply(text));
        }
        let handler = self.clone();
        Ok(HandlerOutcome::Background(Box::pin(async move {
            handler.execute(command).await
        })))
    }
}
