use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{HubError, HubResult};

pub const DEFAULT_WECOM_API_BASE: &str = "https://qyapi.weixin.qq.com";
pub const DEFAULT_MARKET_URL: &str = "https://datacenter-web.eastmoney.com/api/data/v1/get?sortColumns=PUBLIC_START_DATE&sortTypes=-1&pageSize=50&pageNumber=1&reportName=RPT_BOND_CB_LIST&columns=CONVERT_STOCK_CODE,SECURITY_CODE,SECURITY_NAME_ABBR,LISTING_DATE,PUBLIC_START_DATE&quoteColumns=f2~01~CONVERT_STOCK_CODE~CONVERT_STOCK_PRICE,f235~10~SECURITY_CODE~TRANSFER_PRICE,f236~10~SECURITY_CODE~TRANSFER_VALUE,f2~10~SECURITY_CODE~CURRENT_BOND_PRICE,f237~10~SECURITY_CODE~TRANSFER_PREMIUM_RATIO";
pub const DEFAULT_MARKET_LINK: &str = "https://data.eastmoney.com/kzz/default.html";

/// Root configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub wecom: WeComConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    /// RSS feed polling; the feed handler cannot be built without it
    #[serde(default)]
    pub feed: Option<FeedConfig>,
    /// Torrent client used by the feed handler to start downloads
    #[serde(default)]
    pub torrent: Option<TorrentConfig>,
    /// Daily bond listing/release notifications
    #[serde(default)]
    pub notification: Option<NotificationConfig>,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Provider-level settings shared by every application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeComConfig {
    /// Corporation id; also the receive id embedded in every envelope
    pub corp_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// User notified about operational problems (optional)
    #[serde(default)]
    pub admin_user: Option<String>,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

/// One WeCom application sharing the webhook endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identifier matched against the `X-App-Id` header
    pub app_id: String,
    pub agent_id: u64,
    pub corp_secret: String,
    /// Callback token used in the SHA-1 signature
    pub token: String,
    /// 43-character base64 AES key from the callback settings
    pub encoding_aes_key: String,
    /// Public URL prefix matched against the `X-Upstream` header
    #[serde(default)]
    pub url_prefix: Option<String>,
    /// Command handler bound to this application's agent id
    #[serde(default)]
    pub handler: Option<HandlerKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Feed,
    Subscription,
    Torrent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_dedup_purge_secs")]
    pub purge_interval_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: default_dedup_window_secs(),
            purge_interval_secs: default_dedup_purge_secs(),
        }
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Background worker pool for detached handler work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Pause before the single retry of a failed user notification
    #[serde(default = "default_report_retry_delay_ms")]
    pub report_retry_delay_ms: u64,
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
    /// How long shutdown waits for queued work before leaving it running
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            report_retry_delay_ms: default_report_retry_delay_ms(),
            dead_letter_capacity: default_dead_letter_capacity(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSchedule {
    pub start_delay_ms: u64,
    pub period_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySchedule {
    pub hour: u32,
    pub minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// RSS endpoint, including any access token query parameter
    pub url: String,
    /// Application used to push new-item digests
    pub agent_id: u64,
    #[serde(default = "default_broadcast")]
    pub recipients: String,
    /// Externally reachable base URL of this service, used for download links
    #[serde(default)]
    pub public_host: Option<String>,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_feed_refresh")]
    pub refresh: IntervalSchedule,
    #[serde(default = "default_feed_evict")]
    pub evict: IntervalSchedule,
    /// Upper bound of the random extra delay added before the first poll
    #[serde(default)]
    pub jitter_ms: u64,
}

impl FeedConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }
}

/// qBittorrent Web API access. The top-level instance is the default site;
/// `sites` lists further instances the torrent app can switch to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentConfig {
    #[serde(default = "default_site_name")]
    pub name: String,
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub sites: Vec<TorrentSite>,
    /// Words masked in listed torrent names while the filter is on
    #[serde(default)]
    pub hidden_words: Vec<String>,
}

impl TorrentConfig {
    /// Every site, the default one first.
    pub fn all_sites(&self) -> Vec<TorrentSite> {
        let mut sites = vec![TorrentSite {
            name: self.name.clone(),
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }];
        sites.extend(self.sites.iter().cloned());
        sites
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentSite {
    pub name: String,
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Application used to push the notification cards
    pub agent_id: u64,
    pub listing: DailySchedule,
    pub release: DailySchedule,
    #[serde(default = "default_market_link")]
    pub link_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    #[serde(default = "default_market_url")]
    pub url: String,
    #[serde(default = "default_market_attempts")]
    pub attempts: u32,
    #[serde(default = "default_market_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            url: default_market_url(),
            attempts: default_market_attempts(),
            retry_delay_ms: default_market_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionStoreConfig {
    /// JSON file the in-memory store is loaded from and saved to
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

impl HubConfig {
    pub fn from_toml_str(raw: &str) -> HubResult<Self> {
        let config: HubConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> HubResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HubError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject configurations that could only fail later at runtime.
    pub fn validate(&self) -> HubResult<()> {
        if self.wecom.apps.is_empty() {
            return Err(HubError::Config(
                "at least one [[wecom.apps]] entry is required".to_string(),
            ));
        }

        let mut agent_ids = HashSet::new();
        let mut app_ids = HashSet::new();
        for app in &self.wecom.apps {
            if !agent_ids.insert(app.agent_id) {
                return Err(HubError::Config(format!(
                    "duplicate agent_id {}",
                    app.agent_id
                )));
            }
            if !app_ids.insert(app.app_id.as_str()) {
                return Err(HubError::Config(format!("duplicate app_id '{}'", app.app_id)));
            }
            if app.encoding_aes_key.len() != 43 {
                return Err(HubError::Config(format!(
                    "app '{}': encoding_aes_key must be 43 characters",
                    app.app_id
                )));
            }
        }

        if self.dedup.window_secs == 0 || self.dedup.purge_interval_secs == 0 {
            return Err(HubError::Config(
                "dedup window and purge interval must be positive".to_string(),
            ));
        }
        if self.workers.count == 0 || self.workers.queue_capacity == 0 {
            return Err(HubError::Config(
                "workers.count and workers.queue_capacity must be positive".to_string(),
            ));
        }

        if let Some(feed) = &self.feed {
            for (name, schedule) in [("refresh", feed.refresh), ("evict", feed.evict)] {
                if schedule.period_ms == 0 {
                    return Err(HubError::Config(format!(
                        "feed.{}.period_ms must be positive",
                        name
                    )));
                }
            }
        }

        if let Some(notification) = &self.notification {
            for (name, daily) in [
                ("listing", notification.listing),
                ("release", notification.release),
            ] {
                if daily.hour > 23 || daily.minute > 59 {
                    return Err(HubError::Config(format!(
                        "notification.{} time {:02}:{:02} is out of range",
                        name, daily.hour, daily.minute
                    )));
                }
            }
        }

        if let Some(torrent) = &self.torrent {
            let mut names = HashSet::new();
            for site in torrent.all_sites() {
                if !names.insert(site.name.to_lowercase()) {
                    return Err(HubError::Config(format!(
                        "duplicate torrent site '{}'",
                        site.name
                    )));
                }
            }
        }

        for (name, value) in self.endpoint_urls() {
            Url::parse(value)
                .map_err(|e| HubError::Config(format!("{} '{}' is not a URL: {}", name, value, e)))?;
        }

        Ok(())
    }

    fn endpoint_urls(&self) -> Vec<(&'static str, &str)> {
        let mut urls = vec![
            ("wecom.api_base", self.wecom.api_base.as_str()),
            ("market.url", self.market.url.as_str()),
        ];
        if let Some(feed) = &self.feed {
            urls.push(("feed.url", feed.url.as_str()));
            if let Some(host) = &feed.public_host {
                urls.push(("feed.public_host", host.as_str()));
            }
        }
        if let Some(torrent) = &self.torrent {
            urls.push(("torrent.url", torrent.url.as_str()));
            for site in &torrent.sites {
                urls.push(("torrent.sites.url", site.url.as_str()));
            }
        }
        if let Some(notification) = &self.notification {
            urls.push(("notification.link_url", notification.link_url.as_str()));
        }
        urls
    }

    pub fn app_by_agent(&self, agent_id: u64) -> Option<&AppConfig> {
        self.wecom.apps.iter().find(|a| a.agent_id == agent_id)
    }
}

fn default_site_name() -> String {
    "default".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:5170".to_string()
}

fn default_api_base() -> String {
    DEFAULT_WECOM_API_BASE.to_string()
}

fn default_dedup_window_secs() -> u64 {
    60
}

fn default_dedup_purge_secs() -> u64 {
    60
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_report_retry_delay_ms() -> u64 {
    2000
}

fn default_dead_letter_capacity() -> usize {
    128
}

fn default_drain_grace_ms() -> u64 {
    5000
}

fn default_broadcast() -> String {
    "@all".to_string()
}

fn default_retention_hours() -> u64 {
    72
}

fn default_feed_refresh() -> IntervalSchedule {
    IntervalSchedule {
        start_delay_ms: 20,
        period_ms: 3_600_000,
    }
}

fn default_feed_evict() -> IntervalSchedule {
    IntervalSchedule {
        start_delay_ms: 0,
        period_ms: 3_600_000,
    }
}

fn default_market_url() -> String {
    DEFAULT_MARKET_URL.to_string()
}

fn default_market_link() -> String {
    DEFAULT_MARKET_LINK.to_string()
}

fn default_market_attempts() -> u32 {
    3
}

fn default_market_retry_delay_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[wecom]
corp_id = "ww0000"

[[wecom.apps]]
app_id = "feed"
agent_id = 1000009
corp_secret = "secret"
token = "token"
encoding_aes_key = "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2C"
handler = "feed"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = HubConfig::from_toml_str(MINIMAL).expect("config parses");
        assert_eq!(config.server.bind_addr, "0.0.0.0:5170");
        assert_eq!(config.wecom.api_base, DEFAULT_WECOM_API_BASE);
        assert_eq!(config.dedup.window_secs, 60);
        assert_eq!(config.workers.count, 4);
        assert_eq!(config.wecom.apps[0].handler, Some(HandlerKind::Feed));
        assert!(config.feed.is_none());
        assert_eq!(config.market.attempts, 3);
    }

    #[test]
    fn feed_section_defaults_schedules() {
        let raw = format!(
            "{}\n[feed]\nurl = \"https://example.org/rss\"\nagent_id = 1000009\n",
            MINIMAL
        );
        let config = HubConfig::from_toml_str(&raw).expect("config parses");
        let feed = config.feed.expect("feed section");
        assert_eq!(feed.recipients, "@all");
        assert_eq!(feed.retention_hours, 72);
        assert_eq!(feed.refresh.start_delay_ms, 20);
        assert_eq!(feed.refresh.period_ms, 3_600_000);
        assert_eq!(feed.evict.start_delay_ms, 0);
    }

    #[test]
    fn duplicate_agent_ids_are_rejected() {
        let raw = format!(
            "{}\n[[wecom.apps]]\napp_id = \"other\"\nagent_id = 1000009\ncorp_secret = \"s\"\ntoken = \"t\"\nencoding_aes_key = \"jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2C\"\n",
            MINIMAL
        );
        let err = HubConfig::from_toml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("duplicate agent_id"));
    }

    #[test]
    fn out_of_range_daily_time_is_rejected() {
        let raw = format!(
            "{}\n[notification]\nagent_id = 1000003\nlisting = {{ hour = 24, minute = 0 }}\nrelease = {{ hour = 1, minute = 0 }}\n",
            MINIMAL
        );
        let err = HubConfig::from_toml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn short_aes_key_is_rejected() {
        let raw = MINIMAL.replace(
            "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2C",
            "tooshort",
        );
        assert!(HubConfig::from_toml_str(&raw).is_err());
    }

    #[test]
    fn malformed_torrent_url_is_rejected() {
        let raw = format!(
            "{}\n[torrent]\nurl = \"qbittorrent-host\"\nusername = \"admin\"\npassword = \"pw\"\n",
            MINIMAL
        );
        let err = HubConfig::from_toml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("torrent.url"));
    }

    #[test]
    fn torrent_sites_follow_the_default_site() {
        let raw = format!(
            "{}\n[torrent]\nname = \"home\"\nurl = \"http://nas:8080\"\nusername = \"admin\"\npassword = \"pw\"\nhidden_words = [\"secret\"]\n\n[[torrent.sites]]\nname = \"seedbox\"\nurl = \"https://seedbox.example\"\nusername = \"u\"\npassword = \"p\"\n",
            MINIMAL
        );
        let config = HubConfig::from_toml_str(&raw).expect("config parses");
        let torrent = config.torrent.expect("torrent section");
        let names: Vec<_> = torrent.all_sites().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["home".to_string(), "seedbox".to_string()]);
        assert_eq!(torrent.hidden_words, vec!["secret".to_string()]);
    }

    #[test]
    fn duplicate_torrent_site_names_are_rejected() {
        let raw = format!(
            "{}\n[torrent]\nurl = \"http://nas:8080\"\nusername = \"admin\"\npassword = \"pw\"\n\n[[torrent.sites]]\nname = \"Default\"\nurl = \"https://seedbox.example\"\nusername = \"u\"\npassword = \"p\"\n",
            MINIMAL
        );
        let err = HubConfig::from_toml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("duplicate torrent site"));
    }
}
