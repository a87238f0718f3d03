//! qBittorrent Web API access: download hand-off for the feed, and the
//! list/delete/pause/resume/site operations behind the torrent app.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info};

use crate::config::{TorrentConfig, TorrentSite};
use crate::error::{HubError, HubResult};

#[async_trait]
pub trait TorrentClient: Send + Sync {
    /// Ask the client to download the torrent behind `url`.
    async fn add_url(&self, url: &str) -> HubResult<()>;
}

/// One row of `/api/v2/torrents/info`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TorrentInfo {
    pub hash: String,
    pub name: String,
    #[serde(default)]
    pub size: i64,
    /// 0.0 ..= 1.0
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub state: String,
}

/// A configured site as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteEntry {
    pub name: String,
    pub active: bool,
    pub default: bool,
}

/// Operations of the torrent management app. Torrents are addressed by
/// hash; display numbering is the caller's concern.
#[async_trait]
pub trait TorrentManager: TorrentClient {
    async fn list(&self) -> HubResult<Vec<TorrentInfo>>;
    async fn delete(&self, hash: &str, delete_files: bool) -> HubResult<()>;
    async fn pause(&self, hash: &str) -> HubResult<()>;
    async fn resume(&self, hash: &str) -> HubResult<()>;
    fn sites(&self) -> Vec<SiteEntry>;
    /// Make the named site (case-insensitive) the target of later calls.
    fn switch_site(&self, name: &str) -> HubResult<String>;
}

pub struct QbittorrentClient {
    http: reqwest::Client,
    /// Default site first
    sites: Vec<TorrentSite>,
    active: RwLock<usize>,
}

impl QbittorrentClient {
    pub fn new(config: &TorrentConfig) -> HubResult<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(30))
            .build()?;
        let sites = config
            .all_sites()
            .into_iter()
            .map(|mut site| {
                site.url = site.url.trim_end_matches('/').to_string();
                site
            })
            .collect();
        Ok(Self {
            http,
            sites,
            active: RwLock::new(0),
        })
    }

    fn active_site(&self) -> HubResult<&TorrentSite> {
        let idx = *self
            .active
            .read()
            .map_err(|_| HubError::Config("torrent site lock poisoned".to_string()))?;
        self.sites
            .get(idx)
            .ok_or_else(|| HubError::Config("no torrent site configured".to_string()))
    }

    /// Log in to the active site; returns it so the caller talks to the
    /// same site even if another request switches in between.
    async fn login(&self) -> HubResult<&TorrentSite> {
        let site = self.active_site()?;
        let response = self
            .http
            .post(format!("{}/api/v2/auth/login", site.url))
            .form(&[
                ("username", site.username.as_str()),
                ("password", site.password.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        // qBittorrent answers 200 "Fails." on bad credentials.
        if body.trim().eq_ignore_ascii_case("fails.") {
            return Err(HubError::Upstream(format!(
                "qBittorrent site '{}' rejected the configured credentials",
                site.name
            )));
        }
        Ok(site)
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> HubResult<()> {
        let site = self.login().await?;
        self.http
            .post(format!("{}{}", site.url, path))
            .form(form)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Log the outcome of a torrent operation and pass it through.
fn logged<T>(result: HubResult<T>, what: &str) -> HubResult<T> {
    match &result {
        Ok(_) => info!("[Torrent] {}", what),
        Err(e) => error!("[Torrent] {} failed: {}", what, e),
    }
    result
}

#[async_trait]
impl TorrentClient for QbittorrentClient {
    async fn add_url(&self, url: &str) -> HubResult<()> {
        let result = self.post_form("/api/v2/torrents/add", &[("urls", url)]).await;
        logged(result, &format!("Add {}", url))
    }
}

#[async_trait]
impl TorrentManager for QbittorrentClient {
    async fn list(&self) -> HubResult<Vec<TorrentInfo>> {
        let site = self.login().await?;
        let torrents = self
            .http
            .get(format!("{}/api/v2/torrents/info", site.url))
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<TorrentInfo>>()
            .await?;
        Ok(torrents)
    }

    async fn delete(&self, hash: &str, delete_files: bool) -> HubResult<()> {
        let delete_files = if delete_files { "true" } else { "false" };
        let result = self
            .post_form(
                "/api/v2/torrents/delete",
                &[("hashes", hash), ("deleteFiles", delete_files)],
            )
            .await;
        logged(result, &format!("Delete {} (files: {})", hash, delete_files))
    }

    async fn pause(&self, hash: &str) -> HubResult<()> {
        let result = self
            .post_form("/api/v2/torrents/pause", &[("hashes", hash)])
            .await;
        logged(result, &format!("Pause {}", hash))
    }

    async fn resume(&self, hash: &str) -> HubResult<()> {
        let result = self
            .post_form("/api/v2/torrents/resume", &[("hashes", hash)])
            .await;
        logged(result, &format!("Resume {}", hash))
    }

    fn sites(&self) -> Vec<SiteEntry> {
        let active = self.active.read().map(|idx| *idx).unwrap_or(0);
        self.sites
            .iter()
            .enumerate()
            .map(|(idx, site)| SiteEntry {
                name: site.name.clone(),
                active: idx == active,
                default: idx == 0,
            })
            .collect()
    }

    fn switch_site(&self, name: &str) -> HubResult<String> {
        let idx = self
            .sites
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| HubError::NotFound(format!("Site {} not found", name)))?;
        let mut active = self
            .active
            .write()
            .map_err(|_| HubError::Config("torrent site lock poisoned".to_string()))?;
        *active = idx;
        info!("[Torrent] Active site is now '{}'", self.sites[idx].name);
        Ok(self.sites[idx].name.clone())
    }
}
