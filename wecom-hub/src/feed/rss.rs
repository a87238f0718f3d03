//! Minimal RSS 2.0 reader: only `channel/item/{title, link, enclosure@url}`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::{HubError, HubResult};

static EPISODE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"([a-f\d]+)\.torrent").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: String,
    pub link: Option<String>,
    pub enclosure_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    enclosure: Option<Enclosure>,
}

#[derive(Debug, Deserialize)]
struct Enclosure {
    #[serde(rename = "@url")]
    url: String,
}

pub fn parse_rss(xml: &str) -> HubResult<Vec<FeedEntry>> {
    let rss: Rss = quick_xml::de::from_str(xml)
        .map_err(|e| HubError::Upstream(format!("invalid RSS document: {}", e)))?;
    Ok(rss
        .channel
        .items
        .into_iter()
        .filter_map(|item| {
            let title = item.title?.trim().to_string();
            (!title.is_empty()).then(|| FeedEntry {
                title,
                link: item.link,
                enclosure_url: item.enclosure.map(|e| e.url),
            })
        })
        .collect())
}

/// Hex episode id embedded in a torrent URL, e.g. `.../3f2a9c.torrent`.
pub fn episode_id(url: &str) -> Option<String> {
    EPISODE_ID
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
