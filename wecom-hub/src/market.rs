//! Convertible bond market data (Eastmoney data center).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::MarketConfig;
use crate::error::{HubError, HubResult};

const CHINA_OFFSET_SECS: i32 = 8 * 3600;
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Calendar date in China (UTC+8); listing and subscription dates are
/// published in that calendar.
pub fn china_today() -> NaiveDate {
    let now = Utc::now();
    FixedOffset::east_opt(CHINA_OFFSET_SECS)
        .map(|tz| now.with_timezone(&tz).date_naive())
        .unwrap_or_else(|| now.date_naive())
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BondListing {
    #[serde(rename = "SECURITY_CODE")]
    pub bond_code: String,
    #[serde(rename = "SECURITY_NAME_ABBR", default)]
    pub bond_name: String,
    #[serde(rename = "CONVERT_STOCK_CODE", default)]
    pub stock_code: String,
    #[serde(rename = "LISTING_DATE", default)]
    pub listing_date: Option<String>,
    #[serde(rename = "PUBLIC_START_DATE", default)]
    pub public_start_date: Option<String>,
    #[serde(rename = "CONVERT_STOCK_PRICE", default)]
    pub stock_price: serde_json::Value,
    #[serde(rename = "TRANSFER_PRICE", default)]
    pub transfer_price: serde_json::Value,
    #[serde(rename = "TRANSFER_VALUE", default)]
    pub transfer_value: serde_json::Value,
    #[serde(rename = "CURRENT_BOND_PRICE", default)]
    pub bond_price: serde_json::Value,
    #[serde(rename = "TRANSFER_PREMIUM_RATIO", default)]
    pub premium_ratio: serde_json::Value,
}

fn parse_day(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?.trim();
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()
}

fn display(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "-".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl BondListing {
    pub fn listing_day(&self) -> Option<NaiveDate> {
        parse_day(self.listing_date.as_deref())
    }

    /// Day the bond opens for public subscription.
    pub fn release_day(&self) -> Option<NaiveDate> {
        parse_day(self.public_start_date.as_deref())
    }

    pub fn matches_code(&self, code: &str) -> bool {
        self.bond_code == code || self.stock_code == code
    }

    pub fn card_content(&self) -> String {
        [
            format!("Bond code {}", self.bond_code),
            format!("Bond name {}", self.bond_name),
            format!("Stock code {}", self.stock_code),
            format!(
                "Subscription date {}",
                self.release_day()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".to_string())
            ),
            format!("Stock price {}", display(&self.stock_price)),
            format!("Conversion price {}", display(&self.transfer_price)),
            format!("Conversion value {}", display(&self.transfer_value)),
            format!("Bond price {}", display(&self.bond_price)),
            format!("Conversion premium {}", display(&self.premium_ratio)),
        ]
        .join("\n")
    }
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn listings(&self) -> HubResult<Arc<Vec<BondListing>>>;

    async fn find(&self, code: &str) -> HubResult<Option<BondListing>> {
        Ok(self
            .listings()
            .await?
            .iter()
            .find(|b| b.matches_code(code))
            .cloned())
    }

    async fn listed_on(&self, day: NaiveDate) -> HubResult<Vec<BondListing>> {
        Ok(self
            .listings()
            .await?
            .iter()
            .filter(|b| b.listing_day() == Some(day))
            .cloned()
            .collect())
    }

    async fn released_on(&self, day: NaiveDate) -> HubResult<Vec<BondListing>> {
        Ok(self
            .listings()
            .await?
            .iter()
            .filter(|b| b.release_day() == Some(day))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct EastmoneyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result: Option<EastmoneyResult>,
}

#[derive(Debug, Deserialize)]
struct EastmoneyResult {
    #[serde(default)]
    data: Vec<BondListing>,
}

struct Snapshot {
    day: NaiveDate,
    listings: Arc<Vec<BondListing>>,
}

/// Fetches the bond list at most once per China calendar day.
pub struct EastmoneyClient {
    http: reqwest::Client,
    url: String,
    attempts: u32,
    retry_delay: Duration,
    snapshot: Mutex<Option<Snapshot>>,
}

impl EastmoneyClient {
    pub fn new(config: &MarketConfig) -> HubResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            url: config.url.clone(),
            attempts: config.attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            snapshot: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> HubResult<Vec<BondListing>> {
        let response: EastmoneyResponse = self
            .http
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "*/*")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match response.result {
            Some(result) if response.success => Ok(result.data),
            _ => Err(HubError::Upstream(format!(
                "market data request failed: {}",
                response.message.unwrap_or_else(|| "no result".to_string())
            ))),
        }
    }
}

#[async_trait]
impl MarketDataSource for EastmoneyClient {
    async fn listings(&self) -> HubResult<Arc<Vec<BondListing>>> {
        let today = china_today();
        let mut snapshot = self.snapshot.lock().await;
        if let Some(current) = snapshot.as_ref().filter(|s| s.day == today) {
            return Ok(current.listings.clone());
        }

        let mut last_error = None;
        for attempt in 1..=self.attempts {
            info!("[Market] Fetching bond list (attempt {}/{})", attempt, self.attempts);
            match self.fetch().await {
                Ok(listings) => {
                    info!("[Market] Received {} bonds", listings.len());
                    let listings = Arc::new(listings);
                    *snapshot = Some(Snapshot {
                        day: today,
                        listings: listings.clone(),
                    });
                    return Ok(listings);
                }
                Err(e) => {
                    warn!("[Market] Fetch attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        if let Some(stale) = snapshot.as_ref() {
            warn!("[Market] Serving bond list from {}", stale.day);
            return Ok(stale.listings.clone());
        }
        Err(last_error
            .unwrap_or_else(|| HubError::Upstream("market data unavailable".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "version": "x",
            "success": true,
            "message": "ok",
            "code": 0,
            "result": {
                "pages": 1,
                "count": 2,
                "data": [
                    {
                        "SECURITY_CODE": "123001",
                        "SECURITY_NAME_ABBR": "Alpha Convertible",
                        "CONVERT_STOCK_CODE": "300001",
                        "LISTING_DATE": "2024-03-11 00:00:00",
                        "PUBLIC_START_DATE": "2024-02-20 00:00:00",
                        "CONVERT_STOCK_PRICE": 12.5,
                        "TRANSFER_PRICE": "-",
                        "CURRENT_BOND_PRICE": null
                    },
                    {
                        "SECURITY_CODE": "113002",
                        "SECURITY_NAME_ABBR": "Beta Convertible",
                        "CONVERT_STOCK_CODE": "600002",
                        "LISTING_DATE": null,
                        "PUBLIC_START_DATE": "2024-03-11 00:00:00"
                    }
                ]
            }
        })
    }

    /// Serves the sample after `failures` failing requests; returns the
    /// base URL and a hit counter.
    async fn spawn_server(failures: usize) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/api/data/v1/get",
            get(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        (axum::http::StatusCode::SERVICE_UNAVAILABLE, String::new())
                    } else {
                        (axum::http::StatusCode::OK, sample_json().to_string())
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        (format!("http://{}/api/data/v1/get", addr), hits)
    }

    fn client(url: String, attempts: u32) -> EastmoneyClient {
        EastmoneyClient::new(&MarketConfig {
            url,
            attempts,
            retry_delay_ms: 10,
        })
        .unwrap()
    }

    #[test]
    fn dates_and_codes_are_recognised() {
        let listings: Vec<BondListing> =
            serde_json::from_value(sample_json()["result"]["data"].clone()).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();
        assert_eq!(listings[0].listing_day(), Some(day));
        assert_eq!(listings[1].listing_day(), None);
        assert_eq!(listings[1].release_day(), Some(day));
        assert!(listings[0].matches_code("300001"));
        assert!(listings[0].matches_code("123001"));

        let card = listings[0].card_content();
        assert!(card.contains("Bond code 123001"));
        assert!(card.contains("Stock price 12.5"));
        assert!(card.contains("Conversion price -"));
        assert!(card.contains("Bond price -"));
    }

    #[tokio::test]
    async fn list_is_fetched_once_per_day() {
        let (url, hits) = spawn_server(0).await;
        let client = client(url, 3);
        let day = NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();

        assert_eq!(client.listed_on(day).await.unwrap().len(), 1);
        assert_eq!(client.released_on(day).await.unwrap().len(), 1);
        assert_eq!(
            client.find("600002").await.unwrap().map(|b| b.bond_code),
            Some("113002".to_string())
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (url, hits) = spawn_server(2).await;
        let client = client(url, 3);
        assert_eq!(client.listings().await.unwrap().len(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_the_error() {
        let (url, hits) = spawn_server(usize::MAX).await;
        let client = client(url, 2);
        assert!(client.listings().await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
