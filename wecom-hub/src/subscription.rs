//! Bond reminder subscriptions: the store abstraction, an in-memory store
//! with optional JSON snapshots, and the user-facing subscription service.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{HubError, HubResult};
use crate::market::{china_today, MarketDataSource};

/// Code stored by release subscriptions, which are not tied to one bond.
pub const RELEASE_CODE: &str = "@all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReminderKind {
    /// Bond starts trading
    Listing,
    /// Bond opens for public subscription
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user: String,
    pub bond_code: String,
    pub stock_code: String,
    #[serde(default)]
    pub bond_name: Option<String>,
    pub kind: ReminderKind,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        user: impl Into<String>,
        kind: ReminderKind,
        bond_code: impl Into<String>,
        stock_code: impl Into<String>,
        bond_name: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user: user.into(),
            bond_code: bond_code.into(),
            stock_code: stock_code.into(),
            bond_name,
            kind,
            created_at: Utc::now(),
        }
    }

    /// Two subscriptions are the same if user, bond and kind agree.
    pub fn same_key(&self, other: &Subscription) -> bool {
        self.user == other.user && self.bond_code == other.bond_code && self.kind == other.kind
    }

    fn matches_code(&self, code: &str) -> bool {
        self.bond_code == code || self.stock_code == code
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Added,
    Duplicate,
    Removed,
    NotFound,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub user: Option<String>,
    pub kind: Option<ReminderKind>,
    /// Matches either the bond or the underlying stock code
    pub code: Option<String>,
    /// Matches any of these bond codes
    pub bond_codes: Option<Vec<String>>,
}

impl SubscriptionFilter {
    pub fn matches(&self, sub: &Subscription) -> bool {
        self.user.as_deref().map_or(true, |u| sub.user == u)
            && self.kind.map_or(true, |k| sub.kind == k)
            && self.code.as_deref().map_or(true, |c| sub.matches_code(c))
            && self
                .bond_codes
                .as_ref()
                .map_or(true, |codes| codes.iter().any(|c| *c == sub.bond_code))
    }
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn add(&self, subscription: Subscription) -> HubResult<StoreOutcome>;

    /// Remove the user's subscription of `kind` whose bond or stock code is `code`.
    async fn remove(&self, user: &str, kind: ReminderKind, code: &str) -> HubResult<StoreOutcome>;

    async fn query(&self, filter: &SubscriptionFilter) -> HubResult<Vec<Subscription>>;
}

/// Process-local store. With a snapshot path every change is written back
/// to a JSON file, and the file is loaded at startup.
pub struct InMemorySubscriptionStore {
    items: RwLock<Vec<Subscription>>,
    snapshot: Option<PathBuf>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            snapshot: None,
        }
    }

    pub fn with_snapshot(path: impl Into<PathBuf>) -> HubResult<Self> {
        let path = path.into();
        let items = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let items: Vec<Subscription> = serde_json::from_str(&raw)?;
            info!(
                "[Subscriptions] Loaded {} subscriptions from {}",
                items.len(),
                path.display()
            );
            items
        } else {
            Vec::new()
        };
        Ok(Self {
            items: RwLock::new(items),
            snapshot: Some(path),
        })
    }

    async fn persist(&self, items: &[Subscription]) -> HubResult<()> {
        let Some(path) = self.snapshot.clone() else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(items)?;
        tokio::task::spawn_blocking(move || write_atomically(&path, &json))
            .await
            .map_err(|e| HubError::Io(format!("snapshot task failed: {}", e)))?
    }
}

impl Default for InMemorySubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn write_atomically(path: &Path, contents: &str) -> HubResult<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn add(&self, subscription: Subscription) -> HubResult<StoreOutcome> {
        let mut items = self.items.write().await;
        if items.iter().any(|s| s.same_key(&subscription)) {
            return Ok(StoreOutcome::Duplicate);
        }
        debug!(
            "[Subscriptions] {} -> {} ({:?})",
            subscription.user, subscription.bond_code, subscription.kind
        );
        items.push(subscription);
        self.persist(&items).await?;
        Ok(StoreOutcome::Added)
    }

    async fn remove(&self, user: &str, kind: ReminderKind, code: &str) -> HubResult<StoreOutcome> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|s| !(s.user == user && s.kind == kind && s.matches_code(code)));
        if items.len() == before {
            return Ok(StoreOutcome::NotFound);
        }
        self.persist(&items).await?;
        Ok(StoreOutcome::Removed)
    }

    async fn query(&self, filter: &SubscriptionFilter) -> HubResult<Vec<Subscription>> {
        let items = self.items.read().await;
        Ok(items.iter().filter(|s| filter.matches(s)).cloned().collect())
    }
}

/// User-facing subscription operations; every method returns reply text.
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    market: Arc<dyn MarketDataSource>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn SubscriptionStore>, market: Arc<dyn MarketDataSource>) -> Self {
        Self { store, market }
    }

    pub async fn subscribe(&self, user: &str, kind: ReminderKind, code: &str) -> HubResult<String> {
        let subscription = match kind {
            ReminderKind::Listing => {
                let Some(bond) = self.market.find(code).await? else {
                    return Err(HubError::NotFound(format!("Unknown code {}", code)));
                };
                Subscription::new(
                    user,
                    kind,
                    bond.bond_code,
                    bond.stock_code,
                    Some(bond.bond_name),
                )
            }
            ReminderKind::Release => Subscription::new(user, kind, RELEASE_CODE, RELEASE_CODE, None),
        };

        Ok(match self.store.add(subscription).await? {
            StoreOutcome::Duplicate => format!("Already subscribed: user {} code {}", user, code),
            _ => format!("Subscribed: user {} code {}", user, code),
        })
    }

    pub async fn unsubscribe(
        &self,
        user: &str,
        kind: ReminderKind,
        code: &str,
    ) -> HubResult<String> {
        Ok(match self.store.remove(user, kind, code).await? {
            StoreOutcome::Removed => format!("Unsubscribed: user {} code {}", user, code),
            _ => format!("Not subscribed: user {} code {}", user, code),
        })
    }

    pub async fn query(
        &self,
        user: &str,
        kind: ReminderKind,
        code: Option<&str>,
    ) -> HubResult<String> {
        let filter = SubscriptionFilter {
            user: Some(user.to_string()),
            kind: Some(kind),
            code: code.map(str::to_string),
            bond_codes: None,
        };
        let found = self.store.query(&filter).await?;
        Ok(match kind {
            ReminderKind::Release if found.is_empty() => "Not subscribed".to_string(),
            ReminderKind::Release => "Subscribed".to_string(),
            ReminderKind::Listing if found.is_empty() => {
                "No results, nothing subscribed".to_string()
            }
            ReminderKind::Listing => {
                let lines = found
                    .iter()
                    .map(|s| {
                        format!(
                            "Bond {} stock {} name {}",
                            s.bond_code,
                            s.stock_code,
                            s.bond_name.as_deref().unwrap_or("-")
                        )
                    })
                    .join("\n");
                format!("Subscriptions:\n{}", lines)
            }
        })
    }

    /// Bonds listing or opening for subscription today, as reply text.
    pub async fn today(&self, kind: ReminderKind) -> HubResult<String> {
        let day = china_today();
        let (bonds, none) = match kind {
            ReminderKind::Listing => (self.market.listed_on(day).await?, "No new listings today"),
            ReminderKind::Release => (
                self.market.released_on(day).await?,
                "No new subscriptions today",
            ),
        };
        if bonds.is_empty() {
            return Ok(none.to_string());
        }
        Ok(bonds.iter().map(|b| b.card_content()).join("\n\n"))
    }
}
