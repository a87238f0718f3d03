//! Daily bond notifications pushed to subscribers as text cards.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use itertools::Itertools;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::error::HubResult;
use crate::market::{china_today, MarketDataSource};
use crate::scheduler::{job_action, Scheduler, TriggerPolicy};
use crate::subscription::{ReminderKind, SubscriptionFilter, SubscriptionStore};
use crate::wecom::{join_recipients, OutboundSender};

pub const LISTING_JOB: &str = "listing-check";
pub const RELEASE_JOB: &str = "release-check";

const LISTING_TITLE: &str = "New listing";
const RELEASE_TITLE: &str = "New subscription";
const CARD_BUTTON: &str = "View list";

pub struct NotificationService {
    store: Arc<dyn SubscriptionStore>,
    market: Arc<dyn MarketDataSource>,
    outbound: Arc<dyn OutboundSender>,
    agent_id: u64,
    link_url: String,
}

impl NotificationService {
    pub fn new(
        config: &NotificationConfig,
        store: Arc<dyn SubscriptionStore>,
        market: Arc<dyn MarketDataSource>,
        outbound: Arc<dyn OutboundSender>,
    ) -> Self {
        Self {
            store,
            market,
            outbound,
            agent_id: config.agent_id,
            link_url: config.link_url.clone(),
        }
    }

    /// One card per bond listing on `day`, sent to that bond's subscribers.
    /// Returns the number of cards delivered.
    pub async fn check_new_listings(&self, day: NaiveDate) -> HubResult<usize> {
        let bonds = self.market.listed_on(day).await?;
        if bonds.is_empty() {
            info!("[Notification] No bonds listing on {}", day);
            return Ok(0);
        }

        let filter = SubscriptionFilter {
            kind: Some(ReminderKind::Listing),
            bond_codes: Some(bonds.iter().map(|b| b.bond_code.clone()).collect()),
            ..Default::default()
        };
        let subscribers = self
            .store
            .query(&filter)
            .await?
            .into_iter()
            .map(|s| (s.bond_code, s.user))
            .into_group_map();

        let mut delivered = 0;
        for bond in &bonds {
            let Some(users) = subscribers.get(&bond.bond_code) else {
                continue;
            };
            let recipients = join_recipients(users.iter().unique());
            match self
                .outbound
                .send_card(
                    self.agent_id,
                    &recipients,
                    LISTING_TITLE,
                    &bond.card_content(),
                    &self.link_url,
                    CARD_BUTTON,
                )
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "[Notification] Listing card for {} to {} failed: {}",
                    bond.bond_code, recipients, e
                ),
            }
        }
        info!(
            "[Notification] {} bonds listing on {}, {} cards sent",
            bonds.len(),
            day,
            delivered
        );
        Ok(delivered)
    }

    /// A single card describing every bond opening for subscription on
    /// `day`, sent to all release subscribers.
    pub async fn check_new_releases(&self, day: NaiveDate) -> HubResult<usize> {
        let bonds = self.market.released_on(day).await?;
        if bonds.is_empty() {
            info!("[Notification] No bonds opening for subscription on {}", day);
            return Ok(0);
        }

        let filter = SubscriptionFilter {
            kind: Some(ReminderKind::Release),
            ..Default::default()
        };
        let subscribers = self.store.query(&filter).await?;
        if subscribers.is_empty() {
            return Ok(0);
        }

        let recipients = join_recipients(subscribers.iter().map(|s| s.user.as_str()).unique());
        let description = bonds.iter().map(|b| b.card_content()).join("\n\n");
        self.outbound
            .send_card(
                self.agent_id,
                &recipients,
                RELEASE_TITLE,
                &description,
                &self.link_url,
                CARD_BUTTON,
            )
            .await?;
        info!(
            "[Notification] {} bonds open for subscription on {}, sent to {}",
            bonds.len(),
            day,
            recipients
        );
        Ok(1)
    }

    pub fn register_jobs(
        self: &Arc<Self>,
        scheduler: &Scheduler,
        config: &NotificationConfig,
    ) -> HubResult<()> {
        let service = self.clone();
        let listing = job_action(move || {
            let service = service.clone();
            async move {
                service.check_new_listings(china_today()).await?;
                Ok(())
            }
        });
        scheduler.arm(
            LISTING_JOB,
            TriggerPolicy::try_from(config.listing)?,
            Duration::ZERO,
            listing,
        )?;

        let service = self.clone();
        let release = job_action(move || {
            let service = service.clone();
            async move {
                service.check_new_releases(china_today()).await?;
                Ok(())
            }
        });
        scheduler.arm(
            RELEASE_JOB,
            TriggerPolicy::try_from(config.release)?,
            Duration::ZERO,
            release,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DailySchedule;
    use crate::market::BondListing;
    use crate::subscription::{InMemorySubscriptionStore, Subscription, RELEASE_CODE};
    use crate::wecom::MemorySender;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct FixedMarket(Arc<Vec<BondListing>>);

    #[async_trait]
    impl MarketDataSource for FixedMarket {
        async fn listings(&self) -> HubResult<Arc<Vec<BondListing>>> {
            Ok(self.0.clone())
        }
    }

    fn bond(code: &str, listing: Option<&str>, release: Option<&str>) -> BondListing {
        serde_json::from_value(serde_json::json!({
            "SECURITY_CODE": code,
            "SECURITY_NAME_ABBR": format!("Bond {}", code),
            "CONVERT_STOCK_CODE": format!("6{}", code),
            "LISTING_DATE": listing,
            "PUBLIC_START_DATE": release,
        }))
        .unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()
    }

    async fn setup() -> (NotificationService, Arc<MemorySender>) {
        let market = FixedMarket(Arc::new(vec![
            bond("110001", Some("2024-03-11 00:00:00"), None),
            bond("110002", Some("2024-03-11 00:00:00"), Some("2024-03-11 00:00:00")),
            bond("110003", Some("2024-03-12 00:00:00"), Some("2024-03-11 00:00:00")),
        ]));
        let store = Arc::new(InMemorySubscriptionStore::new());
        for (user, kind, code) in [
            ("alice", ReminderKind::Listing, "110001"),
            ("bob", ReminderKind::Listing, "110001"),
            ("bob", ReminderKind::Listing, "110003"),
            ("carol", ReminderKind::Release, RELEASE_CODE),
            ("dave", ReminderKind::Release, RELEASE_CODE),
        ] {
            store
                .add(Subscription::new(user, kind, code, code, None))
                .await
                .unwrap();
        }
        let sender = Arc::new(MemorySender::new());
        let config = NotificationConfig {
            agent_id: 1000010,
            listing: DailySchedule { hour: 1, minute: 0 },
            release: DailySchedule { hour: 1, minute: 5 },
            link_url: "https://data.example/kzz".to_string(),
        };
        let service =
            NotificationService::new(&config, store, Arc::new(market), sender.clone());
        (service, sender)
    }

    #[tokio::test]
    async fn listing_cards_go_to_each_bonds_subscribers() {
        let (service, sender) = setup().await;
        assert_eq!(service.check_new_listings(day()).await.unwrap(), 1);

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to_user, "alice|bob");
        assert_eq!(sent[0].agent_id, 1000010);
        let card = sent[0].text_card.as_ref().unwrap();
        assert_eq!(card.title, "New listing");
        assert_eq!(card.url, "https://data.example/kzz");
        assert!(card.description.contains("Bond code 110001"));
    }

    #[tokio::test]
    async fn release_card_lists_all_bonds_once() {
        let (service, sender) = setup().await;
        assert_eq!(service.check_new_releases(day()).await.unwrap(), 1);

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to_user, "carol|dave");
        let card = sent[0].text_card.as_ref().unwrap();
        assert_eq!(card.title, "New subscription");
        assert!(card.description.contains("Bond code 110002"));
        assert!(card.description.contains("Bond code 110003"));
    }

    #[tokio::test]
    async fn quiet_day_sends_nothing() {
        let (service, sender) = setup().await;
        let quiet = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(service.check_new_listings(quiet).await.unwrap(), 0);
        assert_eq!(service.check_new_releases(quiet).await.unwrap(), 0);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn jobs_are_armed_daily() {
        let (service, _) = setup().await;
        let scheduler = Scheduler::new();
        let config = NotificationConfig {
            agent_id: 1000010,
            listing: DailySchedule { hour: 1, minute: 0 },
            release: DailySchedule { hour: 1, minute: 5 },
            link_url: "https://data.example/kzz".to_string(),
        };
        Arc::new(service).register_jobs(&scheduler, &config).unwrap();
        let mut names = scheduler.job_names();
        names.sort();
        assert_eq!(names, vec![LISTING_JOB.to_string(), RELEASE_JOB.to_string()]);
        assert_eq!(scheduler.live_timers(), 2);
        scheduler.shutdown();
    }
}
