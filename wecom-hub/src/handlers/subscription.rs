use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::normalize;
use crate::error::HubResult;
use crate::gateway::{HandlerOutcome, MessageHandler};
use crate::subscription::{ReminderKind, SubscriptionService, RELEASE_CODE};
use crate::wecom::{OutboundSender, ReceiveMessage};

pub const SUBSCRIPTION_HELP: &str = "Available commands:\n\
sub <code> - remind me when the bond lists\n\
unsub <code> - cancel a listing reminder\n\
query <code> - show a listing reminder\n\
query - show all listing reminders\n\
sub release - remind me of new subscriptions\n\
unsub release - cancel subscription reminders\n\
query release - show the subscription reminder\n\
today listing - bonds listing today\n\
today release - bonds opening for subscription today";

static VERB_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(sub|unsub|query)(?:\s+(\S+))?$").unwrap());
static TODAY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^today\s+(listing|release)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionCommand {
    Subscribe { kind: ReminderKind, code: String },
    Unsubscribe { kind: ReminderKind, code: String },
    Query { kind: ReminderKind, code: Option<String> },
    Today(ReminderKind),
}

impl SubscriptionCommand {
    pub fn parse(content: &str) -> Option<Self> {
        let text = normalize(content);
        if let Some(caps) = TODAY_RE.captures(&text) {
            let kind = if caps[1].eq_ignore_ascii_case("release") {
                ReminderKind::Release
            } else {
                ReminderKind::Listing
            };
            return Some(SubscriptionCommand::Today(kind));
        }

        let caps = VERB_RE.captures(&text)?;
        let verb = caps[1].to_ascii_lowercase();
        let arg = caps.get(2).map(|m| m.as_str());
        let (kind, code) = match arg {
            Some(a) if a.eq_ignore_ascii_case("release") => {
                (ReminderKind::Release, Some(RELEASE_CODE.to_string()))
            }
            Some(a) => (ReminderKind::Listing, Some(a.to_string())),
            None => (ReminderKind::Listing, None),
        };

        match (verb.as_str(), code) {
            ("sub", Some(code)) => Some(SubscriptionCommand::Subscribe { kind, code }),
            ("unsub", Some(code)) => Some(SubscriptionCommand::Unsubscribe { kind, code }),
            ("query", code) => Some(SubscriptionCommand::Query {
                kind,
                // A release reminder is a single flag per user.
                code: code.filter(|_| kind == ReminderKind::Listing),
            }),
            _ => None,
        }
    }
}

/// Bond reminder commands. Anything touching market data or the store
/// runs on the worker pool.
pub struct SubscriptionHandler {
    service: Arc<SubscriptionService>,
}

impl SubscriptionHandler {
    pub fn new(service: Arc<SubscriptionService>) -> Self {
        Self { service }
    }

    pub async fn execute(
        service: &SubscriptionService,
        user: &str,
        command: SubscriptionCommand,
    ) -> HubResult<Option<String>> {
        let text = match command {
            SubscriptionCommand::Subscribe { kind, code } => {
                service.subscribe(user, kind, &code).await?
            }
            SubscriptionCommand::Unsubscribe { kind, code } => {
                service.unsubscribe(user, kind, &code).await?
            }
            SubscriptionCommand::Query { kind, code } => {
                service.query(user, kind, code.as_deref()).await?
            }
            SubscriptionCommand::Today(kind) => service.today(kind).await?,
        };
        Ok(Some(text))
    }
}

#[async_trait]
impl MessageHandler for SubscriptionHandler {
    fn name(&self) -> &str {
        "subscription"
    }

    async fn handle(
        &self,
        message: &ReceiveMessage,
        _outbound: Arc<dyn OutboundSender>,
    ) -> HubResult<HandlerOutcome> {
        let Some(command) = SubscriptionCommand::parse(&message.content) else {
            return Ok(HandlerOutcome::Reply(SUBSCRIPTION_HELP.to_string()));
        };
        debug!(
            "[SubscriptionHandler] {} -> {:?}",
            message.from_user_name, command
        );

        let service = self.service.clone();
        let user = message.from_user_name.clone();
        Ok(HandlerOutcome::Background(Box::pin(async move {
            SubscriptionHandler::execute(&service, &user, command).await
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubError;
    use crate::market::{BondListing, MarketDataSource};
    use crate::subscription::InMemorySubscriptionStore;
    use pretty_assertions::assert_eq;

    struct FixedMarket(Arc<Vec<BondListing>>);

    #[async_trait]
    impl MarketDataSource for FixedMarket {
        async fn listings(&self) -> HubResult<Arc<Vec<BondListing>>> {
            Ok(self.0.clone())
        }
    }

    fn service() -> SubscriptionService {
        let bond: BondListing = serde_json::from_value(serde_json::json!({
            "SECURITY_CODE": "123001",
            "SECURITY_NAME_ABBR": "Alpha Convertible",
            "CONVERT_STOCK_CODE": "300001"
        }))
        .unwrap();
        SubscriptionService::new(
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(FixedMarket(Arc::new(vec![bond]))),
        )
    }

    fn listing(code: &str) -> (ReminderKind, String) {
        (ReminderKind::Listing, code.to_string())
    }

    #[test]
    fn parses_every_command_form() {
        let (kind, code) = listing("123001");
        assert_eq!(
            SubscriptionCommand::parse("SUB 123001"),
            Some(SubscriptionCommand::Subscribe { kind, code })
        );
        assert_eq!(
            SubscriptionCommand::parse("unsub release"),
            Some(SubscriptionCommand::Unsubscribe {
                kind: ReminderKind::Release,
                code: RELEASE_CODE.to_string()
            })
        );
        assert_eq!(
            SubscriptionCommand::parse("query"),
            Some(SubscriptionCommand::Query {
                kind: ReminderKind::Listing,
                code: None
            })
        );
        assert_eq!(
            SubscriptionCommand::parse("query release"),
            Some(SubscriptionCommand::Query {
                kind: ReminderKind::Release,
                code: None
            })
        );
        assert_eq!(
            SubscriptionCommand::parse("Today Release"),
            Some(SubscriptionCommand::Today(ReminderKind::Release))
        );
        assert_eq!(SubscriptionCommand::parse("sub"), None);
        assert_eq!(SubscriptionCommand::parse("sub a b"), None);
        assert_eq!(SubscriptionCommand::parse("today"), None);
    }

    #[tokio::test]
    async fn subscribe_query_unsubscribe_cycle() {
        let service = service();
        let run = |text: &str| {
            let command = SubscriptionCommand::parse(text).unwrap();
            SubscriptionHandler::execute(&service, "alice", command)
        };

        assert_eq!(
            run("sub 300001").await.unwrap().as_deref(),
            Some("Subscribed: user alice code 300001")
        );
        assert_eq!(
            run("sub 123001").await.unwrap().as_deref(),
            Some("Already subscribed: user alice code 123001")
        );
        assert_eq!(
            run("query").await.unwrap().as_deref(),
            Some("Subscriptions:\nBond 123001 stock 300001 name Alpha Convertible")
        );
        assert_eq!(
            run("unsub 123001").await.unwrap().as_deref(),
            Some("Unsubscribed: user alice code 123001")
        );
        assert_eq!(
            run("query 123001").await.unwrap().as_deref(),
            Some("No results, nothing subscribed")
        );
    }

    #[tokio::test]
    async fn release_reminder_is_a_flag() {
        let service = service();
        let exec = |text: &str| {
            SubscriptionHandler::execute(&service, "bob", SubscriptionCommand::parse(text).unwrap())
        };
        assert_eq!(exec("query release").await.unwrap().as_deref(), Some("Not subscribed"));
        exec("sub release").await.unwrap();
        assert_eq!(exec("query release").await.unwrap().as_deref(), Some("Subscribed"));
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let service = service();
        let command = SubscriptionCommand::parse("sub 999999").unwrap();
        let err = SubscriptionHandler::execute(&service, "carol", command)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));
    }
}
