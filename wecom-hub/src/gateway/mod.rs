//! Inbound side of the hub: the webhook endpoint, delivery deduplication,
//! handler routing and the worker pool that runs detached handler work.

pub mod dedup;
pub mod dispatcher;
pub mod registry;
pub mod server;
pub mod worker;

pub use dedup::{DedupCache, DeliveryKey};
pub use dispatcher::{DeliveryParams, DispatchOutcome, Dispatcher, VerifyParams};
pub use registry::{BackgroundWork, HandlerOutcome, HandlerRegistry, MessageHandler};
pub use server::{router, serve, GatewayState};
pub use worker::{BackgroundTask, DeadLetter, WorkerPool};
