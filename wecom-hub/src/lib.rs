// wecom-hub library
// Webhook bot for WeCom applications: envelope crypto, dispatch, dedup,
// background jobs and RSS feed polling.

pub mod app;
pub mod config;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod handlers;
pub mod market;
pub mod notification;
pub mod scheduler;
pub mod subscription;
pub mod torrent;
pub mod wecom;

pub use app::HubApp;
pub use config::HubConfig;
pub use error::{HubError, HubResult};
