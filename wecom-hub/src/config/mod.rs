//! Configuration module for the wecom-hub runtime
//!
//! The configuration is a single TOML document. Every section except
//! `[wecom]` is optional and falls back to the defaults declared in
//! `types.rs`.

pub mod types;

pub use types::*;
