//! WeCom protocol pieces: callback envelope crypto, message shapes and the
//! outbound message client.

pub mod client;
pub mod crypto;
pub mod message;

pub use client::{MemorySender, OutboundSender, WeComClient};
pub use crypto::{AppSelector, CryptoError, Keyring, MsgCrypt, SealedEnvelope};
pub use message::{join_recipients, InstanceReply, ReceiveMessage, RegularMessage};
