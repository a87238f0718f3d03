use std::sync::Arc;

use axum::http::StatusCode;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::dedup::{DedupCache, DeliveryKey};
use super::registry::{HandlerOutcome, HandlerRegistry};
use super::worker::{BackgroundTask, WorkerPool};
use crate::error::HubError;
use crate::wecom::{AppSelector, InstanceReply, Keyring, MsgCrypt, OutboundSender, ReceiveMessage};

pub const UNROUTABLE_REPLY: &str = "This application has no handler configured";
pub const BUSY_REPLY: &str = "Too many requests are being processed, please try again later";
pub const MALFORMED_BODY: &str = "RECEIVE_MESSAGE ERR: INVALID MESSAGE";

/// Query parameters of a message delivery (`POST /`). Missing values are
/// empty so they fail the signature check instead of the extractor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeliveryParams {
    pub msg_signature: String,
    pub timestamp: String,
    pub nonce: String,
}

/// Query parameters of the URL verification handshake (`GET /`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VerifyParams {
    pub msg_signature: String,
    pub timestamp: String,
    pub nonce: String,
    pub echostr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Envelope could not be opened; body carries the diagnostic
    EnvelopeRejected(String),
    /// Repeat delivery; body is whatever the first delivery answered
    Duplicate(String),
    Malformed,
    /// No handler for the agent; body is the sealed notice
    Unroutable(String),
    /// Sealed synchronous reply
    Replied(String),
    Accepted,
    Fatal(String),
}

impl DispatchOutcome {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchOutcome::Malformed => StatusCode::BAD_REQUEST,
            DispatchOutcome::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::OK,
        }
    }

    pub fn body(&self) -> String {
        match self {
            DispatchOutcome::EnvelopeRejected(body)
            | DispatchOutcome::Duplicate(body)
            | DispatchOutcome::Unroutable(body)
            | DispatchOutcome::Replied(body) => body.clone(),
            DispatchOutcome::Malformed => MALFORMED_BODY.to_string(),
            DispatchOutcome::Fatal(msg) => msg.clone(),
            DispatchOutcome::Accepted => String::new(),
        }
    }
}

/// Verify, deduplicate, route and execute one inbound delivery.
pub struct Dispatcher {
    keyring: Keyring,
    dedup: Arc<DedupCache>,
    registry: Arc<HandlerRegistry>,
    workers: Arc<WorkerPool>,
    outbound: Arc<dyn OutboundSender>,
}

impl Dispatcher {
    pub fn new(
        keyring: Keyring,
        dedup: Arc<DedupCache>,
        registry: Arc<HandlerRegistry>,
        workers: Arc<WorkerPool>,
        outbound: Arc<dyn OutboundSender>,
    ) -> Self {
        Self {
            keyring,
            dedup,
            registry,
            workers,
            outbound,
        }
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// URL verification: the decrypted echo string, or a diagnostic.
    pub fn verify_url(&self, selector: &AppSelector, params: &VerifyParams) -> String {
        let result = self.keyring.select(selector).and_then(|crypt| {
            crypt.verify_url(
                &params.msg_signature,
                &params.timestamp,
                &params.nonce,
                &params.echostr,
            )
        });
        match result {
            Ok(echo) => {
                info!("[Dispatcher] URL verification succeeded");
                echo
            }
            Err(e) => {
                warn!("[Dispatcher] URL verification failed: {} ({})", e, e.code());
                format!("VERIFY_URL ERR: VERIFY_FAIL: {}", e.code())
            }
        }
    }

    pub async fn dispatch(
        &self,
        selector: &AppSelector,
        params: &DeliveryParams,
        body: &str,
    ) -> DispatchOutcome {
        let opened = self.keyring.select(selector).and_then(|crypt| {
            let xml =
                crypt.decrypt_message(&params.msg_signature, &params.timestamp, &params.nonce, body)?;
            Ok((crypt, xml))
        });
        let (crypt, xml) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!("[Dispatcher] Rejected envelope: {} ({})", e, e.code());
                return DispatchOutcome::EnvelopeRejected(format!(
                    "RECEIVE_MESSAGE ERR: DECRYPT_FAIL: {}",
                    e.code()
                ));
            }
        };

        let key = DeliveryKey::new(&params.msg_signature, &params.timestamp, &params.nonce);
        if let Some(cached) = self.dedup.check(&key) {
            info!(
                "[Dispatcher] Duplicate delivery ts={} nonce={}, answering from cache",
                params.timestamp, params.nonce
            );
            return DispatchOutcome::Duplicate(cached);
        }

        let outcome = self.route(&crypt, params, &xml).await;
        if outcome.status() == StatusCode::OK {
            self.dedup.record_response(&key, outcome.body());
        }
        outcome
    }

    async fn route(
        &self,
        crypt: &MsgCrypt,
        params: &DeliveryParams,
        xml: &str,
    ) -> DispatchOutcome {
        let message = match ReceiveMessage::from_xml(xml) {
            Ok(message) => message,
            Err(e) => {
                warn!("[Dispatcher] Malformed message body: {}", e);
                return DispatchOutcome::Malformed;
            }
        };
        if !message.is_text() {
            debug!(
                "[Dispatcher] Ignoring '{}' message from {}",
                message.msg_type, message.from_user_name
            );
            return DispatchOutcome::Accepted;
        }

        let handler = match self.registry.resolve(message.agent_id) {
            Ok(Some(handler)) => handler,
            Ok(None) => {
                info!(
                    "[Dispatcher] No handler for agent {}, sending notice",
                    message.agent_id
                );
                return match self.seal(crypt, params, &message, UNROUTABLE_REPLY) {
                    Ok(sealed) => DispatchOutcome::Unroutable(sealed),
                    Err(fatal) => fatal,
                };
            }
            Err(e) => {
                error!("[Dispatcher] Handler registry unavailable: {}", e);
                return DispatchOutcome::Fatal(e.to_string());
            }
        };

        debug!(
            "[Dispatcher] agent={} user={} -> {}: {}",
            message.agent_id,
            message.from_user_name,
            handler.name(),
            message.content
        );
        let outcome = match handler.handle(&message, self.outbound.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("[Dispatcher] Handler '{}' failed: {}", handler.name(), e);
                self.report_failure(&message, handler.name(), e);
                return DispatchOutcome::Accepted;
            }
        };

        match outcome {
            HandlerOutcome::Reply(text) => match self.seal(crypt, params, &message, &text) {
                Ok(sealed) => DispatchOutcome::Replied(sealed),
                Err(fatal) => fatal,
            },
            HandlerOutcome::Background(work) => {
                let task = BackgroundTask {
                    agent_id: message.agent_id,
                    user_id: message.from_user_name.clone(),
                    label: format!("{}:{}", handler.name(), message.content.trim()),
                    work,
                };
                match self.workers.enqueue(task) {
                    Ok(()) => DispatchOutcome::Accepted,
                    Err(HubError::Busy) => match self.seal(crypt, params, &message, BUSY_REPLY) {
                        Ok(sealed) => DispatchOutcome::Replied(sealed),
                        Err(fatal) => fatal,
                    },
                    Err(e) => DispatchOutcome::Fatal(e.to_string()),
                }
            }
            HandlerOutcome::NoReply => DispatchOutcome::Accepted,
        }
    }

    fn seal(
        &self,
        crypt: &MsgCrypt,
        params: &DeliveryParams,
        inbound: &ReceiveMessage,
        text: &str,
    ) -> Result<String, DispatchOutcome> {
        let reply = InstanceReply::text_to(inbound, text);
        crypt
            .encrypt_message(&reply.to_xml(), &params.timestamp, &params.nonce)
            .map_err(|e| {
                error!("[Dispatcher] Failed to seal reply: {}", e);
                DispatchOutcome::Fatal(format!("reply encryption failed: {}", e.code()))
            })
    }

    /// Route a synchronous handler error through the worker pool so it gets
    /// the same retry and dead-letter treatment as background failures.
    fn report_failure(&self, message: &ReceiveMessage, handler: &str, err: HubError) {
        let task = BackgroundTask {
            agent_id: message.agent_id,
            user_id: message.from_user_name.clone(),
            label: format!("{}:error", handler),
            work: Box::pin(async move { Err(err) }),
        };
        if let Err(e) = self.workers.enqueue(task) {
            error!(
                "[Dispatcher] Could not queue error report for {}: {}",
                message.from_user_name, e
            );
        }
    }
}
