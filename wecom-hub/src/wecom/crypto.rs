//! Callback envelope crypto
//!
//! WeCom signs every callback with `sha1(sort(token, timestamp, nonce,
//! ciphertext))` and encrypts the body with AES-256-CBC, IV = first 16 key
//! bytes, PKCS#7 padding to 32-byte blocks. The plaintext layout is
//! `random(16) | len(u32 BE) | message | receive_id`.

use std::collections::HashMap;
use std::sync::Arc;

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::info;

use crate::config::AppConfig;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const PAD_BLOCK: usize = 32;
const RANDOM_PREFIX: usize = 16;

/// Provider AES keys are 43 base64 characters whose last symbol may carry
/// non-zero trailing bits.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// Envelope failures, numbered with the provider's reference error codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("malformed envelope: {0}")]
    ParseXml(String),
    #[error("illegal AES key")]
    IllegalAesKey,
    #[error("receive id mismatch")]
    ReceiveIdMismatch,
    #[error("AES decryption failed")]
    Decrypt,
    #[error("illegal plaintext buffer")]
    IllegalBuffer,
    #[error("base64 decoding failed")]
    DecodeBase64,
    #[error("no crypto configured for {0}")]
    UnknownApp(String),
}

impl CryptoError {
    pub fn code(&self) -> i32 {
        match self {
            CryptoError::SignatureMismatch => -40001,
            CryptoError::ParseXml(_) => -40002,
            CryptoError::IllegalAesKey => -40004,
            CryptoError::ReceiveIdMismatch => -40005,
            CryptoError::Decrypt => -40007,
            CryptoError::IllegalBuffer => -40008,
            CryptoError::DecodeBase64 => -40010,
            CryptoError::UnknownApp(_) => -40012,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EncryptedBody {
    #[serde(rename = "Encrypt")]
    encrypt: String,
}

/// Output of sealing a reply: the XML body plus its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEnvelope {
    pub encrypt: String,
    pub signature: String,
    pub xml: String,
}

/// Envelope opener/sealer for one application.
#[derive(Clone)]
pub struct MsgCrypt {
    token: String,
    key: [u8; 32],
    receive_id: String,
}

impl std::fmt::Debug for MsgCrypt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgCrypt")
            .field("receive_id", &self.receive_id)
            .finish_non_exhaustive()
    }
}

impl MsgCrypt {
    pub fn new(
        token: impl Into<String>,
        encoding_aes_key: &str,
        receive_id: impl Into<String>,
    ) -> Result<Self, CryptoError> {
        if encoding_aes_key.len() != 43 {
            return Err(CryptoError::IllegalAesKey);
        }
        let decoded = KEY_ENGINE
            .decode(format!("{}=", encoding_aes_key))
            .map_err(|_| CryptoError::IllegalAesKey)?;
        let key: [u8; 32] = decoded
            .try_into()
            .map_err(|_| CryptoError::IllegalAesKey)?;
        Ok(Self {
            token: token.into(),
            key,
            receive_id: receive_id.into(),
        })
    }

    pub fn signature(&self, timestamp: &str, nonce: &str, encrypted: &str) -> String {
        let mut parts = [self.token.as_str(), timestamp, nonce, encrypted];
        parts.sort_unstable();
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    fn check_signature(
        &self,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
        encrypted: &str,
    ) -> Result<(), CryptoError> {
        if self.signature(timestamp, nonce, encrypted) == msg_signature {
            Ok(())
        } else {
            Err(CryptoError::SignatureMismatch)
        }
    }

    /// URL-verification handshake: returns the plaintext echo string.
    pub fn verify_url(
        &self,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
        echostr: &str,
    ) -> Result<String, CryptoError> {
        self.check_signature(msg_signature, timestamp, nonce, echostr)?;
        self.decrypt(echostr)
    }

    /// Open an encrypted callback body and return the inner XML.
    pub fn decrypt_message(
        &self,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
        body: &str,
    ) -> Result<String, CryptoError> {
        let envelope: EncryptedBody =
            quick_xml::de::from_str(body).map_err(|e| CryptoError::ParseXml(e.to_string()))?;
        self.check_signature(msg_signature, timestamp, nonce, &envelope.encrypt)?;
        self.decrypt(&envelope.encrypt)
    }

    /// Seal a reply XML for the synchronous HTTP response.
    pub fn encrypt_message(
        &self,
        reply: &str,
        timestamp: &str,
        nonce: &str,
    ) -> Result<String, CryptoError> {
        Ok(self.seal(reply, timestamp, nonce)?.xml)
    }

    pub fn seal(
        &self,
        plaintext: &str,
        timestamp: &str,
        nonce: &str,
    ) -> Result<SealedEnvelope, CryptoError> {
        let encrypt = self.encrypt(plaintext)?;
        let signature = self.signature(timestamp, nonce, &encrypt);
        let xml = format!(
            "<xml><Encrypt><![CDATA[{}]]></Encrypt><MsgSignature><![CDATA[{}]]></MsgSignature><TimeStamp>{}</TimeStamp><Nonce><![CDATA[{}]]></Nonce></xml>",
            encrypt, signature, timestamp, nonce
        );
        Ok(SealedEnvelope {
            encrypt,
            signature,
            xml,
        })
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let message = plaintext.as_bytes();
        let mut buf = Vec::with_capacity(
            RANDOM_PREFIX + 4 + message.len() + self.receive_id.len() + PAD_BLOCK,
        );
        buf.extend(
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(RANDOM_PREFIX),
        );
        buf.extend_from_slice(&(message.len() as u32).to_be_bytes());
        buf.extend_from_slice(message);
        buf.extend_from_slice(self.receive_id.as_bytes());

        let pad = PAD_BLOCK - (buf.len() % PAD_BLOCK);
        buf.extend(std::iter::repeat(pad as u8).take(pad));

        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.key[..16])
            .map_err(|_| CryptoError::IllegalAesKey)?;
        let encrypted = cipher.encrypt_padded_vec_mut::<NoPadding>(&buf);
        Ok(STANDARD.encode(encrypted))
    }

    fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let ciphertext = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CryptoError::DecodeBase64)?;
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(CryptoError::Decrypt);
        }

        let cipher = Aes256CbcDec::new_from_slices(&self.key, &self.key[..16])
            .map_err(|_| CryptoError::IllegalAesKey)?;
        let plain = cipher
            .decrypt_padded_vec_mut::<NoPadding>(&ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;

        let pad = *plain.last().ok_or(CryptoError::IllegalBuffer)? as usize;
        if pad == 0 || pad > PAD_BLOCK || pad > plain.len() {
            return Err(CryptoError::IllegalBuffer);
        }
        let content = &plain[..plain.len() - pad];
        if content.len() < RANDOM_PREFIX + 4 {
            return Err(CryptoError::IllegalBuffer);
        }

        let body = &content[RANDOM_PREFIX..];
        let len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
        if body.len() < 4 + len {
            return Err(CryptoError::IllegalBuffer);
        }
        let message = &body[4..4 + len];
        let receive_id = &body[4 + len..];
        if receive_id != self.receive_id.as_bytes() {
            return Err(CryptoError::ReceiveIdMismatch);
        }

        String::from_utf8(message.to_vec()).map_err(|_| CryptoError::IllegalBuffer)
    }
}

/// How the caller identified which application a delivery belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppSelector {
    /// Value of the `X-App-Id` header
    pub app_id: Option<String>,
    /// Value of the `X-Upstream` header (original public URL)
    pub upstream: Option<String>,
}

struct KeyringEntry {
    app_id: String,
    url_prefix: Option<String>,
    crypt: Arc<MsgCrypt>,
}

/// Per-application crypto table, built once at startup.
pub struct Keyring {
    entries: Vec<KeyringEntry>,
    by_app_id: HashMap<String, usize>,
}

impl Keyring {
    pub fn from_apps(corp_id: &str, apps: &[AppConfig]) -> Result<Self, CryptoError> {
        let mut entries = Vec::with_capacity(apps.len());
        let mut by_app_id = HashMap::new();
        for app in apps {
            info!("[Keyring] Creating envelope crypto for app '{}'", app.app_id);
            let crypt = MsgCrypt::new(app.token.clone(), &app.encoding_aes_key, corp_id)?;
            by_app_id.insert(app.app_id.clone(), entries.len());
            entries.push(KeyringEntry {
                app_id: app.app_id.clone(),
                url_prefix: app.url_prefix.clone(),
                crypt: Arc::new(crypt),
            });
        }
        Ok(Self { entries, by_app_id })
    }

    /// Pick the crypto for a delivery: explicit app id first, then the
    /// longest matching upstream URL prefix, then the first configured app.
    pub fn select(&self, selector: &AppSelector) -> Result<Arc<MsgCrypt>, CryptoError> {
        if let Some(app_id) = selector.app_id.as_deref() {
            return self
                .by_app_id
                .get(app_id)
                .map(|idx| self.entries[*idx].crypt.clone())
                .ok_or_else(|| CryptoError::UnknownApp(app_id.to_string()));
        }

        if let Some(upstream) = selector.upstream.as_deref() {
            let upstream = upstream.to_ascii_lowercase();
            let matched = self
                .entries
                .iter()
                .filter_map(|entry| {
                    let prefix = entry.url_prefix.as_deref()?.to_ascii_lowercase();
                    upstream.starts_with(&prefix).then_some((prefix.len(), entry))
                })
                .max_by_key(|(len, _)| *len);
            if let Some((_, entry)) = matched {
                return Ok(entry.crypt.clone());
            }
        }

        self.entries
            .first()
            .map(|entry| entry.crypt.clone())
            .ok_or_else(|| CryptoError::UnknownApp("<none>".to_string()))
    }

    pub fn app_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.app_id.as_str())
    }
}
