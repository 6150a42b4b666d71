//! Integrity stamps for QR payloads and the encrypted metadata copy.
//!
//! The stamp is the first [`STAMP_BYTES`] bytes of an HMAC-SHA256 over the ticket's identity
//! triple, keyed by a versioned signing key. The payload names the key version it was stamped
//! with, so rotated keys keep verifying old tickets for as long as they stay in the ring.

use std::collections::BTreeMap;
use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, SecondsFormat, Utc};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::models::{EventId, SealedMetadata, Ticket, TicketCode, UserId};

type HmacSha256 = Hmac<Sha256>;

pub const STAMP_BYTES: usize = 4;
pub const MIN_KEY_BYTES: usize = 32;
pub const SALT_BYTES: usize = 16;
const NONCE_BYTES: usize = 12;
const METADATA_INFO: &[u8] = b"campus-tickets/metadata/v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("{name} must be at least {min} bytes")]
    KeyTooShort { name: &'static str, min: usize },

    #[error("signing key version {0} is not loaded")]
    UnknownKeyVersion(u8),

    #[error("failed to encrypt ticket metadata")]
    Encryption,

    #[error("failed to decrypt ticket metadata")]
    Decryption,

    #[error("malformed encrypted metadata: {0}")]
    MalformedCipherText(String),

    #[error("failed to serialize ticket metadata: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SecretKey(Vec<u8>);

impl SecretKey {
    fn new(name: &'static str, bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() < MIN_KEY_BYTES {
            let mut bytes = bytes;
            bytes.zeroize();
            return Err(CryptoError::KeyTooShort {
                name,
                min: MIN_KEY_BYTES,
            });
        }
        Ok(Self(bytes))
    }
}

/// Key material loaded once at start-up. Never mutated afterwards.
pub struct KeyRing {
    current_version: u8,
    signing: BTreeMap<u8, SecretKey>,
    metadata: SecretKey,
}

impl KeyRing {
    pub fn new(
        current_version: u8,
        signing_key: Vec<u8>,
        metadata_key: Vec<u8>,
    ) -> Result<Self, CryptoError> {
        let mut signing = BTreeMap::new();
        signing.insert(
            current_version,
            SecretKey::new("TICKET_SIGNING_KEY", signing_key)?,
        );
        Ok(Self {
            current_version,
            signing,
            metadata: SecretKey::new("TICKET_METADATA_KEY", metadata_key)?,
        })
    }

    /// Keeps a rotated-out signing key for verification only.
    pub fn with_previous(mut self, version: u8, key: Vec<u8>) -> Result<Self, CryptoError> {
        if version != self.current_version {
            self.signing
                .insert(version, SecretKey::new("previous signing key", key)?);
        }
        Ok(self)
    }

    pub fn current_version(&self) -> u8 {
        self.current_version
    }

    pub fn versions(&self) -> impl Iterator<Item = u8> + '_ {
        self.signing.keys().copied()
    }

    fn signing_key(&self, version: u8) -> Option<&[u8]> {
        self.signing.get(&version).map(|k| k.0.as_slice())
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("current_version", &self.current_version)
            .field("versions", &self.signing.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn default_payload_version() -> u8 {
    1
}

/// The text encoded in the QR image. Plain JSON so any reader can extract it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrPayload {
    #[serde(default = "default_payload_version")]
    pub v: u8,
    pub code: TicketCode,
    pub event: EventId,
    pub user: UserId,
    pub issued: DateTime<Utc>,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regenerated: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
#[error("malformed QR payload: {0}")]
pub struct MalformedPayload(String);

impl QrPayload {
    pub fn parse(raw: &str) -> Result<Self, MalformedPayload> {
        serde_json::from_str(raw.trim()).map_err(|e| MalformedPayload(e.to_string()))
    }

    pub fn encode(&self) -> String {
        // Serializing plain strings and timestamps cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Whether the identity fields agree with the stored ticket.
    pub fn matches(&self, ticket: &Ticket) -> bool {
        self.code == ticket.ticket_code
            && self.event == ticket.event_id
            && self.user == ticket.user_id
    }
}

/// Plaintext of the encrypted metadata copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketMetadata {
    pub ticket_code: TicketCode,
    pub event_id: EventId,
    pub user_id: UserId,
    pub valid_until: DateTime<Utc>,
    pub issue_date: DateTime<Utc>,
}

impl From<&Ticket> for TicketMetadata {
    fn from(ticket: &Ticket) -> Self {
        Self {
            ticket_code: ticket.ticket_code.clone(),
            event_id: ticket.event_id,
            user_id: ticket.user_id,
            valid_until: ticket.valid_until,
            issue_date: ticket.issued_at,
        }
    }
}

#[derive(Debug)]
pub struct IntegrityGuard {
    keys: KeyRing,
}

impl IntegrityGuard {
    pub fn new(keys: KeyRing) -> Self {
        Self { keys }
    }

    /// Stamp over the immutable identity triple with the current key.
    pub fn stamp(&self, code: &TicketCode, event: EventId, user: UserId) -> String {
        self.stamp_with(self.keys.current_version(), code, event, user, None)
            .unwrap_or_default()
    }

    /// Builds and stamps the payload issued with a new ticket.
    pub fn issue_payload(
        &self,
        code: &TicketCode,
        event: EventId,
        user: UserId,
        issued: DateTime<Utc>,
    ) -> QrPayload {
        QrPayload {
            v: self.keys.current_version(),
            code: code.clone(),
            event,
            user,
            issued,
            hash: self.stamp(code, event, user),
            regenerated: None,
        }
    }

    /// Re-signs a payload with a `regenerated` marker. The marker is covered by the stamp,
    /// so the new payload verifies on its own and the original one keeps verifying.
    pub fn regenerate_payload(&self, original: &QrPayload, at: DateTime<Utc>) -> QrPayload {
        let version = self.keys.current_version();
        QrPayload {
            v: version,
            code: original.code.clone(),
            event: original.event,
            user: original.user,
            issued: original.issued,
            hash: self
                .stamp_with(version, &original.code, original.event, original.user, Some(at))
                .unwrap_or_default(),
            regenerated: Some(at),
        }
    }

    /// Recomputes the stamp from the payload's own fields and compares in constant time.
    pub fn verify(&self, payload: &QrPayload) -> bool {
        let Some(key) = self.keys.signing_key(payload.v) else {
            return false;
        };
        let Ok(tag) = hex::decode(&payload.hash) else {
            return false;
        };
        if tag.len() != STAMP_BYTES {
            return false;
        }
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
            return false;
        };
        mac.update(&stamp_message(
            &payload.code,
            payload.event,
            payload.user,
            payload.regenerated,
        ));
        mac.verify_truncated_left(&tag).is_ok()
    }

    fn stamp_with(
        &self,
        version: u8,
        code: &TicketCode,
        event: EventId,
        user: UserId,
        regenerated: Option<DateTime<Utc>>,
    ) -> Result<String, CryptoError> {
        let key = self
            .keys
            .signing_key(version)
            .ok_or(CryptoError::UnknownKeyVersion(version))?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|_| CryptoError::UnknownKeyVersion(version))?;
        mac.update(&stamp_message(code, event, user, regenerated));
        let digest = mac.finalize().into_bytes();
        Ok(hex::encode(&digest[..STAMP_BYTES]))
    }

    /// Encrypts the identity fields under a key derived from a fresh random salt.
    pub fn encrypt(&self, metadata: &TicketMetadata) -> Result<SealedMetadata, CryptoError> {
        let mut salt = [0u8; SALT_BYTES];
        OsRng.fill_bytes(&mut salt);

        let cipher = self.metadata_cipher(&salt)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let plaintext = serde_json::to_vec(metadata)?;
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| CryptoError::Encryption)?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(SealedMetadata {
            cipher_text: hex::encode(sealed),
            salt: hex::encode(salt),
        })
    }

    /// Needs the exact salt the copy was sealed with.
    pub fn decrypt(&self, sealed: &SealedMetadata) -> Result<TicketMetadata, CryptoError> {
        let salt = hex::decode(&sealed.salt)
            .map_err(|e| CryptoError::MalformedCipherText(format!("salt: {e}")))?;
        let bytes = hex::decode(&sealed.cipher_text)
            .map_err(|e| CryptoError::MalformedCipherText(format!("cipher text: {e}")))?;
        if bytes.len() <= NONCE_BYTES {
            return Err(CryptoError::MalformedCipherText(
                "cipher text shorter than nonce".to_string(),
            ));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_BYTES);

        let cipher = self.metadata_cipher(&salt)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decryption)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn metadata_cipher(&self, salt: &[u8]) -> Result<Aes256Gcm, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), &self.keys.metadata.0);
        let mut okm = [0u8; 32];
        hkdf.expand(METADATA_INFO, &mut okm)
            .map_err(|_| CryptoError::Encryption)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&okm));
        okm.zeroize();
        Ok(cipher)
    }
}

fn stamp_message(
    code: &TicketCode,
    event: EventId,
    user: UserId,
    regenerated: Option<DateTime<Utc>>,
) -> Vec<u8> {
    let mut message = format!("{code}|{event}|{user}");
    if let Some(at) = regenerated {
        message.push_str("|regenerated:");
        message.push_str(&at.to_rfc3339_opts(SecondsFormat::AutoSi, true));
    }
    message.into_bytes()
}
