//! Ticket payload codec.
//!
//! A payload is what the scannable code carries: the ticket's identity plus a
//! keyed integrity tag. Layout, big-endian, 57 bytes:
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 1    | version (`1`)                  |
//! | 1      | 16   | ticket id (UUID bytes)         |
//! | 17     | 8    | issued_at, Unix milliseconds   |
//! | 25     | 32   | HMAC-SHA256 over bytes `0..25` |
//!
//! Encoding is pure. Decoding recomputes the tag with the process secret, so a
//! payload that parses but was altered or minted elsewhere is reported as
//! [`CodecError::Forged`] rather than [`CodecError::Malformed`].

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::ticket::TicketId;

type HmacSha256 = Hmac<Sha256>;

pub const PAYLOAD_VERSION: u8 = 1;
pub const TAG_LEN: usize = 32;
pub const MIN_SECRET_LEN: usize = 16;
const SIGNED_LEN: usize = 1 + 16 + 8;
pub const PAYLOAD_LEN: usize = SIGNED_LEN + TAG_LEN;

/// Keyed tag proving a payload was issued by this process's key holder.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntegrityTag([u8; TAG_LEN]);

impl IntegrityTag {
    pub fn from_bytes(bytes: [u8; TAG_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TAG_LEN] {
        &self.0
    }
}

impl fmt::Debug for IntegrityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntegrityTag(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("payload integrity tag does not match")]
    Forged,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("secret key must be at least {MIN_SECRET_LEN} bytes, got {0}")]
    TooShort(usize),
}

/// Process-wide secret used to tag payloads.
#[derive(Clone)]
pub struct IntegrityKey {
    mac: HmacSha256,
}

impl IntegrityKey {
    pub fn from_secret(secret: &[u8]) -> Result<Self, KeyError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(KeyError::TooShort(secret.len()));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| KeyError::TooShort(secret.len()))?;
        Ok(Self { mac })
    }

    /// Fresh random 32-byte key from the OS entropy source.
    pub fn generate() -> Result<Self, KeyError> {
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self::from_secret(&secret)
    }

    fn mac_over(&self, signed: &[u8]) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(signed);
        mac
    }
}

impl fmt::Debug for IntegrityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IntegrityKey(<redacted>)")
    }
}

/// Identity and integrity fields carried by a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadFields {
    pub ticket_id: TicketId,
    pub issued_at: DateTime<Utc>,
    pub integrity_tag: IntegrityTag,
}

/// Encodes payloads and verifies scanned ones against the process secret.
#[derive(Debug, Clone)]
pub struct TicketCodec {
    key: IntegrityKey,
}

impl TicketCodec {
    pub fn new(key: IntegrityKey) -> Self {
        Self { key }
    }

    /// Tag for a ticket issued at `issued_at` (millisecond precision is what the payload keeps).
    pub fn tag(&self, ticket_id: &TicketId, issued_at: DateTime<Utc>) -> IntegrityTag {
        let signed = signed_prefix(ticket_id, issued_at);
        let digest = self.key.mac_over(&signed).finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest);
        IntegrityTag(tag)
    }

    /// Constant-time check of `fields.integrity_tag` against a recomputed tag.
    pub fn verify(&self, fields: &PayloadFields) -> bool {
        let signed = signed_prefix(&fields.ticket_id, fields.issued_at);
        self.key
            .mac_over(&signed)
            .verify_slice(fields.integrity_tag.as_bytes())
            .is_ok()
    }

    /// Serialize identity and tag. Same inputs always produce the same bytes.
    pub fn encode(fields: &PayloadFields) -> Bytes {
        let mut buf = BytesMut::with_capacity(PAYLOAD_LEN);
        buf.put_slice(&signed_prefix(&fields.ticket_id, fields.issued_at));
        buf.put_slice(fields.integrity_tag.as_bytes());
        buf.freeze()
    }

    pub fn decode(&self, payload: &[u8]) -> Result<PayloadFields, CodecError> {
        if payload.len() != PAYLOAD_LEN {
            return Err(CodecError::Malformed(format!(
                "expected {PAYLOAD_LEN} bytes, got {}",
                payload.len()
            )));
        }

        let mut buf = payload;
        let version = buf.get_u8();
        if version != PAYLOAD_VERSION {
            return Err(CodecError::Malformed(format!(
                "unsupported payload version {version}"
            )));
        }

        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let millis = buf.get_i64();
        let issued_at = DateTime::from_timestamp_millis(millis).ok_or_else(|| {
            CodecError::Malformed(format!("issued_at {millis} is out of range"))
        })?;
        let mut tag = [0u8; TAG_LEN];
        buf.copy_to_slice(&mut tag);

        let fields = PayloadFields {
            ticket_id: TicketId::from_bytes(id),
            issued_at,
            integrity_tag: IntegrityTag(tag),
        };

        if !self.verify(&fields) {
            tracing::debug!(ticket = %fields.ticket_id, "Payload tag verification failed");
            return Err(CodecError::Forged);
        }
        Ok(fields)
    }
}

fn signed_prefix(ticket_id: &TicketId, issued_at: DateTime<Utc>) -> [u8; SIGNED_LEN] {
    let mut signed = [0u8; SIGNED_LEN];
    let mut buf = &mut signed[..];
    buf.put_u8(PAYLOAD_VERSION);
    buf.put_slice(ticket_id.as_bytes());
    buf.put_i64(issued_at.timestamp_millis());
    signed
}

/// Text form of a payload for collaborators that move strings (QR text, JSON).
pub fn payload_to_text(payload: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(payload)
}

pub fn payload_from_text(text: &str) -> Result<Vec<u8>, CodecError> {
    URL_SAFE_NO_PAD
        .decode(text.trim())
        .map_err(|e| CodecError::Malformed(format!("invalid payload text: {e}")))
}
