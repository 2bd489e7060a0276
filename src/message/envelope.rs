//! Signed message envelopes, the unit of transport between agents.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::schema::SchemaDigest;
use crate::error::{Error, Result};
use crate::identity::{self, Address, Identity};

/// Wire format version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Message envelope carrying an encoded payload between two addresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub version: u32,
    pub sender: Address,
    pub target: Address,
    pub schema_digest: SchemaDigest,
    /// Encoded message body (base64 on the wire)
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// ed25519 signature over [`Envelope::signing_digest`] (hex on the wire)
    #[serde(with = "hex_bytes", default)]
    pub signature: Vec<u8>,
    pub session_id: Uuid,
    /// Expiration timestamp (unix ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl Envelope {
    pub fn builder(sender: Address) -> EnvelopeBuilder {
        EnvelopeBuilder::from(sender)
    }

    /// Digest covering every field except the signature.
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_be_bytes());
        hasher.update(self.sender.as_bytes());
        hasher.update(self.target.as_bytes());
        hasher.update(self.schema_digest.as_bytes());
        hasher.update((self.payload.len() as u64).to_be_bytes());
        hasher.update(&self.payload);
        hasher.update(self.session_id.as_bytes());
        match self.expires_at {
            Some(expires) => {
                hasher.update([1u8]);
                hasher.update(expires.to_be_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.finalize().into()
    }

    /// Sign with `identity`, which must own the sender address.
    pub fn sign(&mut self, identity: &Identity) -> Result<()> {
        if identity.address() != self.sender {
            return Err(Error::Identity(format!(
                "cannot sign envelope from {} with key for {}",
                self.sender,
                identity.address()
            )));
        }
        self.signature = identity.sign(&self.signing_digest());
        Ok(())
    }

    pub fn has_valid_signature(&self) -> bool {
        identity::verify(&self.sender, &self.signing_digest(), &self.signature)
    }

    /// Check if envelope has expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires| current_timestamp() > expires)
            .unwrap_or(false)
    }

    /// Admission check: not expired and signed by the sender.
    pub fn verify(&self) -> Result<()> {
        if let Some(expires) = self.expires_at {
            if current_timestamp() > expires {
                return Err(Error::Expired(expires));
            }
        }
        if !self.has_valid_signature() {
            return Err(Error::BadSignature(self.sender.to_string()));
        }
        Ok(())
    }
}

/// Builder for creating envelopes with fluent API.
pub struct EnvelopeBuilder {
    sender: Address,
    target: Option<Address>,
    schema_digest: Option<SchemaDigest>,
    payload: Vec<u8>,
    session_id: Option<Uuid>,
    ttl_seconds: Option<u64>,
}

impl EnvelopeBuilder {
    /// Start building an envelope from an agent.
    pub fn from(sender: Address) -> Self {
        Self {
            sender,
            target: None,
            schema_digest: None,
            payload: Vec::new(),
            session_id: None,
            ttl_seconds: None,
        }
    }

    pub fn to(mut self, target: Address) -> Self {
        self.target = Some(target);
        self
    }

    pub fn schema(mut self, digest: SchemaDigest) -> Self {
        self.schema_digest = Some(digest);
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Reuse a session, e.g. when replying. A fresh one is generated otherwise.
    pub fn session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }

    pub fn build(self) -> Result<Envelope> {
        let target = self
            .target
            .ok_or_else(|| Error::Validation("envelope target is required".to_string()))?;
        let schema_digest = self
            .schema_digest
            .ok_or_else(|| Error::Validation("envelope schema digest is required".to_string()))?;

        let expires_at = match self.ttl_seconds {
            Some(ttl) => Some(expiry_after(ttl).ok_or_else(|| {
                Error::Validation(format!("envelope ttl of {}s is out of range", ttl))
            })?),
            None => None,
        };

        Ok(Envelope {
            version: ENVELOPE_VERSION,
            sender: self.sender,
            target,
            schema_digest,
            payload: self.payload,
            signature: Vec::new(),
            session_id: self.session_id.unwrap_or_else(Uuid::new_v4),
            expires_at,
        })
    }

    pub fn build_signed(self, identity: &Identity) -> Result<Envelope> {
        let mut envelope = self.build()?;
        envelope.sign(identity)?;
        Ok(envelope)
    }
}

/// Unix ms `ttl` seconds from now, or `None` when that overflows.
pub(crate) fn expiry_after(ttl: u64) -> Option<i64> {
    i64::try_from(ttl)
        .ok()
        .and_then(|secs| secs.checked_mul(1000))
        .and_then(|ms| current_timestamp().checked_add(ms))
}

pub(crate) fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
