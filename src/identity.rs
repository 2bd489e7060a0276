//! Agent identities: ed25519 keypairs and the addresses derived from them.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Textual prefix of every address.
pub const ADDRESS_PREFIX: &str = "agent";

/// Agent address: the 32-byte ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 32]);

impl Address {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short display label, used as the default agent name.
    pub fn short(&self) -> String {
        format!("{}-{}", ADDRESS_PREFIX, &hex::encode(self.0)[..8])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", ADDRESS_PREFIX, hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or_else(|| Error::Identity(format!("address must start with '{}': {}", ADDRESS_PREFIX, s)))?;
        let bytes = hex::decode(hex_part)
            .map_err(|e| Error::Identity(format!("invalid address hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Identity(format!("address must be 32 bytes: {}", s)))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Key material an identity is built from.
#[derive(Clone)]
pub enum KeyMaterial {
    /// Arbitrary seed phrase; hashed into the secret key.
    Seed(String),
    /// Hex-encoded 32-byte ed25519 secret key.
    SecretKey(String),
    /// Fresh key from the OS RNG.
    Random,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Seed(_) => write!(f, "Seed(..)"),
            KeyMaterial::SecretKey(_) => write!(f, "SecretKey(..)"),
            KeyMaterial::Random => write!(f, "Random"),
        }
    }
}

/// Signing identity of an agent.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    address: Address,
}

impl Identity {
    /// Build an identity from key material. Seeds and secret keys are deterministic.
    pub fn generate_or_load(material: &KeyMaterial) -> Result<Self> {
        match material {
            KeyMaterial::Seed(seed) => Self::from_seed(seed),
            KeyMaterial::SecretKey(secret) => Self::from_secret_hex(secret),
            KeyMaterial::Random => Ok(Self::from_signing_key(SigningKey::generate(
                &mut rand::rngs::OsRng,
            ))),
        }
    }

    pub fn from_seed(seed: &str) -> Result<Self> {
        if seed.is_empty() {
            return Err(Error::Identity("seed must not be empty".to_string()));
        }
        let secret: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| Error::Identity(format!("invalid secret key hex: {}", e)))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| Error::Identity(format!("secret key must be 32 bytes, got {}", b.len())))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = Address(signing_key.verifying_key().to_bytes());
        Self { signing_key, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Hex-encoded secret key, for persisting a random identity.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.signing_key.sign(payload).to_bytes().to_vec()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("address", &self.address).finish()
    }
}

/// Verify `signature` over `payload` against the key behind `address`.
pub fn verify(address: &Address, payload: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(address.as_bytes()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(payload, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_is_deterministic() {
        let a = Identity::from_seed("alice secret phrase").unwrap();
        let b = Identity::generate_or_load(&KeyMaterial::Seed("alice secret phrase".into())).unwrap();
        let c = Identity::from_seed("bob secret phrase").unwrap();

        assert_eq!(a.address(), b.address());
        assert_ne!(a.address(), c.address());
    }

    #[test]
    fn test_sign_and_verify() {
        let id = Identity::from_seed("signer").unwrap();
        let sig = id.sign(b"hello");

        assert!(verify(&id.address(), b"hello", &sig));
        assert!(!verify(&id.address(), b"hellO", &sig));

        let other = Identity::from_seed("someone else").unwrap();
        assert!(!verify(&other.address(), b"hello", &sig));
        assert!(!verify(&id.address(), b"hello", &sig[..10]));
    }

    #[test]
    fn test_secret_round_trip() {
        let id = Identity::generate_or_load(&KeyMaterial::Random).unwrap();
        let restored = Identity::generate_or_load(&KeyMaterial::SecretKey(id.secret_hex())).unwrap();
        assert_eq!(id.address(), restored.address());
    }

    #[test]
    fn test_invalid_key_material() {
        assert!(matches!(Identity::from_seed(""), Err(Error::Identity(_))));
        assert!(matches!(Identity::from_secret_hex("zz"), Err(Error::Identity(_))));
        assert!(matches!(Identity::from_secret_hex("abcd"), Err(Error::Identity(_))));
    }

    #[test]
    fn test_address_text_form() {
        let id = Identity::from_seed("text").unwrap();
        let text = id.address().to_string();
        assert!(text.starts_with("agent"));
        assert_eq!(text.len(), 5 + 64);
        assert_eq!(text.parse::<Address>().unwrap(), id.address());
        assert!(id.address().short().starts_with("agent-"));

        assert!("agent1234".parse::<Address>().is_err());
        assert!("user00".parse::<Address>().is_err());

        let json = serde_json::to_string(&id.address()).unwrap();
        assert_eq!(json, format!("\"{}\"", text));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id.address());
    }
}
