//! Hashes, keys, parties and signatures
//!
//! Keys are ed25519; hashes are SHA-256. Both are serialized as lowercase hex.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::CoreError;

fn decode_fixed<const N: usize>(text: &str) -> Result<[u8; N], CoreError> {
    let bytes = hex::decode(text)
        .map_err(|e| CoreError::SerializationError(format!("Invalid hex: {}", e)))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        CoreError::SerializationError(format!("Expected {} bytes, got {}", N, bytes.len()))
    })
}

macro_rules! hex_newtype_serde {
    ($name:ident, $len:expr) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                decode_fixed::<$len>(&text)
                    .map($name)
                    .map_err(serde::de::Error::custom)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &hex::encode(self.0)[..8])
            }
        }
    };
}

/// Value object: SHA-256 hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecureHash(pub [u8; 32]);

hex_newtype_serde!(SecureHash, 32);

impl SecureHash {
    /// Hash arbitrary bytes
    pub fn sha256(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        SecureHash(hasher.finalize().into())
    }

    /// Parse from hex
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        decode_fixed::<32>(text).map(SecureHash)
    }

    /// Raw bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Value object: ed25519 public key identifying a party
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartyKey(pub [u8; 32]);

hex_newtype_serde!(PartyKey, 32);

impl PartyKey {
    /// Parse from hex
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        decode_fixed::<32>(text).map(PartyKey)
    }

    fn verifying_key(&self) -> Result<VerifyingKey, CoreError> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CoreError::SignatureError(format!("Invalid public key {}: {}", self, e)))
    }
}

/// A well-known network participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Party {
    /// Legal name
    pub name: String,
    /// Key the party signs with
    pub owning_key: PartyKey,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A signature over some content together with the key that made it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature {
    /// Signing key
    pub by: PartyKey,
    /// Raw signature bytes, hex encoded
    pub bytes: String,
}

impl DigitalSignature {
    /// Check this signature against the content it claims to cover
    pub fn verify(&self, content: &[u8]) -> Result<(), CoreError> {
        let raw = hex::decode(&self.bytes)
            .map_err(|e| CoreError::SignatureError(format!("Malformed signature: {}", e)))?;
        let signature = Signature::from_slice(&raw)
            .map_err(|e| CoreError::SignatureError(format!("Malformed signature: {}", e)))?;
        self.by
            .verifying_key()?
            .verify(content, &signature)
            .map_err(|_| {
                CoreError::SignatureError(format!("Signature by {} does not verify", self.by))
            })
    }
}

/// An ed25519 key pair held by a node
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Build a key pair from 32 secret bytes
    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Derive a deterministic key pair from a seed phrase
    pub fn from_seed(seed: &str) -> Self {
        Self::from_secret(SecureHash::sha256(seed.as_bytes()).0)
    }

    /// Public half of the key pair
    pub fn public_key(&self) -> PartyKey {
        PartyKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign arbitrary bytes
    pub fn sign(&self, content: &[u8]) -> DigitalSignature {
        let signature = self.signing_key.sign(content);
        DigitalSignature {
            by: self.public_key(),
            bytes: hex::encode(signature.to_bytes()),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}
