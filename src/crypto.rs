//! Hashing, signing, and address derivation.
//!
//! Record hashes are BLAKE2b-256 over canonical JSON (recursively sorted
//! keys, compact separators). Signatures are Ed25519 over the same
//! canonical form. The canonical serializer is the single enforced helper;
//! nothing else may produce bytes for hashing or signing.

use crate::types::Address;
use blake2::digest::consts::{U24, U32};
use blake2::{Blake2b, Digest};
use ed25519_consensus::{Signature, SigningKey, VerificationKey};
use rand::RngCore;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

type Blake2b256 = Blake2b<U32>;
type Blake2b192 = Blake2b<U24>;

/// Address prefix; the rest is the hex BLAKE2b-192 digest of the public key.
pub const ADDRESS_PREFIX: &str = "ndo";

/// Total address length: prefix + 48 hex characters.
pub const ADDRESS_LEN: usize = 51;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("key file error: {0}")]
    KeyFile(#[from] std::io::Error),
}

// =============================================================================
// CANONICAL JSON
// =============================================================================

/// Byte-stable JSON: object keys sorted recursively, compact separators.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => other.to_string(),
    }
}

/// Canonical JSON of `value` with the named top-level fields removed.
/// This is how txids, block hashes, and signing messages are derived.
pub fn canonical_without<T: Serialize>(value: &T, exclude: &[&str]) -> Result<String, CryptoError> {
    let mut v = serde_json::to_value(value)?;
    if let Value::Object(map) = &mut v {
        for key in exclude {
            map.remove(*key);
        }
    }
    Ok(canonical_json(&v))
}

// =============================================================================
// HASHING
// =============================================================================

/// Hex BLAKE2b-256 digest.
pub fn blake2b_hash(data: &[u8]) -> String {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Raw BLAKE2b-256 digest, for byte-wise comparisons.
pub fn blake2b_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash a serializable record minus the named fields.
pub fn hash_record<T: Serialize>(value: &T, exclude: &[&str]) -> Result<String, CryptoError> {
    Ok(blake2b_hash(canonical_without(value, exclude)?.as_bytes()))
}

/// Random nonce carried in transactions to make txids unique.
pub fn create_nonce() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// =============================================================================
// KEYS AND SIGNATURES
// =============================================================================

pub struct Keypair {
    secret: SigningKey,
    public: VerificationKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = SigningKey::new(rand::thread_rng());
        let public = secret.verification_key();
        Self { secret, public }
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(secret_hex)?;
        let raw: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidSecretKey)?;
        let secret = SigningKey::from(raw);
        let public = secret.verification_key();
        Ok(Self { secret, public })
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public.to_bytes())
    }

    pub fn address(&self) -> Address {
        make_address(&self.public_hex())
    }

    /// Hex Ed25519 signature over the message bytes.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.secret.sign(message).to_bytes())
    }

    /// Load the key file or generate and persist a fresh keypair.
    /// Returns the keypair and whether it was freshly generated.
    pub fn load_or_generate(path: &std::path::Path) -> Result<(Self, bool), CryptoError> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let stored: serde_json::Value = serde_json::from_str(&raw)?;
            let secret_hex = stored
                .get("private_key")
                .and_then(|v| v.as_str())
                .ok_or(CryptoError::InvalidSecretKey)?;
            return Ok((Self::from_secret_hex(secret_hex)?, false));
        }

        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored = serde_json::json!({
            "private_key": keypair.secret_hex(),
            "public_key": keypair.public_hex(),
            "address": keypair.address(),
        });
        std::fs::write(path, serde_json::to_string_pretty(&stored)?)?;
        Ok((keypair, true))
    }
}

pub fn verify_signature(
    public_key_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), CryptoError> {
    let pk_bytes = hex::decode(public_key_hex)?;
    let pk_raw: [u8; 32] = pk_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let public = VerificationKey::try_from(pk_raw).map_err(|_| CryptoError::InvalidPublicKey)?;

    let sig_bytes = hex::decode(signature_hex)?;
    let sig_raw: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let signature = Signature::from(sig_raw);

    public
        .verify(&signature, message)
        .map_err(|_| CryptoError::InvalidSignature)
}

// =============================================================================
// ADDRESSES
// =============================================================================

/// Derive an address from a hex public key.
pub fn make_address(public_key_hex: &str) -> Address {
    let mut hasher = Blake2b192::new();
    hasher.update(public_key_hex.as_bytes());
    format!("{ADDRESS_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Structural address check: prefix, length, hex body.
pub fn validate_address(address: &str) -> bool {
    address.len() == ADDRESS_LEN
        && address.starts_with(ADDRESS_PREFIX)
        && address[ADDRESS_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit())
}

/// Confirm the sender address is derived from the attached public key.
pub fn proof_sender(sender: &str, public_key_hex: &str) -> bool {
    make_address(public_key_hex) == sender
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"d": 2, "c": [3, {"f": 4, "e": 5}]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":[3,{"e":5,"f":4}],"d":2},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_without_strips_fields() {
        let value = json!({"txid": "x", "signature": "y", "amount": 5});
        let stripped = canonical_without(&value, &["txid", "signature"]).unwrap();
        assert_eq!(stripped, r#"{"amount":5}"#);
    }

    #[test]
    fn test_hash_is_stable() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(hash_record(&a, &[]).unwrap(), hash_record(&b, &[]).unwrap());
        assert_eq!(hash_record(&a, &[]).unwrap().len(), 64);
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"message");
        assert!(verify_signature(&keypair.public_hex(), b"message", &sig).is_ok());
        assert!(verify_signature(&keypair.public_hex(), b"other", &sig).is_err());
    }

    #[test]
    fn test_keypair_from_secret_hex() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_hex(&keypair.secret_hex()).unwrap();
        assert_eq!(keypair.public_hex(), restored.public_hex());
        assert_eq!(keypair.address(), restored.address());
    }

    #[test]
    fn test_address_shape() {
        let keypair = Keypair::generate();
        let address = keypair.address();
        assert!(validate_address(&address));
        assert!(proof_sender(&address, &keypair.public_hex()));
        assert!(!validate_address("ndo123"));
        assert!(!validate_address(&address.replace("ndo", "xyz")));
        assert!(!proof_sender(&address, "deadbeef"));
    }
}
