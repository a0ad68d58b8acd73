//! Key material for Cairn peers.
//!
//! Keys are capabilities: callers hold a `Box<dyn PublicKey>` or a
//! `Box<dyn PrivateKey>` and never touch the algorithm behind it.
//!
//! Ed25519 is the only implemented algorithm. RSA and ECDSA are reserved tags:
//! the registry constructs them, but every operation on a reserved key fails
//! with `KeyError::UnsupportedAlgorithm`.
//!
//! Tag → constructor dispatch goes through a `KeyRegistry` that is built once
//! at startup and handed to whoever needs it. There is no global table.

use std::collections::HashMap;
use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroize;

/// Raw Ed25519 public key length.
pub const ED25519_PUBLIC_KEY_LEN: usize = 32;

/// Raw Ed25519 private key length: 32-byte seed followed by the public key.
pub const ED25519_PRIVATE_KEY_LEN: usize = 64;

/// Ed25519 signature length.
pub const ED25519_SIGNATURE_LEN: usize = 64;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
///
/// Used for DIGEST peer ids.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// ── Key types ─────────────────────────────────────────────────────────────────

/// Algorithm tag. Carried by every key and embedded in INLINE peer ids, so
/// the numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyType {
    Rsa = 0,
    Ed25519 = 1,
    Ecdsa = 2,
}

impl TryFrom<u8> for KeyType {
    type Error = KeyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyType::Rsa),
            1 => Ok(KeyType::Ed25519),
            2 => Ok(KeyType::Ecdsa),
            other => Err(KeyError::UnknownKeyType(other)),
        }
    }
}

impl From<KeyType> for u8 {
    fn from(t: KeyType) -> u8 {
        t as u8
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyType::Rsa => "rsa",
            KeyType::Ed25519 => "ed25519",
            KeyType::Ecdsa => "ecdsa",
        };
        f.write_str(name)
    }
}

// ── Capabilities ──────────────────────────────────────────────────────────────

/// Anything with an algorithm tag and a raw byte encoding.
pub trait Key: Send + Sync {
    fn key_type(&self) -> KeyType;

    /// Raw key bytes, without any envelope. Inverse of the registry parsers.
    fn raw(&self) -> Result<Vec<u8>, KeyError>;
}

/// A public key that verifies signatures made by its private half.
pub trait PublicKey: Key {
    /// `Ok(false)` for a bad or malformed signature. `Err` only when the key
    /// itself cannot perform verification.
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, KeyError>;
}

/// A private key that signs and yields its public half.
pub trait PrivateKey: Key {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError>;

    /// The matching public key. Deterministic in the private key.
    fn public(&self) -> Box<dyn PublicKey>;
}

/// Key equality: same algorithm tag and constant-time-equal raw bytes.
///
/// A key that cannot export its raw bytes is never equal to anything.
pub fn keys_equal<A, B>(a: &A, b: &B) -> bool
where
    A: Key + ?Sized,
    B: Key + ?Sized,
{
    if a.key_type() != b.key_type() {
        return false;
    }
    match (a.raw(), b.raw()) {
        (Ok(x), Ok(y)) => x.ct_eq(&y).into(),
        _ => false,
    }
}

impl PartialEq for dyn PublicKey {
    fn eq(&self, other: &Self) -> bool {
        keys_equal(self, other)
    }
}

impl PartialEq for dyn PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        keys_equal(self, other)
    }
}

impl fmt::Debug for dyn PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw() {
            Ok(raw) => write!(f, "PublicKey({}, {})", self.key_type(), hex::encode(raw)),
            Err(_) => write!(f, "PublicKey({}, <unavailable>)", self.key_type()),
        }
    }
}

impl fmt::Debug for dyn PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({}, <redacted>)", self.key_type())
    }
}

// ── Ed25519 ───────────────────────────────────────────────────────────────────

/// Ed25519 public key.
#[derive(Clone)]
pub struct Ed25519PublicKey(VerifyingKey);

impl Ed25519PublicKey {
    /// Parse a 32-byte compressed Edwards point.
    pub fn from_bytes(data: &[u8]) -> Result<Self, KeyError> {
        let bytes: &[u8; ED25519_PUBLIC_KEY_LEN] =
            data.try_into().map_err(|_| KeyError::InvalidKey {
                key_type: KeyType::Ed25519,
                reason: format!(
                    "expected {ED25519_PUBLIC_KEY_LEN} public key bytes, got {}",
                    data.len()
                ),
            })?;
        let key = VerifyingKey::from_bytes(bytes).map_err(|e| KeyError::InvalidKey {
            key_type: KeyType::Ed25519,
            reason: e.to_string(),
        })?;
        Ok(Self(key))
    }
}

impl Key for Ed25519PublicKey {
    fn key_type(&self) -> KeyType {
        KeyType::Ed25519
    }

    fn raw(&self) -> Result<Vec<u8>, KeyError> {
        Ok(self.0.to_bytes().to_vec())
    }
}

impl PublicKey for Ed25519PublicKey {
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, KeyError> {
        let Ok(signature) = Signature::from_slice(signature) else {
            return Ok(false);
        };
        Ok(self.0.verify(data, &signature).is_ok())
    }
}

/// Ed25519 private key. The signing key zeroizes itself on drop.
pub struct Ed25519PrivateKey(SigningKey);

impl Ed25519PrivateKey {
    /// Generate a key from the supplied randomness source.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(SigningKey::generate(rng))
    }

    /// Parse raw private key bytes.
    ///
    /// Accepts the 64-byte `seed || public` form, and a legacy 96-byte form
    /// whose trailing 32 bytes must repeat the public key. The redundant copy
    /// is compared in constant time and dropped.
    pub fn from_bytes(data: &[u8]) -> Result<Self, KeyError> {
        let keypair = match data.len() {
            ED25519_PRIVATE_KEY_LEN => data,
            n if n == ED25519_PRIVATE_KEY_LEN + ED25519_PUBLIC_KEY_LEN => {
                let embedded = &data[ED25519_PRIVATE_KEY_LEN - ED25519_PUBLIC_KEY_LEN
                    ..ED25519_PRIVATE_KEY_LEN];
                let redundant = &data[ED25519_PRIVATE_KEY_LEN..];
                if !bool::from(embedded.ct_eq(redundant)) {
                    return Err(KeyError::InvalidKey {
                        key_type: KeyType::Ed25519,
                        reason: "redundant public key does not match".into(),
                    });
                }
                &data[..ED25519_PRIVATE_KEY_LEN]
            }
            n => {
                return Err(KeyError::InvalidKey {
                    key_type: KeyType::Ed25519,
                    reason: format!(
                        "expected {} or {} private key bytes, got {n}",
                        ED25519_PRIVATE_KEY_LEN,
                        ED25519_PRIVATE_KEY_LEN + ED25519_PUBLIC_KEY_LEN
                    ),
                })
            }
        };

        let mut bytes = [0u8; ED25519_PRIVATE_KEY_LEN];
        bytes.copy_from_slice(keypair);
        let signing = SigningKey::from_keypair_bytes(&bytes).map_err(|e| KeyError::InvalidKey {
            key_type: KeyType::Ed25519,
            reason: e.to_string(),
        });
        bytes.zeroize();
        Ok(Self(signing?))
    }
}

impl Key for Ed25519PrivateKey {
    fn key_type(&self) -> KeyType {
        KeyType::Ed25519
    }

    fn raw(&self) -> Result<Vec<u8>, KeyError> {
        Ok(self.0.to_keypair_bytes().to_vec())
    }
}

impl PrivateKey for Ed25519PrivateKey {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        Ok(self.0.sign(data).to_bytes().to_vec())
    }

    fn public(&self) -> Box<dyn PublicKey> {
        Box::new(Ed25519PublicKey(self.0.verifying_key()))
    }
}

// ── Reserved algorithms ───────────────────────────────────────────────────────

/// Placeholder for a registered but unimplemented algorithm.
///
/// Construction succeeds so the tag round-trips through the registry; every
/// operation fails closed.
pub struct ReservedKey {
    key_type: KeyType,
}

impl ReservedKey {
    pub fn new(key_type: KeyType) -> Self {
        Self { key_type }
    }
}

impl Key for ReservedKey {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn raw(&self) -> Result<Vec<u8>, KeyError> {
        Err(KeyError::UnsupportedAlgorithm(self.key_type))
    }
}

impl PublicKey for ReservedKey {
    fn verify(&self, _data: &[u8], _signature: &[u8]) -> Result<bool, KeyError> {
        Err(KeyError::UnsupportedAlgorithm(self.key_type))
    }
}

impl PrivateKey for ReservedKey {
    fn sign(&self, _data: &[u8]) -> Result<Vec<u8>, KeyError> {
        Err(KeyError::UnsupportedAlgorithm(self.key_type))
    }

    fn public(&self) -> Box<dyn PublicKey> {
        Box::new(ReservedKey::new(self.key_type))
    }
}

// ── Generation ────────────────────────────────────────────────────────────────

/// Generate a keypair of the given type from a caller-supplied RNG.
///
/// Production callers pass `rand::rngs::OsRng`; tests pass a seeded `StdRng`.
pub fn generate_keypair<R: RngCore + CryptoRng>(
    key_type: KeyType,
    rng: &mut R,
) -> Result<(Box<dyn PrivateKey>, Box<dyn PublicKey>), KeyError> {
    match key_type {
        KeyType::Ed25519 => {
            let private = Ed25519PrivateKey::generate(rng);
            let public = private.public();
            Ok((Box::new(private), public))
        }
        other => Err(KeyError::UnsupportedAlgorithm(other)),
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Builds a public key from its raw bytes.
pub type PublicKeyParser = fn(&[u8]) -> Result<Box<dyn PublicKey>, KeyError>;

/// Builds a private key from its raw bytes.
pub type PrivateKeyParser = fn(&[u8]) -> Result<Box<dyn PrivateKey>, KeyError>;

/// Maps algorithm tags to key constructors.
///
/// Populate it at startup, then share it read-only (typically behind an
/// `Arc`). Lookups for tags with no registered constructor fail with
/// `KeyError::UnsupportedAlgorithm`.
#[derive(Clone, Default)]
pub struct KeyRegistry {
    public: HashMap<KeyType, PublicKeyParser>,
    private: HashMap<KeyType, PrivateKeyParser>,
}

impl KeyRegistry {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Ed25519 plus the reserved RSA and ECDSA placeholders.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register_public(KeyType::Ed25519, parse_ed25519_public);
        registry.register_private(KeyType::Ed25519, parse_ed25519_private);
        registry.register_public(KeyType::Rsa, parse_rsa_public);
        registry.register_private(KeyType::Rsa, parse_rsa_private);
        registry.register_public(KeyType::Ecdsa, parse_ecdsa_public);
        registry.register_private(KeyType::Ecdsa, parse_ecdsa_private);
        registry
    }

    pub fn register_public(&mut self, key_type: KeyType, parser: PublicKeyParser) {
        self.public.insert(key_type, parser);
    }

    pub fn register_private(&mut self, key_type: KeyType, parser: PrivateKeyParser) {
        self.private.insert(key_type, parser);
    }

    /// True if a public key constructor is registered for `key_type`.
    pub fn supports(&self, key_type: KeyType) -> bool {
        self.public.contains_key(&key_type)
    }

    pub fn unmarshal_public_key(
        &self,
        key_type: KeyType,
        data: &[u8],
    ) -> Result<Box<dyn PublicKey>, KeyError> {
        let parser = self
            .public
            .get(&key_type)
            .ok_or(KeyError::UnsupportedAlgorithm(key_type))?;
        parser(data)
    }

    pub fn unmarshal_private_key(
        &self,
        key_type: KeyType,
        data: &[u8],
    ) -> Result<Box<dyn PrivateKey>, KeyError> {
        let parser = self
            .private
            .get(&key_type)
            .ok_or(KeyError::UnsupportedAlgorithm(key_type))?;
        parser(data)
    }
}

fn parse_ed25519_public(data: &[u8]) -> Result<Box<dyn PublicKey>, KeyError> {
    Ok(Box::new(Ed25519PublicKey::from_bytes(data)?))
}

fn parse_ed25519_private(data: &[u8]) -> Result<Box<dyn PrivateKey>, KeyError> {
    Ok(Box::new(Ed25519PrivateKey::from_bytes(data)?))
}

fn parse_rsa_public(_: &[u8]) -> Result<Box<dyn PublicKey>, KeyError> {
    Ok(Box::new(ReservedKey::new(KeyType::Rsa)))
}

fn parse_rsa_private(_: &[u8]) -> Result<Box<dyn PrivateKey>, KeyError> {
    Ok(Box::new(ReservedKey::new(KeyType::Rsa)))
}

fn parse_ecdsa_public(_: &[u8]) -> Result<Box<dyn PublicKey>, KeyError> {
    Ok(Box::new(ReservedKey::new(KeyType::Ecdsa)))
}

fn parse_ecdsa_private(_: &[u8]) -> Result<Box<dyn PrivateKey>, KeyError> {
    Ok(Box::new(ReservedKey::new(KeyType::Ecdsa)))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("{0} keys are not supported")]
    UnsupportedAlgorithm(KeyType),

    #[error("unknown key type tag: 0x{0:02x}")]
    UnknownKeyType(u8),

    #[error("invalid {key_type} key: {reason}")]
    InvalidKey { key_type: KeyType, reason: String },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
