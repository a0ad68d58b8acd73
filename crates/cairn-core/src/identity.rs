//! Self-certifying peer identifiers.
//!
//! A `PeerId` is computed once from a public key and compared by bytes only.
//! Wire layout (self-describing):
//!
//!   [varint code] [varint length] [payload]
//!
//!   code 0x00  INLINE  payload = key type tag || raw public key bytes
//!   code 0x1e  DIGEST  payload = BLAKE3-256(raw public key bytes)
//!
//! INLINE is used while the raw key fits in `MAX_INLINE_KEY_LENGTH` bytes:
//! it skips hashing and lets the key be recovered from the id. Larger keys
//! are hashed, and the id no longer carries the key.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::crypto::{hash, KeyError, KeyRegistry, KeyType, PublicKey};

/// Raw keys up to this many bytes are embedded verbatim.
///
/// Tunable. Changing it changes which ids new keys produce, not how existing
/// ids decode.
pub const MAX_INLINE_KEY_LENGTH: usize = 42;

/// Length of the DIGEST payload.
pub const DIGEST_LEN: usize = 32;

/// Longest varint accepted in an id header.
const MAX_VARINT_LEN: usize = 9;

// ── Encoding ──────────────────────────────────────────────────────────────────

/// How a `PeerId` carries its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdEncoding {
    /// Raw key bytes embedded; key is recoverable.
    Inline,
    /// One-way BLAKE3 digest of the raw key.
    Digest,
}

impl IdEncoding {
    pub const fn code(self) -> u64 {
        match self {
            IdEncoding::Inline => 0x00,
            IdEncoding::Digest => 0x1e,
        }
    }

    fn from_code(code: u64) -> Option<Self> {
        match code {
            0x00 => Some(IdEncoding::Inline),
            0x1e => Some(IdEncoding::Digest),
            _ => None,
        }
    }
}

impl fmt::Display for IdEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdEncoding::Inline => f.write_str("inline"),
            IdEncoding::Digest => f.write_str("digest"),
        }
    }
}

// ── PeerId ────────────────────────────────────────────────────────────────────

/// Identifier derived from a peer's public key. Immutable once built.
///
/// Equality, ordering and hashing follow the encoded bytes; the cached
/// encoding and payload offset are functions of them.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    bytes: Vec<u8>,
    encoding: IdEncoding,
    payload_at: usize,
}

impl PeerId {
    /// Derive the id for `key`.
    ///
    /// Pure and deterministic: equal raw key bytes always give equal ids.
    pub fn from_public_key<K: PublicKey + ?Sized>(key: &K) -> Result<Self, IdentityError> {
        let raw = key.raw().map_err(IdentityError::KeyExport)?;

        let mut out = Vec::with_capacity(2 + 1 + raw.len().max(DIGEST_LEN));
        let encoding = if raw.len() <= MAX_INLINE_KEY_LENGTH {
            put_uvarint(&mut out, IdEncoding::Inline.code());
            put_uvarint(&mut out, (1 + raw.len()) as u64);
            IdEncoding::Inline
        } else {
            put_uvarint(&mut out, IdEncoding::Digest.code());
            put_uvarint(&mut out, DIGEST_LEN as u64);
            IdEncoding::Digest
        };
        let payload_at = out.len();
        match encoding {
            IdEncoding::Inline => {
                out.push(u8::from(key.key_type()));
                out.extend_from_slice(&raw);
            }
            IdEncoding::Digest => out.extend_from_slice(&hash(&raw)),
        }

        Ok(PeerId {
            bytes: out,
            encoding,
            payload_at,
        })
    }

    /// Parse an id received from elsewhere. The encoding is validated.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let (encoding, payload_at) = decode(bytes)?;
        Ok(PeerId {
            bytes: bytes.to_vec(),
            encoding,
            payload_at,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn encoding(&self) -> IdEncoding {
        self.encoding
    }

    /// INLINE: tag + raw key. DIGEST: the digest.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.payload_at..]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.bytes))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| IdentityError::Malformed("not hex"))?;
        PeerId::from_bytes(&bytes)
    }
}

/// Validate `bytes` as an id. Returns the encoding and the payload offset.
fn decode(bytes: &[u8]) -> Result<(IdEncoding, usize), IdentityError> {
    let (code, rest) = read_uvarint(bytes)?;
    let encoding =
        IdEncoding::from_code(code).ok_or(IdentityError::Malformed("unknown encoding code"))?;
    let (len, payload) = read_uvarint(rest)?;
    if payload.len() as u64 != len {
        return Err(IdentityError::Malformed("length does not match payload"));
    }
    match encoding {
        IdEncoding::Digest if payload.len() != DIGEST_LEN => {
            Err(IdentityError::Malformed("digest has wrong length"))
        }
        IdEncoding::Inline if payload.is_empty() => {
            Err(IdentityError::Malformed("inline id has no key type"))
        }
        _ => Ok((encoding, bytes.len() - payload.len())),
    }
}

// ── Varint ────────────────────────────────────────────────────────────────────

fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Unsigned LEB128. Rejects non-minimal encodings so each id has exactly one
/// byte representation.
fn read_uvarint(bytes: &[u8]) -> Result<(u64, &[u8]), IdentityError> {
    let mut value = 0u64;
    for (i, &b) in bytes.iter().enumerate().take(MAX_VARINT_LEN) {
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            if b == 0 && i > 0 {
                return Err(IdentityError::Malformed("non-minimal varint"));
            }
            return Ok((value, &bytes[i + 1..]));
        }
    }
    Err(IdentityError::Malformed("truncated varint"))
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Derives, verifies and unpacks peer ids.
///
/// Stateless apart from the shared registry; safe to clone and use from any
/// number of threads.
#[derive(Clone)]
pub struct IdentityCodec {
    registry: Arc<KeyRegistry>,
}

impl IdentityCodec {
    pub fn new(registry: Arc<KeyRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub fn derive<K: PublicKey + ?Sized>(&self, key: &K) -> Result<PeerId, IdentityError> {
        PeerId::from_public_key(key)
    }

    /// True iff `id` was derived from `key`. Never errors.
    pub fn verify<K: PublicKey + ?Sized>(&self, id: &PeerId, key: &K) -> bool {
        match PeerId::from_public_key(key) {
            Ok(derived) => derived == *id,
            Err(e) => {
                tracing::debug!(peer_id = %id, error = %e, "cannot derive peer id for verification");
                false
            }
        }
    }

    /// Recover the public key embedded in an INLINE id.
    pub fn extract_public_key(&self, id: &PeerId) -> Result<Box<dyn PublicKey>, IdentityError> {
        if id.encoding() == IdEncoding::Digest {
            return Err(IdentityError::NoEmbeddedKey(id.clone()));
        }

        let (&tag, raw) = id
            .payload()
            .split_first()
            .ok_or(IdentityError::Malformed("inline id has no key type"))?;
        let key_type =
            KeyType::try_from(tag).map_err(|_| IdentityError::UnsupportedAlgorithm { tag })?;

        self.registry
            .unmarshal_public_key(key_type, raw)
            .map_err(|e| match e {
                KeyError::UnsupportedAlgorithm(_) => IdentityError::UnsupportedAlgorithm { tag },
                other => IdentityError::InvalidEmbeddedKey(other),
            })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("cannot export public key: {0}")]
    KeyExport(#[source] KeyError),

    #[error("no key constructor registered for key type 0x{tag:02x}")]
    UnsupportedAlgorithm { tag: u8 },

    #[error("peer id {0} is a digest and embeds no public key")]
    NoEmbeddedKey(PeerId),

    #[error("embedded public key is invalid: {0}")]
    InvalidEmbeddedKey(#[source] KeyError),

    #[error("malformed peer id: {0}")]
    Malformed(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
