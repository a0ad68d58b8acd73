use std::sync::Arc;

use cairn_core::crypto::{
    generate_keypair, Key, KeyError, KeyRegistry, KeyType, PublicKey, ReservedKey,
};
use cairn_core::identity::{IdEncoding, IdentityCodec, IdentityError, PeerId};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Public key with caller-chosen raw bytes, tagged RSA.
struct WideKey(Vec<u8>);

impl Key for WideKey {
    fn key_type(&self) -> KeyType {
        KeyType::Rsa
    }

    fn raw(&self) -> Result<Vec<u8>, KeyError> {
        Ok(self.0.clone())
    }
}

impl PublicKey for WideKey {
    fn verify(&self, _data: &[u8], _signature: &[u8]) -> Result<bool, KeyError> {
        Err(KeyError::UnsupportedAlgorithm(KeyType::Rsa))
    }
}

fn codec() -> IdentityCodec {
    IdentityCodec::new(Arc::new(KeyRegistry::standard()))
}

#[test]
fn test_ed25519_peer_id_round_trip() {
    let codec = codec();
    for seed in 0..16 {
        let mut rng = StdRng::seed_from_u64(seed);
        let (private, public) = generate_keypair(KeyType::Ed25519, &mut rng).unwrap();

        let id = codec.derive(public.as_ref()).unwrap();
        assert_eq!(id.encoding(), IdEncoding::Inline);
        assert!(codec.verify(&id, public.as_ref()));
        assert!(codec.verify(&id, private.public().as_ref()));

        let recovered = codec.extract_public_key(&id).unwrap();
        assert_eq!(recovered.raw().unwrap(), public.raw().unwrap());

        // The recovered key verifies signatures made by the key holder.
        let sig = private.sign(b"cairn").unwrap();
        assert!(recovered.verify(b"cairn", &sig).unwrap());

        let reparsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(reparsed, id);
    }
}

#[test]
fn test_wide_keys_use_digest() {
    let codec = codec();
    let key = WideKey(vec![0x42; 270]);
    let id = codec.derive(&key).unwrap();

    assert_eq!(id.encoding(), IdEncoding::Digest);
    assert_eq!(id.as_bytes().len(), 2 + 32);
    assert!(codec.verify(&id, &key));
    assert!(matches!(
        codec.extract_public_key(&id),
        Err(IdentityError::NoEmbeddedKey(_))
    ));
}

#[test]
fn test_ids_differ_across_keys() {
    let codec = codec();
    let mut ids = std::collections::HashSet::new();
    for len in [1usize, 32, 42, 43, 64, 300] {
        for fill in [0u8, 1, 0xff] {
            let id = codec.derive(&WideKey(vec![fill; len])).unwrap();
            assert!(ids.insert(id), "collision at len={len} fill={fill}");
        }
    }
}

#[test]
fn test_verify_rejects_mismatches_without_errors() {
    let codec = codec();
    let mut rng = StdRng::seed_from_u64(99);
    let (_, a) = generate_keypair(KeyType::Ed25519, &mut rng).unwrap();
    let (_, b) = generate_keypair(KeyType::Ed25519, &mut rng).unwrap();

    let id_a = codec.derive(a.as_ref()).unwrap();
    assert!(!codec.verify(&id_a, b.as_ref()));
    assert!(!codec.verify(&id_a, &WideKey(a.raw().unwrap().repeat(2))));
    assert!(!codec.verify(&id_a, &ReservedKey::new(KeyType::Ecdsa)));
}

#[test]
fn test_reserved_tags_fail_closed_after_extraction() {
    // INLINE id carrying an RSA tag with a short key blob.
    let id = PeerId::from_bytes(&[0x00, 0x04, 0x00, 0xde, 0xad, 0x01]).unwrap();
    let key = codec().extract_public_key(&id).unwrap();
    assert_eq!(key.key_type(), KeyType::Rsa);
    assert_eq!(
        key.raw(),
        Err(KeyError::UnsupportedAlgorithm(KeyType::Rsa))
    );
    assert_eq!(
        key.verify(b"m", b"s"),
        Err(KeyError::UnsupportedAlgorithm(KeyType::Rsa))
    );
}

#[test]
fn test_custom_registry_controls_extraction() {
    let mut rng = StdRng::seed_from_u64(7);
    let (_, public) = generate_keypair(KeyType::Ed25519, &mut rng).unwrap();
    let id = PeerId::from_public_key(public.as_ref()).unwrap();

    let bare = IdentityCodec::new(Arc::new(KeyRegistry::empty()));
    assert!(matches!(
        bare.extract_public_key(&id),
        Err(IdentityError::UnsupportedAlgorithm { tag: 1 })
    ));

    let mut registry = KeyRegistry::empty();
    registry.register_public(KeyType::Ed25519, |raw: &[u8]| -> Result<Box<dyn PublicKey>, KeyError> {
        let key = cairn_core::crypto::Ed25519PublicKey::from_bytes(raw)?;
        Ok(Box::new(key) as Box<dyn PublicKey>)
    });
    let custom = IdentityCodec::new(Arc::new(registry));
    assert!(custom.extract_public_key(&id).is_ok());
}
