//! Local keypair persistence.
//!
//! File format: one key type tag byte followed by the private key's raw
//! bytes. Written once with mode 0600 and never rewritten.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use cairn_core::crypto::{generate_keypair, KeyRegistry, KeyType, PrivateKey};

/// Load the keypair at `path`, generating an Ed25519 one if absent.
pub fn load_or_generate<R: RngCore + CryptoRng>(
    path: &Path,
    registry: &KeyRegistry,
    rng: &mut R,
) -> Result<Box<dyn PrivateKey>> {
    if path.exists() {
        return load(path, registry);
    }

    let (private, _) = generate_keypair(KeyType::Ed25519, rng)?;
    save(path, private.as_ref())?;
    tracing::info!(path = %path.display(), "generated new keypair");
    Ok(private)
}

pub fn load(path: &Path, registry: &KeyRegistry) -> Result<Box<dyn PrivateKey>> {
    let bytes = Zeroizing::new(
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?,
    );
    let (&tag, raw) = bytes
        .split_first()
        .with_context(|| format!("{} is empty", path.display()))?;
    let key_type = KeyType::try_from(tag)?;
    let key = registry
        .unmarshal_private_key(key_type, raw)
        .with_context(|| format!("invalid keypair in {}", path.display()))?;
    Ok(key)
}

fn save(path: &Path, key: &dyn PrivateKey) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut contents = Zeroizing::new(vec![u8::from(key.key_type())]);
    contents.extend_from_slice(&Zeroizing::new(key.raw()?));

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(&contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
