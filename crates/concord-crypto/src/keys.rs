use anyhow::Result;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use sha2::{Digest, Sha256};

pub type PartyKey = [u8; 32];

/// Generate a random 256-bit signing key for one party.
pub fn generate_party_key() -> PartyKey {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Encode a key to base64 for display/config.
pub fn key_to_base64(key: &PartyKey) -> String {
    BASE64.encode(key)
}

/// Short tag identifying a key in logs. The key cannot be recovered from it.
pub fn key_fingerprint(key: &PartyKey) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..8])
}

/// Decode a base64 key.
pub fn key_from_base64(encoded: &str) -> Result<PartyKey> {
    let bytes = BASE64.decode(encoded.trim())?;
    let key: PartyKey = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Invalid key length"))?;
    Ok(key)
}
