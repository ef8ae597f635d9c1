use anyhow::{Result, anyhow};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::keys::PartyKey;

type HmacSha256 = Hmac<Sha256>;

/// Sign a transition digest. Returns the hex-encoded MAC.
pub fn sign_digest(key: &PartyKey, digest: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| anyhow!("Invalid key: {}", e))?;
    mac.update(digest.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a hex signature against a digest in constant time.
pub fn verify_digest(key: &PartyKey, digest: &str, signature: &str) -> bool {
    let Ok(bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(digest.as_bytes());
    mac.verify_slice(&bytes).is_ok()
}
