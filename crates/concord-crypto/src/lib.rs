/// Concord Crypto Library
///
/// Party keys and transition signatures. Each party holds a 256-bit secret;
/// a signature is HMAC-SHA256 over a transition digest. The notary is given
/// every party's key at registration, which stands in for a real public-key
/// identity service.

pub mod keys;
pub mod sign;

pub use keys::{PartyKey, generate_party_key, key_fingerprint, key_from_base64, key_to_base64};
pub use sign::{sign_digest, verify_digest};
