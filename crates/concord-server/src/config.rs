use std::path::PathBuf;

use anyhow::{Result, bail};

use concord_crypto::{PartyKey, generate_party_key, key_from_base64};
use concord_engine::EngineConfig;
use concord_types::Party;

/// Settings for the local mesh the binary boots.
pub struct SimConfig {
    /// One SQLite file per party under this directory. In-memory when unset.
    pub db_dir: Option<PathBuf>,
    pub parties: Vec<Party>,
    pub engine: EngineConfig,
}

impl SimConfig {
    pub fn from_env() -> Result<Self> {
        let parties: Vec<Party> = std::env::var("CONCORD_PARTIES")
            .unwrap_or_else(|_| "alice,bob,carol".into())
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(Party::from)
            .collect();
        if parties.len() < 3 {
            bail!("CONCORD_PARTIES needs at least three parties, got {}", parties.len());
        }

        Ok(Self {
            db_dir: std::env::var("CONCORD_DB_DIR").ok().map(PathBuf::from),
            parties,
            engine: EngineConfig::from_env()?,
        })
    }

    /// `CONCORD_KEY_<PARTY>` (base64) when set, otherwise a fresh key.
    pub fn party_key(&self, party: &Party) -> Result<PartyKey> {
        let var = format!("CONCORD_KEY_{}", party.as_str().to_ascii_uppercase());
        match std::env::var(&var) {
            Ok(encoded) => key_from_base64(&encoded),
            Err(_) => Ok(generate_party_key()),
        }
    }

    pub fn db_path(&self, party: &Party) -> Option<PathBuf> {
        self.db_dir.as_ref().map(|dir| dir.join(format!("{}.db", party)))
    }
}
