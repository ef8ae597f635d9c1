#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use concord_crypto::generate_party_key;
use concord_db::Database;
use concord_engine::{EngineConfig, Node};
use concord_gateway::Dispatcher;
use concord_notary::LocalNotary;
use concord_types::{Party, ThreadId};

/// A set of parties sharing one dispatcher and one notary.
pub struct Mesh {
    pub notary: Arc<LocalNotary>,
    pub dispatcher: Dispatcher,
    nodes: BTreeMap<String, Node>,
}

impl Mesh {
    pub async fn new(names: &[&str]) -> Self {
        Self::with_config(names, EngineConfig::default()).await
    }

    /// Every party finalizes only when told to.
    pub async fn manual(names: &[&str]) -> Self {
        Self::with_config(names, EngineConfig::default().with_auto_finalize(false)).await
    }

    pub async fn with_config(names: &[&str], config: EngineConfig) -> Self {
        init_tracing();
        let config = config.with_request_timeout(Duration::from_secs(2));
        let notary = Arc::new(LocalNotary::new());
        let dispatcher = Dispatcher::new(config.request_timeout);

        let mut nodes = BTreeMap::new();
        for name in names {
            let node = Node::new(
                Party::from(*name),
                generate_party_key(),
                Database::open_in_memory().unwrap(),
                notary.clone(),
                dispatcher.clone(),
                config.clone(),
            );
            node.start().await;
            nodes.insert(name.to_string(), node);
        }

        Self {
            notary,
            dispatcher,
            nodes,
        }
    }

    pub fn node(&self, name: &str) -> &Node {
        self.nodes.get(name).unwrap_or_else(|| panic!("no node {}", name))
    }

    pub fn live_proposals(&self, thread_id: ThreadId) -> usize {
        self.notary.live_claims(&format!("proposed:{}", thread_id))
    }
}

pub fn party(name: &str) -> Party {
    Party::from(name)
}

pub fn parties(names: &[&str]) -> Vec<Party> {
    names.iter().map(|n| party(n)).collect()
}

pub fn roster(names: &[&str]) -> BTreeSet<Party> {
    names.iter().map(|n| party(n)).collect()
}

/// Poll `check` until it holds. Finality travels asynchronously, so tests
/// wait for each party's store to catch up.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("concord=debug")
        .with_test_writer()
        .try_init();
}
