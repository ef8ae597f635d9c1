mod config;
mod scenario;

use std::sync::Arc;

use tracing::{debug, info};

use concord_crypto::key_fingerprint;
use concord_db::Database;
use concord_engine::{Node, TracingObserver};
use concord_gateway::Dispatcher;
use concord_notary::LocalNotary;

use crate::config::SimConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "concord=debug".into()),
        )
        .init();

    let config = SimConfig::from_env()?;
    if let Some(dir) = &config.db_dir {
        std::fs::create_dir_all(dir)?;
    }

    let notary = Arc::new(LocalNotary::new());
    let dispatcher = Dispatcher::new(config.engine.request_timeout);

    let mut nodes = Vec::with_capacity(config.parties.len());
    for party in &config.parties {
        let key = config.party_key(party)?;
        debug!("{} key fingerprint {}", party, key_fingerprint(&key));

        let db = match config.db_path(party) {
            Some(path) => Database::open(&path)?,
            None => Database::open_in_memory()?,
        };

        let node = Node::new(
            party.clone(),
            key,
            db,
            notary.clone(),
            dispatcher.clone(),
            config.engine.clone(),
        );
        node.register_observer(Arc::new(TracingObserver));
        node.start().await;
        nodes.push(node);
    }

    info!(
        "Mesh up: {} (auto finalize: {})",
        dispatcher
            .parties()
            .await
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        config.engine.auto_finalize
    );

    scenario::run(&nodes).await?;

    for node in &nodes {
        node.stop().await;
    }
    Ok(())
}
