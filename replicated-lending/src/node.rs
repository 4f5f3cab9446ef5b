//! Wiring for one lending site: two file-backed engines, the coordinator,
//! the retry queues and the dispatcher.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::clock::LamportClock;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::model::demo_catalogue;
use crate::replication::ReplicationCoordinator;
use crate::retry_queue::RetryQueues;
use crate::store::StorageEngine;

pub const PRIMARY_DIR: &str = "primary";
pub const SECONDARY_DIR: &str = "secondary";
pub const RETRY_DIR: &str = "retry";

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub site: String,
    pub data_dir: PathBuf,
    pub dispatcher: DispatcherConfig,
    /// Add the demo catalogue to engines missing those books.
    pub seed: bool,
    /// Arm the primary's fault plan after start-up.
    pub fail_primary_after: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            site: "1".to_string(),
            data_dir: PathBuf::from("data"),
            dispatcher: DispatcherConfig::default(),
            seed: false,
            fail_primary_after: None,
        }
    }
}

pub struct Node {
    site: String,
    dispatcher: Arc<Dispatcher>,
}

impl Node {
    /// Opens every store under `config.data_dir` and starts the dispatcher on
    /// the current Tokio runtime.
    pub fn start(config: NodeConfig) -> Result<Self> {
        let NodeConfig {
            site,
            data_dir,
            dispatcher,
            seed,
            fail_primary_after,
        } = config;

        let primary = StorageEngine::open(PRIMARY_DIR, data_dir.join(PRIMARY_DIR))
            .context("failed to open primary store")?;
        let secondary = StorageEngine::open(SECONDARY_DIR, data_dir.join(SECONDARY_DIR))
            .context("failed to open secondary store")?;
        if seed {
            for engine in [&primary, &secondary] {
                let added = engine
                    .seed(demo_catalogue())
                    .with_context(|| format!("failed to seed {} store", engine.name()))?;
                info!(engine = %engine.name(), added, "seeded demo catalogue");
            }
        }

        let coordinator = Arc::new(
            ReplicationCoordinator::new(Arc::new(primary), Arc::new(secondary))
                .context("failed to start replication coordinator")?,
        );
        if let Err(err) = coordinator.resync_secondary() {
            warn!(error = %err, "start-up resync of secondary failed");
        }
        if let Some(writes) = fail_primary_after {
            warn!(writes, "primary will fail after the given number of writes");
            coordinator.primary().fail_after_writes(writes);
        }

        let retry_dir = data_dir.join(RETRY_DIR);
        let queues = Arc::new(
            RetryQueues::open(&retry_dir)
                .with_context(|| format!("failed to open retry queues in {}", retry_dir.display()))?,
        );

        let dispatcher = Arc::new(Dispatcher::start(
            dispatcher,
            coordinator,
            queues,
            Arc::new(LamportClock::new()),
        ));
        info!(%site, data_dir = %data_dir.display(), "lending node started");

        Ok(Self { site, dispatcher })
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        info!(site = %self.site, "lending node stopped");
    }
}
