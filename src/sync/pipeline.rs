use std::{sync::Arc, time::Duration};

use tokio::sync::{broadcast, mpsc};

use crate::{
    chain::BlockChain,
    error::Error,
    query::subs::SubscriptionHub,
    sync::stages::{index, pull},
};

const DEFAULT_SYNC_STAGE_QUEUE_SIZE: usize = 20;
const DEFAULT_SYNC_STAGE_TIMEOUT_SECS: u64 = 600;

fn gasket_policy(stage_timeout: u64) -> gasket::runtime::Policy {
    let default_retries = gasket::retries::Policy {
        max_retries: 20,
        backoff_unit: Duration::from_secs(1),
        backoff_factor: 2,
        max_backoff: Duration::from_secs(60),
        ..Default::default()
    };

    gasket::runtime::Policy {
        tick_timeout: Duration::from_secs(stage_timeout).into(),
        bootstrap_retry: default_retries.clone(),
        work_retry: default_retries.clone(),
        teardown_retry: default_retries,
    }
}

/// Wires the ongoing-sync pipeline: pull (node polling, fork detection)
/// feeding index (atomic connect/disconnect plus fan-out).
pub fn pipeline(
    config: &super::Config,
    chain: Arc<dyn BlockChain>,
    indexer: Arc<index::Indexer>,
    hub: Arc<SubscriptionHub>,
    shutdown_signals: Option<(broadcast::Receiver<()>, mpsc::Sender<()>)>,
) -> Result<gasket::daemon::Daemon, Error> {
    let mut pull = pull::Stage::new(
        chain,
        indexer.clone(),
        config.mempool_enabled(),
        shutdown_signals,
    );

    let mut index = index::stage::Stage::new(indexer, hub);

    let queue_size = config
        .stage_queue_size
        .unwrap_or(DEFAULT_SYNC_STAGE_QUEUE_SIZE);
    let stage_timeout = config
        .stage_timeout_secs
        .unwrap_or(DEFAULT_SYNC_STAGE_TIMEOUT_SECS);

    let (pull_to_index, index_from_pull) = gasket::messaging::tokio::mpsc_channel(queue_size);
    pull.downstream.connect(pull_to_index);
    index.upstream.connect(index_from_pull);

    let policy = gasket_policy(stage_timeout);

    let pull = gasket::runtime::spawn_stage(pull, policy.clone());
    let index = gasket::runtime::spawn_stage(index, policy);

    Ok(gasket::daemon::Daemon::new(vec![pull, index]))
}
