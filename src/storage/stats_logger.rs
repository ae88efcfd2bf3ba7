use std::{sync::Arc, time::Duration};

use tokio::time::interval;
use tracing::info;

use super::kv_store::{COLUMNS, Store};

/// Background task that logs per-column key estimates every 5 minutes
pub async fn start_stats_logger(store: Arc<Store>) {
    let mut ticker = interval(Duration::from_secs(300));

    loop {
        ticker.tick().await;

        let counts = COLUMNS
            .iter()
            .map(|column| format!("{}={}", column, store.estimated_keys(column)))
            .collect::<Vec<_>>()
            .join(" ");

        info!("store key estimates: {counts}");
    }
}
