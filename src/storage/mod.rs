use serde::Deserialize;
use sysinfo::System;
use tracing::info;

pub mod encdec;
pub mod kv_store;
pub mod stats_logger;
pub mod table;
pub mod tx_cache;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Config {
    /// Total memory budget for RocksDB in GB (default 25% of available system memory)
    pub rocksdb_memory_budget: Option<f64>,
}

impl Config {
    pub fn rocksdb_memory_budget_bytes(&self) -> usize {
        match self.rocksdb_memory_budget {
            Some(gb) => (gb * 1024.0 * 1024.0 * 1024.0) as usize,
            None => Self::default_rocksdb_memory_budget(),
        }
    }

    fn default_rocksdb_memory_budget() -> usize {
        let mut system = System::new_all();

        system.refresh_memory();

        let total_memory = system
            .cgroup_limits()
            .map(|x| x.total_memory)
            .unwrap_or_else(|| system.total_memory());

        let default_budget = (total_memory as f64 * 0.25) as usize;

        info!(
            "no RocksDB memory budget specified, using 25% of system memory: {:.2} GB",
            default_budget as f64 / (1024.0 * 1024.0 * 1024.0),
        );

        default_budget
    }
}
