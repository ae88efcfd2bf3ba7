use std::{sync::Arc, time::Duration};

use gasket::framework::*;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::{
    chain::{BlockChain, NodeNotification},
    error::Error,
    sync::stages::{ChainEvent, Point, index::Indexer},
};

/*
    Pull Stage

    Responsible for talking to the node in order to discover new blocks,
    fork points and mempool transactions, and passing them downstream to
    the index stage as chain events.
*/

pub type DownstreamPort = gasket::messaging::OutputPort<ChainEvent>;

/// Blocks fetched per scheduling round when behind the tip.
const FETCH_BATCH: u32 = 10;

const TIP_WAIT: Duration = Duration::from_secs(5);

#[derive(Stage)]
#[stage(name = "pull", unit = "Vec<ChainEvent>", worker = "Worker")]
pub struct Stage {
    chain: Arc<dyn BlockChain>,
    indexer: Arc<Indexer>,
    mempool_enabled: bool,

    should_shutdown: Option<broadcast::Receiver<()>>,
    has_shutdown: Option<mpsc::Sender<()>>,

    pub downstream: DownstreamPort,
}

impl Stage {
    pub fn new(
        chain: Arc<dyn BlockChain>,
        indexer: Arc<Indexer>,
        mempool_enabled: bool,
        shutdown_signals: Option<(broadcast::Receiver<()>, mpsc::Sender<()>)>,
    ) -> Self {
        let (should_shutdown, has_shutdown) = match shutdown_signals {
            Some((x, y)) => (Some(x), Some(y)),
            None => (None, None),
        };

        Self {
            chain,
            indexer,
            mempool_enabled,
            should_shutdown,
            has_shutdown,
            downstream: Default::default(),
        }
    }
}

pub struct Worker {
    cursor: Option<Point>,
    notifications: broadcast::Receiver<NodeNotification>,
    has_shutdown: Option<mpsc::Sender<()>>,
}

#[async_trait::async_trait(?Send)]
impl gasket::framework::Worker<Stage> for Worker {
    async fn bootstrap(stage: &Stage) -> Result<Self, WorkerError> {
        let cursor = stage.indexer.best_block().map(|best| Point {
            height: best.height,
            hash: best.hash,
        });

        info!(cursor = ?cursor.map(|p| p.height), "bootstrapped pull stage");

        Ok(Worker {
            cursor,
            notifications: stage.chain.notifications(),
            has_shutdown: stage.has_shutdown.clone(),
        })
    }

    async fn schedule(
        &mut self,
        stage: &mut Stage,
    ) -> Result<WorkSchedule<Vec<ChainEvent>>, WorkerError> {
        if stage
            .should_shutdown
            .as_mut()
            .map(|x| x.try_recv().is_ok())
            .unwrap_or_default()
        {
            info!("sync received shutdown signal");
            return Ok(WorkSchedule::Done);
        }

        let (tip_height, _) = stage.chain.best_block().or_restart()?;

        let mut units = vec![];

        if matches!(self.cursor, Some(cursor) if cursor.height >= tip_height) {
            // at tip, wait for a notification (or poll again after a beat)
            let _ = tokio::time::timeout(TIP_WAIT, self.notifications.recv()).await;
        }

        units.extend(self.fetch_chain_events(stage, tip_height)?);

        if stage.mempool_enabled {
            units.extend(self.drain_mempool_notifications(stage));
        }

        if units.is_empty() {
            Ok(WorkSchedule::Idle)
        } else {
            Ok(WorkSchedule::Unit(units))
        }
    }

    async fn execute(
        &mut self,
        unit: &Vec<ChainEvent>,
        stage: &mut Stage,
    ) -> Result<(), WorkerError> {
        for event in unit {
            stage.downstream.send(event.clone().into()).await.or_panic()?;
        }

        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), WorkerError> {
        if let Some(sender) = &self.has_shutdown {
            sender.send(()).await.or_panic()?;
        }

        Ok(())
    }
}

impl Worker {
    fn fetch_chain_events(
        &mut self,
        stage: &Stage,
        tip_height: u32,
    ) -> Result<Vec<ChainEvent>, WorkerError> {
        let mut units = vec![];

        for _ in 0..FETCH_BATCH {
            let next_height = match self.cursor {
                Some(cursor) if cursor.height >= tip_height => break,
                Some(cursor) => cursor.height + 1,
                // an empty index starts from the genesis block
                None => 0,
            };

            let hash = stage.chain.get_block_hash(next_height).or_restart()?;
            let block = stage.chain.get_block(next_height, Some(&hash)).or_restart()?;

            if let Some(cursor) = self.cursor {
                if block.header.prev_hash != cursor.hash {
                    // the node is on another chain; find the common ancestor
                    let ancestor = self.find_fork_point(stage, cursor).or_restart()?;
                    warn!(
                        "fork detected at height {}, rolling back to {}",
                        next_height, ancestor.height
                    );
                    units.push(ChainEvent::RollBack(ancestor));
                    self.cursor = Some(ancestor);
                    break;
                }
            }

            let point = Point {
                height: next_height,
                hash: block.header.hash,
            };

            units.push(ChainEvent::RollForward(point, block));
            self.cursor = Some(point);
        }

        Ok(units)
    }

    /// Walks the local chain downwards until the stored hash matches the
    /// node's hash for the same height.
    fn find_fork_point(&self, stage: &Stage, from: Point) -> Result<Point, Error> {
        let mut height = from.height;

        loop {
            let local = stage.indexer.get_block_hash(height)?;
            let remote = stage.chain.get_block_hash(height)?;

            if local == Some(remote) {
                return Ok(Point {
                    height,
                    hash: remote,
                });
            }

            height = height.checked_sub(1).ok_or_else(|| {
                Error::internal("no common ancestor with the node down to genesis")
            })?;
        }
    }

    fn drain_mempool_notifications(&mut self, stage: &Stage) -> Vec<ChainEvent> {
        let mut units = vec![];

        while let Ok(notification) = self.notifications.try_recv() {
            let NodeNotification::NewTx(txid) = notification else {
                continue;
            };

            match stage.chain.get_transaction(&txid) {
                Ok((tx, None)) => units.push(ChainEvent::MempoolTx(tx)),
                Ok((_, Some(_))) => {} // already confirmed, the block will carry it
                Err(e) => error!("mempool tx {}: {e}", hex::encode(txid)),
            }
        }

        units
    }
}
