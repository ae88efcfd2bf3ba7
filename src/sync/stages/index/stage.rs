use std::sync::Arc;

use gasket::framework::*;
use tracing::{info, warn};

use crate::{
    error::Error,
    query::subs::SubscriptionHub,
    sync::stages::{ChainEvent, index::Indexer},
};

/*
    Index Stage

    Receives chain events from the pull stage and applies them to storage:
    connects new blocks, disconnects on rollbacks, and routes the resulting
    address observations (plus mempool tx sightings) into the subscription
    fan-out.
*/

pub type UpstreamPort = gasket::messaging::InputPort<ChainEvent>;

#[derive(Stage)]
#[stage(name = "index", unit = "ChainEvent", worker = "Worker")]
pub struct Stage {
    indexer: Arc<Indexer>,
    hub: Arc<SubscriptionHub>,

    pub upstream: UpstreamPort,
}

impl Stage {
    pub fn new(indexer: Arc<Indexer>, hub: Arc<SubscriptionHub>) -> Self {
        Self {
            indexer,
            hub,
            upstream: Default::default(),
        }
    }
}

pub struct Worker;

#[async_trait::async_trait(?Send)]
impl gasket::framework::Worker<Stage> for Worker {
    async fn bootstrap(stage: &Stage) -> Result<Self, WorkerError> {
        // ongoing sync means the bulk phase is over
        if stage.indexer.is_initial_sync() {
            stage.indexer.set_initial_sync(false);
        }

        Ok(Worker)
    }

    async fn schedule(
        &mut self,
        stage: &mut Stage,
    ) -> Result<WorkSchedule<ChainEvent>, WorkerError> {
        let event = stage.upstream.recv().await.or_panic()?.payload;

        Ok(WorkSchedule::Unit(event))
    }

    async fn execute(&mut self, unit: &ChainEvent, stage: &mut Stage) -> Result<(), WorkerError> {
        match unit {
            ChainEvent::RollForward(point, block) => {
                let result = stage.indexer.connect_block(block).or_restart()?;

                info!(height = point.height, "connected block");

                stage
                    .hub
                    .broadcast_new_block(result.point.height, &result.point.hash);
                broadcast_address_events(stage, result.address_events);
            }
            ChainEvent::RollBack(ancestor) => {
                let best = stage
                    .indexer
                    .best_block()
                    .ok_or(Error::internal("rollback on an empty index"))
                    .or_panic()?;

                stage
                    .indexer
                    .disconnect_block_range(ancestor.height + 1, best.height)
                    .or_restart()?;
            }
            ChainEvent::MempoolTx(tx) => {
                // mempool sightings only feed the fan-out, nothing is stored
                let mut events = Vec::new();

                for vout in &tx.vout {
                    let descriptor = stage.indexer.parser().script_to_descriptor(&vout.script);
                    events.push(super::AddressEvent {
                        descriptor,
                        txid: tx.txid,
                        is_input: false,
                    });
                }

                for vin in &tx.vin {
                    let Some(prevout) = &vin.prevout else { continue };
                    // resolvable only when the ancestor is already indexed
                    match stage.indexer.get_tx_addresses(&prevout.txid) {
                        Ok(Some(record)) => {
                            if let Some(output) = record.outputs.get(prevout.vout as usize) {
                                events.push(super::AddressEvent {
                                    descriptor: output.descriptor.clone(),
                                    txid: tx.txid,
                                    is_input: true,
                                });
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("mempool input resolution: {e}"),
                    }
                }

                broadcast_address_events(stage, events);
            }
        }

        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }
}

fn broadcast_address_events(stage: &Stage, events: Vec<super::AddressEvent>) {
    for event in events {
        if event.descriptor.is_empty() {
            continue;
        }

        let address = match stage
            .indexer
            .parser()
            .descriptor_to_addresses(&event.descriptor)
        {
            Ok((addresses, _)) => match addresses.into_iter().next() {
                Some(address) => address,
                None => continue,
            },
            Err(_) => continue, // unrenderable descriptors are not broadcast
        };

        stage.hub.broadcast_address_txid(
            &event.descriptor,
            address,
            hex::encode(event.txid),
            event.is_input,
        );
    }
}
