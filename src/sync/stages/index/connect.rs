use std::collections::HashSet;

use indexmap::IndexMap;
use num_bigint::BigUint;
use tracing::warn;

use crate::{
    chain::{AddressDescriptor, Block, MAX_DESCRIPTOR_LEN, Txid},
    error::Error,
};

use super::{
    AddressBalanceKV, AddressEvent, AddressKey, AddressesKV, BlockAddressesKV, BlockTxidsKV,
    ConnectResult, HeightKV, Indexer, TxAddressesKV,
    records::{
        AddrTxRecord, AddrTxRecords, AddressBalanceRecord, BlockAddress, BlockAddressesRecord,
        BlockInfoRecord, BlockTxidsRecord, SpentOutpoint, StatePoint, TxAddr, TxAddressesRecord,
    },
};

/// Everything one block changes, accumulated before the batch is built.
/// Owned by the connect call; the batch borrows from it and both go out of
/// scope together.
#[derive(Default)]
struct ConnectContext {
    /// TxAddresses rows for the block's own txs, in block order.
    tx_addresses: IndexMap<Txid, TxAddressesRecord>,
    /// Prior-block TxAddresses rows rewritten to set spent flags.
    flipped: IndexMap<Txid, TxAddressesRecord>,
    /// Per-address deltas, in first-touch order.
    deltas: IndexMap<AddressDescriptor, AddressDelta>,
}

#[derive(Default)]
struct AddressDelta {
    contributions: Vec<AddrTxRecord>,
    counted_txids: HashSet<Txid>,
    received: BigUint,
    sent: BigUint,
    spent_outpoints: Vec<SpentOutpoint>,
}

impl ConnectContext {
    fn delta(&mut self, descriptor: &[u8]) -> &mut AddressDelta {
        self.deltas.entry(descriptor.to_vec()).or_default()
    }
}

fn indexable(descriptor: &[u8]) -> bool {
    !descriptor.is_empty() && descriptor.len() <= MAX_DESCRIPTOR_LEN
}

impl Indexer {
    /// Connects one fully materialized block: computes the delta it imposes
    /// on every column and applies it as a single atomic batch, advancing
    /// the best height. Returns the per-address observations for the
    /// subscription fan-out.
    pub fn connect_block(&self, block: &Block) -> Result<ConnectResult, Error> {
        let height = block.header.height;

        if let Some(best) = self.best_block() {
            if height <= best.height {
                return Err(Error::invalid(format!(
                    "cannot connect block {} on top of best height {}",
                    height, best.height
                )));
            }
        }

        let mut ctx = ConnectContext::default();

        // first pass: outputs of every tx, in block order
        for tx in &block.txs {
            let mut record = TxAddressesRecord {
                height,
                ..Default::default()
            };

            for (vout, output) in tx.vout.iter().enumerate() {
                let descriptor = self.parser.script_to_descriptor(&output.script);

                if indexable(&descriptor) {
                    let delta = ctx.delta(&descriptor);
                    delta.contributions.push(AddrTxRecord {
                        txid: tx.txid,
                        io_index: vout as u32,
                        is_input: false,
                    });
                    delta.counted_txids.insert(tx.txid);
                    delta.received += &output.value_sat;
                } else if descriptor.len() > MAX_DESCRIPTOR_LEN {
                    warn!(
                        "output {}:{} descriptor of {} bytes not indexed",
                        hex::encode(tx.txid),
                        vout,
                        descriptor.len()
                    );
                }

                record
                    .outputs
                    .push(TxAddr::new(descriptor, output.value_sat.clone()));
            }

            ctx.tx_addresses.insert(tx.txid, record);
        }

        // second pass: inputs of every tx, resolving previous outputs from
        // this block's records, then from storage
        for tx in &block.txs {
            for (index, vin) in tx.vin.iter().enumerate() {
                let Some(prevout) = &vin.prevout else {
                    continue; // coinbase
                };

                let resolved = self.resolve_and_flip(&mut ctx, prevout.txid, prevout.vout)?;

                let input = match resolved {
                    Some((descriptor, value_sat)) => TxAddr::new(descriptor, value_sat),
                    None => {
                        warn!(
                            "tx {} input {} spends unknown output {}:{}",
                            hex::encode(tx.txid),
                            index,
                            hex::encode(prevout.txid),
                            prevout.vout
                        );
                        TxAddr::new(Vec::new(), BigUint::ZERO)
                    }
                };

                if indexable(&input.descriptor) {
                    let delta = ctx.delta(&input.descriptor);
                    delta.contributions.push(AddrTxRecord {
                        txid: tx.txid,
                        io_index: index as u32,
                        is_input: true,
                    });
                    delta.counted_txids.insert(tx.txid);
                    delta.sent += &input.value_sat;
                    delta.spent_outpoints.push(SpentOutpoint {
                        txid: prevout.txid,
                        vout: prevout.vout,
                    });
                }

                let record = ctx
                    .tx_addresses
                    .get_mut(&tx.txid)
                    .ok_or_else(|| Error::internal("connect context missing own tx"))?;
                record.inputs.push(input);
            }
        }

        // assemble the batch
        let mut batch = self.store.batch();

        batch.put::<HeightKV>(
            &height,
            &BlockInfoRecord {
                hash: block.header.hash,
                time: block.header.time,
                tx_count: block.txs.len() as u32,
                size: block.header.size,
            },
        );
        batch.put::<BlockTxidsKV>(
            &height,
            &BlockTxidsRecord(block.txs.iter().map(|tx| tx.txid).collect()),
        );

        for (txid, record) in &ctx.tx_addresses {
            batch.put::<TxAddressesKV>(txid, record);
        }
        for (txid, record) in &ctx.flipped {
            batch.put::<TxAddressesKV>(txid, record);
        }

        let mut block_addresses = Vec::with_capacity(ctx.deltas.len());
        let mut address_events = Vec::new();

        for (descriptor, delta) in &ctx.deltas {
            batch.put::<AddressesKV>(
                &AddressKey {
                    descriptor: descriptor.clone(),
                    height,
                },
                &AddrTxRecords(delta.contributions.clone()),
            );

            let mut balance = self
                .store
                .get::<AddressBalanceKV>(descriptor)?
                .unwrap_or_default();
            balance.tx_count += delta.counted_txids.len() as u32;

            let credited = &balance.balance_sat + &delta.received;
            if credited < delta.sent {
                warn!(
                    "address {} balance underflow while connecting block {height}",
                    hex::encode(descriptor)
                );
                balance.balance_sat = BigUint::ZERO;
            } else {
                balance.balance_sat = credited - &delta.sent;
            }
            balance.sent_sat += &delta.sent;

            batch.put::<AddressBalanceKV>(descriptor, &balance);

            block_addresses.push(BlockAddress {
                descriptor: descriptor.clone(),
                spent: delta.spent_outpoints.clone(),
            });

            for contribution in &delta.contributions {
                address_events.push(AddressEvent {
                    descriptor: descriptor.clone(),
                    txid: contribution.txid,
                    is_input: contribution.is_input,
                });
            }
        }

        batch.put::<BlockAddressesKV>(&height, &BlockAddressesRecord(block_addresses));

        // retention: only the last N undo records are kept
        if self.block_addresses_to_keep > 0 {
            if let Some(expired) = height.checked_sub(self.block_addresses_to_keep) {
                batch.delete::<BlockAddressesKV>(&expired);
            }
        }

        let point = StatePoint {
            height,
            hash: block.header.hash,
        };
        let state = self.stage_state(&mut batch, Some(point));

        self.store.commit(batch)?;
        self.commit_state(state);

        Ok(ConnectResult {
            point,
            address_events,
        })
    }

    /// Looks up the referenced previous output, sets its spent flag in
    /// whichever record owns it (an in-block one or a stored one scheduled
    /// for rewrite), and returns its descriptor and value.
    fn resolve_and_flip(
        &self,
        ctx: &mut ConnectContext,
        prev_txid: Txid,
        prev_vout: u32,
    ) -> Result<Option<(Vec<u8>, BigUint)>, Error> {
        let record = if ctx.tx_addresses.contains_key(&prev_txid) {
            &mut ctx.tx_addresses[&prev_txid]
        } else if ctx.flipped.contains_key(&prev_txid) {
            &mut ctx.flipped[&prev_txid]
        } else {
            match self.store.get::<TxAddressesKV>(&prev_txid)? {
                Some(stored) => ctx.flipped.entry(prev_txid).or_insert(stored),
                None => return Ok(None),
            }
        };

        match record.outputs.get_mut(prev_vout as usize) {
            Some(output) => {
                output.spent = true;
                Ok(Some((output.descriptor.clone(), output.value_sat.clone())))
            }
            None => Ok(None),
        }
    }
}
