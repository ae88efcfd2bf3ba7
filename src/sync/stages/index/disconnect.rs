use std::collections::HashSet;

use indexmap::{IndexMap, IndexSet};
use num_bigint::BigUint;
use tracing::{info, warn};

use crate::{
    chain::{AddressDescriptor, Block, Txid},
    error::Error,
    storage::tx_cache::TxCache,
};

use super::{
    AddressBalanceKV, AddressKey, AddressesKV, BlockAddressesKV, BlockTxidsKV, HeightKV, Indexer,
    TransactionsKV, TxAddressesKV,
    records::{SpentOutpoint, StatePoint, TxAddressesRecord},
};

#[derive(Default)]
struct DisconnectDelta {
    removed_txids: HashSet<Txid>,
    received: BigUint,
    sent: BigUint,
}

impl Indexer {
    /// Single-block disconnect by block content is not possible on UTXO
    /// chains; undo always goes through [`Self::disconnect_block_range`].
    pub fn disconnect_block(&self, _block: &Block) -> Result<(), Error> {
        Err(Error::unsupported(
            "DisconnectBlock is not supported for UTXO chains",
        ))
    }

    /// Fast-path disconnect of `[lower..higher]`, newest first, one atomic
    /// batch per height. Requires the blockAddresses undo record of every
    /// height in the range.
    pub fn disconnect_block_range(&self, lower: u32, higher: u32) -> Result<(), Error> {
        if !self.parser.supports_disconnect() {
            return Err(Error::unsupported(format!(
                "chain {} does not support disconnect",
                self.parser.coin_name()
            )));
        }

        self.check_disconnect_range(lower, higher)?;

        // verify the whole range is undoable before touching anything
        for height in lower..=higher {
            if self.store.get::<BlockAddressesKV>(&height)?.is_none() {
                return Err(Error::unsupported(format!(
                    "blockAddresses for height {height} not kept, range disconnect must \
                     be done by full scan"
                )));
            }
        }

        for height in (lower..=higher).rev() {
            let undo = self
                .store
                .get::<BlockAddressesKV>(&height)?
                .ok_or_else(|| Error::internal("blockAddresses disappeared mid-disconnect"))?;

            let touched = undo.0.iter().map(|a| a.descriptor.clone()).collect();
            let flips = undo
                .0
                .iter()
                .flat_map(|a| a.spent.iter().copied())
                .collect::<Vec<_>>();

            self.disconnect_height(height, touched, &flips)?;
        }

        Ok(())
    }

    /// Full-scan disconnect for heights whose undo records have aged out:
    /// reconstructs the per-address delta by scanning the whole addresses
    /// column and resolves spent-flag restores through the tx cache. Used
    /// only on operator command.
    pub fn disconnect_block_range_full_scan(
        &self,
        lower: u32,
        higher: u32,
        tx_cache: &TxCache,
    ) -> Result<(), Error> {
        if !self.parser.supports_disconnect() {
            return Err(Error::unsupported(format!(
                "chain {} does not support disconnect",
                self.parser.coin_name()
            )));
        }

        self.check_disconnect_range(lower, higher)?;

        info!("disconnecting {lower}..{higher} by full address scan");

        for height in (lower..=higher).rev() {
            let mut touched: Vec<AddressDescriptor> = Vec::new();
            for item in self.store.iterate_all::<AddressesKV>() {
                let (key, _) = item?;
                if key.height == height {
                    touched.push(key.descriptor);
                }
            }

            // restore spent flags from the spending txs' own outpoints
            let mut flips = Vec::new();
            let own_txids = self
                .store
                .get::<BlockTxidsKV>(&height)?
                .map(|r| r.0)
                .unwrap_or_default();
            for txid in &own_txids {
                let (tx, _) = match tx_cache.get(txid) {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(
                            "cannot resolve tx {} while disconnecting {height}: {e}",
                            hex::encode(txid)
                        );
                        continue;
                    }
                };
                for vin in &tx.vin {
                    if let Some(prevout) = &vin.prevout {
                        flips.push(SpentOutpoint {
                            txid: prevout.txid,
                            vout: prevout.vout,
                        });
                    }
                }
            }

            self.disconnect_height(height, touched, &flips)?;
        }

        Ok(())
    }

    fn check_disconnect_range(&self, lower: u32, higher: u32) -> Result<(), Error> {
        let best = self
            .best_block()
            .ok_or_else(|| Error::invalid("nothing to disconnect, index is empty"))?;

        if lower > higher || higher != best.height {
            return Err(Error::invalid(format!(
                "invalid disconnect range {lower}..{higher}, best height is {}",
                best.height
            )));
        }

        Ok(())
    }

    /// Undoes a single height in one atomic batch: deletes the block's
    /// address rows and its own txAddresses, clears spent flags on prior
    /// outputs, reverses the balance deltas, drops cached txs, and retreats
    /// the internal state.
    fn disconnect_height(
        &self,
        height: u32,
        touched: Vec<AddressDescriptor>,
        flips: &[SpentOutpoint],
    ) -> Result<(), Error> {
        let own_txids = self
            .store
            .get::<BlockTxidsKV>(&height)?
            .map(|r| r.0)
            .unwrap_or_default();
        let own: HashSet<Txid> = own_txids.iter().copied().collect();

        // reverse deltas come from the block's own txAddresses rows
        let mut deltas: IndexMap<AddressDescriptor, DisconnectDelta> = IndexMap::new();
        for txid in &own_txids {
            let Some(record) = self.store.get::<TxAddressesKV>(txid)? else {
                warn!(
                    "inconsistency: tx {} of block {height} has no txAddresses row",
                    hex::encode(txid)
                );
                continue;
            };

            for output in &record.outputs {
                if output.descriptor.is_empty() {
                    continue;
                }
                let delta = deltas.entry(output.descriptor.clone()).or_default();
                delta.removed_txids.insert(*txid);
                delta.received += &output.value_sat;
            }
            for input in &record.inputs {
                if input.descriptor.is_empty() {
                    continue;
                }
                let delta = deltas.entry(input.descriptor.clone()).or_default();
                delta.removed_txids.insert(*txid);
                delta.sent += &input.value_sat;
            }
        }

        // spent flags to clear live on txs outside this block
        let mut restored: IndexMap<Txid, TxAddressesRecord> = IndexMap::new();
        for flip in flips {
            if own.contains(&flip.txid) {
                continue;
            }
            if !restored.contains_key(&flip.txid) {
                match self.store.get::<TxAddressesKV>(&flip.txid)? {
                    Some(record) => {
                        restored.insert(flip.txid, record);
                    }
                    None => {
                        warn!(
                            "inconsistency: spent-flag owner {} missing while \
                             disconnecting {height}",
                            hex::encode(flip.txid)
                        );
                        continue;
                    }
                }
            }
            let record = restored.get_mut(&flip.txid).expect("just inserted");
            match record.outputs.get_mut(flip.vout as usize) {
                Some(output) => output.spent = false,
                None => warn!(
                    "inconsistency: outpoint {}:{} out of range while disconnecting {height}",
                    hex::encode(flip.txid),
                    flip.vout
                ),
            }
        }

        let mut batch = self.store.batch();

        let mut address_rows: IndexSet<AddressDescriptor> = IndexSet::new();
        address_rows.extend(touched);
        address_rows.extend(deltas.keys().cloned());
        for descriptor in &address_rows {
            batch.delete::<AddressesKV>(&AddressKey {
                descriptor: descriptor.clone(),
                height,
            });
        }

        for (txid, record) in &restored {
            batch.put::<TxAddressesKV>(txid, record);
        }

        for txid in &own_txids {
            batch.delete::<TxAddressesKV>(txid);
            batch.delete::<TransactionsKV>(txid);
        }

        for (descriptor, delta) in &deltas {
            let Some(mut balance) = self.store.get::<AddressBalanceKV>(descriptor)? else {
                warn!(
                    "inconsistency: no balance row for {} while disconnecting {height}",
                    hex::encode(descriptor)
                );
                continue;
            };

            balance.tx_count = balance
                .tx_count
                .saturating_sub(delta.removed_txids.len() as u32);

            if balance.sent_sat < delta.sent {
                warn!(
                    "inconsistency: sent underflow for {} while disconnecting {height}",
                    hex::encode(descriptor)
                );
                balance.sent_sat = BigUint::ZERO;
            } else {
                balance.sent_sat -= &delta.sent;
            }

            // undo balance += received - sent
            let restored_balance = &balance.balance_sat + &delta.sent;
            if restored_balance < delta.received {
                warn!(
                    "inconsistency: balance underflow for {} while disconnecting {height}",
                    hex::encode(descriptor)
                );
                balance.balance_sat = BigUint::ZERO;
            } else {
                balance.balance_sat = restored_balance - &delta.received;
            }

            if balance.tx_count == 0 {
                batch.delete::<AddressBalanceKV>(descriptor);
            } else {
                batch.put::<AddressBalanceKV>(descriptor, &balance);
            }
        }

        batch.delete::<HeightKV>(&height);
        batch.delete::<BlockTxidsKV>(&height);
        batch.delete::<BlockAddressesKV>(&height);

        let best = match height.checked_sub(1) {
            Some(prev) => self
                .store
                .get::<HeightKV>(&prev)?
                .map(|info| StatePoint {
                    height: prev,
                    hash: info.hash,
                }),
            None => None,
        };
        let state = self.stage_state(&mut batch, best);

        self.store.commit(batch)?;
        self.commit_state(state);

        info!("disconnected block {height}");
        Ok(())
    }
}
