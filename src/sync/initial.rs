use std::{
    collections::BTreeMap,
    sync::{
        Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, SyncSender, sync_channel},
    },
};

use tracing::{info, warn};

use crate::{
    chain::{Block, BlockChain},
    error::Error,
    sync::stages::index::Indexer,
};

/*
    Initial bulk sync

    A fixed pool of fetch workers pulls blocks from the node concurrently
    and a single committer applies them to the store in strictly ascending
    height order. Workers may run ahead of the committer by a bounded
    prefetch window, which doubles as backpressure; fetched blocks flow to
    the committer over a bounded channel. Each block is one atomic batch,
    so recovery after a crash is a plain replay from the persisted best
    height.
*/

struct Dispatch {
    /// Next height to hand to a fetch worker.
    next: Mutex<u32>,
    /// Highest height committed so far, advanced by the committer.
    committed: Mutex<Option<u32>>,
    resume: Condvar,
    cancelled: AtomicBool,
}

impl Dispatch {
    fn claim(&self, higher: u32) -> Option<u32> {
        let mut next = self.next.lock().expect("dispatch lock poisoned");
        if *next > higher {
            return None;
        }
        let height = *next;
        *next += 1;
        Some(height)
    }

    /// Blocks the worker until `height` is within the prefetch window.
    fn wait_for_window(&self, height: u32, window: u32) {
        let mut committed = self.committed.lock().expect("dispatch lock poisoned");
        while !self.cancelled.load(Ordering::Relaxed) {
            let horizon = committed.map_or(window, |c| c.saturating_add(window));
            if height <= horizon {
                return;
            }
            committed = self
                .resume
                .wait(committed)
                .expect("dispatch lock poisoned");
        }
    }

    fn advance(&self, height: u32) {
        *self.committed.lock().expect("dispatch lock poisoned") = Some(height);
        self.resume.notify_all();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.resume.notify_all();
    }
}

/// Connects `[lower..higher]` using `workers` concurrent block fetchers.
/// On cancellation the in-flight block either commits wholly or is dropped
/// wholly, and the pool drains before returning.
pub fn connect_blocks_parallel(
    indexer: &Indexer,
    chain: &dyn BlockChain,
    lower: u32,
    higher: u32,
    workers: usize,
    prefetch_window: u32,
    cancel: &AtomicBool,
) -> Result<(), Error> {
    if lower > higher {
        return Err(Error::invalid(format!(
            "invalid sync range {lower}..{higher}"
        )));
    }

    info!("connecting blocks {lower}..{higher} with {workers} workers");

    let dispatch = Dispatch {
        next: Mutex::new(lower),
        committed: Mutex::new(lower.checked_sub(1)),
        resume: Condvar::new(),
        cancelled: AtomicBool::new(false),
    };

    let (sender, receiver) = sync_channel::<(u32, Result<Block, Error>)>(workers * 2);

    std::thread::scope(|scope| {
        for _ in 0..workers.max(1) {
            let sender = sender.clone();
            scope.spawn(|| fetch_worker(chain, &dispatch, sender, higher, prefetch_window));
        }
        drop(sender);

        let result = commit_loop(indexer, &dispatch, receiver, lower, higher, cancel);

        // wake any worker parked on the window before the scope joins
        dispatch.cancel();

        result
    })
}

fn fetch_worker(
    chain: &dyn BlockChain,
    dispatch: &Dispatch,
    sender: SyncSender<(u32, Result<Block, Error>)>,
    higher: u32,
    prefetch_window: u32,
) {
    while !dispatch.cancelled.load(Ordering::Relaxed) {
        let Some(height) = dispatch.claim(higher) else {
            return;
        };

        dispatch.wait_for_window(height, prefetch_window);
        if dispatch.cancelled.load(Ordering::Relaxed) {
            return;
        }

        let block = chain
            .get_block_hash(height)
            .and_then(|hash| chain.get_block(height, Some(&hash)));

        if sender.send((height, block)).is_err() {
            return;
        }
    }
}

fn commit_loop(
    indexer: &Indexer,
    dispatch: &Dispatch,
    receiver: Receiver<(u32, Result<Block, Error>)>,
    lower: u32,
    higher: u32,
    cancel: &AtomicBool,
) -> Result<(), Error> {
    let mut pending: BTreeMap<u32, Block> = BTreeMap::new();
    let mut next_commit = lower;

    while next_commit <= higher {
        if cancel.load(Ordering::Relaxed) {
            dispatch.cancel();
            warn!("initial sync interrupted at height {next_commit}");
            return Err(Error::internal(format!(
                "initial sync interrupted at height {next_commit}"
            )));
        }

        if !pending.contains_key(&next_commit) {
            let (height, block) = receiver
                .recv()
                .map_err(|_| Error::internal("fetch workers exited prematurely"))?;

            match block {
                Ok(block) => {
                    pending.insert(height, block);
                    continue;
                }
                Err(e) => {
                    dispatch.cancel();
                    return Err(e);
                }
            }
        }

        let block = pending
            .remove(&next_commit)
            .ok_or_else(|| Error::internal("reorder buffer inconsistent"))?;

        indexer.connect_block(&block)?;
        dispatch.advance(next_commit);

        if next_commit % 1000 == 0 {
            info!("initial sync at height {next_commit}/{higher}");
        }

        next_commit += 1;
    }

    Ok(())
}
