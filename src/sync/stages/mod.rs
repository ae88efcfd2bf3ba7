use crate::chain::{Block, BlockHash, Tx};

pub mod index;
pub mod pull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub height: u32,
    pub hash: BlockHash,
}

#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A new block extending the local chain.
    RollForward(Point, Block),
    /// The local chain no longer matches the node past this point; the
    /// index must disconnect everything above it.
    RollBack(Point),
    /// A transaction entered the node mempool.
    MempoolTx(Tx),
}
