
//! The chain explorer interface.
//!
//! Poll-based; the sweeper uses it to watch for unilateral exits of
//! tree transactions and caches blocktimes per txid.

use bitcoin::{OutPoint, Transaction, Txid};

use ark::BlockHeight;

/// The explorer cannot be reached right now; safe to retry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("explorer unavailable: {reason}")]
pub struct ExplorerUnavailable {
	pub reason: String,
}

/// Status of a transaction as seen by the explorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
	/// Not seen in mempool or chain.
	Unseen,
	/// In the mempool.
	Mempool,
	/// Confirmed at the given height and block time.
	Confirmed { height: BlockHeight, blocktime: u64 },
}

impl TxStatus {
	pub fn confirmed_height(&self) -> Option<BlockHeight> {
		match self {
			TxStatus::Confirmed { height, .. } => Some(*height),
			_ => None,
		}
	}

	pub fn seen(&self) -> bool {
		!matches!(self, TxStatus::Unseen)
	}
}

#[async_trait::async_trait]
pub trait Explorer: Send + Sync + 'static {
	async fn broadcast(&self, tx: &Transaction) -> anyhow::Result<()>;

	async fn tx_status(&self, txid: Txid) -> anyhow::Result<TxStatus>;

	/// The tx spending the given outpoint, if any is known.
	async fn spending_tx(&self, point: OutPoint) -> anyhow::Result<Option<Transaction>>;

	async fn tip_height(&self) -> anyhow::Result<BlockHeight>;
}
