
//! The on-chain wallet interface.
//!
//! The wallet itself (coin selection, signing, fee estimation) lives
//! outside the coordinator; the round machine and the sweeper only
//! consume this trait. Unavailability is retried with exponential
//! backoff bounded by the broadcast window.

use std::time::Duration;

use bitcoin::{Address, Amount, OutPoint, Psbt, Transaction, Txid};

use ark::BlockHeight;

/// The wallet cannot be reached right now; safe to retry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("wallet unavailable: {reason}")]
pub struct WalletUnavailable {
	pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
	pub height: BlockHeight,
	pub blocktime: u64,
}

#[derive(Debug, Clone)]
pub struct WalletUtxo {
	pub point: OutPoint,
	pub amount: Amount,
}

#[async_trait::async_trait]
pub trait Wallet: Send + Sync + 'static {
	async fn derive_address(&self) -> anyhow::Result<Address>;

	/// Select utxos worth at least `amount` and lock them until
	/// released or spent.
	async fn select_utxos(&self, amount: Amount) -> anyhow::Result<Vec<WalletUtxo>>;

	/// Release utxos locked by [Wallet::select_utxos].
	async fn release_utxos(&self, utxos: &[OutPoint]) -> anyhow::Result<()>;

	async fn sign_taproot(&self, psbt: Psbt) -> anyhow::Result<Psbt>;

	async fn finalize(&self, psbt: Psbt) -> anyhow::Result<Transaction>;

	async fn broadcast(&self, tx: &Transaction) -> anyhow::Result<Txid>;

	/// Whether the given tx is confirmed, and where.
	async fn is_confirmed(&self, txid: Txid) -> anyhow::Result<Option<Confirmation>>;

	async fn synced_height(&self) -> anyhow::Result<BlockHeight>;
}

/// Run a wallet call, retrying [WalletUnavailable] errors with
/// exponential backoff until `budget` is exhausted.
pub async fn with_retry<T, F, Fut>(budget: Duration, mut call: F) -> anyhow::Result<T>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = anyhow::Result<T>>,
{
	let start = tokio::time::Instant::now();
	let mut delay = Duration::from_millis(250);
	loop {
		match call().await {
			Ok(v) => return Ok(v),
			Err(e) if e.downcast_ref::<WalletUnavailable>().is_some() => {
				if start.elapsed() + delay > budget {
					return Err(e);
				}
				log::warn!("wallet unavailable, retrying in {:?}: {}", delay, e);
				tokio::time::sleep(delay).await;
				delay *= 2;
			},
			Err(e) => return Err(e),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[tokio::test(start_paused = true)]
	async fn retry_gives_up_after_budget() {
		let attempts = AtomicUsize::new(0);
		let res: anyhow::Result<()> = with_retry(Duration::from_secs(2), || {
			attempts.fetch_add(1, Ordering::SeqCst);
			async { Err(anyhow::Error::from(WalletUnavailable { reason: "down".into() })) }
		}).await;
		assert!(res.is_err());
		assert!(attempts.load(Ordering::SeqCst) >= 3);
	}

	#[tokio::test(start_paused = true)]
	async fn retry_succeeds_eventually() {
		let attempts = AtomicUsize::new(0);
		let res = with_retry(Duration::from_secs(10), || {
			let n = attempts.fetch_add(1, Ordering::SeqCst);
			async move {
				if n < 2 {
					Err(anyhow::Error::from(WalletUnavailable { reason: "down".into() }))
				} else {
					Ok(42)
				}
			}
		}).await;
		assert_eq!(res.unwrap(), 42);
	}

	#[tokio::test]
	async fn non_retryable_errors_bubble_up() {
		let res: anyhow::Result<()> = with_retry(Duration::from_secs(10), || {
			async { Err(anyhow::anyhow!("hard error")) }
		}).await;
		assert_eq!(res.unwrap_err().to_string(), "hard error");
	}
}
