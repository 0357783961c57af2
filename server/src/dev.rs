
//! In-memory wallet and explorer backends.
//!
//! These back the test suite and the regtest development mode of the
//! daemon. Production deployments inject real adapters through the
//! [crate::wallet::Wallet] and [crate::explorer::Explorer] traits.

use std::collections::{HashMap, HashSet};

use bitcoin::{Address, Amount, Network, OutPoint, Psbt, Transaction, Txid};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{rand, Keypair};
use parking_lot::Mutex;

use ark::{BlockHeight, SECP};

use crate::explorer::{Explorer, TxStatus};
use crate::wallet::{Confirmation, Wallet, WalletUtxo};

pub struct MemoryWallet {
	key: Keypair,
	network: Network,
	height: Mutex<BlockHeight>,
	broadcasts: Mutex<Vec<Transaction>>,
	confirmed: Mutex<HashMap<Txid, Confirmation>>,
	utxo_counter: Mutex<u32>,
	/// Coins handed out by [MemoryWallet::select_utxos] and not yet
	/// released or spent.
	locked: Mutex<HashSet<OutPoint>>,
}

impl MemoryWallet {
	pub fn new(network: Network) -> MemoryWallet {
		MemoryWallet {
			key: Keypair::new(&SECP, &mut rand::thread_rng()),
			network,
			height: Mutex::new(0),
			broadcasts: Mutex::new(Vec::new()),
			confirmed: Mutex::new(HashMap::new()),
			utxo_counter: Mutex::new(0),
			locked: Mutex::new(HashSet::new()),
		}
	}

	/// The coins currently locked by select_utxos.
	pub fn locked_utxos(&self) -> Vec<OutPoint> {
		self.locked.lock().iter().copied().collect()
	}

	pub fn set_height(&self, height: BlockHeight) {
		*self.height.lock() = height;
	}

	pub fn broadcasts(&self) -> Vec<Transaction> {
		self.broadcasts.lock().clone()
	}

	pub fn confirm(&self, txid: Txid, height: BlockHeight) {
		self.confirmed.lock().insert(txid, Confirmation {
			height,
			blocktime: height * 600,
		});
	}
}

#[async_trait::async_trait]
impl Wallet for MemoryWallet {
	async fn derive_address(&self) -> anyhow::Result<Address> {
		let (xonly, _) = self.key.public_key().x_only_public_key();
		Ok(Address::p2tr(&SECP, xonly, None, self.network))
	}

	async fn select_utxos(&self, amount: Amount) -> anyhow::Result<Vec<WalletUtxo>> {
		let mut counter = self.utxo_counter.lock();
		*counter += 1;
		let utxo = WalletUtxo {
			point: OutPoint::new(Txid::all_zeros(), *counter),
			amount: amount + Amount::from_sat(10_000),
		};
		self.locked.lock().insert(utxo.point);
		Ok(vec![utxo])
	}

	async fn release_utxos(&self, utxos: &[OutPoint]) -> anyhow::Result<()> {
		let mut locked = self.locked.lock();
		for point in utxos {
			locked.remove(point);
		}
		Ok(())
	}

	async fn sign_taproot(&self, psbt: Psbt) -> anyhow::Result<Psbt> {
		Ok(psbt)
	}

	async fn finalize(&self, psbt: Psbt) -> anyhow::Result<Transaction> {
		Ok(psbt.extract_tx_unchecked_fee_rate())
	}

	async fn broadcast(&self, tx: &Transaction) -> anyhow::Result<Txid> {
		// spent coins are no longer merely locked
		let mut locked = self.locked.lock();
		for input in &tx.input {
			locked.remove(&input.previous_output);
		}
		drop(locked);
		self.broadcasts.lock().push(tx.clone());
		Ok(tx.compute_txid())
	}

	async fn is_confirmed(&self, txid: Txid) -> anyhow::Result<Option<Confirmation>> {
		Ok(self.confirmed.lock().get(&txid).copied())
	}

	async fn synced_height(&self) -> anyhow::Result<BlockHeight> {
		Ok(*self.height.lock())
	}
}

#[derive(Default)]
pub struct MemoryExplorer {
	tip: Mutex<BlockHeight>,
	broadcasts: Mutex<Vec<Transaction>>,
	confirmed: Mutex<HashMap<Txid, (BlockHeight, u64)>>,
}

impl MemoryExplorer {
	pub fn new() -> MemoryExplorer {
		MemoryExplorer::default()
	}

	pub fn set_tip(&self, height: BlockHeight) {
		*self.tip.lock() = height;
	}

	pub fn broadcasts(&self) -> Vec<Transaction> {
		self.broadcasts.lock().clone()
	}

	pub fn confirm(&self, txid: Txid, height: BlockHeight, blocktime: u64) {
		self.confirmed.lock().insert(txid, (height, blocktime));
	}
}

#[async_trait::async_trait]
impl Explorer for MemoryExplorer {
	async fn broadcast(&self, tx: &Transaction) -> anyhow::Result<()> {
		self.broadcasts.lock().push(tx.clone());
		Ok(())
	}

	async fn tx_status(&self, txid: Txid) -> anyhow::Result<TxStatus> {
		if let Some((height, blocktime)) = self.confirmed.lock().get(&txid) {
			return Ok(TxStatus::Confirmed { height: *height, blocktime: *blocktime });
		}
		if self.broadcasts.lock().iter().any(|tx| tx.compute_txid() == txid) {
			return Ok(TxStatus::Mempool);
		}
		Ok(TxStatus::Unseen)
	}

	async fn spending_tx(&self, point: OutPoint) -> anyhow::Result<Option<Transaction>> {
		Ok(self.broadcasts.lock().iter()
			.find(|tx| tx.input.iter().any(|i| i.previous_output == point))
			.cloned())
	}

	async fn tip_height(&self) -> anyhow::Result<BlockHeight> {
		Ok(*self.tip.lock())
	}
}
