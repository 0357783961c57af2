
//! Storage adapter interfaces.
//!
//! The coordinator defines the invariants, the adapters define the
//! schema. All effects of a round must be durable through these traits
//! before the round is announced as finalized.
//!
//! The in-memory implementation backs tests and throwaway regtest
//! setups; production deployments inject their own adapters.

use std::collections::HashMap;

use bitcoin::{Amount, Transaction};
use bitcoin::secp256k1::{PublicKey, SecretKey};
use parking_lot::Mutex;

use ark::{RoundId, Vtxo, VtxoId};
use ark::connectors::ConnectorTree;
use ark::note::NoteId;
use ark::tree::signed::SignedVtxoTree;

/// Lifecycle flags of a stored VTXO.
///
/// A VTXO progresses monotonically from unspent to spent; `swept` is
/// terminal and mutually exclusive with a pending unroll.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct VtxoFlags {
	pub spent: bool,
	pub swept: bool,
	pub redeemed: bool,
	pub unrolled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoredVtxo {
	pub vtxo: Vtxo,
	pub flags: VtxoFlags,
}

impl StoredVtxo {
	pub fn new(vtxo: Vtxo) -> StoredVtxo {
		StoredVtxo { vtxo, flags: VtxoFlags::default() }
	}

	pub fn id(&self) -> VtxoId {
		self.vtxo.id()
	}

	pub fn is_spendable(&self) -> bool {
		!self.flags.spent && !self.flags.swept
	}
}

/// Everything the server persists per finished round.
#[derive(Debug, Clone)]
pub struct StoredRound {
	pub id: RoundId,
	pub funding_tx: Transaction,
	pub signed_tree: SignedVtxoTree,
	pub connectors: ConnectorTree,
	pub connector_key: SecretKey,
	/// The owner-signed forfeit tx for every input VTXO of the round.
	pub forfeit_txs: HashMap<VtxoId, Transaction>,
	pub swept: bool,
}

#[async_trait::async_trait]
pub trait VtxoStore: Send + Sync + 'static {
	async fn get_vtxo(&self, id: VtxoId) -> anyhow::Result<Option<StoredVtxo>>;
	async fn upsert_vtxos(&self, vtxos: &[StoredVtxo]) -> anyhow::Result<()>;
	/// Atomically update a VTXO's flags if the current flags match
	/// `expect`. Returns false if they don't.
	async fn compare_and_set_flags(
		&self,
		id: VtxoId,
		expect: VtxoFlags,
		new: VtxoFlags,
	) -> anyhow::Result<bool>;
	async fn list_spendable_by_owner(&self, owner: PublicKey) -> anyhow::Result<Vec<StoredVtxo>>;
}

#[async_trait::async_trait]
pub trait NoteStore: Send + Sync + 'static {
	/// Register an issued note. Fails if the id is already known.
	async fn register_note(&self, id: NoteId, amount: Amount) -> anyhow::Result<()>;
	/// The amount of an unspent note, [None] if unknown or consumed.
	async fn get_note(&self, id: NoteId) -> anyhow::Result<Option<Amount>>;
	/// Atomically consume a note. Returns its amount, or [None] if the
	/// note is unknown or was consumed before.
	async fn spend_note(&self, id: NoteId) -> anyhow::Result<Option<Amount>>;
}

#[async_trait::async_trait]
pub trait RoundStore: Send + Sync + 'static {
	async fn store_round(&self, round: StoredRound) -> anyhow::Result<()>;
	async fn get_round(&self, id: RoundId) -> anyhow::Result<Option<StoredRound>>;
	async fn list_unswept_rounds(&self) -> anyhow::Result<Vec<StoredRound>>;
	async fn mark_round_swept(&self, id: RoundId) -> anyhow::Result<()>;
}

pub trait Store: VtxoStore + NoteStore + RoundStore {}
impl<T: VtxoStore + NoteStore + RoundStore> Store for T {}

/// In-memory storage adapter.
#[derive(Default)]
pub struct MemoryStore {
	vtxos: Mutex<HashMap<VtxoId, StoredVtxo>>,
	notes: Mutex<HashMap<NoteId, Amount>>,
	rounds: Mutex<HashMap<RoundId, StoredRound>>,
}

impl MemoryStore {
	pub fn new() -> MemoryStore {
		MemoryStore::default()
	}
}

#[async_trait::async_trait]
impl VtxoStore for MemoryStore {
	async fn get_vtxo(&self, id: VtxoId) -> anyhow::Result<Option<StoredVtxo>> {
		Ok(self.vtxos.lock().get(&id).cloned())
	}

	async fn upsert_vtxos(&self, vtxos: &[StoredVtxo]) -> anyhow::Result<()> {
		let mut lock = self.vtxos.lock();
		for vtxo in vtxos {
			lock.insert(vtxo.id(), vtxo.clone());
		}
		Ok(())
	}

	async fn compare_and_set_flags(
		&self,
		id: VtxoId,
		expect: VtxoFlags,
		new: VtxoFlags,
	) -> anyhow::Result<bool> {
		let mut lock = self.vtxos.lock();
		match lock.get_mut(&id) {
			Some(stored) if stored.flags == expect => {
				stored.flags = new;
				Ok(true)
			},
			_ => Ok(false),
		}
	}

	async fn list_spendable_by_owner(&self, owner: PublicKey) -> anyhow::Result<Vec<StoredVtxo>> {
		Ok(self.vtxos.lock().values()
			.filter(|v| v.vtxo.owner_pubkey() == owner && v.is_spendable())
			.cloned()
			.collect())
	}
}

#[async_trait::async_trait]
impl NoteStore for MemoryStore {
	async fn register_note(&self, id: NoteId, amount: Amount) -> anyhow::Result<()> {
		let mut lock = self.notes.lock();
		if lock.contains_key(&id) {
			bail!("note {} already registered", id);
		}
		lock.insert(id, amount);
		Ok(())
	}

	async fn get_note(&self, id: NoteId) -> anyhow::Result<Option<Amount>> {
		Ok(self.notes.lock().get(&id).copied())
	}

	async fn spend_note(&self, id: NoteId) -> anyhow::Result<Option<Amount>> {
		Ok(self.notes.lock().remove(&id))
	}
}

#[async_trait::async_trait]
impl RoundStore for MemoryStore {
	async fn store_round(&self, round: StoredRound) -> anyhow::Result<()> {
		self.rounds.lock().insert(round.id, round);
		Ok(())
	}

	async fn get_round(&self, id: RoundId) -> anyhow::Result<Option<StoredRound>> {
		Ok(self.rounds.lock().get(&id).cloned())
	}

	async fn list_unswept_rounds(&self) -> anyhow::Result<Vec<StoredRound>> {
		Ok(self.rounds.lock().values().filter(|r| !r.swept).cloned().collect())
	}

	async fn mark_round_swept(&self, id: RoundId) -> anyhow::Result<()> {
		if let Some(round) = self.rounds.lock().get_mut(&id) {
			round.swept = true;
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn note_single_spend() {
		let store = MemoryStore::new();
		let note = ark::Note::generate(Amount::from_sat(10_000));
		store.register_note(note.id(), note.amount).await.unwrap();
		assert!(store.register_note(note.id(), note.amount).await.is_err());

		assert_eq!(store.spend_note(note.id()).await.unwrap(), Some(note.amount));
		assert_eq!(store.spend_note(note.id()).await.unwrap(), None);
	}
}
