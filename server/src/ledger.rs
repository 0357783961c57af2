
//! The VTXO ledger.
//!
//! Authoritative set of spent and unspent VTXOs plus the issued-notes
//! set. All state transitions go through this type; the commit lock
//! serializes them, so concurrent spend-and-mint calls with overlapping
//! inputs resolve to exactly one winner.

use std::sync::Arc;

use bitcoin::secp256k1::PublicKey;
use log::debug;
use tokio::sync::Mutex;

use ark::{Note, RoundEvent, RoundId, Vtxo, VtxoId};
use ark::note::NoteId;
use bitcoin::Amount;

use crate::database::{Store, StoredVtxo, VtxoFlags};
use crate::error::AlreadySpent;
use crate::events::EventBus;

/// What kind of operation is spending the inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendKind {
	/// Inputs consumed by a round.
	Round,
	/// Inputs consumed by an off-chain redeem tx.
	Redeem,
}

pub struct Ledger {
	store: Arc<dyn Store>,
	events: Arc<EventBus>,
	/// Serializes all ledger mutations.
	commit_lock: Mutex<()>,
}

impl Ledger {
	pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>) -> Ledger {
		Ledger {
			store,
			events,
			commit_lock: Mutex::new(()),
		}
	}

	pub async fn get(&self, id: VtxoId) -> anyhow::Result<Option<StoredVtxo>> {
		self.store.get_vtxo(id).await
	}

	pub async fn list_spendable(&self, owner: PublicKey) -> anyhow::Result<Vec<StoredVtxo>> {
		self.store.list_spendable_by_owner(owner).await
	}

	/// Atomically mark all `spend` inputs spent and insert the `mint`
	/// outputs.
	///
	/// Rejected with [AlreadySpent] if any input is not spendable; in
	/// that case no state is changed.
	pub async fn spend_and_mint(
		&self,
		spend: &[VtxoId],
		mint: Vec<Vtxo>,
		kind: SpendKind,
	) -> anyhow::Result<()> {
		let _guard = self.commit_lock.lock().await;

		// all inputs must exist and be spendable before we write anything
		let mut inputs = Vec::with_capacity(spend.len());
		for id in spend {
			let stored = self.store.get_vtxo(*id).await?
				.ok_or_else(|| AlreadySpent::new(id))?;
			if !stored.is_spendable() {
				return Err(AlreadySpent::new(id).into());
			}
			inputs.push(stored);
		}

		let mut written: Vec<(VtxoId, VtxoFlags)> = Vec::with_capacity(spend.len());
		for stored in inputs {
			let mut new = stored.flags;
			new.spent = true;
			new.redeemed = kind == SpendKind::Redeem;
			let ok = self.store
				.compare_and_set_flags(stored.id(), stored.flags, new)
				.await?;
			if !ok {
				// the store changed under us: roll back and report
				for (id, flags) in written {
					let mut spent = flags;
					spent.spent = true;
					spent.redeemed = kind == SpendKind::Redeem;
					self.store.compare_and_set_flags(id, spent, flags).await?;
				}
				return Err(AlreadySpent::new(stored.id()).into());
			}
			written.push((stored.id(), stored.flags));
		}

		let round_id = mint.first().map(|v| v.round_id);
		let minted = mint.iter().map(|v| v.id()).collect::<Vec<_>>();
		let stored = mint.into_iter().map(StoredVtxo::new).collect::<Vec<_>>();
		self.store.upsert_vtxos(&stored).await?;

		debug!("ledger: spent {} inputs, minted {} outputs", spend.len(), minted.len());
		if let Some(round_id) = round_id {
			self.events.publish(RoundEvent::VtxoMinted { round_id, vtxos: minted });
		}
		Ok(())
	}

	/// Mark the given VTXOs spent without minting anything.
	pub async fn spend(&self, ids: &[VtxoId], kind: SpendKind) -> anyhow::Result<()> {
		self.spend_and_mint(ids, Vec::new(), kind).await
	}

	/// Mint without spending, e.g. for note redemptions.
	pub async fn mint(&self, vtxos: Vec<Vtxo>) -> anyhow::Result<()> {
		self.spend_and_mint(&[], vtxos, SpendKind::Round).await
	}

	/// Commit a finished round: spend the input VTXOs, mark recovered
	/// VTXOs reclaimed and mint the tree leaves.
	///
	/// Recovered inputs must be swept and not yet reclaimed; regular
	/// inputs must be spendable. Nothing is changed on rejection.
	pub async fn commit_round(
		&self,
		spend: &[VtxoId],
		recovered: &[VtxoId],
		mint: Vec<Vtxo>,
	) -> anyhow::Result<()> {
		let _guard = self.commit_lock.lock().await;

		// validate everything before writing anything
		let mut writes = Vec::with_capacity(spend.len() + recovered.len());
		for id in spend {
			let stored = self.store.get_vtxo(*id).await?
				.ok_or_else(|| AlreadySpent::new(id))?;
			if !stored.is_spendable() {
				return Err(AlreadySpent::new(id).into());
			}
			let mut new = stored.flags;
			new.spent = true;
			writes.push((*id, stored.flags, new));
		}
		for id in recovered {
			let stored = self.store.get_vtxo(*id).await?
				.ok_or_else(|| AlreadySpent::new(id))?;
			if !stored.flags.swept || stored.flags.spent || stored.flags.unrolled {
				return Err(AlreadySpent::new(id).into());
			}
			let mut new = stored.flags;
			new.spent = true;
			writes.push((*id, stored.flags, new));
		}

		let mut written = Vec::with_capacity(writes.len());
		for (id, old, new) in writes {
			if !self.store.compare_and_set_flags(id, old, new).await? {
				for (id, old, new) in written {
					self.store.compare_and_set_flags(id, new, old).await?;
				}
				return Err(AlreadySpent::new(id).into());
			}
			written.push((id, old, new));
		}

		let round_id = mint.first().map(|v| v.round_id);
		let minted = mint.iter().map(|v| v.id()).collect::<Vec<_>>();
		let stored = mint.into_iter().map(StoredVtxo::new).collect::<Vec<_>>();
		self.store.upsert_vtxos(&stored).await?;

		debug!("ledger: round committed, {} spent, {} recovered, {} minted",
			spend.len(), recovered.len(), minted.len());
		if let Some(round_id) = round_id {
			self.events.publish(RoundEvent::VtxoMinted { round_id, vtxos: minted });
		}
		Ok(())
	}

	/// Look up an unspent note's amount.
	pub async fn note_amount(&self, id: NoteId) -> anyhow::Result<Option<Amount>> {
		self.store.get_note(id).await
	}

	/// Mark the given VTXOs swept.
	///
	/// Sweeping is terminal; a VTXO with a pending unroll cannot be
	/// swept.
	pub async fn mark_swept(&self, ids: &[VtxoId]) -> anyhow::Result<()> {
		let _guard = self.commit_lock.lock().await;
		for id in ids {
			let stored = self.store.get_vtxo(*id).await?
				.ok_or_else(|| anyhow!("unknown vtxo {}", id))?;
			if stored.flags.unrolled {
				bail!("vtxo {} has a pending unroll, cannot sweep", id);
			}
			if stored.flags.swept {
				continue;
			}
			let mut new = stored.flags;
			new.swept = true;
			if !self.store.compare_and_set_flags(*id, stored.flags, new).await? {
				bail!("concurrent flag update for vtxo {}", id);
			}
		}
		Ok(())
	}

	/// Mark a VTXO as being unilaterally exited.
	pub async fn mark_unrolled(&self, id: VtxoId) -> anyhow::Result<()> {
		let _guard = self.commit_lock.lock().await;
		let stored = self.store.get_vtxo(id).await?
			.ok_or_else(|| anyhow!("unknown vtxo {}", id))?;
		if stored.flags.swept {
			bail!("vtxo {} was swept, cannot unroll", id);
		}
		if stored.flags.unrolled {
			return Ok(());
		}
		let mut new = stored.flags;
		new.unrolled = true;
		if !self.store.compare_and_set_flags(id, stored.flags, new).await? {
			bail!("concurrent flag update for vtxo {}", id);
		}
		Ok(())
	}

	/// Register freshly issued notes.
	pub async fn register_notes(&self, notes: &[Note]) -> anyhow::Result<()> {
		for note in notes {
			self.store.register_note(note.id(), note.amount).await?;
		}
		Ok(())
	}

	/// Consume a note. Fails with [AlreadySpent] if the note is unknown
	/// or was consumed before.
	pub async fn spend_note(&self, id: NoteId) -> anyhow::Result<Amount> {
		match self.store.spend_note(id).await? {
			Some(amount) => Ok(amount),
			None => Err(AlreadySpent::new(id).into()),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use bitcoin::OutPoint;
	use bitcoin::hashes::Hash;
	use bitcoin::secp256k1::{rand, Keypair};
	use bitcoin::Txid;

	use ark::{Expiry, VtxoSpec, SECP};

	use crate::database::MemoryStore;

	fn test_vtxo(point: OutPoint) -> Vtxo {
		let owner = Keypair::new(&SECP, &mut rand::thread_rng());
		let server = Keypair::new(&SECP, &mut rand::thread_rng());
		Vtxo {
			point,
			spec: VtxoSpec {
				owner_pubkey: owner.public_key(),
				server_pubkey: server.public_key(),
				expiry: Expiry::Height(850_000),
				exit_delta: 144,
				extra_closures: vec![],
				amount: Amount::from_sat(10_000),
			},
			round_id: RoundId::new(Txid::all_zeros()),
			redeem_tx: None,
		}
	}

	fn test_ledger() -> Arc<Ledger> {
		Arc::new(Ledger::new(Arc::new(MemoryStore::new()), Arc::new(EventBus::new())))
	}

	fn point(vout: u32) -> OutPoint {
		OutPoint::new(Txid::all_zeros(), vout)
	}

	#[tokio::test]
	async fn double_spend_rejected() {
		let ledger = test_ledger();
		let vtxo = test_vtxo(point(0));
		ledger.mint(vec![vtxo.clone()]).await.unwrap();

		ledger.spend_and_mint(&[vtxo.id()], vec![test_vtxo(point(1))], SpendKind::Round)
			.await.unwrap();
		let err = ledger
			.spend_and_mint(&[vtxo.id()], vec![test_vtxo(point(2))], SpendKind::Round)
			.await.unwrap_err();
		assert!(err.downcast_ref::<AlreadySpent>().is_some());
	}

	#[tokio::test]
	async fn concurrent_overlapping_spends_one_winner() {
		let ledger = test_ledger();
		let vtxo = test_vtxo(point(0));
		ledger.mint(vec![vtxo.clone()]).await.unwrap();

		let mut tasks = Vec::new();
		for i in 0..8u32 {
			let ledger = ledger.clone();
			let id = vtxo.id();
			tasks.push(tokio::spawn(async move {
				ledger.spend_and_mint(
					&[id], vec![test_vtxo(point(100 + i))], SpendKind::Redeem,
				).await
			}));
		}

		let mut ok = 0;
		let mut already_spent = 0;
		for task in tasks {
			match task.await.unwrap() {
				Ok(()) => ok += 1,
				Err(e) if e.downcast_ref::<AlreadySpent>().is_some() => already_spent += 1,
				Err(e) => panic!("unexpected error: {}", e),
			}
		}
		assert_eq!(ok, 1);
		assert_eq!(already_spent, 7);
	}

	#[tokio::test]
	async fn swept_and_unrolled_are_exclusive() {
		let ledger = test_ledger();
		let a = test_vtxo(point(0));
		let b = test_vtxo(point(1));
		ledger.mint(vec![a.clone(), b.clone()]).await.unwrap();

		ledger.mark_unrolled(a.id()).await.unwrap();
		assert!(ledger.mark_swept(&[a.id()]).await.is_err());

		ledger.mark_swept(&[b.id()]).await.unwrap();
		assert!(ledger.mark_unrolled(b.id()).await.is_err());
		// swept vtxos are not spendable
		let err = ledger
			.spend_and_mint(&[b.id()], vec![], SpendKind::Redeem)
			.await.unwrap_err();
		assert!(err.downcast_ref::<AlreadySpent>().is_some());
	}

	#[tokio::test]
	async fn note_redeemed_once() {
		let ledger = test_ledger();
		let note = Note::generate(Amount::from_sat(10_000));
		ledger.register_notes(&[note.clone()]).await.unwrap();

		assert_eq!(ledger.spend_note(note.id()).await.unwrap(), note.amount);
		let err = ledger.spend_note(note.id()).await.unwrap_err();
		assert!(err.downcast_ref::<AlreadySpent>().is_some());
	}
}
