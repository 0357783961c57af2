
//! Forfeit collection for a round.
//!
//! Every input VTXO of a round gets one connector leaf assigned; the
//! collector accepts owner-signed forfeit txs, validates them against
//! their assigned connector and reports completeness.

use std::fmt;

use bitcoin::{Amount, OutPoint, Transaction};
use bitcoin::secp256k1::PublicKey;

use ark::{forfeit, Vtxo, VtxoId};
use ark::connectors::ConnectorTree;

use crate::error::badarg;

/// Not every input VTXO has a forfeit tx yet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("missing forfeit tx for vtxo {vtxo}")]
pub struct MissingForfeit {
	pub vtxo: VtxoId,
}

struct Entry {
	vtxo: Vtxo,
	connector: OutPoint,
	tx: Option<Transaction>,
}

/// Collects and validates the forfeit txs of one round.
///
/// Owned by the round coordinator task; needs no locking.
pub struct ForfeitCollector {
	entries: Vec<Entry>,
	connector_pubkey: PublicKey,
	fee: Amount,
}

impl fmt::Debug for ForfeitCollector {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "ForfeitCollector({}/{} signed)", self.nb_signed(), self.entries.len())
	}
}

impl ForfeitCollector {
	/// Build the collector, binding every input VTXO to a connector.
	///
	/// VTXOs are ordered lexicographically by outpoint and mapped
	/// position-wise onto the connector leaves ordered by outpoint.
	/// Fails if there are fewer connectors than VTXOs, which is fatal
	/// for the round.
	pub fn new(
		mut vtxos: Vec<Vtxo>,
		connectors: &ConnectorTree,
		connector_txs: &[Transaction],
		fee: Amount,
	) -> anyhow::Result<ForfeitCollector> {
		let mut leaves = connectors.connectors(connector_txs);
		if vtxos.len() > leaves.len() {
			bail!(
				"connector tree has {} leaves for {} input vtxos",
				leaves.len(), vtxos.len(),
			);
		}

		vtxos.sort_by_key(|v| v.id());
		leaves.sort_by_key(|p| (p.txid, p.vout));

		let entries = vtxos.into_iter().zip(leaves).map(|(vtxo, connector)| {
			Entry { vtxo, connector, tx: None }
		}).collect();

		Ok(ForfeitCollector {
			entries,
			connector_pubkey: connectors.pubkey(),
			fee,
		})
	}

	pub fn nb_signed(&self) -> usize {
		self.entries.iter().filter(|e| e.tx.is_some()).count()
	}

	/// The connector assigned to the given input VTXO.
	pub fn connector_for(&self, vtxo: VtxoId) -> Option<OutPoint> {
		self.entries.iter().find(|e| e.vtxo.id() == vtxo).map(|e| e.connector)
	}

	/// Accept a batch of owner-signed forfeit txs.
	///
	/// Each tx is matched to its input VTXO by its first input and
	/// validated in full; one bad tx rejects the batch.
	pub fn sign(&mut self, txs: &[Transaction]) -> anyhow::Result<()> {
		for tx in txs {
			let spent = tx.input.first()
				.map(|i| VtxoId::from(i.previous_output))
				.ok_or_else(|| anyhow!("forfeit tx without inputs"))?;
			let entry = match self.entries.iter_mut().find(|e| e.vtxo.id() == spent) {
				Some(e) => e,
				None => return badarg!("vtxo {} is not part of this round", spent),
			};
			forfeit::validate_forfeit_tx(
				tx, &entry.vtxo, entry.connector, self.connector_pubkey, self.fee,
			).map_err(|e| anyhow::Error::from(crate::error::BadArgument::new(e)))?;
			entry.tx = Some(tx.clone());
		}
		Ok(())
	}

	/// Whether every input VTXO has a validated forfeit tx.
	pub fn all_signed(&self) -> bool {
		self.entries.iter().all(|e| e.tx.is_some())
	}

	/// The input VTXOs that are still missing a forfeit.
	pub fn missing(&self) -> Vec<VtxoId> {
		self.entries.iter().filter(|e| e.tx.is_none()).map(|e| e.vtxo.id()).collect()
	}

	/// Take the complete forfeit set, resetting the collector.
	///
	/// Fails with [MissingForfeit] if any entry is empty.
	pub fn pop(&mut self) -> Result<Vec<(VtxoId, Transaction)>, MissingForfeit> {
		if let Some(missing) = self.entries.iter().find(|e| e.tx.is_none()) {
			return Err(MissingForfeit { vtxo: missing.vtxo.id() });
		}
		Ok(self.entries.iter_mut()
			.map(|e| (e.vtxo.id(), e.tx.take().expect("checked non-empty")))
			.collect())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use bitcoin::{Amount, Txid};
	use bitcoin::hashes::Hash;
	use bitcoin::secp256k1::{rand, Keypair};

	use ark::{Expiry, RoundId, VtxoSpec, SECP};

	const FEE: Amount = Amount::from_sat(500);

	fn test_vtxo(owner: &Keypair, server: &Keypair, vout: u32) -> Vtxo {
		Vtxo {
			point: OutPoint::new(Txid::all_zeros(), vout),
			spec: VtxoSpec {
				owner_pubkey: owner.public_key(),
				server_pubkey: server.public_key(),
				expiry: Expiry::Height(850_000),
				exit_delta: 144,
				extra_closures: vec![],
				amount: Amount::from_sat(50_000),
			},
			round_id: RoundId::new(Txid::all_zeros()),
			redeem_tx: None,
		}
	}

	struct Setup {
		owners: Vec<Keypair>,
		vtxos: Vec<Vtxo>,
		connectors: ConnectorTree,
		connector_key: Keypair,
		txs: Vec<Transaction>,
	}

	fn setup(n: usize) -> Setup {
		let server = Keypair::new(&SECP, &mut rand::thread_rng());
		let connector_key = Keypair::new(&SECP, &mut rand::thread_rng());
		let owners = (0..n).map(|_| Keypair::new(&SECP, &mut rand::thread_rng()))
			.collect::<Vec<_>>();
		let vtxos = owners.iter().enumerate()
			.map(|(i, o)| test_vtxo(o, &server, i as u32))
			.collect::<Vec<_>>();
		let connectors = ConnectorTree::new(
			n,
			OutPoint::new(Txid::all_zeros(), 100),
			connector_key.public_key(),
			FEE,
		);
		let txs = connectors.txs();
		Setup { owners, vtxos, connectors, connector_key, txs }
	}

	fn signed_forfeit(s: &Setup, collector: &ForfeitCollector, idx: usize) -> Transaction {
		let vtxo = &s.vtxos[idx];
		let connector = collector.connector_for(vtxo.id()).unwrap();
		let mut tx = forfeit::create_forfeit_tx(vtxo, connector, FEE);
		forfeit::sign_forfeit_vtxo_input(
			&mut tx, vtxo, s.connector_key.public_key(), &s.owners[idx],
		);
		tx
	}

	#[test]
	fn collects_and_pops_complete_set() {
		let s = setup(3);
		let mut collector = ForfeitCollector::new(
			s.vtxos.clone(), &s.connectors, &s.txs, FEE,
		).unwrap();

		let txs = (0..3).map(|i| signed_forfeit(&s, &collector, i)).collect::<Vec<_>>();
		collector.sign(&txs[0..2]).unwrap();
		assert!(!collector.all_signed());
		assert_eq!(collector.missing().len(), 1);
		assert!(matches!(collector.pop(), Err(MissingForfeit { .. })));

		collector.sign(&txs[2..3]).unwrap();
		assert!(collector.all_signed());

		let popped = collector.pop().unwrap();
		assert_eq!(popped.len(), 3);
		// every forfeit spends its designated connector leaf
		let mut leaves = s.connectors.connectors(&s.txs);
		leaves.sort_by_key(|p| (p.txid, p.vout));
		let mut sorted = s.vtxos.clone();
		sorted.sort_by_key(|v| v.id());
		for (vtxo, leaf) in sorted.iter().zip(&leaves) {
			let (_, tx) = popped.iter().find(|(id, _)| *id == vtxo.id()).unwrap();
			assert_eq!(tx.input[1].previous_output, *leaf);
		}

		// popping resets the collector
		assert!(!collector.all_signed());
	}

	#[test]
	fn too_few_connectors_is_fatal() {
		let s = setup(3);
		let small = ConnectorTree::new(
			2,
			OutPoint::new(Txid::all_zeros(), 100),
			s.connector_key.public_key(),
			FEE,
		);
		let txs = small.txs();
		assert!(ForfeitCollector::new(s.vtxos.clone(), &small, &txs, FEE).is_err());
	}

	#[test]
	fn rejects_foreign_and_invalid_txs() {
		let s = setup(2);
		let mut collector = ForfeitCollector::new(
			s.vtxos.clone(), &s.connectors, &s.txs, FEE,
		).unwrap();

		// signed by the wrong key
		let vtxo = &s.vtxos[0];
		let connector = collector.connector_for(vtxo.id()).unwrap();
		let mut tx = forfeit::create_forfeit_tx(vtxo, connector, FEE);
		forfeit::sign_forfeit_vtxo_input(
			&mut tx, vtxo, s.connector_key.public_key(), &s.owners[1],
		);
		assert!(collector.sign(&[tx]).is_err());

		// spending a vtxo that's not in the round
		let foreign_owner = Keypair::new(&SECP, &mut rand::thread_rng());
		let server = Keypair::new(&SECP, &mut rand::thread_rng());
		let foreign = test_vtxo(&foreign_owner, &server, 99);
		let tx = forfeit::create_forfeit_tx(&foreign, connector, FEE);
		assert!(collector.sign(&[tx]).is_err());
	}
}
