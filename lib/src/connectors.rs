
//! The connector tree.
//!
//! A balanced binary tree of transactions fanning the round tx's
//! connector output out into one tiny connector output per input VTXO.
//! Each connector's sole purpose is to be the second input of a forfeit
//! tx, which makes forfeits single-use and lets the server control their
//! fees.
//!
//! All outputs are p2tr keyspend outputs for the round's connector key.

use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{Keypair, Message, PublicKey};
use bitcoin::sighash::{self, SighashCache, TapSighashType};

use crate::tree::Tree;
use crate::{P2TR_DUST, SECP};

/// The signing key passed into [ConnectorTree::signed_txs] doesn't match
/// the tree's connector key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("signing key doesn't match connector tree")]
pub struct InvalidSigningKeyError;

/// A tree of connector outputs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConnectorTree {
	/// The number of connector leaves, one per input VTXO.
	len: usize,

	/// The key all connector outputs pay to.
	pubkey: PublicKey,

	/// The prevout from where the tree starts.
	///
	/// This should be an output of the round transaction.
	utxo: OutPoint,

	/// Fee budget spent by each node tx.
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	min_relay_fee: Amount,
}

impl ConnectorTree {
	/// Create the scriptPubkey all connector outputs use.
	pub fn output_script(pubkey: PublicKey) -> ScriptBuf {
		ScriptBuf::new_p2tr(&SECP, pubkey.x_only_public_key().0, None)
	}

	/// The budget needed for a tree with `len` connectors: one dust per
	/// connector plus one fee budget per node tx.
	pub fn required_budget(len: usize, min_relay_fee: Amount) -> Amount {
		assert_ne!(len, 0);
		if len == 1 {
			P2TR_DUST
		} else {
			P2TR_DUST * len as u64 + min_relay_fee * (len - 1) as u64
		}
	}

	/// Create the connector output to include in the round tx.
	pub fn output(len: usize, pubkey: PublicKey, min_relay_fee: Amount) -> TxOut {
		TxOut {
			script_pubkey: Self::output_script(pubkey),
			value: Self::required_budget(len, min_relay_fee),
		}
	}

	/// Create a new connector tree.
	///
	/// Before calling this, a utxo should be created paying
	/// [ConnectorTree::output_script] exactly
	/// [ConnectorTree::required_budget].
	pub fn new(
		len: usize,
		utxo: OutPoint,
		pubkey: PublicKey,
		min_relay_fee: Amount,
	) -> ConnectorTree {
		assert_ne!(len, 0);
		ConnectorTree { len, pubkey, utxo, min_relay_fee }
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn pubkey(&self) -> PublicKey {
		self.pubkey
	}

	fn node_values(&self, tree: &Tree) -> Vec<Amount> {
		let mut ret = Vec::<Amount>::with_capacity(tree.nb_nodes());
		for node in tree.iter() {
			let value = if node.is_leaf() {
				P2TR_DUST
			} else {
				node.children().map(|c| ret[c]).sum::<Amount>() + self.min_relay_fee
			};
			ret.push(value);
		}
		ret
	}

	/// The unsigned node transactions, children before parents.
	///
	/// Empty for a single-connector tree, where the round tx output is
	/// the connector itself.
	pub fn txs(&self) -> Vec<Transaction> {
		if self.len == 1 {
			return Vec::new();
		}
		let tree = Tree::new(self.len);
		let values = self.node_values(&tree);
		let spk = Self::output_script(self.pubkey);

		let mut txs = tree.iter_internal().map(|node| {
			Transaction {
				version: bitcoin::transaction::Version::TWO,
				lock_time: bitcoin::absolute::LockTime::ZERO,
				input: vec![TxIn {
					previous_output: OutPoint::null(), // filled below
					sequence: Sequence::ZERO,
					script_sig: ScriptBuf::new(),
					witness: Witness::new(),
				}],
				output: node.children().map(|child| TxOut {
					script_pubkey: spk.clone(),
					value: values[child],
				}).collect(),
			}
		}).collect::<Vec<_>>();

		// fill prevouts top-down so parent txids are final
		let nb_leaves = tree.nb_leaves();
		txs.last_mut().unwrap().input[0].previous_output = self.utxo;
		for node in tree.iter_internal().rev() {
			let txid = txs[node.idx() - nb_leaves].compute_txid();
			for (i, child) in node.children().enumerate() {
				if child >= nb_leaves {
					txs[child - nb_leaves].input[0].previous_output =
						OutPoint::new(txid, i as u32);
				}
			}
		}
		txs
	}

	/// The signed node transactions, children before parents.
	///
	/// We expect the internal key here, not the output key.
	pub fn signed_txs(
		&self,
		sign_key: &Keypair,
	) -> Result<Vec<Transaction>, InvalidSigningKeyError> {
		if Self::output_script(sign_key.public_key()) != Self::output_script(self.pubkey) {
			return Err(InvalidSigningKeyError);
		}
		let tree = Tree::new(self.len);
		let values = self.node_values(&tree);
		let spk = Self::output_script(self.pubkey);
		let tweaked = sign_key.tap_tweak(&SECP, None).to_inner();

		let mut txs = self.txs();
		let nb_leaves = tree.nb_leaves();
		for node in tree.iter_internal() {
			let tx_idx = node.idx() - nb_leaves;
			let prevout = TxOut {
				script_pubkey: spk.clone(),
				value: values[node.idx()],
			};
			let sighash = SighashCache::new(&txs[tx_idx])
				.taproot_key_spend_signature_hash(
					0, &sighash::Prevouts::All(&[prevout]), TapSighashType::Default,
				).expect("sighash error");
			let msg = Message::from_digest(sighash.to_byte_array());
			let sig = SECP.sign_schnorr(&msg, &tweaked);
			txs[tx_idx].input[0].witness = Witness::from_slice(&[&sig[..]]);
		}
		Ok(txs)
	}

	/// The connector leaf outpoints, in leaf order.
	///
	/// Must be called with the result of [ConnectorTree::txs] or
	/// [ConnectorTree::signed_txs].
	pub fn connectors(&self, txs: &[Transaction]) -> Vec<OutPoint> {
		if self.len == 1 {
			return vec![self.utxo];
		}
		let tree = Tree::new(self.len);
		let nb_leaves = tree.nb_leaves();
		let txids = txs.iter().map(|tx| tx.compute_txid()).collect::<Vec<Txid>>();

		(0..self.len).map(|leaf| {
			let (parent, sibling_idx) = tree.parent_idx_of_with_sibling_idx(leaf)
				.expect("len > 1 so leaves have parents");
			OutPoint::new(txids[parent - nb_leaves], sibling_idx as u32)
		}).collect()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::collections::HashSet;
	use bitcoin::secp256k1::rand;

	const FEE: Amount = Amount::from_sat(500);

	#[test]
	fn test_single_connector() {
		let key = Keypair::new(&SECP, &mut rand::thread_rng());
		let utxo = OutPoint::new(Txid::all_zeros(), 1);
		let tree = ConnectorTree::new(1, utxo, key.public_key(), FEE);

		assert!(tree.txs().is_empty());
		assert_eq!(tree.connectors(&[]), vec![utxo]);
		assert_eq!(ConnectorTree::required_budget(1, FEE), P2TR_DUST);
	}

	#[test]
	fn test_budget_and_structure() {
		let key = Keypair::new(&SECP, &mut rand::thread_rng());
		let utxo = OutPoint::new(Txid::all_zeros(), 1);

		for n in 2..24 {
			let tree = ConnectorTree::new(n, utxo, key.public_key(), FEE);
			let txs = tree.txs();
			assert_eq!(txs.len(), n - 1);

			let connectors = tree.connectors(&txs);
			assert_eq!(connectors.len(), n);
			assert_eq!(connectors.iter().collect::<HashSet<_>>().len(), n);

			// every connector is a dust output of one of the txs
			for conn in &connectors {
				let tx = txs.iter().find(|tx| tx.compute_txid() == conn.txid).unwrap();
				assert_eq!(tx.output[conn.vout as usize].value, P2TR_DUST);
			}

			// the root tx spends the round tx output and the values add up
			assert_eq!(txs.last().unwrap().input[0].previous_output, utxo);
			let budget = ConnectorTree::required_budget(n, FEE);
			let total_out = txs.iter()
				.flat_map(|tx| tx.output.iter())
				.map(|o| o.value)
				.sum::<Amount>();
			// every tx's outputs are spent by a child except the connectors
			let spent_within = txs.iter()
				.map(|tx| tx.input[0].previous_output)
				.filter(|p| *p != utxo)
				.map(|p| txs.iter().find(|tx| tx.compute_txid() == p.txid).unwrap()
					.output[p.vout as usize].value)
				.sum::<Amount>();
			assert_eq!(
				total_out - spent_within,
				budget - FEE * (n - 1) as u64,
				"n={}", n,
			);
		}
	}

	#[test]
	fn test_signatures() {
		let key = Keypair::new(&SECP, &mut rand::thread_rng());
		let utxo = OutPoint::new(Txid::all_zeros(), 1);
		let tree = ConnectorTree::new(5, utxo, key.public_key(), FEE);

		let wrong_key = Keypair::new(&SECP, &mut rand::thread_rng());
		assert_eq!(tree.signed_txs(&wrong_key), Err(InvalidSigningKeyError));

		let txs = tree.signed_txs(&key).unwrap();
		let output_key = key.public_key().x_only_public_key().0
			.tap_tweak(&SECP, None).0;
		let tree_struct = Tree::new(5);
		let values = tree.node_values(&tree_struct);
		for node in tree_struct.iter_internal() {
			let tx_idx = node.idx() - tree_struct.nb_leaves();
			let prevout = TxOut {
				script_pubkey: ConnectorTree::output_script(key.public_key()),
				value: values[node.idx()],
			};
			let sighash = SighashCache::new(&txs[tx_idx])
				.taproot_key_spend_signature_hash(
					0, &sighash::Prevouts::All(&[prevout]), TapSighashType::Default,
				).unwrap();
			let sig = bitcoin::secp256k1::schnorr::Signature::from_slice(
				&txs[tx_idx].input[0].witness[0],
			).unwrap();
			let msg = Message::from_digest(sighash.to_byte_array());
			SECP.verify_schnorr(&sig, &msg, &output_key.to_x_only_public_key()).unwrap();
		}
	}
}
