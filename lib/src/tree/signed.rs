
//! Construction and cooperative signing of the VTXO tree.
//!
//! Every node of the tree is a transaction. Leaf txs pay the minted
//! receivers, internal node txs fan out to their children. Each node tx
//! spends its parent's output through a taproot whose key path aggregates
//! the cosigners participating at that node and whose only script path is
//! the server's delayed sweep clause.

use std::collections::HashMap;
use std::fmt;

use bitcoin::{taproot, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{schnorr, Keypair, PublicKey, XOnlyPublicKey};
use bitcoin::sighash::{self, SighashCache, TapSighash, TapSighashType};

use crate::{
	musig, scripts, BlockDelta, Expiry, RoundId, SignMode, SignedVtxoRequest, Vtxo, VtxoSpec, SECP,
};
use crate::musig::{AggNonce, PartialSignature, PubNonce, SecNonce};
use crate::tree::{Node, Tree};

/// The delayed server-only sweep clause hidden in every node taproot.
pub fn sweep_clause(server_pubkey: PublicKey, sweep_delta: BlockDelta) -> ScriptBuf {
	scripts::delay_sign(sweep_delta, server_pubkey.x_only_public_key().0)
}

/// The taproot of a tree node output: key path for the aggregate cosign
/// key, script path for the sweep clause.
pub fn cosign_taproot(
	agg_pk: XOnlyPublicKey,
	server_pubkey: PublicKey,
	sweep_delta: BlockDelta,
) -> taproot::TaprootSpendInfo {
	taproot::TaprootBuilder::new()
		.add_leaf(0, sweep_clause(server_pubkey, sweep_delta)).unwrap()
		.finalize(&SECP, agg_pk).unwrap()
}

/// Error returned from the cosigning protocol.
#[derive(PartialEq, Eq, thiserror::Error)]
pub enum CosignError {
	#[error("missing cosign nonces from pubkey {pk}")]
	MissingNonces { pk: PublicKey },
	#[error("missing cosign signature from pubkey {pk}")]
	MissingSignature { pk: PublicKey },
	#[error("invalid cosign signature from pubkey {pk} at node {node_idx}")]
	InvalidSignature { pk: PublicKey, node_idx: usize },
	#[error("entry at node {node_idx} where pubkey {pk} does not participate")]
	UnexpectedEntry { pk: PublicKey, node_idx: usize },
	#[error("invalid cosign data: {0}")]
	Invalid(&'static str),
}

impl fmt::Debug for CosignError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

/// All the information that uniquely specifies a VTXO tree before it has
/// been signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtxoTreeSpec {
	/// The minted receivers, in batch order. Leaf `i` of the tree pays
	/// receiver `i`.
	pub vtxos: Vec<SignedVtxoRequest>,
	pub server_pubkey: PublicKey,
	/// The server's ephemeral cosign key for this round. The server
	/// cosigns every node.
	pub server_cosign_pubkey: PublicKey,
	pub expiry: Expiry,
	/// Relative timelock of the sweep clause on every node output.
	pub sweep_delta: BlockDelta,
	/// Relative timelock of the exit clause on the leaf outputs.
	pub exit_delta: BlockDelta,
	/// Fee budget deducted by every node tx.
	pub min_relay_fee: Amount,
}

impl VtxoTreeSpec {
	pub fn new(
		vtxos: Vec<SignedVtxoRequest>,
		server_pubkey: PublicKey,
		server_cosign_pubkey: PublicKey,
		expiry: Expiry,
		sweep_delta: BlockDelta,
		exit_delta: BlockDelta,
		min_relay_fee: Amount,
	) -> VtxoTreeSpec {
		assert_ne!(vtxos.len(), 0);
		VtxoTreeSpec {
			vtxos, server_pubkey, server_cosign_pubkey, expiry, sweep_delta,
			exit_delta, min_relay_fee,
		}
	}

	pub fn nb_leaves(&self) -> usize {
		self.vtxos.len()
	}

	pub fn nb_nodes(&self) -> usize {
		Tree::nb_nodes_for_leaves(self.nb_leaves())
	}

	/// Get the leaf index of the given cosign pubkey.
	pub fn leaf_idx_of(&self, cosign_pubkey: PublicKey) -> Option<usize> {
		self.vtxos.iter().position(|e| e.cosign_pubkey == cosign_pubkey)
	}

	/// The output spec of the leaf VTXO at the given index.
	pub fn leaf_spec(&self, leaf_idx: usize) -> VtxoSpec {
		let req = &self.vtxos[leaf_idx];
		VtxoSpec {
			owner_pubkey: req.vtxo.pubkey,
			server_pubkey: self.server_pubkey,
			expiry: self.expiry,
			exit_delta: self.exit_delta,
			extra_closures: vec![],
			amount: req.vtxo.amount,
		}
	}

	/// Whether the signer of the given leaf participates at the node.
	pub fn participates(&self, leaf_idx: usize, node: &Node) -> bool {
		match self.vtxos[leaf_idx].sign_mode {
			SignMode::All => true,
			SignMode::Branch => node.contains_leaf(leaf_idx),
		}
	}

	/// The cosigners at the given node: all participating receiver
	/// cosign keys plus the server's.
	pub fn node_cosigners<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = PublicKey> + 'a {
		self.vtxos.iter().enumerate()
			.filter(move |(i, _)| self.participates(*i, node))
			.map(|(_, req)| req.cosign_pubkey)
			.chain(Some(self.server_cosign_pubkey))
	}

	/// The value each node tx must receive from its parent.
	///
	/// Returned ordered from leaves to root. Every node tx spends its
	/// min-relay-fee budget, so an internal node carries the sum of its
	/// children plus its own budget.
	pub fn node_values(&self, tree: &Tree) -> Vec<Amount> {
		let mut ret = Vec::<Amount>::with_capacity(tree.nb_nodes());
		for node in tree.iter() {
			let value = if node.is_leaf() {
				self.vtxos[node.idx()].vtxo.amount + self.min_relay_fee
			} else {
				node.children().map(|c| ret[c]).sum::<Amount>() + self.min_relay_fee
			};
			ret.push(value);
		}
		ret
	}

	/// Calculate the total value needed in the tree: all leaf amounts
	/// plus one fee budget per node.
	pub fn total_required_value(&self) -> Amount {
		let amounts = self.vtxos.iter().map(|d| d.vtxo.amount).sum::<Amount>();
		amounts + self.min_relay_fee * self.nb_nodes() as u64
	}

	/// Calculate all the aggregate cosign pubkeys, ordered from leaves
	/// to root.
	pub fn cosign_agg_pks(&self) -> Vec<XOnlyPublicKey> {
		Tree::new(self.nb_leaves()).iter()
			.map(|node| musig::combine_keys(self.node_cosigners(node)))
			.collect()
	}

	/// Calculate the cosign taproot at a given node.
	pub fn cosign_taproot(&self, agg_pk: XOnlyPublicKey) -> taproot::TaprootSpendInfo {
		cosign_taproot(agg_pk, self.server_pubkey, self.sweep_delta)
	}

	/// The scriptPubkey of the shared output on the round tx that funds
	/// the tree.
	pub fn funding_script_pubkey(&self) -> ScriptBuf {
		let tree = Tree::new(self.nb_leaves());
		let agg_pk = musig::combine_keys(self.node_cosigners(tree.root()));
		ScriptBuf::new_p2tr_tweaked(self.cosign_taproot(agg_pk).output_key())
	}

	/// The shared output of the round tx funding the tree.
	pub fn funding_txout(&self) -> TxOut {
		TxOut {
			script_pubkey: self.funding_script_pubkey(),
			value: self.total_required_value(),
		}
	}

	fn node_tx(
		&self,
		node: &Node,
		values: &[Amount],
		agg_pks: &[XOnlyPublicKey],
	) -> Transaction {
		let output = if node.is_leaf() {
			vec![self.leaf_spec(node.idx()).txout()]
		} else {
			node.children().map(|child| TxOut {
				script_pubkey: ScriptBuf::new_p2tr_tweaked(self.cosign_taproot(agg_pks[child]).output_key()),
				value: values[child],
			}).collect()
		};
		Transaction {
			version: bitcoin::transaction::Version::TWO,
			lock_time: bitcoin::absolute::LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint::null(), // filled once txids are known
				sequence: Sequence::ZERO,
				script_sig: ScriptBuf::new(),
				witness: Witness::new(),
			}],
			output,
		}
	}

	/// Return unsigned transactions for all nodes from leaves to root.
	pub fn unsigned_transactions(&self, utxo: OutPoint) -> Vec<Transaction> {
		let tree = Tree::new(self.nb_leaves());
		let values = self.node_values(&tree);
		let agg_pks = self.cosign_agg_pks();

		let mut txs = tree.iter()
			.map(|node| self.node_tx(node, &values, &agg_pks))
			.collect::<Vec<_>>();

		// set the prevouts, top-down so parent txids are final
		txs.last_mut().unwrap().input[0].previous_output = utxo;
		for node in tree.iter().rev() {
			let txid = txs[node.idx()].compute_txid();
			for (i, child) in node.children().enumerate() {
				txs[child].input[0].previous_output = OutPoint::new(txid, i as u32);
			}
		}
		txs
	}

	/// Convert this spec into an unsigned tree by providing the shared
	/// output's outpoint on the round tx.
	pub fn into_unsigned_tree(self, utxo: OutPoint) -> UnsignedVtxoTree {
		UnsignedVtxoTree::new(self, utxo)
	}
}

/// A VTXO tree ready to be signed.
///
/// This type contains various cached values required to sign the tree.
#[derive(Debug, Clone)]
pub struct UnsignedVtxoTree {
	pub spec: VtxoTreeSpec,
	pub utxo: OutPoint,

	// the following fields are calculated from the above

	/// Aggregate pubkeys for the inputs of all node txs, leaves to root.
	pub cosign_agg_pks: Vec<XOnlyPublicKey>,
	/// Transactions for all nodes, leaves to root.
	pub txs: Vec<Transaction>,
	/// Sighashes for the only input of each node tx, leaves to root.
	pub sighashes: Vec<TapSighash>,

	tree: Tree,
}

impl UnsignedVtxoTree {
	pub fn new(spec: VtxoTreeSpec, utxo: OutPoint) -> UnsignedVtxoTree {
		let tree = Tree::new(spec.nb_leaves());
		let cosign_agg_pks = spec.cosign_agg_pks();
		let txs = spec.unsigned_transactions(utxo);
		let funding_txout = spec.funding_txout();

		let sighashes = tree.iter().map(|node| {
			let prev = match tree.parent_idx_of_with_sibling_idx(node.idx()) {
				Some((parent, sibling_idx)) => &txs[parent].output[sibling_idx],
				None => &funding_txout,
			};
			SighashCache::new(&txs[node.idx()]).taproot_key_spend_signature_hash(
				0, // input idx is always 0
				&sighash::Prevouts::All(&[prev]),
				TapSighashType::Default,
			).expect("sighash error")
		}).collect();

		UnsignedVtxoTree { spec, utxo, txs, sighashes, cosign_agg_pks, tree }
	}

	pub fn nb_leaves(&self) -> usize {
		self.tree.nb_leaves()
	}

	pub fn nb_nodes(&self) -> usize {
		self.tree.nb_nodes()
	}

	fn node_merkle_root(&self, node_idx: usize) -> Option<bitcoin::TapNodeHash> {
		self.spec.cosign_taproot(self.cosign_agg_pks[node_idx]).merkle_root()
	}

	/// Validate that a nonce matrix has entries exactly at the nodes the
	/// signer of the given leaf participates in.
	pub fn validate_nonce_matrix(
		&self,
		leaf_idx: usize,
		nonces: &[Option<PubNonce>],
	) -> Result<(), CosignError> {
		let pk = self.spec.vtxos[leaf_idx].cosign_pubkey;
		if nonces.len() != self.nb_nodes() {
			return Err(CosignError::Invalid("nonce matrix has wrong length"));
		}
		for node in self.tree.iter() {
			let entry = &nonces[node.idx()];
			if self.spec.participates(leaf_idx, node) {
				if entry.is_none() {
					return Err(CosignError::MissingNonces { pk });
				}
			} else if entry.is_some() {
				return Err(CosignError::UnexpectedEntry { pk, node_idx: node.idx() });
			}
		}
		Ok(())
	}

	/// Calculate all the aggregate cosign nonces by aggregating the
	/// receivers' nonce matrices with the server's nonces.
	///
	/// Returned ordered from leaves to root.
	pub fn calculate_cosign_agg_nonces(
		&self,
		cosign_nonces: &HashMap<PublicKey, Vec<Option<PubNonce>>>,
		server_nonces: &[PubNonce],
	) -> Result<Vec<AggNonce>, CosignError> {
		if server_nonces.len() != self.nb_nodes() {
			return Err(CosignError::Invalid("wrong number of server nonces"));
		}
		self.tree.iter().map(|node| {
			let mut nonces = Vec::new();
			for (i, req) in self.spec.vtxos.iter().enumerate() {
				if !self.spec.participates(i, node) {
					continue;
				}
				let matrix = cosign_nonces.get(&req.cosign_pubkey)
					.ok_or(CosignError::MissingNonces { pk: req.cosign_pubkey })?;
				let nonce = matrix.get(node.idx()).and_then(|o| o.as_ref())
					.ok_or(CosignError::MissingNonces { pk: req.cosign_pubkey })?;
				nonces.push(nonce);
			}
			nonces.push(&server_nonces[node.idx()]);
			Ok(musig::nonce_agg(nonces))
		}).collect()
	}

	/// Generate partial signatures for the nodes the signer of the given
	/// leaf participates in.
	///
	/// Secret nonces expected in node-index order over the participating
	/// nodes. Returns a full-length matrix with entries at those nodes.
	pub fn cosign_leaf(
		&self,
		cosign_agg_nonces: &[AggNonce],
		leaf_idx: usize,
		cosign_key: &Keypair,
		sec_nonces: Vec<SecNonce>,
	) -> Result<Vec<Option<PartialSignature>>, CosignError> {
		let req = self.spec.vtxos.get(leaf_idx).expect("leaf idx out of bounds");
		if cosign_key.public_key() != req.cosign_pubkey {
			return Err(CosignError::Invalid("cosign key doesn't match leaf"));
		}

		let mut ret = vec![None; self.nb_nodes()];
		let mut nonce_iter = sec_nonces.into_iter();
		for node in self.tree.iter() {
			if !self.spec.participates(leaf_idx, node) {
				continue;
			}
			let sec_nonce = nonce_iter.next()
				.ok_or(CosignError::Invalid("not enough secret nonces"))?;
			let sig = musig::partial_sign(
				self.spec.node_cosigners(node),
				self.node_merkle_root(node.idx()),
				cosign_key,
				sec_nonce,
				&cosign_agg_nonces[node.idx()],
				self.sighashes[node.idx()].to_byte_array(),
			);
			ret[node.idx()] = Some(sig);
		}
		Ok(ret)
	}

	/// Generate the server's partial signatures for all nodes.
	///
	/// Secret nonces expected for all nodes, ordered from leaves to root.
	pub fn cosign_tree(
		&self,
		cosign_agg_nonces: &[AggNonce],
		cosign_key: &Keypair,
		sec_nonces: Vec<SecNonce>,
	) -> Vec<PartialSignature> {
		assert_eq!(cosign_agg_nonces.len(), self.nb_nodes());
		assert_eq!(sec_nonces.len(), self.nb_nodes());

		self.tree.iter().zip(sec_nonces.into_iter()).map(|(node, sec_nonce)| {
			musig::partial_sign(
				self.spec.node_cosigners(node),
				self.node_merkle_root(node.idx()),
				cosign_key,
				sec_nonce,
				&cosign_agg_nonces[node.idx()],
				self.sighashes[node.idx()].to_byte_array(),
			)
		}).collect()
	}

	/// Verify the partial signatures submitted for the given leaf.
	///
	/// A single invalid entry rejects the whole submission.
	pub fn verify_leaf_partial_sigs(
		&self,
		cosign_agg_nonces: &[AggNonce],
		leaf_idx: usize,
		pub_nonces: &[Option<PubNonce>],
		part_sigs: &[Option<PartialSignature>],
	) -> Result<(), CosignError> {
		let pk = self.spec.vtxos[leaf_idx].cosign_pubkey;
		if part_sigs.len() != self.nb_nodes() {
			return Err(CosignError::Invalid("signature matrix has wrong length"));
		}
		for node in self.tree.iter() {
			let idx = node.idx();
			if !self.spec.participates(leaf_idx, node) {
				if part_sigs[idx].is_some() {
					return Err(CosignError::UnexpectedEntry { pk, node_idx: idx });
				}
				continue;
			}
			let part_sig = part_sigs[idx].ok_or(CosignError::MissingSignature { pk })?;
			let pub_nonce = pub_nonces.get(idx).and_then(|o| o.as_ref())
				.ok_or(CosignError::MissingNonces { pk })?;
			let ok = musig::partial_verify(
				self.spec.node_cosigners(node),
				self.node_merkle_root(idx),
				&cosign_agg_nonces[idx],
				self.sighashes[idx].to_byte_array(),
				part_sig,
				pub_nonce,
				pk,
			);
			if !ok {
				return Err(CosignError::InvalidSignature { pk, node_idx: idx });
			}
		}
		Ok(())
	}

	/// Combine all partial cosign signatures into one schnorr signature
	/// per node, ordered from leaves to root.
	pub fn combine_partial_signatures(
		&self,
		cosign_agg_nonces: &[AggNonce],
		leaf_part_sigs: &HashMap<PublicKey, Vec<Option<PartialSignature>>>,
		server_sigs: &[PartialSignature],
	) -> Result<Vec<schnorr::Signature>, CosignError> {
		if server_sigs.len() != self.nb_nodes() {
			return Err(CosignError::Invalid("wrong number of server signatures"));
		}
		self.tree.iter().map(|node| {
			let idx = node.idx();
			let mut sigs = Vec::new();
			for (i, req) in self.spec.vtxos.iter().enumerate() {
				if !self.spec.participates(i, node) {
					continue;
				}
				let sig = leaf_part_sigs.get(&req.cosign_pubkey)
					.and_then(|m| m.get(idx).copied().flatten())
					.ok_or(CosignError::MissingSignature { pk: req.cosign_pubkey })?;
				sigs.push(sig);
			}
			sigs.push(server_sigs[idx]);
			musig::combine_partial_signatures(
				self.spec.node_cosigners(node),
				self.node_merkle_root(idx),
				&cosign_agg_nonces[idx],
				self.sighashes[idx].to_byte_array(),
				sigs,
			).map_err(|_| CosignError::Invalid("partial signatures don't combine"))
		}).collect()
	}

	/// Verify the signatures of all the node txs.
	///
	/// Signatures expected ordered from leaves to root. On failure,
	/// returns the output key the signature failed for.
	pub fn verify_cosign_sigs(
		&self,
		signatures: &[schnorr::Signature],
	) -> Result<(), XOnlyPublicKey> {
		for node in self.tree.iter() {
			let sighash = self.sighashes[node.idx()];
			let agg_pk = self.cosign_agg_pks[node.idx()];
			let pk = self.spec.cosign_taproot(agg_pk).output_key().to_x_only_public_key();
			let sig = signatures.get(node.idx()).ok_or(pk)?;
			let msg = bitcoin::secp256k1::Message::from_digest(sighash.to_byte_array());
			if SECP.verify_schnorr(sig, &msg, &pk).is_err() {
				return Err(pk);
			}
		}
		Ok(())
	}

	/// Convert into a [SignedVtxoTree] by providing the signatures.
	///
	/// Signatures expected ordered from leaves to root.
	pub fn into_signed_tree(self, signatures: Vec<schnorr::Signature>) -> SignedVtxoTree {
		let txs = self.txs.iter().cloned().zip(&signatures).map(|(mut tx, sig)| {
			tx.input[0].witness.push(&sig[..]);
			tx
		}).collect();
		SignedVtxoTree {
			spec: self.spec,
			utxo: self.utxo,
			cosign_sigs: signatures,
			txs,
		}
	}
}

/// A fully signed VTXO tree, with all transactions cached.
#[derive(Debug, Clone)]
pub struct SignedVtxoTree {
	pub spec: VtxoTreeSpec,
	pub utxo: OutPoint,
	/// The signatures for the node txs from leaves to root.
	pub cosign_sigs: Vec<schnorr::Signature>,
	/// All signed txs in this tree, starting with the leaves, towards
	/// the root.
	pub txs: Vec<Transaction>,
}

impl SignedVtxoTree {
	pub fn nb_leaves(&self) -> usize {
		self.spec.nb_leaves()
	}

	pub fn nb_nodes(&self) -> usize {
		self.txs.len()
	}

	/// The round this tree was committed in.
	pub fn round_id(&self) -> RoundId {
		RoundId::new(self.utxo.txid)
	}

	/// Get all signed txs, starting with the leaves, towards the root.
	pub fn all_signed_txs(&self) -> &[Transaction] {
		&self.txs
	}

	/// Construct the exit branch starting from the root ending in the
	/// leaf tx.
	pub fn exit_branch(&self, leaf_idx: usize) -> Option<Vec<&Transaction>> {
		if leaf_idx >= self.spec.nb_leaves() {
			return None;
		}
		let tree = Tree::new(self.spec.nb_leaves());
		let mut ret = tree.iter_branch(leaf_idx)
			.map(|n| &self.txs[n.idx()])
			.collect::<Vec<_>>();
		ret.reverse();
		Some(ret)
	}

	/// The leaf indices whose leaf falls under the given node.
	pub fn leaves_under(&self, node_idx: usize) -> Vec<usize> {
		let tree = Tree::new(self.spec.nb_leaves());
		tree.node_at(node_idx).leaves().collect()
	}

	/// Construct the VTXO at the given leaf index.
	pub fn build_vtxo(&self, leaf_idx: usize) -> Option<Vtxo> {
		if leaf_idx >= self.spec.nb_leaves() {
			return None;
		}
		Some(Vtxo {
			point: OutPoint::new(self.txs[leaf_idx].compute_txid(), 0),
			spec: self.spec.leaf_spec(leaf_idx),
			round_id: self.round_id(),
			redeem_tx: None,
		})
	}

	/// Construct all individual vtxos of this tree.
	pub fn all_vtxos(&self) -> impl Iterator<Item = Vtxo> + '_ {
		(0..self.nb_leaves()).map(|idx| self.build_vtxo(idx).unwrap())
	}
}
