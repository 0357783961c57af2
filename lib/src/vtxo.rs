
//! The VTXO model.
//!
//! A VTXO is a claim on an on-chain output, either directly (a leaf of a
//! round's VTXO tree) or transitively through an off-chain redeem tx. The
//! [VtxoSpec] captures the output policy, the [Vtxo] adds chain identity.

use std::fmt;
use std::str::FromStr;

use bitcoin::{taproot, Amount, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;

use crate::{musig, BlockDelta, Closure, Expiry, RoundId, SECP};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("failed to parse vtxo id, must be 36 bytes")]
pub struct VtxoIdParseError;

/// Identifier of a VTXO: its outpoint, txid plus output index.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VtxoId([u8; 36]);

impl VtxoId {
	/// Size in bytes of an encoded [VtxoId].
	pub const ENCODE_SIZE: usize = 36;

	pub fn from_slice(b: &[u8]) -> Result<VtxoId, VtxoIdParseError> {
		if b.len() == 36 {
			let mut ret = [0u8; 36];
			ret[..].copy_from_slice(&b[0..36]);
			Ok(Self(ret))
		} else {
			Err(VtxoIdParseError)
		}
	}

	pub fn point(self) -> OutPoint {
		let vout = [self.0[32], self.0[33], self.0[34], self.0[35]];
		OutPoint::new(
			Txid::from_slice(&self.0[0..32]).expect("32 bytes"),
			u32::from_le_bytes(vout),
		)
	}

	pub fn to_bytes(self) -> [u8; 36] {
		self.0
	}
}

impl From<OutPoint> for VtxoId {
	fn from(p: OutPoint) -> VtxoId {
		let mut ret = [0u8; 36];
		ret[0..32].copy_from_slice(&p.txid[..]);
		ret[32..].copy_from_slice(&p.vout.to_le_bytes());
		VtxoId(ret)
	}
}

impl AsRef<[u8]> for VtxoId {
	fn as_ref(&self) -> &[u8] {
		&self.0
	}
}

impl fmt::Display for VtxoId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(&self.point(), f)
	}
}

impl fmt::Debug for VtxoId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl FromStr for VtxoId {
	type Err = VtxoIdParseError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(OutPoint::from_str(s).map_err(|_| VtxoIdParseError)?.into())
	}
}

impl serde::Serialize for VtxoId {
	fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		if s.is_human_readable() {
			s.collect_str(self)
		} else {
			s.serialize_bytes(self.as_ref())
		}
	}
}

impl<'de> serde::Deserialize<'de> for VtxoId {
	fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		struct Visitor;
		impl<'de> serde::de::Visitor<'de> for Visitor {
			type Value = VtxoId;
			fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "a VtxoId, an outpoint")
			}
			fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
				VtxoId::from_slice(v).map_err(serde::de::Error::custom)
			}
			fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
				VtxoId::from_str(v).map_err(serde::de::Error::custom)
			}
		}
		if d.is_human_readable() {
			d.deserialize_str(Visitor)
		} else {
			d.deserialize_bytes(Visitor)
		}
	}
}

/// All the information that determines a VTXO's output script and value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VtxoSpec {
	pub owner_pubkey: PublicKey,
	pub server_pubkey: PublicKey,
	pub expiry: Expiry,
	/// The relative timelock of the owner's unilateral exit clause.
	pub exit_delta: BlockDelta,
	/// Additional spend closures beyond the standard forfeit and exit
	/// clauses, e.g. CLTV or hash-condition closures.
	pub extra_closures: Vec<Closure>,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
}

impl VtxoSpec {
	/// The cooperative owner+server clause, spent by forfeit txs and
	/// cosigned redeem txs.
	pub fn forfeit_closure(&self) -> Closure {
		Closure::new_multisig(self.owner_pubkey, self.server_pubkey)
	}

	/// The owner's unilateral exit clause.
	pub fn exit_closure(&self) -> Closure {
		Closure::new_csv_multisig(self.exit_delta, self.owner_pubkey)
	}

	/// All spend closures of this VTXO, forfeit clause first.
	pub fn closures(&self) -> Vec<Closure> {
		let mut ret = Vec::with_capacity(2 + self.extra_closures.len());
		ret.push(self.forfeit_closure());
		ret.push(self.exit_closure());
		ret.extend(self.extra_closures.iter().cloned());
		ret
	}

	/// The first closure the given witness stack length could satisfy,
	/// preferring cooperative closures.
	pub fn matching_closures(&self, witness_len: usize) -> Vec<Closure> {
		self.closures().into_iter()
			.filter(|c| c.witness_items() + 2 == witness_len)
			.collect()
	}

	/// The taproot of the VTXO output.
	///
	/// The key path aggregates owner and server, the script paths are
	/// the closures.
	pub fn taproot(&self) -> taproot::TaprootSpendInfo {
		let internal = musig::combine_keys([self.owner_pubkey, self.server_pubkey]);
		let leaves = self.closures().into_iter().map(|c| (1, c.script()));
		taproot::TaprootBuilder::with_huffman_tree(leaves)
			.expect("huffman tree")
			.finalize(&SECP, internal)
			.expect("taproot finalize")
	}

	pub fn script_pubkey(&self) -> ScriptBuf {
		ScriptBuf::new_p2tr_tweaked(self.taproot().output_key())
	}

	pub fn txout(&self) -> TxOut {
		TxOut {
			value: self.amount,
			script_pubkey: self.script_pubkey(),
		}
	}
}

/// A VTXO: a [VtxoSpec] anchored at a chain position.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Vtxo {
	/// The outpoint paying this VTXO, a leaf of a round's VTXO tree or
	/// an output of a redeem tx.
	pub point: OutPoint,
	pub spec: VtxoSpec,
	/// The round this VTXO was committed in.
	pub round_id: RoundId,
	/// For VTXOs created off-chain through the redeem path, the signed
	/// redeem tx, so a later unroll can republish it.
	pub redeem_tx: Option<Transaction>,
}

impl Vtxo {
	pub fn id(&self) -> VtxoId {
		self.point.into()
	}

	pub fn amount(&self) -> Amount {
		self.spec.amount
	}

	pub fn owner_pubkey(&self) -> PublicKey {
		self.spec.owner_pubkey
	}

	pub fn server_pubkey(&self) -> PublicKey {
		self.spec.server_pubkey
	}

	pub fn txout(&self) -> TxOut {
		self.spec.txout()
	}

	/// Whether this VTXO was created through the redeem path.
	pub fn is_redeemed(&self) -> bool {
		self.redeem_tx.is_some()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use bitcoin::secp256k1::{rand, Keypair};

	fn spec(amount: u64) -> VtxoSpec {
		let owner = Keypair::new(&SECP, &mut rand::thread_rng());
		let server = Keypair::new(&SECP, &mut rand::thread_rng());
		VtxoSpec {
			owner_pubkey: owner.public_key(),
			server_pubkey: server.public_key(),
			expiry: Expiry::Height(850_000),
			exit_delta: 144,
			extra_closures: vec![],
			amount: Amount::from_sat(amount),
		}
	}

	#[test]
	fn vtxo_id_roundtrip() {
		let point = OutPoint::new(Txid::all_zeros(), 7);
		let id = VtxoId::from(point);
		assert_eq!(id.point(), point);
		assert_eq!(VtxoId::from_slice(&id.to_bytes()).unwrap(), id);
		assert_eq!(VtxoId::from_str(&id.to_string()).unwrap(), id);
	}

	#[test]
	fn taproot_commits_all_closures() {
		let mut spec = spec(10_000);
		let base_spk = spec.script_pubkey();

		spec.extra_closures.push(Closure::new_cltv_multisig(
			900_000, spec.owner_pubkey, spec.server_pubkey,
		));
		// adding a closure must change the commitment
		assert_ne!(base_spk, spec.script_pubkey());

		// every closure is reachable through a control block
		let taproot = spec.taproot();
		for closure in spec.closures() {
			let leaf = (closure.script(), taproot::LeafVersion::TapScript);
			assert!(taproot.control_block(&leaf).is_some(), "{:?}", closure.kind());
		}
	}
}
