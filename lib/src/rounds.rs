
use std::fmt;
use std::str::FromStr;

use bitcoin::{Transaction, Txid};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::schnorr;

use crate::connectors::ConnectorTree;
use crate::musig;
use crate::tree::signed::VtxoTreeSpec;
use crate::vtxo::VtxoId;

/// The output index of the vtxo tree root in the round tx.
pub const ROUND_TX_VTXO_TREE_VOUT: u32 = 0;
/// The output index of the connector tree root in the round tx.
pub const ROUND_TX_CONNECTOR_VOUT: u32 = 1;

/// Identifier for a round.
///
/// It is the txid of the round's commitment transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoundId(Txid);

impl RoundId {
	/// Create a new [RoundId] from the round tx's [Txid].
	pub const fn new(txid: Txid) -> RoundId {
		RoundId(txid)
	}

	pub fn from_slice(bytes: &[u8]) -> Result<RoundId, bitcoin::hashes::FromSliceError> {
		Txid::from_slice(bytes).map(RoundId::new)
	}

	pub fn as_round_txid(&self) -> Txid {
		self.0
	}
}

impl From<Txid> for RoundId {
	fn from(txid: Txid) -> RoundId {
		RoundId::new(txid)
	}
}

impl fmt::Display for RoundId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for RoundId {
	type Err = bitcoin::hashes::hex::HexToArrayError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Txid::from_str(s).map(RoundId::new)
	}
}

impl serde::Serialize for RoundId {
	fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		if s.is_human_readable() {
			s.collect_str(self)
		} else {
			s.serialize_bytes(self.0.as_ref())
		}
	}
}

impl<'de> serde::Deserialize<'de> for RoundId {
	fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		struct Visitor;
		impl<'de> serde::de::Visitor<'de> for Visitor {
			type Value = RoundId;
			fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "a RoundId, which is a Txid")
			}
			fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
				RoundId::from_slice(v).map_err(serde::de::Error::custom)
			}
			fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
				RoundId::from_str(v).map_err(serde::de::Error::custom)
			}
		}
		if d.is_human_readable() {
			d.deserialize_str(Visitor)
		} else {
			d.deserialize_bytes(Visitor)
		}
	}
}

/// Sequence number of a round, unique within a server lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct RoundSeq(u64);

impl RoundSeq {
	pub fn new(seq: u64) -> RoundSeq {
		RoundSeq(seq)
	}

	pub fn inner(&self) -> u64 {
		self.0
	}

	pub fn increment(&mut self) {
		self.0 += 1;
	}
}

impl fmt::Display for RoundSeq {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Events the coordinator fans out to connected clients.
///
/// Delivery is best-effort: slow subscribers drop their oldest events.
#[derive(Debug, Clone)]
pub enum RoundEvent {
	/// A new round started and its batch is fixed.
	Started {
		round_seq: RoundSeq,
	},
	/// The trees are built; cosigners must submit their nonce matrices.
	TreeNonceRequested {
		round_seq: RoundSeq,
		unsigned_round_tx: Transaction,
		vtxos_spec: VtxoTreeSpec,
	},
	/// Nonces are aggregated; cosigners must submit partial signatures.
	TreeSigRequested {
		round_seq: RoundSeq,
		cosign_agg_nonces: Vec<musig::AggNonce>,
	},
	/// The tree is fully signed; owners must submit their forfeit txs.
	ForfeitsRequested {
		round_seq: RoundSeq,
		cosign_sigs: Vec<schnorr::Signature>,
		connectors: ConnectorTree,
	},
	/// The round tx was broadcast and all effects are durable.
	Finalized {
		round_seq: RoundSeq,
		round_id: RoundId,
		signed_round_tx: Transaction,
	},
	/// The round failed; reason is safe to show to clients.
	Failed {
		round_seq: RoundSeq,
		reason: String,
	},
	/// New VTXOs were committed to the ledger.
	VtxoMinted {
		round_id: RoundId,
		vtxos: Vec<VtxoId>,
	},
}

impl RoundEvent {
	/// A short name for logging.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::Started { .. } => "started",
			Self::TreeNonceRequested { .. } => "tree-nonce-requested",
			Self::TreeSigRequested { .. } => "tree-sig-requested",
			Self::ForfeitsRequested { .. } => "forfeits-requested",
			Self::Finalized { .. } => "finalized",
			Self::Failed { .. } => "failed",
			Self::VtxoMinted { .. } => "vtxo-minted",
		}
	}
}
