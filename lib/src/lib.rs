
pub extern crate bitcoin;

#[macro_use] extern crate serde;
#[macro_use] extern crate lazy_static;

pub mod connectors;
pub mod encode;
pub mod forfeit;
pub mod musig;
pub mod note;
pub mod policy;
pub mod rounds;
pub mod scripts;
pub mod tree;
pub mod vtxo;

use bitcoin::Amount;
use bitcoin::secp256k1::{self, PublicKey};

pub use crate::note::Note;
pub use crate::policy::Closure;
pub use crate::rounds::{RoundEvent, RoundId};
pub use crate::vtxo::{Vtxo, VtxoId, VtxoSpec};

lazy_static! {
	/// Global secp context.
	pub static ref SECP: secp256k1::Secp256k1<secp256k1::All> = secp256k1::Secp256k1::new();
}

pub const P2TR_DUST_VB: u64 = 110;
/// 330 satoshis
pub const P2TR_DUST_SAT: u64 = P2TR_DUST_VB * 3;
pub const P2TR_DUST: Amount = Amount::from_sat(P2TR_DUST_SAT);

/// Witness weight of a taproot keyspend.
pub const TAPROOT_KEYSPEND_WEIGHT: usize = 66;

/// Type representing a block height in the bitcoin blockchain.
pub type BlockHeight = u64;

/// Type representing a relative number of blocks.
pub type BlockDelta = u16;

/// An expiry moment for tree outputs, in the unit the server is
/// configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum Expiry {
	/// Absolute block height.
	Height(BlockHeight),
	/// Unix timestamp in seconds.
	Timestamp(u64),
}

impl Expiry {
	/// Whether this expiry has passed at the given chain position.
	pub fn is_due(&self, tip_height: BlockHeight, now_unix: u64) -> bool {
		match self {
			Expiry::Height(h) => tip_height >= *h,
			Expiry::Timestamp(t) => now_unix >= *t,
		}
	}
}

/// How a receiver participates in signing the VTXO tree.
///
/// Signers always participate in all nodes on their own root-to-leaf
/// branch. A signer in [SignMode::All] additionally cosigns every other
/// node of the tree, so its key is part of every node's aggregate key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum SignMode {
	All,
	Branch,
}

/// Request for the creation of a VTXO.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct VtxoRequest {
	pub pubkey: PublicKey,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
}

/// A [VtxoRequest] together with the ephemeral key its owner will use
/// to cosign the VTXO tree.
///
/// The client SHOULD forget the cosign key after signing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct SignedVtxoRequest {
	pub vtxo: VtxoRequest,
	pub cosign_pubkey: PublicKey,
	pub sign_mode: SignMode,
}
