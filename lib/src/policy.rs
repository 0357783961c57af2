
//! Spend closures for VTXOs.
//!
//! A VTXO's script commitment is a taproot over a set of closures, each
//! describing one way to spend it. All closures share a common capability
//! set: producing their tapscript, bounding their witness size and
//! verifying a witness stack against the chain tip.

use std::fmt;

use bitcoin::{ScriptBuf, Witness};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{schnorr, Message, PublicKey};

use crate::{scripts, BlockDelta, BlockHeight, SECP};

/// Upper bound size of a single schnorr signature witness element,
/// including the length prefix.
const SIGNATURE_WITNESS_SIZE: usize = 66;

/// Type enum of [Closure].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum ClosureKind {
	/// Cooperative owner+server spend, used by forfeits and redeems.
	Multisig,
	/// Owner+server spend behind an absolute locktime.
	CltvMultisig,
	/// Single-key spend behind a relative timelock, used for unilateral
	/// exit (owner key) and tree sweeps (server key).
	CsvMultisig,
	/// Owner+server spend conditional on a hash preimage.
	ConditionMultisig,
}

impl fmt::Display for ClosureKind {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Multisig => f.write_str("multisig"),
			Self::CltvMultisig => f.write_str("cltv-multisig"),
			Self::CsvMultisig => f.write_str("csv-multisig"),
			Self::ConditionMultisig => f.write_str("condition-multisig"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct MultisigClosure {
	pub owner_pubkey: PublicKey,
	pub server_pubkey: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct CltvMultisigClosure {
	pub height: BlockHeight,
	pub owner_pubkey: PublicKey,
	pub server_pubkey: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct CsvMultisigClosure {
	pub delta: BlockDelta,
	pub pubkey: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct ConditionMultisigClosure {
	pub condition: sha256::Hash,
	pub owner_pubkey: PublicKey,
	pub server_pubkey: PublicKey,
}

/// One way to spend a VTXO.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum Closure {
	Multisig(MultisigClosure),
	CltvMultisig(CltvMultisigClosure),
	CsvMultisig(CsvMultisigClosure),
	ConditionMultisig(ConditionMultisigClosure),
}

/// Error returned from verifying a witness against a [Closure].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClosureError {
	#[error("malformed witness: {0}")]
	BadWitness(&'static str),
	#[error("missing owner signature")]
	MissingSignature,
	#[error("invalid signature for key {pubkey}")]
	InvalidSignature { pubkey: PublicKey },
	#[error("locktime at height {height} not met at tip {tip}")]
	LocktimeNotMet { height: BlockHeight, tip: BlockHeight },
	#[error("condition preimage does not match")]
	ConditionMismatch,
}

fn check_sig(
	sig: &[u8],
	sighash: [u8; 32],
	pubkey: PublicKey,
) -> Result<(), ClosureError> {
	let sig = schnorr::Signature::from_slice(sig)
		.map_err(|_| ClosureError::BadWitness("invalid signature encoding"))?;
	let msg = Message::from_digest(sighash);
	SECP.verify_schnorr(&sig, &msg, &pubkey.x_only_public_key().0)
		.map_err(|_| ClosureError::InvalidSignature { pubkey })
}

impl Closure {
	pub fn new_multisig(owner_pubkey: PublicKey, server_pubkey: PublicKey) -> Closure {
		Closure::Multisig(MultisigClosure { owner_pubkey, server_pubkey })
	}

	pub fn new_cltv_multisig(
		height: BlockHeight,
		owner_pubkey: PublicKey,
		server_pubkey: PublicKey,
	) -> Closure {
		Closure::CltvMultisig(CltvMultisigClosure { height, owner_pubkey, server_pubkey })
	}

	pub fn new_csv_multisig(delta: BlockDelta, pubkey: PublicKey) -> Closure {
		Closure::CsvMultisig(CsvMultisigClosure { delta, pubkey })
	}

	pub fn new_condition_multisig(
		condition: sha256::Hash,
		owner_pubkey: PublicKey,
		server_pubkey: PublicKey,
	) -> Closure {
		Closure::ConditionMultisig(ConditionMultisigClosure {
			condition, owner_pubkey, server_pubkey,
		})
	}

	pub fn kind(&self) -> ClosureKind {
		match self {
			Self::Multisig(_) => ClosureKind::Multisig,
			Self::CltvMultisig(_) => ClosureKind::CltvMultisig,
			Self::CsvMultisig(_) => ClosureKind::CsvMultisig,
			Self::ConditionMultisig(_) => ClosureKind::ConditionMultisig,
		}
	}

	/// Whether the server can cooperate in spending through this closure.
	pub fn is_cooperative(&self) -> bool {
		!matches!(self, Self::CsvMultisig(_))
	}

	/// The tapscript of this closure.
	pub fn script(&self) -> ScriptBuf {
		match self {
			Self::Multisig(c) => scripts::multisig(
				c.owner_pubkey.x_only_public_key().0,
				c.server_pubkey.x_only_public_key().0,
			),
			Self::CltvMultisig(c) => scripts::timelock_multisig(
				c.height,
				c.owner_pubkey.x_only_public_key().0,
				c.server_pubkey.x_only_public_key().0,
			),
			Self::CsvMultisig(c) => scripts::delay_sign(
				c.delta,
				c.pubkey.x_only_public_key().0,
			),
			Self::ConditionMultisig(c) => scripts::hash_multisig(
				c.condition,
				c.owner_pubkey.x_only_public_key().0,
				c.server_pubkey.x_only_public_key().0,
			),
		}
	}

	/// Upper bound on the witness stack size to satisfy this closure,
	/// excluding the script and control block elements.
	pub fn witness_size(&self) -> usize {
		match self {
			Self::Multisig(_) => 2 * SIGNATURE_WITNESS_SIZE,
			Self::CltvMultisig(_) => 2 * SIGNATURE_WITNESS_SIZE,
			Self::CsvMultisig(_) => SIGNATURE_WITNESS_SIZE,
			Self::ConditionMultisig(_) => 2 * SIGNATURE_WITNESS_SIZE + 33,
		}
	}

	/// The number of witness stack elements this closure consumes.
	pub fn witness_items(&self) -> usize {
		match self {
			Self::Multisig(_) => 2,
			Self::CltvMultisig(_) => 2,
			Self::CsvMultisig(_) => 1,
			Self::ConditionMultisig(_) => 3,
		}
	}

	/// Verify a witness stack against this closure.
	///
	/// The stack contains only the elements consumed by the script, in
	/// witness order; the script and control block elements are stripped
	/// by the caller. The server signature slot may be empty, it is
	/// added by the server when it cosigns.
	pub fn verify(
		&self,
		stack: &[&[u8]],
		sighash: [u8; 32],
		tip_height: BlockHeight,
	) -> Result<(), ClosureError> {
		if stack.len() != self.witness_items() {
			return Err(ClosureError::BadWitness("wrong number of witness elements"));
		}
		match self {
			Self::Multisig(c) => {
				if !stack[0].is_empty() {
					check_sig(stack[0], sighash, c.server_pubkey)?;
				}
				if stack[1].is_empty() {
					return Err(ClosureError::MissingSignature);
				}
				check_sig(stack[1], sighash, c.owner_pubkey)
			},
			Self::CltvMultisig(c) => {
				if tip_height < c.height {
					return Err(ClosureError::LocktimeNotMet {
						height: c.height, tip: tip_height,
					});
				}
				if !stack[0].is_empty() {
					check_sig(stack[0], sighash, c.server_pubkey)?;
				}
				if stack[1].is_empty() {
					return Err(ClosureError::MissingSignature);
				}
				check_sig(stack[1], sighash, c.owner_pubkey)
			},
			Self::CsvMultisig(c) => {
				if stack[0].is_empty() {
					return Err(ClosureError::MissingSignature);
				}
				check_sig(stack[0], sighash, c.pubkey)
			},
			Self::ConditionMultisig(c) => {
				if sha256::Hash::hash(stack[2]) != c.condition {
					return Err(ClosureError::ConditionMismatch);
				}
				if !stack[0].is_empty() {
					check_sig(stack[0], sighash, c.server_pubkey)?;
				}
				if stack[1].is_empty() {
					return Err(ClosureError::MissingSignature);
				}
				check_sig(stack[1], sighash, c.owner_pubkey)
			},
		}
	}

	/// Extract the closure's witness stack from a full script-spend witness.
	///
	/// Returns the stack elements without the script and control block.
	pub fn witness_stack<'a>(&self, witness: &'a Witness) -> Result<Vec<&'a [u8]>, ClosureError> {
		let total = witness.len();
		if total != self.witness_items() + 2 {
			return Err(ClosureError::BadWitness("wrong witness length for script spend"));
		}
		Ok(witness.iter().take(self.witness_items()).collect())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use bitcoin::secp256k1::{rand, Keypair};

	fn keypair() -> Keypair {
		Keypair::new(&SECP, &mut rand::thread_rng())
	}

	#[test]
	fn multisig_owner_half_and_full() {
		let owner = keypair();
		let server = keypair();
		let closure = Closure::new_multisig(owner.public_key(), server.public_key());
		let sighash = rand::random::<[u8; 32]>();
		let msg = Message::from_digest(sighash);

		let owner_sig = SECP.sign_schnorr(&msg, &owner);
		let server_sig = SECP.sign_schnorr(&msg, &server);

		// owner half only: server slot empty
		closure.verify(&[&[], &owner_sig[..]], sighash, 0).unwrap();
		// fully signed
		closure.verify(&[&server_sig[..], &owner_sig[..]], sighash, 0).unwrap();
		// owner sig missing
		assert_eq!(
			closure.verify(&[&server_sig[..], &[]], sighash, 0),
			Err(ClosureError::MissingSignature),
		);
		// swapped sigs don't verify
		assert!(closure.verify(&[&owner_sig[..], &server_sig[..]], sighash, 0).is_err());
	}

	#[test]
	fn cltv_respects_tip() {
		let owner = keypair();
		let server = keypair();
		let closure = Closure::new_cltv_multisig(100, owner.public_key(), server.public_key());
		let sighash = rand::random::<[u8; 32]>();
		let sig = SECP.sign_schnorr(&Message::from_digest(sighash), &owner);

		assert_eq!(
			closure.verify(&[&[], &sig[..]], sighash, 99),
			Err(ClosureError::LocktimeNotMet { height: 100, tip: 99 }),
		);
		closure.verify(&[&[], &sig[..]], sighash, 100).unwrap();
	}

	#[test]
	fn condition_closure_checks_preimage() {
		let owner = keypair();
		let server = keypair();
		let preimage = rand::random::<[u8; 32]>();
		let condition = sha256::Hash::hash(&preimage);
		let closure = Closure::new_condition_multisig(
			condition, owner.public_key(), server.public_key(),
		);
		let sighash = rand::random::<[u8; 32]>();
		let sig = SECP.sign_schnorr(&Message::from_digest(sighash), &owner);

		closure.verify(&[&[], &sig[..], &preimage[..]], sighash, 0).unwrap();
		let wrong = rand::random::<[u8; 32]>();
		assert_eq!(
			closure.verify(&[&[], &sig[..], &wrong[..]], sighash, 0),
			Err(ClosureError::ConditionMismatch),
		);
	}
}
