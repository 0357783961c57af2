
//! Forfeit transaction construction and validation.
//!
//! For every VTXO spent in a round, its owner pre-signs a tx spending the
//! VTXO together with one connector output, paying to the server. Should
//! the owner later try to unilaterally exit the spent VTXO, the server
//! publishes this tx to claim the funds.
//!
//! The VTXO input is a script-path spend of the forfeit closure; the
//! owner's signature is provided at collection time, the server adds its
//! own signature and the connector keyspend signature at broadcast time.

use bitcoin::{
	taproot, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{Keypair, Message, PublicKey};
use bitcoin::sighash::{self, SighashCache, TapSighash, TapSighashType};

use crate::connectors::ConnectorTree;
use crate::policy::ClosureError;
use crate::{Vtxo, P2TR_DUST, SECP};

/// Error returned from validating a submitted forfeit tx.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForfeitError {
	#[error("malformed forfeit tx: {0}")]
	BadTx(&'static str),
	#[error("forfeit tx doesn't spend the assigned connector {expected}")]
	WrongConnector { expected: OutPoint },
	#[error("forfeit output value {value} doesn't match expected {expected}")]
	WrongAmount { value: Amount, expected: Amount },
	#[error("invalid forfeit witness: {0}")]
	Witness(#[from] ClosureError),
}

/// The value of the forfeit output: the VTXO amount minus the connector
/// relay-fee budget. Together with the connector dust input this leaves
/// `fee` plus one dust for the miner.
pub fn forfeit_output_value(vtxo_amount: Amount, fee: Amount) -> Amount {
	vtxo_amount - fee
}

/// The output the forfeit tx pays the server.
pub fn forfeit_txout(vtxo: &Vtxo, fee: Amount) -> TxOut {
	TxOut {
		value: forfeit_output_value(vtxo.amount(), fee),
		script_pubkey: ScriptBuf::new_p2tr(
			&SECP, vtxo.server_pubkey().x_only_public_key().0, None,
		),
	}
}

/// Construct the forfeit tx for the given VTXO and connector.
///
/// The witnesses are left empty.
pub fn create_forfeit_tx(vtxo: &Vtxo, connector: OutPoint, fee: Amount) -> Transaction {
	Transaction {
		version: bitcoin::transaction::Version::TWO,
		lock_time: bitcoin::absolute::LockTime::ZERO,
		input: vec![
			TxIn {
				previous_output: vtxo.point,
				sequence: Sequence::ZERO,
				script_sig: ScriptBuf::new(),
				witness: Witness::new(),
			},
			TxIn {
				previous_output: connector,
				sequence: Sequence::ZERO,
				script_sig: ScriptBuf::new(),
				witness: Witness::new(),
			},
		],
		output: vec![forfeit_txout(vtxo, fee)],
	}
}

fn prevouts(vtxo: &Vtxo, connector_pubkey: PublicKey) -> [TxOut; 2] {
	[
		vtxo.txout(),
		TxOut {
			value: P2TR_DUST,
			script_pubkey: ConnectorTree::output_script(connector_pubkey),
		},
	]
}

/// The sighash of the VTXO input, a script-path spend of the forfeit
/// closure.
pub fn forfeit_vtxo_sighash(
	tx: &Transaction,
	vtxo: &Vtxo,
	connector_pubkey: PublicKey,
) -> TapSighash {
	let leaf = taproot::TapLeafHash::from_script(
		&vtxo.spec.forfeit_closure().script(),
		taproot::LeafVersion::TapScript,
	);
	SighashCache::new(tx).taproot_script_spend_signature_hash(
		0,
		&sighash::Prevouts::All(&prevouts(vtxo, connector_pubkey)),
		leaf,
		TapSighashType::Default,
	).expect("sighash error")
}

/// The sighash of the connector input, a keyspend.
pub fn forfeit_connector_sighash(
	tx: &Transaction,
	vtxo: &Vtxo,
	connector_pubkey: PublicKey,
) -> TapSighash {
	SighashCache::new(tx).taproot_key_spend_signature_hash(
		1,
		&sighash::Prevouts::All(&prevouts(vtxo, connector_pubkey)),
		TapSighashType::Default,
	).expect("sighash error")
}

/// Create the owner's witness for the VTXO input.
///
/// The server signature slot is left empty; the server fills it in when
/// it broadcasts the forfeit.
pub fn sign_forfeit_vtxo_input(
	tx: &mut Transaction,
	vtxo: &Vtxo,
	connector_pubkey: PublicKey,
	owner_key: &Keypair,
) {
	let closure = vtxo.spec.forfeit_closure();
	let taproot = vtxo.spec.taproot();
	let leaf = (closure.script(), taproot::LeafVersion::TapScript);
	let cb = taproot.control_block(&leaf).expect("forfeit closure in taproot");

	let sighash = forfeit_vtxo_sighash(tx, vtxo, connector_pubkey);
	let msg = Message::from_digest(sighash.to_byte_array());
	let sig = SECP.sign_schnorr(&msg, owner_key).serialize();
	let cb = cb.serialize();

	tx.input[0].witness = Witness::from_slice(&[
		&[][..],
		&sig[..],
		leaf.0.as_bytes(),
		&cb[..],
	]);
}

/// Validate a forfeit tx submitted for the given VTXO.
///
/// Checks the input/output shape, the assigned connector, the output
/// amount and the owner's signature under the forfeit closure.
pub fn validate_forfeit_tx(
	tx: &Transaction,
	vtxo: &Vtxo,
	connector: OutPoint,
	connector_pubkey: PublicKey,
	fee: Amount,
) -> Result<(), ForfeitError> {
	if tx.input.len() != 2 {
		return Err(ForfeitError::BadTx("must have exactly two inputs"));
	}
	if tx.output.len() != 1 {
		return Err(ForfeitError::BadTx("must have exactly one output"));
	}
	if tx.input[0].previous_output != vtxo.point {
		return Err(ForfeitError::BadTx("first input must spend the vtxo"));
	}
	if tx.input[1].previous_output != connector {
		return Err(ForfeitError::WrongConnector { expected: connector });
	}

	let expected = forfeit_txout(vtxo, fee);
	if tx.output[0].script_pubkey != expected.script_pubkey {
		return Err(ForfeitError::BadTx("output must pay the server"));
	}
	if tx.output[0].value != expected.value {
		return Err(ForfeitError::WrongAmount {
			value: tx.output[0].value,
			expected: expected.value,
		});
	}

	let closure = vtxo.spec.forfeit_closure();
	let stack = closure.witness_stack(&tx.input[0].witness)?;
	let sighash = forfeit_vtxo_sighash(tx, vtxo, connector_pubkey);
	closure.verify(&stack, sighash.to_byte_array(), 0)?;
	Ok(())
}

/// Complete a collected forfeit tx for broadcast: add the server's
/// signature to the VTXO input and keyspend-sign the connector input.
pub fn finish_forfeit_tx(
	tx: &mut Transaction,
	vtxo: &Vtxo,
	server_key: &Keypair,
	connector_key: &Keypair,
) -> Result<(), ForfeitError> {
	let connector_pubkey = connector_key.public_key();
	let closure = vtxo.spec.forfeit_closure();
	let stack = tx.input[0].witness.iter().map(|e| e.to_vec()).collect::<Vec<_>>();
	if stack.len() != closure.witness_items() + 2 {
		return Err(ForfeitError::BadTx("unexpected witness shape"));
	}

	let sighash = forfeit_vtxo_sighash(tx, vtxo, connector_pubkey);
	let msg = Message::from_digest(sighash.to_byte_array());
	let server_sig = SECP.sign_schnorr(&msg, server_key);

	let mut elements = stack;
	elements[0] = server_sig.serialize().to_vec();
	tx.input[0].witness = Witness::from_slice(&elements);

	let conn_sighash = forfeit_connector_sighash(tx, vtxo, connector_pubkey);
	let conn_msg = Message::from_digest(conn_sighash.to_byte_array());
	let tweaked = connector_key.tap_tweak(&SECP, None).to_inner();
	let conn_sig = SECP.sign_schnorr(&conn_msg, &tweaked);
	tx.input[1].witness = Witness::from_slice(&[&conn_sig[..]]);

	// the result must satisfy the closure in full
	let stack = closure.witness_stack(&tx.input[0].witness)?;
	closure.verify(&stack, sighash.to_byte_array(), 0)?;
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	use bitcoin::{OutPoint, Txid};
	use bitcoin::secp256k1::rand;

	use crate::{Expiry, RoundId, VtxoSpec};

	const FEE: Amount = Amount::from_sat(500);

	fn test_vtxo(owner: &Keypair, server: &Keypair) -> Vtxo {
		Vtxo {
			point: OutPoint::new(Txid::all_zeros(), 3),
			spec: VtxoSpec {
				owner_pubkey: owner.public_key(),
				server_pubkey: server.public_key(),
				expiry: Expiry::Height(850_000),
				exit_delta: 144,
				extra_closures: vec![],
				amount: Amount::from_sat(100_000),
			},
			round_id: RoundId::new(Txid::all_zeros()),
			redeem_tx: None,
		}
	}

	#[test]
	fn forfeit_sign_validate_finish() {
		let owner = Keypair::new(&SECP, &mut rand::thread_rng());
		let server = Keypair::new(&SECP, &mut rand::thread_rng());
		let connector_key = Keypair::new(&SECP, &mut rand::thread_rng());
		let vtxo = test_vtxo(&owner, &server);
		let connector = OutPoint::new(Txid::all_zeros(), 7);

		let mut tx = create_forfeit_tx(&vtxo, connector, FEE);
		assert_eq!(tx.output[0].value, Amount::from_sat(99_500));

		// unsigned tx doesn't validate
		assert!(validate_forfeit_tx(
			&tx, &vtxo, connector, connector_key.public_key(), FEE,
		).is_err());

		sign_forfeit_vtxo_input(&mut tx, &vtxo, connector_key.public_key(), &owner);
		validate_forfeit_tx(&tx, &vtxo, connector, connector_key.public_key(), FEE).unwrap();

		// wrong connector is rejected
		let other = OutPoint::new(Txid::all_zeros(), 8);
		assert_eq!(
			validate_forfeit_tx(&tx, &vtxo, other, connector_key.public_key(), FEE),
			Err(ForfeitError::WrongConnector { expected: other }),
		);

		// tampering with the output is rejected
		let mut tampered = tx.clone();
		tampered.output[0].value = Amount::from_sat(100_000);
		assert!(matches!(
			validate_forfeit_tx(
				&tampered, &vtxo, connector, connector_key.public_key(), FEE,
			),
			Err(ForfeitError::WrongAmount { .. }),
		));

		finish_forfeit_tx(&mut tx, &vtxo, &server, &connector_key).unwrap();
		assert_eq!(tx.input[0].witness.len(), 4);
		assert_eq!(tx.input[1].witness.len(), 1);
	}

	#[test]
	fn forfeit_rejects_foreign_signer() {
		let owner = Keypair::new(&SECP, &mut rand::thread_rng());
		let server = Keypair::new(&SECP, &mut rand::thread_rng());
		let connector_key = Keypair::new(&SECP, &mut rand::thread_rng());
		let mallory = Keypair::new(&SECP, &mut rand::thread_rng());
		let vtxo = test_vtxo(&owner, &server);
		let connector = OutPoint::new(Txid::all_zeros(), 7);

		let mut tx = create_forfeit_tx(&vtxo, connector, FEE);
		sign_forfeit_vtxo_input(&mut tx, &vtxo, connector_key.public_key(), &mallory);
		assert!(matches!(
			validate_forfeit_tx(&tx, &vtxo, connector, connector_key.public_key(), FEE),
			Err(ForfeitError::Witness(ClosureError::InvalidSignature { .. })),
		));
	}
}
