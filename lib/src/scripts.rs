
//! Tapscript clause builders shared by VTXO policies and tree outputs.

use bitcoin::ScriptBuf;
use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::XOnlyPublicKey;

use crate::{BlockDelta, BlockHeight};

/// `<pk> OP_CHECKSIG`
pub fn sign(pk: XOnlyPublicKey) -> ScriptBuf {
	Builder::new()
		.push_x_only_key(&pk)
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.into_script()
}

/// `<pk1> OP_CHECKSIGVERIFY <pk2> OP_CHECKSIG`
pub fn multisig(pk1: XOnlyPublicKey, pk2: XOnlyPublicKey) -> ScriptBuf {
	Builder::new()
		.push_x_only_key(&pk1)
		.push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
		.push_x_only_key(&pk2)
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.into_script()
}

/// `<height> OP_CLTV OP_DROP <pk1> OP_CHECKSIGVERIFY <pk2> OP_CHECKSIG`
pub fn timelock_multisig(
	height: BlockHeight,
	pk1: XOnlyPublicKey,
	pk2: XOnlyPublicKey,
) -> ScriptBuf {
	Builder::new()
		.push_int(height as i64)
		.push_opcode(opcodes::all::OP_CLTV)
		.push_opcode(opcodes::all::OP_DROP)
		.push_x_only_key(&pk1)
		.push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
		.push_x_only_key(&pk2)
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.into_script()
}

/// `<delta> OP_CSV OP_DROP <pk> OP_CHECKSIG`
pub fn delay_sign(delta: BlockDelta, pk: XOnlyPublicKey) -> ScriptBuf {
	Builder::new()
		.push_int(delta as i64)
		.push_opcode(opcodes::all::OP_CSV)
		.push_opcode(opcodes::all::OP_DROP)
		.push_x_only_key(&pk)
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.into_script()
}

/// `OP_SHA256 <hash> OP_EQUALVERIFY <pk1> OP_CHECKSIGVERIFY <pk2> OP_CHECKSIG`
pub fn hash_multisig(
	hash: sha256::Hash,
	pk1: XOnlyPublicKey,
	pk2: XOnlyPublicKey,
) -> ScriptBuf {
	Builder::new()
		.push_opcode(opcodes::all::OP_SHA256)
		.push_slice(hash.to_byte_array())
		.push_opcode(opcodes::all::OP_EQUALVERIFY)
		.push_x_only_key(&pk1)
		.push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
		.push_x_only_key(&pk2)
		.push_opcode(opcodes::all::OP_CHECKSIG)
		.into_script()
}
