
//! Thin wrappers around the MuSig2 implementation.
//!
//! The musig2 crate carries its own secp256k1 types, which differ from the
//! ones re-exported by the bitcoin crate, so we keep conversion helpers
//! here and expose an API in terms of bitcoin types only.

pub use musig2::{AggNonce, KeyAggContext, LiftedSignature, PartialSignature, PubNonce, SecNonce};
pub use musig2::secp256k1 as secpm;

use bitcoin::TapNodeHash;
use bitcoin::secp256k1::{schnorr, Keypair, PublicKey, XOnlyPublicKey};

pub fn pubkey_to(pk: PublicKey) -> secpm::PublicKey {
	secpm::PublicKey::from_slice(&pk.serialize()).unwrap()
}

pub fn pubkey_from(pk: secpm::PublicKey) -> PublicKey {
	PublicKey::from_slice(&pk.serialize()).unwrap()
}

pub fn seckey_to(key: &Keypair) -> secpm::SecretKey {
	secpm::SecretKey::from_slice(&key.secret_bytes()).unwrap()
}

pub fn sig_from(sig: LiftedSignature) -> schnorr::Signature {
	schnorr::Signature::from_slice(&sig.serialize()).unwrap()
}

/// Returns the key agg context for the given keys.
///
/// Key order is not important as keys are sorted before aggregation.
pub fn key_agg(keys: impl IntoIterator<Item = PublicKey>) -> KeyAggContext {
	let mut keys = keys.into_iter().map(|k| pubkey_to(k)).collect::<Vec<_>>();
	keys.sort_by_key(|k| k.serialize());
	KeyAggContext::new(keys).expect("key aggregation failed")
}

/// Returns the key agg context with the taproot tweak applied.
///
/// A tweak of [None] applies the BIP-341 tweak for a key without scripts.
pub fn tweaked_key_agg(
	keys: impl IntoIterator<Item = PublicKey>,
	merkle_root: Option<TapNodeHash>,
) -> KeyAggContext {
	let agg = key_agg(keys);
	match merkle_root {
		Some(root) => agg.with_taproot_tweak(root.as_ref())
			.expect("taproot tweak failed"),
		None => agg.with_unspendable_taproot_tweak()
			.expect("taproot tweak failed"),
	}
}

/// Aggregates the public keys into their untweaked aggregate public key.
///
/// Key order is not important as keys are sorted before aggregation.
pub fn combine_keys(keys: impl IntoIterator<Item = PublicKey>) -> XOnlyPublicKey {
	let agg: secpm::PublicKey = key_agg(keys).aggregated_pubkey();
	pubkey_from(agg).x_only_public_key().0
}

/// Generate a new secret/public nonce pair for the given signing key.
pub fn nonce_pair(key: &Keypair) -> (SecNonce, PubNonce) {
	let sec = SecNonce::build(rand::random::<[u8; 32]>())
		.with_seckey(seckey_to(key))
		.build();
	let public = sec.public_nonce();
	(sec, public)
}

/// Like [nonce_pair], but commits the nonce to the message being signed.
pub fn nonce_pair_with_msg(key: &Keypair, msg: &[u8; 32]) -> (SecNonce, PubNonce) {
	let sec = SecNonce::build(rand::random::<[u8; 32]>())
		.with_seckey(seckey_to(key))
		.with_message(msg)
		.build();
	let public = sec.public_nonce();
	(sec, public)
}

pub fn nonce_agg<'a>(pub_nonces: impl IntoIterator<Item = &'a PubNonce>) -> AggNonce {
	AggNonce::sum(pub_nonces)
}

/// Create a partial signature over the given sighash.
pub fn partial_sign(
	pubkeys: impl IntoIterator<Item = PublicKey>,
	merkle_root: Option<TapNodeHash>,
	key: &Keypair,
	sec_nonce: SecNonce,
	agg_nonce: &AggNonce,
	sighash: [u8; 32],
) -> PartialSignature {
	let agg = tweaked_key_agg(pubkeys, merkle_root);
	musig2::sign_partial(&agg, seckey_to(key), sec_nonce, agg_nonce, &sighash)
		.expect("partial signing failed")
}

/// Verify a single partial signature against its public nonce.
pub fn partial_verify(
	pubkeys: impl IntoIterator<Item = PublicKey>,
	merkle_root: Option<TapNodeHash>,
	agg_nonce: &AggNonce,
	sighash: [u8; 32],
	part_sig: PartialSignature,
	pub_nonce: &PubNonce,
	signer: PublicKey,
) -> bool {
	let agg = tweaked_key_agg(pubkeys, merkle_root);
	musig2::verify_partial(&agg, part_sig, agg_nonce, pubkey_to(signer), pub_nonce, &sighash)
		.is_ok()
}

/// Combine all partial signatures into the final schnorr signature.
///
/// Returns an error if the partial signatures don't add up to a
/// signature valid under the (tweaked) aggregate key.
pub fn combine_partial_signatures(
	pubkeys: impl IntoIterator<Item = PublicKey>,
	merkle_root: Option<TapNodeHash>,
	agg_nonce: &AggNonce,
	sighash: [u8; 32],
	sigs: impl IntoIterator<Item = PartialSignature>,
) -> Result<schnorr::Signature, musig2::errors::VerifyError> {
	let agg = tweaked_key_agg(pubkeys, merkle_root);
	let sig: LiftedSignature =
		musig2::aggregate_partial_signatures(&agg, agg_nonce, sigs, &sighash)?;
	Ok(sig_from(sig))
}

#[cfg(test)]
mod test {
	use super::*;
	use bitcoin::secp256k1::rand;
	use bitcoin::key::TapTweak;
	use bitcoin::taproot::TaprootBuilder;
	use crate::SECP;

	#[test]
	fn two_party_keyspend_roundtrip() {
		let user = Keypair::new(&SECP, &mut rand::thread_rng());
		let server = Keypair::new(&SECP, &mut rand::thread_rng());
		let keys = [user.public_key(), server.public_key()];
		let sighash = rand::random::<[u8; 32]>();

		let (user_sec, user_pub) = nonce_pair(&user);
		let (server_sec, server_pub) = nonce_pair(&server);
		let agg_nonce = nonce_agg([&user_pub, &server_pub]);

		let user_sig = partial_sign(keys, None, &user, user_sec, &agg_nonce, sighash);
		assert!(partial_verify(
			keys, None, &agg_nonce, sighash, user_sig, &user_pub, user.public_key(),
		));
		let server_sig = partial_sign(keys, None, &server, server_sec, &agg_nonce, sighash);

		let sig = combine_partial_signatures(
			keys, None, &agg_nonce, sighash, [user_sig, server_sig],
		).expect("valid partials");

		// the aggregate must verify as a plain schnorr sig under the
		// taproot output key for the combined internal key
		let internal = combine_keys(keys);
		let output_key = internal.tap_tweak(&SECP, None).0;
		let msg = bitcoin::secp256k1::Message::from_digest(sighash);
		SECP.verify_schnorr(&sig, &msg, &output_key.to_x_only_public_key()).unwrap();
	}

	#[test]
	fn tweaked_aggregate_matches_taproot_builder() {
		let a = Keypair::new(&SECP, &mut rand::thread_rng());
		let b = Keypair::new(&SECP, &mut rand::thread_rng());
		let keys = [a.public_key(), b.public_key()];

		let leaf = crate::scripts::delay_sign(144, a.public_key().x_only_public_key().0);
		let taproot = TaprootBuilder::new()
			.add_leaf(0, leaf).unwrap()
			.finalize(&SECP, combine_keys(keys)).unwrap();

		let sighash = rand::random::<[u8; 32]>();
		let (sec_a, pub_a) = nonce_pair(&a);
		let (sec_b, pub_b) = nonce_pair(&b);
		let agg_nonce = nonce_agg([&pub_a, &pub_b]);
		let root = taproot.merkle_root();
		let sig_a = partial_sign(keys, root, &a, sec_a, &agg_nonce, sighash);
		let sig_b = partial_sign(keys, root, &b, sec_b, &agg_nonce, sighash);
		let sig = combine_partial_signatures(
			keys, root, &agg_nonce, sighash, [sig_a, sig_b],
		).unwrap();

		let msg = bitcoin::secp256k1::Message::from_digest(sighash);
		SECP.verify_schnorr(&sig, &msg, &taproot.output_key().to_x_only_public_key()).unwrap();
	}

	#[test]
	fn bad_partial_sig_rejected() {
		let a = Keypair::new(&SECP, &mut rand::thread_rng());
		let b = Keypair::new(&SECP, &mut rand::thread_rng());
		let keys = [a.public_key(), b.public_key()];
		let sighash = rand::random::<[u8; 32]>();

		let (sec_a, pub_a) = nonce_pair(&a);
		let (_sec_b, pub_b) = nonce_pair(&b);
		let agg_nonce = nonce_agg([&pub_a, &pub_b]);

		// signing a different message must not verify for the real one
		let other = rand::random::<[u8; 32]>();
		let sig_a = partial_sign(keys, None, &a, sec_a, &agg_nonce, other);
		assert!(!partial_verify(
			keys, None, &agg_nonce, sighash, sig_a, &pub_a, a.public_key(),
		));
	}
}
