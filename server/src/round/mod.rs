
//! The round state machine.
//!
//! One coordinator task drives a round through its phases:
//!
//! ```text
//! Idle -> Registration -> TreeSigning -> ForfeitCollection
//!      -> Finalization -> (Done | Failed)
//! ```
//!
//! Client submissions arrive through a typed channel; every intake
//! phase selects over `(submission, deadline)`. A deadline miss or a
//! misbehaving signer fails the round: the guilty requests are ejected
//! and the innocent ones return to the queue with their place in line
//! preserved. At most one round is past `Idle` at any time.

pub mod forfeits;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bitcoin::{Amount, OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use bitcoin::secp256k1::{rand, Keypair, PublicKey};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};

use ark::{musig, Expiry, RoundEvent, RoundId, Vtxo, VtxoId, P2TR_DUST, SECP};
use ark::connectors::ConnectorTree;
use ark::musig::{AggNonce, PartialSignature, PubNonce, SecNonce};
use ark::rounds::{RoundSeq, ROUND_TX_CONNECTOR_VOUT, ROUND_TX_VTXO_TREE_VOUT};
use ark::tree::signed::{UnsignedVtxoTree, VtxoTreeSpec};

use crate::config::{Config, SweepUnit};
use crate::database::{Store, StoredRound};
use crate::error::badarg;
use crate::events::EventBus;
use crate::flux::VtxosInFlux;
use crate::ledger::Ledger;
use crate::queue::{RequestId, RequestQueue, TimedTxRequest};
use crate::round::forfeits::ForfeitCollector;
use crate::system::RuntimeManager;
use crate::wallet::{self, Wallet};

/// Everything the round coordinator needs to drive rounds.
pub struct RoundContext {
	pub config: Config,
	pub server_key: Keypair,
	pub ledger: Arc<Ledger>,
	pub queue: Arc<RequestQueue>,
	pub store: Arc<dyn Store>,
	pub wallet: Arc<dyn Wallet>,
	pub events: Arc<EventBus>,
	pub flux: Arc<VtxosInFlux>,
}

/// A client submission for the round in progress.
#[derive(Debug)]
pub enum RoundInput {
	Nonces {
		cosign_pubkey: PublicKey,
		nonces: Vec<Option<PubNonce>>,
	},
	Signatures {
		cosign_pubkey: PublicKey,
		signatures: Vec<Option<PartialSignature>>,
	},
	Forfeits {
		txs: Vec<Transaction>,
	},
}

type InputRx = mpsc::UnboundedReceiver<(RoundInput, oneshot::Sender<anyhow::Error>)>;
pub type InputTx = mpsc::UnboundedSender<(RoundInput, oneshot::Sender<anyhow::Error>)>;

#[derive(Debug)]
enum RoundError {
	/// An error occurred, but we can just start a new round.
	Recoverable(anyhow::Error),
	/// A fatal error occurred that we can't recover from.
	Fatal(anyhow::Error),
}

#[derive(Debug)]
enum RoundResult {
	/// Nothing to do, skipping round.
	Empty,
	/// Round finished with success.
	Success,
	/// The round was aborted, guilty parties ejected.
	Aborted,
	/// Error.
	Err(RoundError),
}

/// The registration phase: the popped batch, validated.
struct CollectingRequests {
	round_seq: RoundSeq,
	batch: Vec<TimedTxRequest>,
	all_inputs: HashMap<VtxoId, Vtxo>,
	recovered: Vec<VtxoId>,
	/// Maps every cosign pubkey to the request that registered it.
	request_per_cosigner: HashMap<PublicKey, RequestId>,
}

impl CollectingRequests {
	/// Pop the batch from the queue and validate each request against
	/// the ledger. Invalid requests are dropped, requests that don't
	/// fit this round are requeued.
	async fn collect(ctx: &RoundContext, round_seq: RoundSeq) -> anyhow::Result<Option<CollectingRequests>> {
		let popped = ctx.queue.pop(-1);
		if popped.is_empty() {
			return Ok(None);
		}

		let mut state = CollectingRequests {
			round_seq,
			batch: Vec::with_capacity(popped.len()),
			all_inputs: HashMap::new(),
			recovered: Vec::new(),
			request_per_cosigner: HashMap::new(),
		};
		let mut nb_outputs = 0;
		for timed in popped {
			if nb_outputs + timed.req.receivers.len() > ctx.config.max_output_vtxos {
				debug!("round {}: request {} doesn't fit, requeueing", round_seq, timed.req.id);
				ctx.queue.requeue(vec![timed]);
				continue;
			}
			match state.validate_request(ctx, &timed).await {
				Ok(()) => {
					nb_outputs += timed.req.receivers.len();
					state.batch.push(timed);
				},
				Err(e) => {
					warn!("round {}: dropping request {}: {:#}", round_seq, timed.req.id, e);
					// release anything this request may have claimed
					let ids = timed.req.input_vtxos.iter().map(|v| v.id())
						.chain(timed.req.recovered_vtxos.iter().map(|v| v.id()))
						.collect::<Vec<_>>();
					ctx.flux.release(&ids);
					for vtxo in &timed.req.input_vtxos {
						state.all_inputs.remove(&vtxo.id());
					}
					for vtxo in &timed.req.recovered_vtxos {
						state.recovered.retain(|id| *id != vtxo.id());
					}
					for recv in &timed.req.receivers {
						// a duplicate cosign key belongs to another
						// request, leave that one registered
						if state.request_per_cosigner.get(&recv.cosign_pubkey)
							== Some(&timed.req.id)
						{
							state.request_per_cosigner.remove(&recv.cosign_pubkey);
						}
					}
				},
			}
		}

		if state.batch.is_empty() {
			return Ok(None);
		}
		Ok(Some(state))
	}

	async fn validate_request(
		&mut self,
		ctx: &RoundContext,
		timed: &TimedTxRequest,
	) -> anyhow::Result<()> {
		let req = &timed.req;
		for recv in &req.receivers {
			if recv.vtxo.amount < P2TR_DUST {
				return badarg!("receiver amount below dust");
			}
			if let Some(max) = ctx.config.max_vtxo_amount {
				if recv.vtxo.amount > max {
					return badarg!("receiver exceeds maximum vtxo amount {}", max);
				}
			}
			if self.request_per_cosigner
				.insert(recv.cosign_pubkey, req.id.clone())
				.is_some()
			{
				return badarg!("duplicate cosign pubkey {}", recv.cosign_pubkey);
			}
		}

		let input_ids = req.input_vtxos.iter().map(|v| v.id())
			.chain(req.recovered_vtxos.iter().map(|v| v.id()))
			.collect::<Vec<_>>();
		if let Err(id) = ctx.flux.claim(&input_ids) {
			return badarg!("vtxo {} is already being processed", id);
		}

		for vtxo in &req.input_vtxos {
			let stored = ctx.ledger.get(vtxo.id()).await?
				.context("input vtxo does not exist")?;
			if !stored.is_spendable() {
				return badarg!("input vtxo {} is not spendable", vtxo.id());
			}
			self.all_inputs.insert(vtxo.id(), stored.vtxo);
		}
		for vtxo in &req.recovered_vtxos {
			let stored = ctx.ledger.get(vtxo.id()).await?
				.context("recovered vtxo does not exist")?;
			if !stored.flags.swept || stored.flags.spent || stored.flags.unrolled {
				return badarg!("vtxo {} is not recoverable", vtxo.id());
			}
			self.recovered.push(vtxo.id());
		}
		for note in &req.notes {
			match ctx.ledger.note_amount(note.id()).await? {
				Some(amount) if amount == note.amount => {},
				Some(_) => return badarg!("note {} amount mismatch", note.id()),
				None => return badarg!("note {} unknown or spent", note.id()),
			}
		}
		Ok(())
	}

	fn input_ids(&self) -> Vec<VtxoId> {
		self.all_inputs.keys().copied()
			.chain(self.recovered.iter().copied())
			.collect()
	}

	/// Build the trees and the round tx, then open nonce intake.
	///
	/// On failure the batch and any wallet coins locked so far are
	/// handed back so the caller can requeue and release them.
	async fn progress(
		self,
		ctx: &RoundContext,
	) -> Result<SigningVtxoTree, (RoundError, Vec<TimedTxRequest>, Vec<OutPoint>)> {
		let tip = match wallet::with_retry(ctx.config.broadcast_window, || {
			let wallet = ctx.wallet.clone();
			async move { wallet.synced_height().await }
		}).await {
			Ok(tip) => tip,
			Err(e) => return Err((RoundError::Recoverable(e), self.batch, Vec::new())),
		};

		let expiry = match ctx.config.sweep_unit {
			SweepUnit::Blockheight => Expiry::Height(tip + ctx.config.vtxo_expiry as u64),
			SweepUnit::Timestamp => {
				let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
				// vtxo_expiry is denominated in blocks, schedule by
				// target block interval
				Expiry::Timestamp(now + ctx.config.vtxo_expiry as u64 * 600)
			},
		};

		// Generate one-time use keys for this round.
		let server_cosign_key = Keypair::new(&SECP, &mut rand::thread_rng());
		let connector_key = Keypair::new(&SECP, &mut rand::thread_rng());

		let outputs = self.batch.iter()
			.flat_map(|t| t.req.receivers.iter().cloned())
			.collect::<Vec<_>>();
		let vtxos_spec = VtxoTreeSpec::new(
			outputs,
			ctx.server_key.public_key(),
			server_cosign_key.public_key(),
			expiry,
			ctx.config.vtxo_expiry.try_into().unwrap_or(u16::MAX),
			ctx.config.unroll_delay,
			ctx.config.min_relay_fee,
		);

		let nb_connectors = self.all_inputs.len() + self.recovered.len();
		let shared_output = vtxos_spec.funding_txout();
		let connector_output = ConnectorTree::output(
			nb_connectors.max(1),
			connector_key.public_key(),
			ctx.config.min_relay_fee,
		);

		// Fund the round tx: boarding inputs bring user funds, the
		// wallet fronts the rest.
		let boarding = self.batch.iter()
			.flat_map(|t| t.req.boarding_inputs.iter().cloned())
			.collect::<Vec<_>>();
		let boarding_sum = boarding.iter().map(|b| b.amount).sum::<Amount>();
		let needed = shared_output.value + connector_output.value + ctx.config.min_relay_fee;
		let wallet_target = needed.checked_sub(boarding_sum).unwrap_or(P2TR_DUST);

		let utxos = match wallet::with_retry(ctx.config.broadcast_window, || {
			let wallet = ctx.wallet.clone();
			async move { wallet.select_utxos(wallet_target).await }
		}).await {
			Ok(utxos) => utxos,
			Err(e) => return Err((RoundError::Recoverable(e), self.batch, Vec::new())),
		};
		// the wallet locked these for us; every path that doesn't spend
		// them must release them again
		let wallet_utxos = utxos.iter().map(|u| u.point).collect::<Vec<_>>();

		let change_address = match ctx.wallet.derive_address().await {
			Ok(addr) => addr,
			Err(e) => return Err((RoundError::Recoverable(e), self.batch, wallet_utxos)),
		};
		let total_in = utxos.iter().map(|u| u.amount).sum::<Amount>() + boarding_sum;
		let mut output = vec![shared_output, connector_output];
		if let Some(change) = total_in.checked_sub(needed) {
			if change >= P2TR_DUST {
				output.push(TxOut {
					value: change,
					script_pubkey: change_address.script_pubkey(),
				});
			}
		}
		let unsigned_round_tx = Transaction {
			version: bitcoin::transaction::Version::TWO,
			lock_time: bitcoin::absolute::LockTime::ZERO,
			input: utxos.iter().map(|u| u.point)
				.chain(boarding.iter().map(|b| b.point))
				.map(|point| TxIn {
					previous_output: point,
					sequence: Sequence::ZERO,
					script_sig: ScriptBuf::new(),
					witness: Witness::new(),
				})
				.collect(),
			output,
		};
		let round_txid = unsigned_round_tx.compute_txid();
		let round_psbt = match Psbt::from_unsigned_tx(unsigned_round_tx.clone()) {
			Ok(psbt) => psbt,
			Err(e) => return Err((
				RoundError::Recoverable(anyhow::Error::from(e).context("psbt from round tx")),
				self.batch,
				wallet_utxos,
			)),
		};

		// Generate the server's cosign nonces.
		let nb_nodes = vtxos_spec.nb_nodes();
		let (server_sec_nonces, server_pub_nonces): (Vec<_>, Vec<_>) =
			(0..nb_nodes).map(|_| musig::nonce_pair(&server_cosign_key)).unzip();

		ctx.events.publish(RoundEvent::TreeNonceRequested {
			round_seq: self.round_seq,
			unsigned_round_tx: unsigned_round_tx.clone(),
			vtxos_spec: vtxos_spec.clone(),
		});

		let vtxos_utxo = OutPoint::new(round_txid, ROUND_TX_VTXO_TREE_VOUT);
		let conns_utxo = OutPoint::new(round_txid, ROUND_TX_CONNECTOR_VOUT);
		info!("round {}: trees constructed, round txid {}", self.round_seq, round_txid);

		Ok(SigningVtxoTree {
			round_seq: self.round_seq,
			batch: self.batch,
			all_inputs: self.all_inputs,
			recovered: self.recovered,
			request_per_cosigner: self.request_per_cosigner,
			wallet_utxos,
			server_cosign_key,
			connector_key,
			conns_utxo,
			unsigned_tree: vtxos_spec.into_unsigned_tree(vtxos_utxo),
			round_psbt,
			server_sec_nonces: Some(server_sec_nonces),
			server_pub_nonces,
			pub_nonces: HashMap::new(),
			part_sigs: HashMap::new(),
			agg_nonces: None,
			proceed: false,
		})
	}
}

/// The tree signing phase, covering nonce and partial-sig intake.
struct SigningVtxoTree {
	round_seq: RoundSeq,
	batch: Vec<TimedTxRequest>,
	all_inputs: HashMap<VtxoId, Vtxo>,
	recovered: Vec<VtxoId>,
	request_per_cosigner: HashMap<PublicKey, RequestId>,
	/// Round tx inputs locked in the wallet, released on abort.
	wallet_utxos: Vec<OutPoint>,

	server_cosign_key: Keypair,
	connector_key: Keypair,
	conns_utxo: OutPoint,
	unsigned_tree: UnsignedVtxoTree,
	round_psbt: Psbt,

	server_sec_nonces: Option<Vec<SecNonce>>,
	server_pub_nonces: Vec<PubNonce>,
	pub_nonces: HashMap<PublicKey, Vec<Option<PubNonce>>>,
	part_sigs: HashMap<PublicKey, Vec<Option<PartialSignature>>>,
	agg_nonces: Option<Vec<AggNonce>>,

	proceed: bool,
}

impl SigningVtxoTree {
	fn nb_cosigners(&self) -> usize {
		self.unsigned_tree.spec.vtxos.len()
	}

	fn leaf_idx(&self, cosign_pubkey: PublicKey) -> anyhow::Result<usize> {
		match self.unsigned_tree.spec.leaf_idx_of(cosign_pubkey) {
			Some(idx) => Ok(idx),
			None => badarg!("pubkey {} is not part of the cosigner group", cosign_pubkey),
		}
	}

	fn register_nonces(
		&mut self,
		cosign_pubkey: PublicKey,
		nonces: Vec<Option<PubNonce>>,
	) -> anyhow::Result<()> {
		if self.agg_nonces.is_some() {
			return badarg!("nonce intake is closed");
		}
		if self.pub_nonces.contains_key(&cosign_pubkey) {
			return badarg!("nonces already submitted for pubkey {}", cosign_pubkey);
		}
		let leaf_idx = self.leaf_idx(cosign_pubkey)?;
		self.unsigned_tree.validate_nonce_matrix(leaf_idx, &nonces)
			.map_err(|e| crate::error::BadArgument::new(e))?;
		self.pub_nonces.insert(cosign_pubkey, nonces);

		if self.pub_nonces.len() == self.nb_cosigners() {
			self.proceed = true;
		}
		Ok(())
	}

	/// Close nonce intake: aggregate and ask for partial signatures.
	fn aggregate_nonces(&mut self, ctx: &RoundContext) -> anyhow::Result<()> {
		let agg = self.unsigned_tree
			.calculate_cosign_agg_nonces(&self.pub_nonces, &self.server_pub_nonces)
			.map_err(|e| anyhow!("nonce aggregation failed: {}", e))?;
		ctx.events.publish(RoundEvent::TreeSigRequested {
			round_seq: self.round_seq,
			cosign_agg_nonces: agg.clone(),
		});
		self.agg_nonces = Some(agg);
		self.proceed = false;
		Ok(())
	}

	/// Register a cosigner's partial signatures.
	///
	/// An invalid signature is misbehavior and aborts the round; the
	/// offending request id is returned in the error.
	fn register_signatures(
		&mut self,
		cosign_pubkey: PublicKey,
		signatures: Vec<Option<PartialSignature>>,
	) -> Result<(), SignerMisbehavior> {
		let agg_nonces = match self.agg_nonces {
			Some(ref n) => n,
			None => return Err(SignerMisbehavior::Invalid(
				anyhow!("signature intake is not open"),
			)),
		};
		if self.part_sigs.contains_key(&cosign_pubkey) {
			return Err(SignerMisbehavior::Invalid(
				anyhow!("signatures already submitted for pubkey {}", cosign_pubkey),
			));
		}
		let leaf_idx = match self.unsigned_tree.spec.leaf_idx_of(cosign_pubkey) {
			Some(idx) => idx,
			None => return Err(SignerMisbehavior::Invalid(
				anyhow!("pubkey {} is not part of the cosigner group", cosign_pubkey),
			)),
		};

		let nonces = self.pub_nonces.get(&cosign_pubkey)
			.expect("cosigner submitted nonces before sig intake opened");
		if let Err(e) = self.unsigned_tree.verify_leaf_partial_sigs(
			agg_nonces, leaf_idx, nonces, &signatures,
		) {
			// a single bad signer aborts the round
			let request = self.request_per_cosigner.get(&cosign_pubkey)
				.expect("cosigner is registered").clone();
			return Err(SignerMisbehavior::BadSignature {
				request,
				error: anyhow!("invalid partial signatures: {}", e),
			});
		}

		self.part_sigs.insert(cosign_pubkey, signatures);
		if self.part_sigs.len() == self.nb_cosigners() {
			self.proceed = true;
		}
		Ok(())
	}

	/// Combine all signatures into the signed tree and open forfeit
	/// collection.
	///
	/// On failure the batch and the locked wallet coins are handed back
	/// so the caller can requeue and release them.
	fn progress(
		mut self,
		ctx: &RoundContext,
	) -> Result<SigningForfeits, (RoundError, Vec<TimedTxRequest>, Vec<OutPoint>)> {
		let agg_nonces = self.agg_nonces.take().expect("nonces aggregated");
		let sec_nonces = self.server_sec_nonces.take().expect("server nonces unused");
		let server_sigs = self.unsigned_tree.cosign_tree(
			&agg_nonces, &self.server_cosign_key, sec_nonces,
		);
		let cosign_sigs = match self.unsigned_tree.combine_partial_signatures(
			&agg_nonces, &self.part_sigs, &server_sigs,
		) {
			Ok(sigs) => sigs,
			Err(e) => return Err((
				RoundError::Recoverable(anyhow!("failed to combine partial signatures: {}", e)),
				self.batch,
				self.wallet_utxos,
			)),
		};
		if let Err(pk) = self.unsigned_tree.verify_cosign_sigs(&cosign_sigs) {
			return Err((
				RoundError::Recoverable(anyhow!("aggregated tree doesn't verify for key {}", pk)),
				self.batch,
				self.wallet_utxos,
			));
		}

		let signed_tree = self.unsigned_tree.into_signed_tree(cosign_sigs.clone());

		let nb_connectors = self.all_inputs.len() + self.recovered.len();
		let connectors = ConnectorTree::new(
			nb_connectors.max(1),
			self.conns_utxo,
			self.connector_key.public_key(),
			ctx.config.min_relay_fee,
		);
		let connector_txs = connectors.txs();
		let forfeit_inputs = self.all_inputs.values().cloned().collect::<Vec<_>>();
		let collector = match ForfeitCollector::new(
			forfeit_inputs, &connectors, &connector_txs, ctx.config.min_relay_fee,
		) {
			Ok(collector) => collector,
			Err(e) => return Err((RoundError::Recoverable(e), self.batch, self.wallet_utxos)),
		};

		ctx.events.publish(RoundEvent::ForfeitsRequested {
			round_seq: self.round_seq,
			cosign_sigs,
			connectors: connectors.clone(),
		});
		info!("round {}: vtxo tree signed, collecting forfeits", self.round_seq);

		Ok(SigningForfeits {
			round_seq: self.round_seq,
			batch: self.batch,
			all_inputs: self.all_inputs,
			recovered: self.recovered,
			wallet_utxos: self.wallet_utxos,
			connector_key: self.connector_key,
			connectors,
			collector,
			signed_tree,
			round_psbt: self.round_psbt,
			proceed: false,
		})
	}
}

/// A cosigner broke the protocol; its request gets ejected.
#[derive(Debug)]
enum SignerMisbehavior {
	/// Bad submission, reported back to the caller without aborting.
	Invalid(anyhow::Error),
	/// Provably wrong signature, aborts the round.
	BadSignature {
		request: RequestId,
		error: anyhow::Error,
	},
}

/// The forfeit collection phase.
struct SigningForfeits {
	round_seq: RoundSeq,
	batch: Vec<TimedTxRequest>,
	all_inputs: HashMap<VtxoId, Vtxo>,
	recovered: Vec<VtxoId>,
	/// Round tx inputs locked in the wallet, released on abort.
	wallet_utxos: Vec<OutPoint>,

	connector_key: Keypair,
	connectors: ConnectorTree,
	collector: ForfeitCollector,
	signed_tree: ark::tree::signed::SignedVtxoTree,
	round_psbt: Psbt,

	proceed: bool,
}

impl SigningForfeits {
	fn register_forfeits(&mut self, txs: &[Transaction]) -> anyhow::Result<()> {
		self.collector.sign(txs)?;
		if self.collector.all_signed() {
			self.proceed = true;
		}
		Ok(())
	}

	/// Finalize: sign and broadcast the round tx, commit the ledger
	/// effects, persist the round and announce it.
	///
	/// Failures before the broadcast hand the batch and the locked
	/// wallet coins back for requeueing and release; failures after it
	/// are fatal, the round is on the chain.
	async fn finish(
		mut self,
		ctx: &RoundContext,
	) -> Result<(), (RoundError, Option<Vec<TimedTxRequest>>, Vec<OutPoint>)> {
		let forfeit_txs = match self.collector.pop() {
			Ok(txs) => txs,
			Err(e) => return Err((
				RoundError::Recoverable(e.into()),
				Some(self.batch),
				self.wallet_utxos,
			)),
		};

		let signed_round_tx = match wallet::with_retry(ctx.config.broadcast_window, || {
			let wallet = ctx.wallet.clone();
			let psbt = self.round_psbt.clone();
			async move {
				let signed = wallet.sign_taproot(psbt).await?;
				wallet.finalize(signed).await
			}
		}).await {
			Ok(tx) => tx,
			Err(e) => return Err((
				RoundError::Recoverable(e.context("round tx signing error")),
				Some(self.batch),
				self.wallet_utxos,
			)),
		};

		let round_txid = match wallet::with_retry(ctx.config.broadcast_window, || {
			let wallet = ctx.wallet.clone();
			let tx = signed_round_tx.clone();
			async move { wallet.broadcast(&tx).await }
		}).await {
			Ok(txid) => txid,
			Err(e) => return Err((
				RoundError::Recoverable(e.context("failed to broadcast round")),
				Some(self.batch),
				self.wallet_utxos,
			)),
		};
		let round_id = RoundId::new(round_txid);

		// From here on the round is on the chain; all failures are fatal.

		// Notes were validated at registration; consume them now that
		// the round is committed.
		for timed in &self.batch {
			for note in &timed.req.notes {
				if let Err(e) = ctx.ledger.spend_note(note.id()).await {
					error!("round {}: failed to consume note {}: {:#}",
						self.round_seq, note.id(), e);
				}
			}
		}

		let spend = self.all_inputs.keys().copied().collect::<Vec<_>>();
		let minted = self.signed_tree.all_vtxos().collect::<Vec<_>>();
		if let Err(e) = ctx.ledger.commit_round(&spend, &self.recovered, minted).await {
			return Err((RoundError::Fatal(e), None, Vec::new()));
		}

		let forfeit_txs = forfeit_txs.into_iter().collect::<HashMap<_, _>>();
		let stored = StoredRound {
			id: round_id,
			funding_tx: signed_round_tx.clone(),
			signed_tree: self.signed_tree.clone(),
			connectors: self.connectors.clone(),
			connector_key: self.connector_key.secret_key(),
			forfeit_txs,
			swept: false,
		};
		if let Err(e) = ctx.store.store_round(stored).await {
			return Err((RoundError::Fatal(e), None, Vec::new()));
		}

		let input_ids = spend.iter().copied().chain(self.recovered.iter().copied())
			.collect::<Vec<_>>();
		ctx.flux.release(&input_ids);

		ctx.events.publish(RoundEvent::Finalized {
			round_seq: self.round_seq,
			round_id,
			signed_round_tx,
		});
		info!("round {}: finished as {}", self.round_seq, round_id);
		Ok(())
	}
}

/// Tear a round down after a failure: requeue the innocent requests,
/// drop the guilty ones and release all claimed inputs, including any
/// wallet coins locked for the round tx.
async fn abort_round(
	ctx: &RoundContext,
	round_seq: RoundSeq,
	batch: Vec<TimedTxRequest>,
	guilty: &HashSet<RequestId>,
	wallet_utxos: Vec<OutPoint>,
	reason: &str,
) {
	let mut requeue = Vec::new();
	for timed in batch {
		let ids = timed.req.input_vtxos.iter().map(|v| v.id())
			.chain(timed.req.recovered_vtxos.iter().map(|v| v.id()))
			.collect::<Vec<_>>();
		ctx.flux.release(&ids);
		if guilty.contains(&timed.req.id) {
			warn!("round {}: ejecting request {}", round_seq, timed.req.id);
		} else {
			requeue.push(timed);
		}
	}
	ctx.queue.requeue(requeue);
	if !wallet_utxos.is_empty() {
		if let Err(e) = ctx.wallet.release_utxos(&wallet_utxos).await {
			warn!("round {}: failed to release wallet utxos: {:#}", round_seq, e);
		}
	}
	ctx.events.publish(RoundEvent::Failed {
		round_seq,
		reason: reason.to_string(),
	});
}

async fn perform_round(
	ctx: &RoundContext,
	input_rx: &mut InputRx,
	round_seq: RoundSeq,
) -> RoundResult {
	info!("Starting round {}", round_seq);
	ctx.events.publish(RoundEvent::Started { round_seq });

	// Registration: give clients until the deadline to push, update and
	// ping their requests through the regular queue surface.
	tokio::pin! { let deadline = tokio::time::sleep(ctx.config.registration_window); }
	loop {
		tokio::select! {
			() = &mut deadline => break,
			input = input_rx.recv() => {
				let (_, tx) = input.expect("round input channel closed");
				let r: anyhow::Result<()> = badarg!("no round is in its signing phase");
				let _ = tx.send(r.unwrap_err());
			},
		}
	}

	// Pop and validate the batch; the cosigner set is now fixed.
	let state = match CollectingRequests::collect(ctx, round_seq).await {
		Ok(Some(state)) => state,
		Ok(None) => {
			debug!("round {}: no requests, skipping", round_seq);
			ctx.events.clear_last();
			return RoundResult::Empty;
		},
		Err(e) => {
			ctx.events.clear_last();
			return RoundResult::Err(RoundError::Recoverable(e));
		},
	};
	let input_ids = state.input_ids();
	info!("round {}: batch of {} requests, {} inputs",
		round_seq, state.batch.len(), input_ids.len());

	let mut state = match state.progress(ctx).await {
		Ok(state) => state,
		Err((e, batch, wallet_utxos)) => {
			abort_round(ctx, round_seq, batch, &HashSet::new(), wallet_utxos,
				"failed to construct round").await;
			return RoundResult::Err(e);
		},
	};

	// Nonce intake.
	tokio::pin! { let deadline = tokio::time::sleep(ctx.config.signing_window); }
	'intake: loop {
		tokio::select! {
			() = &mut deadline => {
				let missing = state.request_per_cosigner.iter()
					.filter(|(pk, _)| !state.pub_nonces.contains_key(pk))
					.map(|(_, id)| id.clone())
					.collect::<HashSet<_>>();
				warn!("round {}: timed out waiting for nonces", round_seq);
				abort_round(ctx, round_seq, state.batch, &missing, state.wallet_utxos,
					"nonce intake timed out").await;
				return RoundResult::Aborted;
			},
			input = input_rx.recv() => {
				let (input, tx) = input.expect("round input channel closed");
				let res = match input {
					RoundInput::Nonces { cosign_pubkey, nonces } => {
						state.register_nonces(cosign_pubkey, nonces)
					},
					_ => badarg!("unexpected message, current phase is nonce intake"),
				};
				if let Err(e) = res {
					let _ = tx.send(e);
					continue 'intake;
				}
				if state.proceed {
					break 'intake;
				}
			},
		}
	}

	if let Err(e) = state.aggregate_nonces(ctx) {
		abort_round(ctx, round_seq, state.batch, &HashSet::new(), state.wallet_utxos,
			"nonce aggregation failed").await;
		return RoundResult::Err(RoundError::Recoverable(e));
	}

	// Partial signature intake.
	tokio::pin! { let deadline = tokio::time::sleep(ctx.config.signing_window); }
	'intake: loop {
		tokio::select! {
			() = &mut deadline => {
				let missing = state.request_per_cosigner.iter()
					.filter(|(pk, _)| !state.part_sigs.contains_key(pk))
					.map(|(_, id)| id.clone())
					.collect::<HashSet<_>>();
				warn!("round {}: timed out waiting for tree signatures", round_seq);
				abort_round(ctx, round_seq, state.batch, &missing, state.wallet_utxos,
					"signature intake timed out").await;
				return RoundResult::Aborted;
			},
			input = input_rx.recv() => {
				let (input, tx) = input.expect("round input channel closed");
				match input {
					RoundInput::Signatures { cosign_pubkey, signatures } => {
						match state.register_signatures(cosign_pubkey, signatures) {
							Ok(()) => {},
							Err(SignerMisbehavior::Invalid(e)) => {
								let _ = tx.send(e);
								continue 'intake;
							},
							Err(SignerMisbehavior::BadSignature { request, error }) => {
								warn!("round {}: misbehaving signer on request {}: {:#}",
									round_seq, request, error);
								let _ = tx.send(error);
								let guilty = HashSet::from([request]);
								abort_round(ctx, round_seq, state.batch, &guilty,
									state.wallet_utxos, "signer misbehavior").await;
								return RoundResult::Aborted;
							},
						}
					},
					_ => {
						let r: anyhow::Result<()> =
							badarg!("unexpected message, current phase is signature intake");
						let _ = tx.send(r.unwrap_err());
						continue 'intake;
					},
				}
				if state.proceed {
					break 'intake;
				}
			},
		}
	}

	let mut state = match state.progress(ctx) {
		Ok(state) => state,
		Err((e, batch, wallet_utxos)) => {
			abort_round(ctx, round_seq, batch, &HashSet::new(), wallet_utxos,
				"tree combination failed").await;
			return RoundResult::Err(e);
		},
	};

	// Forfeit collection.
	tokio::pin! { let deadline = tokio::time::sleep(ctx.config.forfeit_window); }
	'intake: loop {
		if state.proceed || state.collector.all_signed() {
			break 'intake;
		}
		tokio::select! {
			() = &mut deadline => {
				let missing_vtxos = state.collector.missing();
				let guilty = state.batch.iter()
					.filter(|t| t.req.input_vtxos.iter().any(|v| missing_vtxos.contains(&v.id())))
					.map(|t| t.req.id.clone())
					.collect::<HashSet<_>>();
				warn!("round {}: timed out waiting for forfeits", round_seq);
				abort_round(ctx, round_seq, state.batch, &guilty, state.wallet_utxos,
					"forfeit intake timed out").await;
				return RoundResult::Aborted;
			},
			input = input_rx.recv() => {
				let (input, tx) = input.expect("round input channel closed");
				let res = match input {
					RoundInput::Forfeits { txs } => state.register_forfeits(&txs),
					_ => badarg!("unexpected message, current phase is forfeit collection"),
				};
				if let Err(e) = res {
					let _ = tx.send(e);
				}
			},
		}
	}

	match state.finish(ctx).await {
		Ok(()) => RoundResult::Success,
		Err((e, batch, wallet_utxos)) => {
			match batch {
				Some(batch) => {
					abort_round(ctx, round_seq, batch, &HashSet::new(), wallet_utxos,
						"round finalization failed").await;
				},
				None => {
					// the round tx is on the chain but local effects
					// failed; release the inputs and halt
					ctx.flux.release(&input_ids);
					ctx.events.publish(RoundEvent::Failed {
						round_seq,
						reason: "round finalization failed".into(),
					});
				},
			}
			RoundResult::Err(e)
		},
	}
}

/// The round coordinator main loop, run as a critical task.
pub async fn run_round_coordinator(
	ctx: Arc<RoundContext>,
	mut input_rx: InputRx,
	rtmgr: RuntimeManager,
) -> anyhow::Result<()> {
	let _worker = rtmgr.spawn_critical("RoundCoordinator");

	let mut round_seq = {
		let epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
		RoundSeq::new(epoch)
	};

	loop {
		round_seq.increment();
		match perform_round(&ctx, &mut input_rx, round_seq).await {
			RoundResult::Success => {},
			RoundResult::Empty => {},
			RoundResult::Aborted => {},
			RoundResult::Err(RoundError::Recoverable(e)) => {
				error!("Round {} error: {:#}", round_seq, e);
			},
			RoundResult::Err(RoundError::Fatal(e)) => {
				error!("Fatal round error: {:#}", e);
				return Err(e);
			},
		}

		// Sleep for the round interval, discarding stray submissions.
		tokio::pin! { let timeout = tokio::time::sleep(ctx.config.round_interval); }
		'sleep: loop {
			tokio::select! {
				() = &mut timeout => break 'sleep,
				input = input_rx.recv() => {
					let (_, tx) = input.expect("round input channel closed");
					let r: anyhow::Result<()> = badarg!("no round in progress");
					let _ = tx.send(r.unwrap_err());
				},
				_ = rtmgr.shutdown_signal() => {
					info!("Shutdown signal received, exiting round coordinator");
					return Ok(());
				},
			}
		}
	}
}
