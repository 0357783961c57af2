
//! The sweeper reclaims expired tree outputs and punishes fraud.
//!
//! It keeps a min-heap of `(expiry, node)` tasks. When a round
//! finalizes, its tree root is scheduled at the round's expiry. When a
//! task fires, the sweeper walks the frontier: a node whose tx was
//! published on-chain (an unroll) is descended into, its children
//! becoming new tasks; a node still unpublished gets its funding output
//! swept through the delayed server-only script path.
//!
//! Any on-chain appearance of a tree tx whose leaves were already
//! forfeited triggers broadcast of the stored forfeit txs. That is the
//! protocol's slashing primitive.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitcoin::{taproot, Amount, OutPoint, Sequence, Transaction, TxIn, TxOut, ScriptBuf, Witness, Txid};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Keypair, Message};
use bitcoin::sighash::{self, SighashCache, TapSighashType};
use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use ark::{forfeit, Expiry, RoundEvent, RoundId, VtxoId, SECP};
use ark::rounds::ROUND_TX_VTXO_TREE_VOUT;
use ark::tree::Tree;
use ark::tree::signed::sweep_clause;

use crate::config::SweepUnit;
use crate::database::{Store, StoredRound};
use crate::events::EventBus;
use crate::explorer::Explorer;
use crate::ledger::Ledger;
use crate::system::RuntimeManager;
use crate::wallet::Wallet;

#[derive(Debug, Clone)]
pub struct Config {
	pub sweep_unit: SweepUnit,
	/// Tree output lifetime in blocks.
	pub vtxo_expiry: u32,
	pub check_interval: Duration,
}

/// A scheduled visit of one tree node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SweepTask {
	expiry: Expiry,
	round_id: RoundId,
	node_idx: usize,
}

struct PendingSweep {
	txid: Txid,
	round_id: RoundId,
	/// The leaves to mark swept once this tx confirms.
	vtxos: Vec<VtxoId>,
}

enum Ctrl {
	TriggerSweep,
}

struct Process {
	config: Config,
	ledger: Arc<Ledger>,
	store: Arc<dyn Store>,
	wallet: Arc<dyn Wallet>,
	explorer: Arc<dyn Explorer>,
	server_key: Keypair,

	// runtime state

	tasks: BinaryHeap<Reverse<SweepTask>>,
	pending_sweeps: Vec<PendingSweep>,
	/// Confirmation cache per observed txid, `(height, blocktime)`.
	confirmations: HashMap<Txid, (u64, u64)>,
	/// Forfeits we already broadcast.
	forfeited: HashSet<VtxoId>,
}

impl Process {
	/// Look up a tx's status, caching confirmations.
	async fn tx_status(&mut self, txid: Txid) -> anyhow::Result<crate::explorer::TxStatus> {
		if let Some((height, blocktime)) = self.confirmations.get(&txid) {
			return Ok(crate::explorer::TxStatus::Confirmed {
				height: *height,
				blocktime: *blocktime,
			});
		}
		let status = self.explorer.tx_status(txid).await?;
		if let crate::explorer::TxStatus::Confirmed { height, blocktime } = status {
			self.confirmations.insert(txid, (height, blocktime));
		}
		Ok(status)
	}
	fn schedule(&mut self, task: SweepTask) {
		trace!("sweeper: scheduling node {} of round {} at {:?}",
			task.node_idx, task.round_id, task.expiry);
		self.tasks.push(Reverse(task));
	}

	/// Schedule the tree root of a freshly finished round.
	async fn on_round_finalized(&mut self, round_id: RoundId) -> anyhow::Result<()> {
		let round = self.store.get_round(round_id).await?
			.ok_or_else(|| anyhow!("finalized round {} not in store", round_id))?;
		let tree = Tree::new(round.signed_tree.nb_leaves());
		self.schedule(SweepTask {
			expiry: round.signed_tree.spec.expiry,
			round_id,
			node_idx: tree.root().idx(),
		});
		Ok(())
	}

	/// Reload schedules for all unswept rounds, e.g. after a restart.
	async fn load_state(&mut self) -> anyhow::Result<()> {
		for round in self.store.list_unswept_rounds().await? {
			let tree = Tree::new(round.signed_tree.nb_leaves());
			self.schedule(SweepTask {
				expiry: round.signed_tree.spec.expiry,
				round_id: round.id,
				node_idx: tree.root().idx(),
			});
		}
		Ok(())
	}

	/// The outpoint that funds the given tree node.
	fn node_funding_point(&self, round: &StoredRound, node_idx: usize) -> OutPoint {
		let tree = Tree::new(round.signed_tree.nb_leaves());
		match tree.parent_idx_of_with_sibling_idx(node_idx) {
			Some((parent, sibling_idx)) => OutPoint::new(
				round.signed_tree.txs[parent].compute_txid(),
				sibling_idx as u32,
			),
			None => OutPoint::new(round.id.as_round_txid(), ROUND_TX_VTXO_TREE_VOUT),
		}
	}

	/// The expiry of a child node unlocked by its parent confirming.
	fn child_expiry(&self, height: u64, blocktime: u64) -> Expiry {
		match self.config.sweep_unit {
			SweepUnit::Blockheight => Expiry::Height(height + self.config.vtxo_expiry as u64),
			SweepUnit::Timestamp => {
				Expiry::Timestamp(blocktime + self.config.vtxo_expiry as u64 * 600)
			},
		}
	}

	/// Build the sweep tx spending a node's funding output through the
	/// delayed server-only script path.
	async fn sweep_tx(
		&self,
		round: &StoredRound,
		node_idx: usize,
		point: OutPoint,
	) -> anyhow::Result<Transaction> {
		let spec = &round.signed_tree.spec;
		let tree = Tree::new(spec.nb_leaves());
		let values = spec.node_values(&tree);
		let agg_pk = spec.cosign_agg_pks()[node_idx];
		let taproot = spec.cosign_taproot(agg_pk);
		let prevout = TxOut {
			value: values[node_idx],
			script_pubkey: ScriptBuf::new_p2tr_tweaked(taproot.output_key()),
		};

		let address = self.wallet.derive_address().await?;
		let mut tx = Transaction {
			version: bitcoin::transaction::Version::TWO,
			lock_time: bitcoin::absolute::LockTime::ZERO,
			input: vec![TxIn {
				previous_output: point,
				sequence: Sequence::from_height(spec.sweep_delta),
				script_sig: ScriptBuf::new(),
				witness: Witness::new(),
			}],
			output: vec![TxOut {
				value: values[node_idx] - spec.min_relay_fee,
				script_pubkey: address.script_pubkey(),
			}],
		};

		let clause = sweep_clause(spec.server_pubkey, spec.sweep_delta);
		let leaf_hash = taproot::TapLeafHash::from_script(
			&clause, taproot::LeafVersion::TapScript,
		);
		let sighash = SighashCache::new(&tx).taproot_script_spend_signature_hash(
			0, &sighash::Prevouts::All(&[prevout]), leaf_hash, TapSighashType::Default,
		).expect("sighash error");
		let msg = Message::from_digest(sighash.to_byte_array());
		let sig = SECP.sign_schnorr(&msg, &self.server_key).serialize();

		let leaf = (clause, taproot::LeafVersion::TapScript);
		let cb = taproot.control_block(&leaf)
			.expect("sweep clause in node taproot").serialize();
		tx.input[0].witness = Witness::from_slice(&[&sig[..], leaf.0.as_bytes(), &cb[..]]);
		Ok(tx)
	}

	/// Process one due task: descend into unrolled nodes, sweep the
	/// still-unpublished frontier.
	async fn process_task(&mut self, task: SweepTask) -> anyhow::Result<()> {
		let round = match self.store.get_round(task.round_id).await? {
			Some(r) if !r.swept => r,
			_ => return Ok(()),
		};
		let tree = Tree::new(round.signed_tree.nb_leaves());
		let node_txid = round.signed_tree.txs[task.node_idx].compute_txid();

		match self.tx_status(node_txid).await? {
			crate::explorer::TxStatus::Confirmed { height, blocktime } => {
				// the node was unrolled; inspect its children
				debug!("sweeper: node {} of round {} unrolled at height {}",
					task.node_idx, task.round_id, height);
				for child in tree.node_at(task.node_idx).children() {
					self.schedule(SweepTask {
						expiry: self.child_expiry(height, blocktime),
						round_id: task.round_id,
						node_idx: child,
					});
				}
				if tree.node_at(task.node_idx).is_leaf() {
					// a fully unrolled exit; record it unless the leaf
					// was forfeited, which the fraud check handles
					let vtxo = round.signed_tree.build_vtxo(task.node_idx)
						.expect("leaf idx");
					let stored = self.ledger.get(vtxo.id()).await?;
					if stored.map(|s| !s.flags.spent && !s.flags.swept).unwrap_or(false) {
						self.ledger.mark_unrolled(vtxo.id()).await?;
					}
				}
			},
			_ => {
				// not on chain: the whole subtree can be swept through
				// this node's funding output
				let point = self.node_funding_point(&round, task.node_idx);
				if let Some(spending) = self.explorer.spending_tx(point).await? {
					// already spent, possibly by an earlier sweep of ours
					trace!("sweeper: {} already spent by {}", point, spending.compute_txid());
					return Ok(());
				}
				let leaves = tree.node_at(task.node_idx).leaves().collect::<Vec<_>>();
				let mut vtxos = Vec::with_capacity(leaves.len());
				for leaf in leaves {
					let vtxo = round.signed_tree.build_vtxo(leaf).expect("leaf idx");
					let stored = self.ledger.get(vtxo.id()).await?;
					if stored.map(|s| !s.flags.swept).unwrap_or(false) {
						vtxos.push(vtxo.id());
					}
				}
				let tx = self.sweep_tx(&round, task.node_idx, point).await?;
				let txid = self.wallet.broadcast(&tx).await?;
				info!("sweeper: broadcast sweep tx {} for node {} of round {}",
					txid, task.node_idx, task.round_id);
				self.pending_sweeps.push(PendingSweep {
					txid,
					round_id: task.round_id,
					vtxos,
				});
			},
		}
		Ok(())
	}

	/// Pop and process all tasks that are due.
	async fn process_due_tasks(&mut self, tip_height: u64, now_unix: u64) -> anyhow::Result<()> {
		while let Some(Reverse(task)) = self.tasks.peek().cloned() {
			if !task.expiry.is_due(tip_height, now_unix) {
				break;
			}
			self.tasks.pop();
			if let Err(e) = self.process_task(task.clone()).await {
				warn!("sweeper: error processing task for round {}: {:#}", task.round_id, e);
				// try again next wake
				self.schedule(task);
				break;
			}
		}
		Ok(())
	}

	/// Mark the leaves of confirmed sweep txs swept.
	async fn check_pending_sweeps(&mut self) -> anyhow::Result<()> {
		let mut remaining = Vec::new();
		for pending in std::mem::take(&mut self.pending_sweeps) {
			match self.wallet.is_confirmed(pending.txid).await? {
				Some(_) => {
					info!("sweeper: sweep tx {} confirmed, {} vtxos swept",
						pending.txid, pending.vtxos.len());
					self.ledger.mark_swept(&pending.vtxos).await?;
					self.maybe_finish_round(pending.round_id).await?;
				},
				None => remaining.push(pending),
			}
		}
		self.pending_sweeps = remaining;
		Ok(())
	}

	/// Mark a round swept once every leaf is accounted for: swept by
	/// us, cleanly unrolled by its owner, or punished by a forfeit.
	async fn maybe_finish_round(&mut self, round_id: RoundId) -> anyhow::Result<()> {
		let round = match self.store.get_round(round_id).await? {
			Some(r) if !r.swept => r,
			_ => return Ok(()),
		};
		for vtxo in round.signed_tree.all_vtxos() {
			let stored = self.ledger.get(vtxo.id()).await?;
			let done = match stored {
				Some(s) => s.flags.swept
					|| (s.flags.unrolled && !s.flags.spent)
					|| self.forfeited.contains(&vtxo.id()),
				None => false,
			};
			if !done {
				return Ok(());
			}
		}
		info!("sweeper: round {} fully swept", round_id);
		self.store.mark_round_swept(round_id).await?;
		Ok(())
	}

	/// Punish unilateral exits of forfeited VTXOs.
	///
	/// Scans all tree txs of unswept rounds for on-chain appearances;
	/// every already-spent leaf under a published node gets its stored
	/// forfeit tx broadcast.
	async fn detect_frauds(&mut self) -> anyhow::Result<()> {
		for round in self.store.list_unswept_rounds().await? {
			let tree = Tree::new(round.signed_tree.nb_leaves());
			for node in tree.iter() {
				let txid = round.signed_tree.txs[node.idx()].compute_txid();
				let status = self.tx_status(txid).await?;
				if !status.seen() {
					continue;
				}
				for leaf in node.leaves() {
					let vtxo = round.signed_tree.build_vtxo(leaf).expect("leaf idx");
					if self.forfeited.contains(&vtxo.id()) {
						continue;
					}
					let stored = self.ledger.get(vtxo.id()).await?;
					if !stored.map(|s| s.flags.spent).unwrap_or(false) {
						continue;
					}
					if let Err(e) = self.broadcast_forfeit(&round, leaf).await {
						error!("sweeper: failed to broadcast forfeit for {}: {:#}",
							vtxo.id(), e);
					} else {
						self.forfeited.insert(vtxo.id());
					}
				}
			}
		}
		Ok(())
	}

	/// Publish the connector branch and the finished forfeit tx for the
	/// given leaf.
	async fn broadcast_forfeit(&self, round: &StoredRound, leaf_idx: usize) -> anyhow::Result<()> {
		let vtxo = round.signed_tree.build_vtxo(leaf_idx).expect("leaf idx");
		let mut tx = round.forfeit_txs.get(&vtxo.id())
			.ok_or_else(|| anyhow!("no stored forfeit for vtxo {}", vtxo.id()))?
			.clone();

		let connector_key = Keypair::from_secret_key(&SECP, &round.connector_key);
		forfeit::finish_forfeit_tx(&mut tx, &vtxo, &self.server_key, &connector_key)
			.map_err(|e| anyhow!("finishing forfeit tx: {}", e))?;

		// the connector txs must be on chain for the forfeit to be valid
		for conn_tx in round.connectors.signed_txs(&connector_key)? {
			self.explorer.broadcast(&conn_tx).await?;
		}
		self.explorer.broadcast(&tx).await?;
		warn!("sweeper: broadcast forfeit tx {} for vtxo {}", tx.compute_txid(), vtxo.id());
		Ok(())
	}

	async fn wake(&mut self) {
		let tip_height = match self.explorer.tip_height().await {
			Ok(h) => h,
			Err(e) => {
				warn!("sweeper: explorer unavailable: {:#}", e);
				return;
			},
		};
		let now_unix = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();

		if let Err(e) = self.process_due_tasks(tip_height, now_unix).await {
			warn!("sweeper: error processing due tasks: {:#}", e);
		}
		if let Err(e) = self.check_pending_sweeps().await {
			warn!("sweeper: error checking pending sweeps: {:#}", e);
		}
		if let Err(e) = self.detect_frauds().await {
			warn!("sweeper: error during fraud detection: {:#}", e);
		}
	}

	async fn run(
		mut self,
		events: Arc<EventBus>,
		mut ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
		rtmgr: RuntimeManager,
	) {
		info!("Starting sweeper");
		let _worker = rtmgr.spawn_critical("Sweeper");

		let mut event_stream = events.subscribe_fresh();
		let mut timer = tokio::time::interval(self.config.check_interval);
		timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = timer.tick() => {
					self.wake().await;
				},
				Some(event) = event_stream.next() => {
					if let RoundEvent::Finalized { round_id, .. } = *event {
						if let Err(e) = self.on_round_finalized(round_id).await {
							warn!("sweeper: error scheduling round {}: {:#}", round_id, e);
						}
					}
				},
				Some(ctrl) = ctrl_rx.recv() => match ctrl {
					Ctrl::TriggerSweep => self.wake().await,
				},
				_ = rtmgr.shutdown_signal() => {
					info!("Shutdown signal received, exiting sweeper");
					break;
				},
			}
		}
	}
}

/// Handle to the sweeper process.
pub struct Sweeper {
	ctrl_tx: mpsc::UnboundedSender<Ctrl>,
}

impl Sweeper {
	pub async fn start(
		rtmgr: RuntimeManager,
		config: Config,
		ledger: Arc<Ledger>,
		store: Arc<dyn Store>,
		wallet: Arc<dyn Wallet>,
		explorer: Arc<dyn Explorer>,
		events: Arc<EventBus>,
		server_key: Keypair,
	) -> anyhow::Result<Sweeper> {
		let mut proc = Process {
			config, ledger, store, wallet, explorer, server_key,
			tasks: BinaryHeap::new(),
			pending_sweeps: Vec::new(),
			confirmations: HashMap::new(),
			forfeited: HashSet::new(),
		};
		proc.load_state().await?;

		let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
		tokio::spawn(proc.run(events, ctrl_rx, rtmgr));
		Ok(Sweeper { ctrl_tx })
	}

	pub fn trigger_sweep(&self) -> anyhow::Result<()> {
		self.ctrl_tx.send(Ctrl::TriggerSweep).map_err(|_| anyhow!("sweeper is down"))?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use crate::database::RoundStore;
	use bitcoin::secp256k1::rand;

	use ark::{SignMode, SignedVtxoRequest, VtxoRequest};
	use ark::connectors::ConnectorTree;
	use ark::tree::signed::VtxoTreeSpec;

	use crate::database::MemoryStore;
	use crate::ledger::SpendKind;
	use crate::dev::{MemoryExplorer, MemoryWallet};

	const FEE: Amount = Amount::from_sat(500);

	struct Setup {
		proc: Process,
		store: Arc<MemoryStore>,
		ledger: Arc<Ledger>,
		wallet: Arc<MemoryWallet>,
		explorer: Arc<MemoryExplorer>,
		round: StoredRound,
	}

	/// Build a stored round with a real signed tree of `n` leaves.
	async fn setup(n: usize) -> Setup {
		let server_key = Keypair::new(&SECP, &mut rand::thread_rng());
		let server_cosign = Keypair::new(&SECP, &mut rand::thread_rng());
		let connector_key = Keypair::new(&SECP, &mut rand::thread_rng());

		let owners = (0..n).map(|_| Keypair::new(&SECP, &mut rand::thread_rng()))
			.collect::<Vec<_>>();
		let cosign_keys = (0..n).map(|_| Keypair::new(&SECP, &mut rand::thread_rng()))
			.collect::<Vec<_>>();
		let spec = VtxoTreeSpec::new(
			owners.iter().zip(&cosign_keys).map(|(o, c)| SignedVtxoRequest {
				vtxo: VtxoRequest {
					pubkey: o.public_key(),
					amount: Amount::from_sat(50_000),
				},
				cosign_pubkey: c.public_key(),
				sign_mode: SignMode::Branch,
			}).collect(),
			server_key.public_key(),
			server_cosign.public_key(),
			Expiry::Height(1_000),
			144,
			144,
			FEE,
		);

		// sign the tree with all participants
		let utxo = OutPoint::new(Txid::all_zeros(), ROUND_TX_VTXO_TREE_VOUT);
		let unsigned = spec.into_unsigned_tree(utxo);
		let tree = Tree::new(n);
		let mut sec_nonces = Vec::new();
		let mut pub_nonces = HashMap::new();
		for (i, c) in cosign_keys.iter().enumerate() {
			let mut secs = Vec::new();
			let mut pubs = vec![None; unsigned.nb_nodes()];
			for node in tree.iter() {
				if unsigned.spec.participates(i, node) {
					let (s, p) = ark::musig::nonce_pair(c);
					secs.push(s);
					pubs[node.idx()] = Some(p);
				}
			}
			sec_nonces.push(secs);
			pub_nonces.insert(c.public_key(), pubs);
		}
		let (server_secs, server_pubs): (Vec<_>, Vec<_>) =
			(0..unsigned.nb_nodes()).map(|_| ark::musig::nonce_pair(&server_cosign)).unzip();
		let agg = unsigned.calculate_cosign_agg_nonces(&pub_nonces, &server_pubs).unwrap();
		let mut part_sigs = HashMap::new();
		for (i, c) in cosign_keys.iter().enumerate() {
			let sigs = unsigned.cosign_leaf(&agg, i, c, sec_nonces.remove(0)).unwrap();
			part_sigs.insert(c.public_key(), sigs);
		}
		let server_sigs = unsigned.cosign_tree(&agg, &server_cosign, server_secs);
		let sigs = unsigned.combine_partial_signatures(&agg, &part_sigs, &server_sigs).unwrap();
		let signed_tree = unsigned.into_signed_tree(sigs);

		let connectors = ConnectorTree::new(
			n, OutPoint::new(Txid::all_zeros(), 1), connector_key.public_key(), FEE,
		);
		let connector_txs = connectors.txs();
		let leaves = connectors.connectors(&connector_txs);

		// owner-signed forfeits for every leaf, bound like the collector
		// binds them
		let mut sorted_vtxos = signed_tree.all_vtxos().collect::<Vec<_>>();
		sorted_vtxos.sort_by_key(|v| v.id());
		let mut sorted_leaves = leaves.clone();
		sorted_leaves.sort_by_key(|p| (p.txid, p.vout));
		let mut forfeit_txs = HashMap::new();
		for (vtxo, conn) in sorted_vtxos.iter().zip(&sorted_leaves) {
			let owner_idx = owners.iter()
				.position(|o| o.public_key() == vtxo.owner_pubkey())
				.unwrap();
			let mut tx = forfeit::create_forfeit_tx(vtxo, *conn, FEE);
			forfeit::sign_forfeit_vtxo_input(
				&mut tx, vtxo, connector_key.public_key(), &owners[owner_idx],
			);
			forfeit_txs.insert(vtxo.id(), tx);
		}

		let round = StoredRound {
			id: RoundId::new(Txid::all_zeros()),
			funding_tx: signed_tree.txs.last().unwrap().clone(),
			signed_tree,
			connectors,
			connector_key: connector_key.secret_key(),
			forfeit_txs,
			swept: false,
		};

		let store = Arc::new(MemoryStore::new());
		store.store_round(round.clone()).await.unwrap();
		let events = Arc::new(EventBus::new());
		let ledger = Arc::new(Ledger::new(store.clone(), events));
		ledger.mint(round.signed_tree.all_vtxos().collect()).await.unwrap();

		let wallet = Arc::new(MemoryWallet::new(bitcoin::Network::Regtest));
		let explorer = Arc::new(MemoryExplorer::new());
		let proc = Process {
			config: Config {
				sweep_unit: SweepUnit::Blockheight,
				vtxo_expiry: 144,
				check_interval: Duration::from_secs(60),
			},
			ledger: ledger.clone(),
			store: store.clone(),
			wallet: wallet.clone(),
			explorer: explorer.clone(),
			server_key,
			tasks: BinaryHeap::new(),
			pending_sweeps: Vec::new(),
			confirmations: HashMap::new(),
			forfeited: HashSet::new(),
		};

		Setup { proc, store, ledger, wallet, explorer, round }
	}

	#[tokio::test]
	async fn schedules_root_on_finalized_round() {
		let mut s = setup(3).await;
		s.proc.on_round_finalized(s.round.id).await.unwrap();
		assert_eq!(s.proc.tasks.len(), 1);
		let Reverse(task) = s.proc.tasks.peek().unwrap();
		assert_eq!(task.expiry, Expiry::Height(1_000));
		assert_eq!(task.node_idx, Tree::new(3).root().idx());
	}

	#[tokio::test]
	async fn sweeps_unpublished_tree_at_expiry() {
		let mut s = setup(2).await;
		s.proc.on_round_finalized(s.round.id).await.unwrap();

		// before expiry nothing happens
		s.proc.process_due_tasks(999, 0).await.unwrap();
		assert!(s.wallet.broadcasts().is_empty());

		// at expiry the root's funding output is swept in one tx
		s.proc.process_due_tasks(1_000, 0).await.unwrap();
		let swept = s.wallet.broadcasts();
		assert_eq!(swept.len(), 1);
		assert_eq!(
			swept[0].input[0].previous_output,
			OutPoint::new(s.round.id.as_round_txid(), ROUND_TX_VTXO_TREE_VOUT),
		);

		// once the sweep confirms, all leaves are swept and the round
		// is done
		s.wallet.confirm(swept[0].compute_txid(), 1_001);
		s.proc.check_pending_sweeps().await.unwrap();
		for vtxo in s.round.signed_tree.all_vtxos() {
			let stored = s.ledger.get(vtxo.id()).await.unwrap().unwrap();
			assert!(stored.flags.swept);
			assert!(!stored.is_spendable());
		}
		assert!(s.store.get_round(s.round.id).await.unwrap().unwrap().swept);
	}

	#[tokio::test]
	async fn descends_into_unrolled_branches() {
		let mut s = setup(2).await;
		s.proc.on_round_finalized(s.round.id).await.unwrap();

		// the root tx was published on-chain before expiry; at the tree
		// expiry the frontier advances past it and both leaf funding
		// outputs are swept individually
		let root_tx = s.round.signed_tree.txs.last().unwrap().clone();
		let root_txid = root_tx.compute_txid();
		s.explorer.confirm(root_txid, 500, 1_700_000_000);

		s.proc.process_due_tasks(1_000, 0).await.unwrap();
		let swept = s.wallet.broadcasts();
		assert_eq!(swept.len(), 2);
		let expected = (0..2)
			.map(|vout| OutPoint::new(root_txid, vout))
			.collect::<HashSet<_>>();
		let actual = swept.iter()
			.map(|tx| tx.input[0].previous_output)
			.collect::<HashSet<_>>();
		assert_eq!(actual, expected);
	}

	#[tokio::test]
	async fn fraud_broadcasts_stored_forfeits() {
		let mut s = setup(3).await;

		// two of the leaves got spent in a later transfer, then their
		// owner publishes the tree on-chain
		let vtxos = s.round.signed_tree.all_vtxos().collect::<Vec<_>>();
		let spent = [vtxos[0].id(), vtxos[1].id()];
		s.ledger.spend_and_mint(&spent, vec![], SpendKind::Round).await.unwrap();

		for tx in &s.round.signed_tree.txs {
			s.explorer.confirm(tx.compute_txid(), 600, 1_700_000_000);
		}

		s.proc.detect_frauds().await.unwrap();

		// exactly the spent leaves have their forfeit broadcast; the
		// server only adds witnesses, so the stored txids still match
		let broadcasts = s.explorer.broadcasts();
		let forfeit_txids = spent.iter()
			.map(|id| s.round.forfeit_txs.get(id).unwrap().compute_txid())
			.collect::<HashSet<_>>();
		let broadcast_txids = broadcasts.iter().map(|tx| tx.compute_txid()).collect::<HashSet<_>>();
		for txid in &forfeit_txids {
			assert!(broadcast_txids.contains(txid), "missing forfeit broadcast");
		}
		// the unspent leaf is not punished
		let unspent_forfeit = s.round.forfeit_txs.get(&vtxos[2].id()).unwrap();
		assert!(!broadcast_txids.contains(&unspent_forfeit.compute_txid()));

		// the detection is idempotent
		let nb = s.explorer.broadcasts().len();
		s.proc.detect_frauds().await.unwrap();
		assert_eq!(s.explorer.broadcasts().len(), nb);
	}
}
