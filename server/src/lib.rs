#[macro_use] extern crate anyhow;
#[macro_use] extern crate serde;

pub mod error;

pub mod config;
pub mod database;
pub mod dev;
pub mod events;
pub mod explorer;
pub mod flux;
pub mod ledger;
pub mod queue;
pub mod redeem;
pub mod round;
pub mod sweeper;
pub mod system;
pub mod wallet;

pub(crate) mod serde_util;

pub use crate::config::Config;

use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Address, Amount, Transaction};
use bitcoin::secp256k1::{rand, Keypair, PublicKey};
use log::info;
use tokio::sync::oneshot;

use ark::{BlockHeight, Note, RoundId, Vtxo, VtxoRequest, SECP};
use ark::musig::{PartialSignature, PubNonce};

use crate::database::{Store, StoredRound, StoredVtxo};
use crate::error::ContextExt;
use crate::events::{EventBus, EventStream};
use crate::explorer::Explorer;
use crate::flux::VtxosInFlux;
use crate::ledger::Ledger;
use crate::queue::{RequestId, RequestQueue, TxRequest};
use crate::redeem::RedeemHandler;
use crate::round::{InputTx, RoundContext, RoundInput};
use crate::sweeper::Sweeper;
use crate::system::RuntimeManager;
use crate::wallet::Wallet;

/// Status of the on-chain wallet, for the admin surface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WalletStatus {
	pub address: String,
	pub synced_height: BlockHeight,
}

/// The coordinator server.
///
/// Owns the shared state (ledger, queue, event bus) and the background
/// processes (round coordinator, sweeper). The methods on this type are
/// the client-facing surface; transports call into them.
pub struct Server {
	config: Config,
	server_key: Keypair,
	ledger: Arc<Ledger>,
	queue: Arc<RequestQueue>,
	store: Arc<dyn Store>,
	wallet: Arc<dyn Wallet>,
	events: Arc<EventBus>,
	redeem: RedeemHandler,
	round_input_tx: InputTx,
	sweeper: Sweeper,
	rtmgr: RuntimeManager,
}

impl Server {
	/// Start the server with the given storage, wallet and explorer
	/// adapters.
	pub async fn start(
		config: Config,
		store: Arc<dyn Store>,
		wallet: Arc<dyn Wallet>,
		explorer: Arc<dyn Explorer>,
	) -> anyhow::Result<Arc<Server>> {
		config.validate()?;

		let rtmgr = RuntimeManager::new();
		rtmgr.run_shutdown_signal_listener(Duration::from_secs(30));

		let server_key = Keypair::new(&SECP, &mut rand::thread_rng());
		let events = Arc::new(EventBus::new());
		let ledger = Arc::new(Ledger::new(store.clone(), events.clone()));
		let queue = Arc::new(RequestQueue::new(
			config.request_select_gap,
			config.request_delete_gap,
		));
		let flux = Arc::new(VtxosInFlux::new());
		let redeem = RedeemHandler::new(
			ledger.clone(),
			flux.clone(),
			server_key,
			config.redeem_fee,
		);

		let sweeper = Sweeper::start(
			rtmgr.clone(),
			sweeper::Config {
				sweep_unit: config.sweep_unit,
				vtxo_expiry: config.vtxo_expiry,
				check_interval: config.sweep_check_interval,
			},
			ledger.clone(),
			store.clone(),
			wallet.clone(),
			explorer,
			events.clone(),
			server_key,
		).await?;

		let (round_input_tx, round_input_rx) = tokio::sync::mpsc::unbounded_channel();
		let round_ctx = Arc::new(RoundContext {
			config: config.clone(),
			server_key,
			ledger: ledger.clone(),
			queue: queue.clone(),
			store: store.clone(),
			wallet: wallet.clone(),
			events: events.clone(),
			flux,
		});
		{
			let rtmgr = rtmgr.clone();
			tokio::spawn(async move {
				let _ = round::run_round_coordinator(round_ctx, round_input_rx, rtmgr).await;
			});
		}

		info!("Coordinator started on {} with pubkey {}",
			config.network, server_key.public_key());

		Ok(Arc::new(Server {
			config,
			server_key,
			ledger,
			queue,
			store,
			wallet,
			events,
			redeem,
			round_input_tx,
			sweeper,
			rtmgr,
		}))
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn server_pubkey(&self) -> PublicKey {
		self.server_key.public_key()
	}

	/// Wait until all background processes have stopped.
	pub async fn wait_shutdown(&self) {
		self.rtmgr.shutdown_signal().await;
		self.rtmgr.wait_done().await;
	}

	async fn send_round_input(&self, input: RoundInput) -> anyhow::Result<()> {
		let (tx, rx) = oneshot::channel();
		self.round_input_tx.send((input, tx))
			.map_err(|_| anyhow!("round coordinator is down"))?;
		match rx.await {
			// the coordinator reported an error for this submission
			Ok(e) => Err(e),
			// the reply sender was dropped, the submission was accepted
			Err(_) => Ok(()),
		}
	}

	// ---- client surface ----

	/// Register an intent for the next round. The returned id must be
	/// kept alive with [Server::ping].
	pub fn register_intent(&self, mut request: TxRequest) -> anyhow::Result<RequestId> {
		request.id = RequestId::generate();
		let id = request.id.clone();
		self.queue.push(request)?;
		Ok(id)
	}

	/// Liveness ping for a pending request.
	pub fn ping(&self, id: &RequestId) -> anyhow::Result<()> {
		self.queue.update_ping(id)
	}

	/// Replace a pending request, e.g. to attach fresh cosigner data.
	pub fn update_intent(&self, request: TxRequest) -> anyhow::Result<()> {
		self.queue.update(request)
	}

	/// Submit a cosigner's nonce matrix for the round in progress.
	pub async fn submit_nonces(
		&self,
		cosign_pubkey: PublicKey,
		nonces: Vec<Option<PubNonce>>,
	) -> anyhow::Result<()> {
		self.send_round_input(RoundInput::Nonces { cosign_pubkey, nonces }).await
	}

	/// Submit a cosigner's partial signatures for the round in progress.
	pub async fn submit_signatures(
		&self,
		cosign_pubkey: PublicKey,
		signatures: Vec<Option<PartialSignature>>,
	) -> anyhow::Result<()> {
		self.send_round_input(RoundInput::Signatures { cosign_pubkey, signatures }).await
	}

	/// Submit owner-signed forfeit txs for the round in progress.
	pub async fn submit_forfeits(&self, txs: Vec<Transaction>) -> anyhow::Result<()> {
		self.send_round_input(RoundInput::Forfeits { txs }).await
	}

	/// Process an out-of-round redeem tx.
	pub async fn submit_redeem_tx(
		&self,
		tx: Transaction,
		outputs: Vec<VtxoRequest>,
	) -> anyhow::Result<Vec<Vtxo>> {
		let tip = self.wallet.synced_height().await?;
		self.redeem.submit_redeem_tx(tx, outputs, tip).await
	}

	/// All spendable VTXOs of the given owner key.
	pub async fn list_vtxos(&self, owner: PublicKey) -> anyhow::Result<Vec<StoredVtxo>> {
		self.ledger.list_spendable(owner).await
	}

	/// A finished round by its round txid.
	pub async fn get_round(&self, id: RoundId) -> anyhow::Result<StoredRound> {
		self.store.get_round(id).await?.not_found([id], "no round with that id")
	}

	/// Subscribe to round events, replaying the last one.
	pub fn events(&self) -> EventStream {
		self.events.subscribe()
	}

	// ---- admin surface ----

	/// Issue a new note for the given amount.
	pub async fn create_note(&self, amount: Amount) -> anyhow::Result<Note> {
		let note = Note::generate(amount);
		self.ledger.register_notes(std::slice::from_ref(&note)).await?;
		info!("Issued note {} for {}", note.id(), amount);
		Ok(note)
	}

	pub async fn wallet_status(&self) -> anyhow::Result<WalletStatus> {
		Ok(WalletStatus {
			address: self.get_address().await?.to_string(),
			synced_height: self.wallet.synced_height().await?,
		})
	}

	pub async fn get_address(&self) -> anyhow::Result<Address> {
		self.wallet.derive_address().await
	}

	pub fn trigger_sweep(&self) -> anyhow::Result<()> {
		self.sweeper.trigger_sweep()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use bitcoin::secp256k1::rand;

	use ark::{SignMode, SignedVtxoRequest};

	use crate::database::MemoryStore;
	use crate::dev::{MemoryExplorer, MemoryWallet};

	fn test_config() -> Config {
		let mut cfg = Config::default();
		// keep the coordinator in its registration phase for the whole
		// test so queue operations don't race the round
		cfg.round_interval = Duration::from_secs(3600);
		cfg.registration_window = Duration::from_secs(3000);
		cfg
	}

	async fn test_server() -> Arc<Server> {
		let store = Arc::new(MemoryStore::new());
		let wallet = Arc::new(MemoryWallet::new(bitcoin::Network::Regtest));
		let explorer = Arc::new(MemoryExplorer::new());
		Server::start(test_config(), store, wallet, explorer).await.unwrap()
	}

	fn receiver(amount: u64) -> SignedVtxoRequest {
		let key = Keypair::new(&SECP, &mut rand::thread_rng());
		let cosign = Keypair::new(&SECP, &mut rand::thread_rng());
		SignedVtxoRequest {
			vtxo: VtxoRequest {
				pubkey: key.public_key(),
				amount: Amount::from_sat(amount),
			},
			cosign_pubkey: cosign.public_key(),
			sign_mode: SignMode::Branch,
		}
	}

	#[tokio::test]
	async fn intent_registration_and_ping() {
		let srv = test_server().await;
		let req = TxRequest {
			id: RequestId::generate(),
			input_vtxos: vec![],
			boarding_inputs: vec![crate::queue::BoardingInput {
				point: bitcoin::OutPoint::new(
					<bitcoin::Txid as bitcoin::hashes::Hash>::all_zeros(), 0,
				),
				amount: Amount::from_sat(100_000),
			}],
			notes: vec![],
			recovered_vtxos: vec![],
			receivers: vec![receiver(100_000)],
		};
		let id = srv.register_intent(req).unwrap();
		srv.ping(&id).unwrap();
		srv.ping(&id).unwrap();

		// unknown ids are rejected
		assert!(srv.ping(&RequestId::generate()).is_err());
	}

	#[tokio::test]
	async fn note_issuance_single_redemption() {
		let srv = test_server().await;
		let note = srv.create_note(Amount::from_sat(10_000)).await.unwrap();
		assert_eq!(srv.ledger.spend_note(note.id()).await.unwrap(), note.amount);
		assert!(srv.ledger.spend_note(note.id()).await.is_err());
	}

	#[tokio::test]
	async fn submissions_outside_round_rejected() {
		let srv = test_server().await;
		let err = srv.submit_forfeits(vec![]).await.unwrap_err();
		assert!(err.downcast_ref::<crate::error::BadArgument>().is_some());
	}
}
