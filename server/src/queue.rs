
//! The pending tx-request queue.
//!
//! Clients register their intents here; the round coordinator pops a
//! batch when the round timer fires. Requests are kept alive by pings:
//! a request that hasn't pinged recently is skipped by rounds, and one
//! that has been silent for longer is deleted.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use bitcoin::{Amount, OutPoint};
use bitcoin::hex::DisplayHex;
use log::warn;
use parking_lot::RwLock;

use ark::{Note, SignedVtxoRequest, Vtxo};

use crate::error::{badarg, not_found, ContextExt};

/// Identifier of a tx-request, assigned at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct RequestId(String);

impl RequestId {
	pub fn generate() -> RequestId {
		let bytes = rand::random::<[u8; 16]>();
		RequestId(bytes[..].as_hex().to_string())
	}
}

impl std::fmt::Display for RequestId {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

/// An on-chain UTXO being folded into the system.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BoardingInput {
	pub point: OutPoint,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
}

/// A client intent to participate in the next round.
#[derive(Debug, Clone)]
pub struct TxRequest {
	pub id: RequestId,
	/// VTXOs spent if the round confirms.
	pub input_vtxos: Vec<Vtxo>,
	/// On-chain UTXOs being boarded.
	pub boarding_inputs: Vec<BoardingInput>,
	/// Notes being redeemed.
	pub notes: Vec<Note>,
	/// Previously swept VTXOs being reclaimed.
	pub recovered_vtxos: Vec<Vtxo>,
	/// The VTXOs to mint.
	pub receivers: Vec<SignedVtxoRequest>,
}

impl TxRequest {
	pub fn input_amount(&self) -> Amount {
		self.input_vtxos.iter().map(|v| v.amount()).sum::<Amount>()
			+ self.boarding_inputs.iter().map(|b| b.amount).sum::<Amount>()
			+ self.notes.iter().map(|n| n.amount).sum::<Amount>()
			+ self.recovered_vtxos.iter().map(|v| v.amount()).sum::<Amount>()
	}

	pub fn output_amount(&self) -> Amount {
		self.receivers.iter().map(|r| r.vtxo.amount).sum()
	}

	fn validate_balance(&self) -> anyhow::Result<()> {
		if self.receivers.is_empty() {
			return badarg!("request has no receivers");
		}
		if self.input_amount() != self.output_amount() {
			return badarg!(
				"request doesn't balance: inputs {} != outputs {}",
				self.input_amount(), self.output_amount(),
			);
		}
		Ok(())
	}
}

/// Check that `req` shares no input VTXO, boarding input, recovered
/// VTXO or note with any *other* pending request.
///
/// An entry under the request's own id is ignored, so a replacement may
/// keep its original inputs.
fn validate_unique(
	req: &TxRequest,
	pending: &HashMap<RequestId, TimedRequest>,
) -> anyhow::Result<()> {
	for (id, other) in pending {
		if *id == req.id {
			continue;
		}
		for input in &req.input_vtxos {
			if other.req.input_vtxos.iter().any(|v| v.id() == input.id()) {
				return badarg!("input vtxo {} already registered", input.id());
			}
		}
		for boarding in &req.boarding_inputs {
			if other.req.boarding_inputs.iter().any(|b| b.point == boarding.point) {
				return badarg!("boarding input {} already registered", boarding.point);
			}
		}
		for recovered in &req.recovered_vtxos {
			if other.req.recovered_vtxos.iter().any(|v| v.id() == recovered.id()) {
				return badarg!("recovered vtxo {} already registered", recovered.id());
			}
		}
		for note in &req.notes {
			if other.req.notes.iter().any(|n| n.id() == note.id()) {
				return badarg!("note {} already registered", note.id());
			}
		}
	}
	Ok(())
}

/// A popped request together with its registration time, so it can be
/// requeued with its place in line preserved.
#[derive(Debug, Clone)]
pub struct TimedTxRequest {
	pub req: TxRequest,
	pub timestamp: SystemTime,
}

struct TimedRequest {
	req: TxRequest,
	/// Registration time, determines round batch order.
	timestamp: SystemTime,
	/// Last liveness ping.
	ping: SystemTime,
}

/// The queue of pending tx-requests.
///
/// View operations take the read lock; everything else the write lock.
pub struct RequestQueue {
	select_gap: Duration,
	delete_gap: Duration,
	requests: RwLock<HashMap<RequestId, TimedRequest>>,
}

impl RequestQueue {
	pub fn new(select_gap: Duration, delete_gap: Duration) -> RequestQueue {
		RequestQueue {
			select_gap,
			delete_gap,
			requests: RwLock::new(HashMap::new()),
		}
	}

	pub fn len(&self) -> usize {
		self.requests.read().len()
	}

	/// Register a new request.
	///
	/// No two pending requests may share an input VTXO, a boarding
	/// input, a recovered VTXO or a note.
	pub fn push(&self, req: TxRequest) -> anyhow::Result<()> {
		self.push_at(req, SystemTime::now())
	}

	fn push_at(&self, req: TxRequest, now: SystemTime) -> anyhow::Result<()> {
		req.validate_balance()?;

		let mut lock = self.requests.write();
		if lock.contains_key(&req.id) {
			return badarg!("duplicate request id {}", req.id);
		}
		validate_unique(&req, &lock)?;

		lock.insert(req.id.clone(), TimedRequest {
			req,
			timestamp: now,
			ping: now,
		});
		Ok(())
	}

	/// Register a new request redeeming the given notes.
	pub fn push_with_notes(&self, mut req: TxRequest, notes: Vec<Note>) -> anyhow::Result<()> {
		req.notes = notes;
		self.push(req)
	}

	/// Record a liveness ping. Idempotent up to timestamp monotonicity.
	pub fn update_ping(&self, id: &RequestId) -> anyhow::Result<()> {
		self.update_ping_at(id, SystemTime::now())
	}

	fn update_ping_at(&self, id: &RequestId, now: SystemTime) -> anyhow::Result<()> {
		let mut lock = self.requests.write();
		let entry = lock.get_mut(id).not_found([id], "request not registered")?;
		entry.ping = now;
		Ok(())
	}

	/// Replace a pending request, e.g. to attach cosigner data.
	///
	/// The replacement must balance, must not claim inputs of other
	/// pending requests, and keeps the original timestamps.
	pub fn update(&self, req: TxRequest) -> anyhow::Result<()> {
		req.validate_balance()?;
		let mut lock = self.requests.write();
		if !lock.contains_key(&req.id) {
			return not_found!([&req.id], "request not registered");
		}
		validate_unique(&req, &lock)?;
		let id = req.id.clone();
		lock.get_mut(&id).expect("checked above").req = req;
		Ok(())
	}

	/// Pop up to `n` live requests in FIFO registration order.
	///
	/// A negative `n` means all eligible. Requests whose last ping is
	/// older than the select gap are skipped; those older than the
	/// delete gap are dropped entirely.
	pub fn pop(&self, n: isize) -> Vec<TimedTxRequest> {
		self.pop_at(n, SystemTime::now())
	}

	fn pop_at(&self, n: isize, now: SystemTime) -> Vec<TimedTxRequest> {
		let mut lock = self.requests.write();

		lock.retain(|_, entry| {
			now.duration_since(entry.ping).unwrap_or_default() <= self.delete_gap
		});

		let mut eligible = lock.values()
			.filter(|e| now.duration_since(e.ping).unwrap_or_default() <= self.select_gap)
			.map(|e| (e.req.id.clone(), e.timestamp))
			.collect::<Vec<_>>();
		eligible.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

		if n >= 0 {
			eligible.truncate(n as usize);
		}

		eligible.into_iter()
			.map(|(id, _)| {
				let entry = lock.remove(&id).expect("just listed");
				TimedTxRequest { req: entry.req, timestamp: entry.timestamp }
			})
			.collect()
	}

	/// Remove the given requests, e.g. after a failed round when the
	/// failure was the request's own fault.
	pub fn delete(&self, ids: &[RequestId]) {
		let mut lock = self.requests.write();
		for id in ids {
			lock.remove(id);
		}
	}

	/// Requeue requests from an aborted round, preserving their
	/// original registration order.
	///
	/// A request whose inputs were claimed by a newer registration
	/// while the round was in flight is dropped instead.
	pub fn requeue(&self, reqs: Vec<TimedTxRequest>) {
		let mut lock = self.requests.write();
		let now = SystemTime::now();
		for timed in reqs {
			if let Err(e) = validate_unique(&timed.req, &lock) {
				warn!("dropping requeued request {}: {:#}", timed.req.id, e);
				continue;
			}
			lock.insert(timed.req.id.clone(), TimedRequest {
				req: timed.req,
				timestamp: timed.timestamp,
				ping: now,
			});
		}
	}

	/// Snapshot of all pending requests.
	pub fn view_all(&self) -> Vec<TxRequest> {
		self.requests.read().values().map(|e| e.req.clone()).collect()
	}
}
