
//! Tracking of VTXOs that are being processed.
//!
//! The round coordinator claims its batch inputs while finalizing, so
//! the redeem path can fail fast instead of racing the round at the
//! ledger.

use std::collections::HashSet;

use parking_lot::Mutex;

use ark::VtxoId;

#[derive(Default)]
pub struct VtxosInFlux {
	set: Mutex<HashSet<VtxoId>>,
}

impl VtxosInFlux {
	pub fn new() -> VtxosInFlux {
		VtxosInFlux::default()
	}

	/// Claim all the given ids, or none if any is already claimed.
	///
	/// Returns the offending id on failure.
	pub fn claim(&self, ids: &[VtxoId]) -> Result<(), VtxoId> {
		let mut set = self.set.lock();
		if let Some(id) = ids.iter().find(|id| set.contains(id)) {
			return Err(*id);
		}
		set.extend(ids.iter().copied());
		Ok(())
	}

	pub fn release(&self, ids: &[VtxoId]) {
		let mut set = self.set.lock();
		for id in ids {
			set.remove(id);
		}
	}

	pub fn contains(&self, id: VtxoId) -> bool {
		self.set.lock().contains(&id)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use bitcoin::OutPoint;
	use bitcoin::hashes::Hash;

	#[test]
	fn claim_is_all_or_nothing() {
		let flux = VtxosInFlux::new();
		let a = VtxoId::from(OutPoint::new(bitcoin::Txid::all_zeros(), 0));
		let b = VtxoId::from(OutPoint::new(bitcoin::Txid::all_zeros(), 1));
		let c = VtxoId::from(OutPoint::new(bitcoin::Txid::all_zeros(), 2));

		flux.claim(&[a]).unwrap();
		assert_eq!(flux.claim(&[b, a, c]), Err(a));
		// the failed claim must not leave b or c claimed
		assert!(!flux.contains(b));
		assert!(!flux.contains(c));

		flux.release(&[a]);
		flux.claim(&[b, a, c]).unwrap();
	}
}
