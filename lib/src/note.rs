
//! Server-issued bearer credits.
//!
//! A note entitles the bearer to mint a VTXO of the note's amount in a
//! later round, used to reclaim value of swept VTXOs. The server keeps a
//! set of issued note ids; redeeming deletes the id, so a note can be
//! redeemed at most once.

use std::fmt;
use std::str::FromStr;

use bitcoin::Amount;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::hex::{DisplayHex, FromHex};

/// The human-readable prefix of encoded notes.
pub const NOTE_PREFIX: &str = "arknote";

/// Identifier of a note, derived from its preimage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct NoteId(u64);

impl NoteId {
	pub fn from_preimage(preimage: &[u8; 32]) -> NoteId {
		let hash = sha256::Hash::hash(preimage);
		let mut buf = [0u8; 8];
		buf.copy_from_slice(&hash.as_byte_array()[0..8]);
		NoteId(u64::from_be_bytes(buf))
	}

	pub fn inner(&self) -> u64 {
		self.0
	}
}

impl fmt::Display for NoteId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{:016x}", self.0)
	}
}

/// A bearer credit issued by the server.
#[derive(Clone, PartialEq, Eq)]
pub struct Note {
	pub amount: Amount,
	pub preimage: [u8; 32],
}

impl Note {
	/// Issue a new note with a fresh random preimage.
	pub fn generate(amount: Amount) -> Note {
		Note {
			amount,
			preimage: rand::random(),
		}
	}

	pub fn id(&self) -> NoteId {
		NoteId::from_preimage(&self.preimage)
	}
}

impl fmt::Display for Note {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let mut buf = [0u8; 40];
		buf[0..8].copy_from_slice(&self.amount.to_sat().to_be_bytes());
		buf[8..40].copy_from_slice(&self.preimage);
		write!(f, "{}{}", NOTE_PREFIX, buf.as_hex())
	}
}

impl fmt::Debug for Note {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		// never print the preimage
		write!(f, "Note({}, {})", self.id(), self.amount)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid note encoding")]
pub struct NoteParseError;

impl FromStr for Note {
	type Err = NoteParseError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let hex = s.strip_prefix(NOTE_PREFIX).ok_or(NoteParseError)?;
		let buf = <[u8; 40]>::from_hex(hex).map_err(|_| NoteParseError)?;
		let mut amount = [0u8; 8];
		amount.copy_from_slice(&buf[0..8]);
		let mut preimage = [0u8; 32];
		preimage.copy_from_slice(&buf[8..40]);
		Ok(Note {
			amount: Amount::from_sat(u64::from_be_bytes(amount)),
			preimage,
		})
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn note_string_roundtrip() {
		let note = Note::generate(Amount::from_sat(10_000));
		let s = note.to_string();
		assert!(s.starts_with(NOTE_PREFIX));
		let parsed = Note::from_str(&s).unwrap();
		assert_eq!(parsed, note);
		assert_eq!(parsed.id(), note.id());
	}

	#[test]
	fn note_id_is_preimage_bound() {
		let a = Note::generate(Amount::from_sat(1));
		let b = Note::generate(Amount::from_sat(1));
		assert_ne!(a.id(), b.id());
		assert_eq!(a.id(), NoteId::from_preimage(&a.preimage));
	}

	#[test]
	fn debug_hides_preimage() {
		let note = Note::generate(Amount::from_sat(123));
		let dbg = format!("{:?}", note);
		assert!(!dbg.contains(&note.preimage.as_hex().to_string()));
	}
}
