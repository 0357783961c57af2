
//! Stable wire encodings of protocol objects.
//!
//! The MuSig2 nonce and signature matrices cross the client-server
//! boundary every round, so their encoding must be stable across
//! versions; serde representations are not. Everything here round-trips
//! byte-identically.

use std::{fmt, io};

use bitcoin::Amount;

use crate::musig::{AggNonce, PartialSignature, PubNonce};
use crate::note::Note;
use crate::vtxo::VtxoId;

/// Maximum number of elements a decoded vector may have.
pub const MAX_VEC_SIZE: usize = 100_000;

/// Error occuring during protocol decoding.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolDecodingError {
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
	#[error("invalid protocol encoding: {message}")]
	Invalid {
		message: String,
	},
}

impl ProtocolDecodingError {
	/// Create a new [ProtocolDecodingError::Invalid] with the given message.
	pub fn invalid(message: impl fmt::Display) -> Self {
		Self::Invalid { message: message.to_string() }
	}
}

/// Trait for encoding objects according to the protocol encoding.
pub trait ProtocolEncoding: Sized {
	/// Encode the object into the writer.
	fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<(), io::Error>;

	/// Decode the object from the reader.
	fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, ProtocolDecodingError>;

	/// Serialize the object into a byte vector.
	fn serialize(&self) -> Vec<u8> {
		let mut buf = Vec::new();
		self.encode(&mut buf).expect("vec write");
		buf
	}

	/// Deserialize the object from a byte slice, requiring all bytes
	/// to be consumed.
	fn deserialize(mut bytes: &[u8]) -> Result<Self, ProtocolDecodingError> {
		let ret = Self::decode(&mut bytes)?;
		if !bytes.is_empty() {
			return Err(ProtocolDecodingError::invalid("trailing bytes"));
		}
		Ok(ret)
	}
}

fn read_array<const N: usize, R: io::Read + ?Sized>(
	r: &mut R,
) -> Result<[u8; N], ProtocolDecodingError> {
	let mut buf = [0u8; N];
	r.read_exact(&mut buf)?;
	Ok(buf)
}

impl ProtocolEncoding for PubNonce {
	fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(&self.serialize())
	}
	fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, ProtocolDecodingError> {
		let buf = read_array::<66, _>(r)?;
		PubNonce::from_bytes(&buf)
			.map_err(|e| ProtocolDecodingError::invalid(format_args!("public nonce: {}", e)))
	}
}

impl ProtocolEncoding for AggNonce {
	fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(&self.serialize())
	}
	fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, ProtocolDecodingError> {
		let buf = read_array::<66, _>(r)?;
		AggNonce::from_bytes(&buf)
			.map_err(|e| ProtocolDecodingError::invalid(format_args!("aggregate nonce: {}", e)))
	}
}

impl ProtocolEncoding for PartialSignature {
	fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(&self.serialize())
	}
	fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, ProtocolDecodingError> {
		let buf = read_array::<32, _>(r)?;
		PartialSignature::from_slice(&buf)
			.map_err(|e| ProtocolDecodingError::invalid(format_args!("partial sig: {}", e)))
	}
}

impl ProtocolEncoding for VtxoId {
	fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(&self.to_bytes())
	}
	fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, ProtocolDecodingError> {
		let buf = read_array::<36, _>(r)?;
		VtxoId::from_slice(&buf).map_err(ProtocolDecodingError::invalid)
	}
}

impl ProtocolEncoding for Note {
	fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(&self.amount.to_sat().to_le_bytes())?;
		w.write_all(&self.preimage)
	}
	fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, ProtocolDecodingError> {
		let amount = u64::from_le_bytes(read_array::<8, _>(r)?);
		let preimage = read_array::<32, _>(r)?;
		Ok(Note { amount: Amount::from_sat(amount), preimage })
	}
}

impl<T: ProtocolEncoding> ProtocolEncoding for Option<T> {
	fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<(), io::Error> {
		match self {
			Some(v) => {
				w.write_all(&[1])?;
				v.encode(w)
			},
			None => w.write_all(&[0]),
		}
	}
	fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, ProtocolDecodingError> {
		match read_array::<1, _>(r)?[0] {
			0 => Ok(None),
			1 => Ok(Some(T::decode(r)?)),
			b => Err(ProtocolDecodingError::invalid(format_args!("invalid option tag {}", b))),
		}
	}
}

impl<T: ProtocolEncoding> ProtocolEncoding for Vec<T> {
	fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(&(self.len() as u32).to_le_bytes())?;
		for item in self {
			item.encode(w)?;
		}
		Ok(())
	}
	fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, ProtocolDecodingError> {
		let len = u32::from_le_bytes(read_array::<4, _>(r)?) as usize;
		if len > MAX_VEC_SIZE {
			return Err(ProtocolDecodingError::invalid("oversized vector"));
		}
		let mut ret = Vec::with_capacity(len);
		for _ in 0..len {
			ret.push(T::decode(r)?);
		}
		Ok(ret)
	}
}
