
//! Serde helpers for config types.

pub mod duration {
	use std::time::Duration;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_u64(d.as_secs())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		Ok(Duration::from_secs(u64::deserialize(d)?))
	}
}

pub mod amount_opt {
	use bitcoin::Amount;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(a: &Option<Amount>, s: S) -> Result<S::Ok, S::Error> {
		match a {
			Some(a) => s.serialize_some(&a.to_sat()),
			None => s.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Amount>, D::Error> {
		Ok(Option::<u64>::deserialize(d)?.map(Amount::from_sat))
	}
}
