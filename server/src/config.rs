
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bitcoin::Amount;
use config::{Environment, File};

use ark::BlockDelta;

/// The unit the sweeper uses to schedule expiries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepUnit {
	Blockheight,
	Timestamp,
}

/// The bitcoin network the server operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
	Mainnet,
	Testnet,
	Regtest,
	Mutinynet,
}

impl Network {
	pub fn to_bitcoin(self) -> bitcoin::Network {
		match self {
			Network::Mainnet => bitcoin::Network::Bitcoin,
			Network::Testnet => bitcoin::Network::Testnet,
			Network::Regtest => bitcoin::Network::Regtest,
			// mutinynet is a signet variant
			Network::Mutinynet => bitcoin::Network::Signet,
		}
	}
}

impl fmt::Display for Network {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Network::Mainnet => f.write_str("mainnet"),
			Network::Testnet => f.write_str("testnet"),
			Network::Regtest => f.write_str("regtest"),
			Network::Mutinynet => f.write_str("mutinynet"),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	pub data_dir: PathBuf,
	pub network: Network,

	/// The period between rounds.
	#[serde(with = "crate::serde_util::duration")]
	pub round_interval: Duration,
	/// How long clients have to confirm their intents after a round tick.
	#[serde(with = "crate::serde_util::duration")]
	pub registration_window: Duration,
	/// How long cosigners have to submit nonces and partial signatures.
	#[serde(with = "crate::serde_util::duration")]
	pub signing_window: Duration,
	/// How long owners have to submit their forfeit txs.
	#[serde(with = "crate::serde_util::duration")]
	pub forfeit_window: Duration,
	/// Retry budget for wallet finalize and broadcast.
	#[serde(with = "crate::serde_util::duration")]
	pub broadcast_window: Duration,

	/// Whether expiries are tracked by block height or unix time.
	pub sweep_unit: SweepUnit,
	/// Relative lifetime of tree outputs before the server may sweep
	/// them, in blocks or seconds depending on [Config::sweep_unit].
	pub vtxo_expiry: u32,
	/// The CSV delay on unilateral exits.
	pub unroll_delay: BlockDelta,
	/// Fee budget per tree transaction.
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub min_relay_fee: Amount,

	/// Flat fee allowed to be deducted by redeem txs.
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub redeem_fee: Amount,
	/// Maximum number of output VTXOs per round.
	pub max_output_vtxos: usize,
	/// Maximum value any VTXO can have.
	#[serde(default, with = "crate::serde_util::amount_opt")]
	pub max_vtxo_amount: Option<Amount>,

	/// Requests whose last ping is older than this are skipped by a
	/// round.
	#[serde(with = "crate::serde_util::duration")]
	pub request_select_gap: Duration,
	/// Requests whose last ping is older than this are deleted.
	#[serde(with = "crate::serde_util::duration")]
	pub request_delete_gap: Duration,

	/// The interval at which the sweeper checks its task heap.
	#[serde(with = "crate::serde_util::duration")]
	pub sweep_check_interval: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			data_dir: PathBuf::from("./arkd-data"),
			network: Network::Regtest,
			round_interval: Duration::from_secs(60),
			registration_window: Duration::from_secs(30),
			signing_window: Duration::from_secs(30),
			forfeit_window: Duration::from_secs(30),
			broadcast_window: Duration::from_secs(10),
			sweep_unit: SweepUnit::Blockheight,
			vtxo_expiry: 144 * 30,
			unroll_delay: 144,
			min_relay_fee: Amount::from_sat(1_000),
			redeem_fee: Amount::ZERO,
			max_output_vtxos: 512,
			max_vtxo_amount: None,
			request_select_gap: Duration::from_secs(60),
			request_delete_gap: Duration::from_secs(5 * 60),
			sweep_check_interval: Duration::from_secs(60),
		}
	}
}

impl Config {
	/// Load the config from an optional TOML file with `ARKD_`
	/// environment overrides on top.
	pub fn load(file: Option<&Path>) -> anyhow::Result<Config> {
		let defaults = config::Config::try_from(&Config::default())
			.context("error building default configuration")?;
		let mut builder = config::Config::builder().add_source(defaults);
		if let Some(path) = file {
			builder = builder.add_source(File::from(path));
		}
		let cfg = builder
			.add_source(Environment::with_prefix("ARKD").separator("__"))
			.build()
			.context("error reading configuration")?;
		let ret: Config = cfg.try_deserialize().context("invalid configuration")?;
		ret.validate()?;
		Ok(ret)
	}

	pub fn validate(&self) -> anyhow::Result<()> {
		if self.registration_window >= self.round_interval {
			bail!("registration_window must be shorter than round_interval");
		}
		if self.min_relay_fee == Amount::ZERO {
			bail!("min_relay_fee may not be zero");
		}
		if self.unroll_delay == 0 {
			bail!("unroll_delay may not be zero");
		}
		Ok(())
	}
}
