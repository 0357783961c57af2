
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use log::info;

use arkd::config::Network;
use arkd::database::MemoryStore;
use arkd::dev::{MemoryExplorer, MemoryWallet};
use arkd::{Config, Server};

fn usage() -> ! {
	eprintln!("usage: arkd [--config <path>]");
	std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	env_logger::Builder::from_env(
		env_logger::Env::default().default_filter_or("info"),
	).init();

	let mut config_path: Option<PathBuf> = None;
	let mut args = std::env::args().skip(1);
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--config" => config_path = Some(args.next().unwrap_or_else(|| usage()).into()),
			_ => usage(),
		}
	}

	let config = Config::load(config_path.as_deref()).context("failed to load config")?;

	// The daemon currently ships with in-memory backends only, which is
	// fine for regtest experimentation. Production deployments embed the
	// server as a library and inject their own storage, wallet and
	// explorer adapters.
	if config.network != Network::Regtest {
		anyhow::bail!("the arkd binary only supports regtest; \
			embed the server as a library for other networks");
	}

	let store = Arc::new(MemoryStore::new());
	let wallet = Arc::new(MemoryWallet::new(config.network.to_bitcoin()));
	let explorer = Arc::new(MemoryExplorer::new());

	let server = Server::start(config, store, wallet, explorer).await
		.context("failed to start server")?;
	info!("arkd running, server pubkey {}", server.server_pubkey());

	server.wait_shutdown().await;
	info!("arkd terminated gracefully");
	Ok(())
}
