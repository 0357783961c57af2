
use std::sync::Arc;
use std::sync::atomic::{self, AtomicUsize};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A struct to be held in scope while a process is working.
pub struct RuntimeWorker {
	mgr: RuntimeManager,
	name: String,
	critical: bool,
}

impl std::ops::Drop for RuntimeWorker {
	fn drop(&mut self) {
		self.mgr.drop_worker(&self.name, self.critical);
	}
}

struct Inner {
	shutdown: CancellationToken,
	workers: AtomicUsize,
	notify: Notify,
}

/// Manager of task coordination during runtime.
#[derive(Clone)]
pub struct RuntimeManager {
	inner: Arc<Inner>,
}

impl RuntimeManager {
	pub fn new() -> RuntimeManager {
		RuntimeManager {
			inner: Arc::new(Inner {
				shutdown: CancellationToken::new(),
				workers: AtomicUsize::new(0),
				notify: Notify::new(),
			}),
		}
	}

	/// Runs a task that will watch for SIGTERM and ctrl-c signals.
	///
	/// Upon receipt it calls [RuntimeManager::shutdown] and exits the
	/// process forcibly if shutdown doesn't finish within `timeout`.
	pub fn run_shutdown_signal_listener(&self, timeout: Duration) {
		let rt = self.clone();
		tokio::spawn(async move {
			let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
				.expect("failed to listen for SIGTERM");

			tokio::select! {
				_ = sigterm.recv() => info!("SIGTERM received, sending shutdown signal..."),
				r = signal::ctrl_c() => match r {
					Ok(()) => info!("Ctrl+C received, sending shutdown signal..."),
					Err(e) => panic!("failed to listen to ctrl-c signal: {e:#}"),
				},
			}

			rt.shutdown();
			let deadline = Instant::now() + timeout;
			while !rt.shutdown_done() {
				if Instant::now() >= deadline {
					error!("Graceful shutdown took too long, exiting...");
					std::process::exit(0);
				}
				tokio::time::sleep(Duration::from_secs(1)).await;
			}
		});
	}

	fn drop_worker(&self, name: &str, critical: bool) {
		let old = self.inner.workers.fetch_sub(1, atomic::Ordering::SeqCst);
		assert_ne!(old, 0);
		self.inner.notify.notify_waiters();

		if critical && !self.inner.shutdown.is_cancelled() {
			warn!("Critical worker '{}' stopped, initiating shutdown", name);
			self.shutdown();
		} else {
			info!("Worker '{}' stopped", name);
		}
	}

	fn inner_spawn(&self, name: impl Into<String>, critical: bool) -> RuntimeWorker {
		self.inner.workers.fetch_add(1, atomic::Ordering::SeqCst);
		self.inner.notify.notify_waiters();
		let name = name.into();
		info!("Worker '{}' started", name);
		RuntimeWorker { mgr: self.clone(), name, critical }
	}

	/// Register a worker; dropping the returned guard deregisters it.
	pub fn spawn(&self, name: impl Into<String>) -> RuntimeWorker {
		self.inner_spawn(name, false)
	}

	/// Register a critical worker: if it stops before shutdown was
	/// requested, the whole process shuts down.
	pub fn spawn_critical(&self, name: impl Into<String>) -> RuntimeWorker {
		self.inner_spawn(name, true)
	}

	pub fn shutdown(&self) {
		self.inner.shutdown.cancel();
	}

	/// Future that resolves when shutdown is initiated.
	pub async fn shutdown_signal(&self) {
		self.inner.shutdown.cancelled().await
	}

	pub fn shutdown_done(&self) -> bool {
		self.inner.shutdown.is_cancelled()
			&& self.inner.workers.load(atomic::Ordering::SeqCst) == 0
	}

	/// Wait until all workers have stopped after a shutdown request.
	pub async fn wait_done(&self) {
		loop {
			if self.shutdown_done() {
				return;
			}
			self.inner.notify.notified().await;
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn workers_block_shutdown_done() {
		let rtmgr = RuntimeManager::new();
		let worker = rtmgr.spawn_critical("test");
		rtmgr.shutdown();
		assert!(!rtmgr.shutdown_done());
		drop(worker);
		assert!(rtmgr.shutdown_done());
		rtmgr.wait_done().await;
	}

	#[tokio::test]
	async fn critical_worker_drop_triggers_shutdown() {
		let rtmgr = RuntimeManager::new();
		let worker = rtmgr.spawn_critical("test");
		drop(worker);
		rtmgr.shutdown_signal().await;
		assert!(rtmgr.shutdown_done());
	}
}
