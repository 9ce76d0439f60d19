// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use tokio::sync::mpsc;

/// How the process was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
	/// Stop accepting new requests, let in-flight requests finish up to the drain deadline.
	Graceful,
	/// Stop now.
	Immediate,
}

pub struct Shutdown {
	shutdown_tx: mpsc::Sender<ShutdownMode>,
	shutdown_rx: mpsc::Receiver<ShutdownMode>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
		Shutdown {
			shutdown_tx,
			shutdown_rx,
		}
	}

	/// Trigger returns a ShutdownTrigger which can be used to trigger a shutdown immediately.
	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			shutdown_tx: self.shutdown_tx.clone(),
		}
	}

	/// Wait completes when a shutdown has been requested, and reports how to stop.
	pub async fn wait(mut self) -> ShutdownMode {
		imp::shutdown(&mut self.shutdown_rx).await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	shutdown_tx: mpsc::Sender<ShutdownMode>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.shutdown_tx.send(ShutdownMode::Immediate).await;
	}

	pub async fn shutdown_drain(&self) {
		let _ = self.shutdown_tx.send(ShutdownMode::Graceful).await;
	}
}

#[cfg(unix)]
mod imp {
	use super::ShutdownMode;
	use tokio::signal::unix::{SignalKind, signal};
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn shutdown(receiver: &mut Receiver<ShutdownMode>) -> ShutdownMode {
		tokio::select! {
			_ = watch_signal(SignalKind::user_defined1(), "SIGUSR1") => ShutdownMode::Graceful,
			_ = watch_signal(SignalKind::user_defined2(), "SIGUSR2") => ShutdownMode::Immediate,
			_ = watch_signal(SignalKind::interrupt(), "SIGINT") => ShutdownMode::Immediate,
			_ = watch_signal(SignalKind::terminate(), "SIGTERM") => ShutdownMode::Immediate,
			res = receiver.recv() => {
				info!("received explicit shutdown request");
				res.unwrap_or(ShutdownMode::Immediate)
			}
		}
	}

	async fn watch_signal(kind: SignalKind, name: &'static str) {
		signal(kind)
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received signal {}, starting shutdown", name);
	}
}

#[cfg(not(unix))]
mod imp {
	use super::ShutdownMode;
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn shutdown(receiver: &mut Receiver<ShutdownMode>) -> ShutdownMode {
		tokio::select! {
			_ = watch_signal() => ShutdownMode::Immediate,
			res = receiver.recv() => {
				info!("received explicit shutdown request");
				res.unwrap_or(ShutdownMode::Immediate)
			}
		}
	}

	// This isn't quite right, but close enough for windows...
	async fn watch_signal() {
		tokio::signal::windows::ctrl_c()
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received signal, starting shutdown");
	}
}
