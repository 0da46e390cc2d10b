pub mod clock;
pub mod config;
pub mod exec;
pub mod health;
pub mod netif;
pub mod observability;
pub mod relay;
pub mod scan;
pub mod server;
pub mod state;
pub mod sync;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

use crate::config::Settings;
use crate::exec::ExecPolicy;
use crate::scan::ScanConfig;
use crate::state::AppState;
use crate::sync::slave::SlaveWorker;

/// Resolve once SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() -> Result<()> {
	let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
	tokio::select! {
		res = tokio::signal::ctrl_c() => res.context("waiting for SIGINT")?,
		_ = term.recv() => {}
	}
	Ok(())
}

/// Run the control-plane daemon until a termination signal.
pub async fn run_autod(settings: Settings) -> Result<()> {
	let metrics = observability::init_metrics()?;
	let addr: SocketAddr = format!("{}:{}", settings.server.bind, settings.server.port)
		.parse()
		.with_context(|| format!("invalid bind address {}", settings.server.bind))?;
	let listener = TcpListener::bind(addr)
		.await
		.with_context(|| format!("binding {}", addr))?;
	run_with_listener(listener, settings, metrics).await
}

/// Same as [`run_autod`] on an already-bound listener.
pub async fn run_with_listener(
	listener: TcpListener,
	settings: Settings,
	metrics: Arc<observability::MetricsRegistry>,
) -> Result<()> {
	let (stop_tx, stop_rx) = watch::channel(false);
	tokio::spawn(async move {
		match shutdown_signal().await {
			Ok(()) => info!("shutdown requested"),
			Err(e) => warn!("signal handling failed: {:#}", e),
		}
		let _ = stop_tx.send(true);
	});
	serve_until(listener, AppState::new(settings, metrics), stop_rx).await
}

/// Run the UDP/UART relay until a termination signal.
pub async fn run_relay(opts: relay::RelayOptions) -> Result<()> {
	relay::run(opts).await
}

/// Start background work, serve HTTP until `stop` flips, then join workers.
pub async fn serve_until(
	listener: TcpListener,
	state: AppState,
	stop: watch::Receiver<bool>,
) -> Result<()> {
	let settings = state.settings().await;
	info!(
		"autod listening on {} (role={}, id={})",
		listener.local_addr()?,
		if settings.sync.role.is_empty() { "none" } else { &settings.sync.role },
		settings.sync.id
	);

	let scan_cfg = ScanConfig::from_settings(&settings);
	state.scanner.seed_self(&scan_cfg).await;
	if settings.server.enable_scan {
		state.scanner.start_async(scan_cfg);
	}

	let (slave_stop, slave_stop_rx) = watch::channel(false);
	let slave = SlaveWorker::spawn(state.clone(), slave_stop_rx);

	if !settings.startup.is_empty() {
		let runner = Arc::clone(&state.runner);
		let policy = ExecPolicy::from(&settings.exec);
		let commands = settings.startup.clone();
		tokio::spawn(async move {
			exec::run_startup_sequence(runner.as_ref(), &policy, &commands).await;
		});
	}

	let served = server::serve(listener, state, stop).await;
	let _ = slave_stop.send(true);
	slave.join().await;
	info!("autod stopped");
	served.context("http server failed")
}
