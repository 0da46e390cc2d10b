//! UDP/UART fan-out relay: an epoll dataplane on its own thread plus a small
//! HTTP control API.

pub mod action;
pub mod config;
pub mod control;
pub mod counters;
pub mod dest;
pub mod engine;
pub mod ring;
pub mod sys;
pub mod uart;

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use anyhow::Context;
use log::{error, info, warn};
use thiserror::Error;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};

pub use action::{Action, ActionError, RelayAction};
pub use config::{RelayConfig, RelayConfigError, Source};
pub use control::UiAsset;
pub use engine::Engine;

use sys::Epoll;

/// epoll wait bound; also the latency of stop and queued-reload checks.
const LOOP_TICK_MS: i32 = 1000;

#[derive(Debug, Error)]
pub enum RelayError {
	#[error(transparent)]
	Config(#[from] RelayConfigError),
	#[error("binding control listener {addr}: {source}")]
	Bind {
		addr: SocketAddr,
		#[source]
		source: io::Error,
	},
	#[error("persisting {path}: {source}")]
	Persist {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
	pub config_path: PathBuf,
	pub ui_path: Option<PathBuf>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
	m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by the dataplane thread and the control API.
pub struct RelayShared {
	engine: Mutex<Engine>,
	epoll: Arc<Epoll>,
	config_path: PathBuf,
	/// Configured address of the live control listener.
	listening: Mutex<SocketAddr>,
	rebind: mpsc::UnboundedSender<std::net::TcpListener>,
	want_reload: AtomicBool,
	stop: AtomicBool,
	ui: Option<UiAsset>,
}

impl RelayShared {
	pub fn engine(&self) -> MutexGuard<'_, Engine> {
		lock(&self.engine)
	}

	pub fn config_path(&self) -> &Path {
		&self.config_path
	}

	pub fn ui(&self) -> Option<&UiAsset> {
		self.ui.as_ref()
	}

	/// Ask the dataplane thread to reload at the top of its next iteration.
	pub fn request_reload(&self) {
		self.want_reload.store(true, Ordering::SeqCst);
	}

	pub fn reload_from_disk(&self) -> Result<(), RelayError> {
		let cfg = RelayConfig::load(&self.config_path)?;
		let listener = self.prepare_listener(&cfg)?;
		self.engine().apply_config(cfg);
		self.install(listener);
		Ok(())
	}

	/// Validate `text`, apply it, then persist it. A failed write rolls the
	/// live state back to what is on disk.
	pub fn replace_config(&self, text: &str) -> Result<(), RelayError> {
		let cfg = RelayConfig::parse(text)?;
		let listener = self.prepare_listener(&cfg)?;
		self.engine().apply_config(cfg);
		if let Err(source) = config::persist(&self.config_path, text) {
			warn!(
				"persisting {} failed ({}), rolling back",
				self.config_path.display(),
				source
			);
			if let Err(e) = self.reload_from_disk() {
				error!("rollback failed: {}", e);
			}
			return Err(RelayError::Persist {
				path: self.config_path.clone(),
				source,
			});
		}
		self.install(listener);
		Ok(())
	}

	fn prepare_listener(
		&self,
		cfg: &RelayConfig,
	) -> Result<Option<(SocketAddr, std::net::TcpListener)>, RelayError> {
		let addr = cfg.http_addr();
		if *lock(&self.listening) == addr {
			return Ok(None);
		}
		let listener = std::net::TcpListener::bind(addr)
			.and_then(|l| l.set_nonblocking(true).map(|()| l))
			.map_err(|source| RelayError::Bind { addr, source })?;
		Ok(Some((addr, listener)))
	}

	fn install(&self, listener: Option<(SocketAddr, std::net::TcpListener)>) {
		let Some((addr, listener)) = listener else {
			return;
		};
		*lock(&self.listening) = addr;
		if self.rebind.send(listener).is_err() {
			warn!("control server gone, new listener on {} dropped", addr);
		}
	}
}

fn event_loop(shared: Arc<RelayShared>) {
	let mut ready = Vec::with_capacity(64);
	while !shared.stop.load(Ordering::SeqCst) {
		if shared.want_reload.swap(false, Ordering::SeqCst) {
			match shared.reload_from_disk() {
				Ok(()) => info!("relay config reloaded"),
				Err(e) => warn!("relay reload failed: {}", e),
			}
		}
		match shared.epoll.wait(LOOP_TICK_MS, &mut ready) {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => {
				error!("epoll_wait failed: {}", e);
				break;
			}
		}
		if !ready.is_empty() {
			shared.engine().process(&ready);
		}
	}
	info!("relay dataplane stopped");
}

/// A running relay: dataplane thread plus control server task.
pub struct RelayService {
	shared: Arc<RelayShared>,
	dataplane: Option<thread::JoinHandle<()>>,
	control: tokio::task::JoinHandle<io::Result<()>>,
	stop: watch::Sender<bool>,
	local_addr: SocketAddr,
}

impl RelayService {
	pub async fn start(opts: &RelayOptions) -> anyhow::Result<RelayService> {
		let cfg = RelayConfig::load(&opts.config_path)
			.with_context(|| format!("loading {}", opts.config_path.display()))?;
		let ui = opts.ui_path.as_deref().and_then(|p| match UiAsset::load(p) {
			Ok(ui) => Some(ui),
			Err(e) => {
				warn!("UI asset {} unavailable: {}", p.display(), e);
				None
			}
		});

		let addr = cfg.http_addr();
		let listener =
			std::net::TcpListener::bind(addr).with_context(|| format!("binding control API on {}", addr))?;
		listener.set_nonblocking(true)?;
		let local_addr = listener.local_addr()?;

		let epoll = Arc::new(Epoll::new().context("creating epoll instance")?);
		let mut engine = Engine::new(Arc::clone(&epoll));
		engine.apply_config(cfg);

		let (rebind_tx, rebind_rx) = mpsc::unbounded_channel();
		let shared = Arc::new(RelayShared {
			engine: Mutex::new(engine),
			epoll,
			config_path: opts.config_path.clone(),
			listening: Mutex::new(addr),
			rebind: rebind_tx,
			want_reload: AtomicBool::new(false),
			stop: AtomicBool::new(false),
			ui,
		});

		let dataplane = thread::Builder::new()
			.name("relay-dataplane".into())
			.spawn({
				let shared = Arc::clone(&shared);
				move || event_loop(shared)
			})
			.context("spawning dataplane thread")?;

		let (stop, stop_rx) = watch::channel(false);
		let control = tokio::spawn(control::serve(
			Arc::clone(&shared),
			tokio::net::TcpListener::from_std(listener)?,
			rebind_rx,
			stop_rx,
		));

		Ok(RelayService {
			shared,
			dataplane: Some(dataplane),
			control,
			stop,
			local_addr,
		})
	}

	pub fn shared(&self) -> &Arc<RelayShared> {
		&self.shared
	}

	/// Address the control API was first bound to.
	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub async fn shutdown(mut self) -> anyhow::Result<()> {
		self.shared.stop.store(true, Ordering::SeqCst);
		let _ = self.stop.send(true);
		let served = self.control.await.context("control server task")?;
		if let Some(handle) = self.dataplane.take() {
			tokio::task::spawn_blocking(move || handle.join())
				.await
				.context("joining dataplane")?
				.map_err(|_| anyhow::anyhow!("dataplane thread panicked"))?;
		}
		served.context("control server failed")
	}
}

/// Run the relay until SIGINT or SIGTERM; SIGHUP queues a reload.
pub async fn run(opts: RelayOptions) -> anyhow::Result<()> {
	let service = RelayService::start(&opts).await?;
	info!(
		"relay control API on http://{} (config {})",
		service.local_addr(),
		opts.config_path.display()
	);
	let mut hup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
	let stop = crate::shutdown_signal();
	tokio::pin!(stop);
	loop {
		tokio::select! {
			res = &mut stop => {
				if let Err(e) = res {
					warn!("signal handling failed: {:#}", e);
				}
				break;
			}
			_ = hup.recv() => {
				info!("SIGHUP: relay reload queued");
				service.shared().request_reload();
			}
		}
	}
	info!("relay shutting down");
	service.shutdown().await
}
