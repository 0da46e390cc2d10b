//! Cooperative LAN scanner and the node directory it maintains.

pub mod directory;
pub mod planner;
pub mod probe;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::clock::unix_now;
use crate::config::Settings;
use crate::netif::{self, Ipv4Subnet};
use crate::observability::MetricsRegistry;

pub use directory::{MAX_NODES, Node, NodeDirectory, NodeInfo};
use planner::PlanInputs;
use probe::{ProbeTimeouts, Prober};

/// Hard cap on probe workers per scan.
pub const MAX_CONCURRENCY: usize = 64;

/// Runtime-overridable probe tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTuning {
	pub connect_timeout_ms: u64,
	pub health_timeout_ms: u64,
	pub caps_timeout_ms: u64,
	pub concurrency: usize,
	pub stale_max_misses: u32,
}

impl Default for ScanTuning {
	fn default() -> Self {
		Self {
			connect_timeout_ms: 200,
			health_timeout_ms: 150,
			caps_timeout_ms: 400,
			concurrency: 16,
			stale_max_misses: 2,
		}
	}
}

impl ScanTuning {
	pub fn workers(&self) -> usize {
		self.concurrency.clamp(1, MAX_CONCURRENCY)
	}

	fn timeouts(&self) -> ProbeTimeouts {
		ProbeTimeouts {
			connect: Duration::from_millis(self.connect_timeout_ms),
			health: Duration::from_millis(self.health_timeout_ms),
			caps: Duration::from_millis(self.caps_timeout_ms),
		}
	}
}

/// What a scan needs from the live configuration.
#[derive(Debug, Clone)]
pub struct ScanConfig {
	pub port: u16,
	pub local: NodeInfo,
	pub extra_subnets: Vec<Ipv4Subnet>,
	pub tuning: ScanTuning,
}

impl ScanConfig {
	pub fn from_settings(s: &Settings) -> Self {
		Self {
			port: s.server.port,
			local: NodeInfo {
				role: s.caps.role.clone(),
				device: s.caps.device.clone(),
				version: s.caps.version.clone(),
				sync_id: s.sync.id.clone(),
			},
			extra_subnets: s.scan.extra_subnets.clone(),
			tuning: s.scan.tuning,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanStatus {
	pub scanning: bool,
	pub targets: usize,
	pub done: usize,
	pub progress_pct: u32,
	pub last_started: i64,
	pub last_finished: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStart {
	Started,
	AlreadyRunning,
}

impl ScanStart {
	pub fn as_str(&self) -> &'static str {
		match self {
			ScanStart::Started => "started",
			ScanStart::AlreadyRunning => "already_running",
		}
	}
}

/// Clears the running flag when a scan task ends, including by panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

/// Owns the node directory and runs at most one scan at a time.
pub struct Scanner {
	directory: Mutex<NodeDirectory>,
	running: AtomicBool,
	seq: AtomicU32,
	targets: AtomicUsize,
	done: AtomicUsize,
	last_started: AtomicI64,
	last_finished: AtomicI64,
	metrics: Arc<MetricsRegistry>,
}

impl Scanner {
	pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
		Self {
			directory: Mutex::new(NodeDirectory::new()),
			running: AtomicBool::new(false),
			seq: AtomicU32::new(0),
			targets: AtomicUsize::new(0),
			done: AtomicUsize::new(0),
			last_started: AtomicI64::new(0),
			last_finished: AtomicI64::new(0),
			metrics,
		}
	}

	/// Insert one self entry per non-loopback IPv4 interface.
	pub async fn seed_self(&self, cfg: &ScanConfig) {
		let interfaces = netif::non_loopback_interfaces();
		self.seed_addresses(cfg, interfaces.iter().map(|i| i.addr)).await;
	}

	async fn seed_addresses(&self, cfg: &ScanConfig, addrs: impl Iterator<Item = Ipv4Addr>) {
		let seq = self.seq.load(Ordering::SeqCst);
		let now = unix_now();
		let mut dir = self.directory.lock().await;
		for addr in addrs {
			if !dir.upsert(addr, cfg.port, &cfg.local, true, seq, now) {
				warn!("node directory full, self entry {} not recorded", addr);
			}
		}
		self.metrics.directory_nodes.set(dir.len() as i64);
	}

	/// Kick off a background scan unless one is already running.
	pub fn start_async(self: &Arc<Self>, cfg: ScanConfig) -> ScanStart {
		if self
			.running
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return ScanStart::AlreadyRunning;
		}
		self.metrics.scans_started.inc();
		let scanner = Arc::clone(self);
		tokio::spawn(async move {
			let _running = RunningGuard(&scanner.running);
			Arc::clone(&scanner).run_scan(cfg).await;
		});
		ScanStart::Started
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	pub fn status(&self) -> ScanStatus {
		let targets = self.targets.load(Ordering::SeqCst);
		let done = self.done.load(Ordering::SeqCst);
		let progress_pct = if targets == 0 {
			0
		} else {
			((done.min(targets) * 100) / targets) as u32
		};
		ScanStatus {
			scanning: self.is_running(),
			targets,
			done,
			progress_pct,
			last_started: self.last_started.load(Ordering::SeqCst),
			last_finished: self.last_finished.load(Ordering::SeqCst),
		}
	}

	pub async fn nodes(&self, max: usize) -> Vec<Node> {
		self.directory.lock().await.snapshot(max)
	}

	/// Probe one address now and record it on success.
	pub async fn probe_one(&self, ip: Ipv4Addr, port: u16, tuning: &ScanTuning) -> bool {
		let seq = self.seq.load(Ordering::SeqCst);
		self.probe_and_record(&Prober::new(tuning.timeouts()), ip, port, seq).await
	}

	async fn probe_and_record(&self, prober: &Prober, ip: Ipv4Addr, port: u16, seq: u32) -> bool {
		self.metrics.probes_total.inc();
		let Some(info) = prober.probe(ip, port).await else {
			return false;
		};
		self.metrics.probes_succeeded.inc();
		let mut dir = self.directory.lock().await;
		let stored = dir.upsert(ip, port, &info, false, seq, unix_now());
		self.metrics.directory_nodes.set(dir.len() as i64);
		if stored {
			debug!("peer {}:{} role={} sync_id={}", ip, port, info.role, info.sync_id);
		}
		stored
	}

	async fn run_scan(self: Arc<Self>, cfg: ScanConfig) {
		let seq = self.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
		self.last_started.store(unix_now(), Ordering::SeqCst);
		self.last_finished.store(0, Ordering::SeqCst);

		let known = self.directory.lock().await.known_addresses(cfg.port);
		let arp = match tokio::fs::read_to_string("/proc/net/arp").await {
			Ok(text) => planner::parse_arp_table(&text),
			Err(e) => {
				debug!("cannot read /proc/net/arp: {}", e);
				Vec::new()
			}
		};
		let interfaces = netif::ipv4_interfaces().unwrap_or_else(|e| {
			warn!("interface enumeration failed: {}", e);
			Vec::new()
		});
		let targets = Arc::new(planner::plan_targets(&PlanInputs {
			known: &known,
			arp: &arp,
			interfaces: &interfaces,
			extra_subnets: &cfg.extra_subnets,
		}));

		self.targets.store(targets.len(), Ordering::SeqCst);
		self.done.store(0, Ordering::SeqCst);
		self.seed_addresses(
			&cfg,
			interfaces
				.iter()
				.map(|i| i.addr)
				.filter(|a| !a.is_loopback()),
		)
		.await;

		info!(
			"scan {} started: {} targets, {} workers",
			seq,
			targets.len(),
			cfg.tuning.workers()
		);

		let next = Arc::new(AtomicUsize::new(0));
		let prober = Prober::new(cfg.tuning.timeouts());
		let workers = cfg.tuning.workers().min(targets.len().max(1));
		let mut handles = Vec::with_capacity(workers);
		for _ in 0..workers {
			let scanner = Arc::clone(&self);
			let targets = Arc::clone(&targets);
			let next = Arc::clone(&next);
			let prober = prober.clone();
			let port = cfg.port;
			handles.push(tokio::spawn(async move {
				loop {
					let i = next.fetch_add(1, Ordering::SeqCst);
					let Some(ip) = targets.get(i).copied() else {
						break;
					};
					scanner.probe_and_record(&prober, ip, port, seq).await;
					scanner.done.fetch_add(1, Ordering::SeqCst);
				}
			}));
		}
		for res in join_all(handles).await {
			if let Err(e) = res {
				warn!("scan worker failed: {}", e);
			}
		}

		let remaining = {
			let mut dir = self.directory.lock().await;
			dir.prune(seq, cfg.tuning.stale_max_misses);
			self.metrics.directory_nodes.set(dir.len() as i64);
			dir.len()
		};
		self.last_finished.store(unix_now(), Ordering::SeqCst);
		info!("scan {} finished: {} nodes in directory", seq, remaining);
	}
}
