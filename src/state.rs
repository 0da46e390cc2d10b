use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::config::Settings;
use crate::exec::{CommandRunner, ExecPolicy, ProcessRunner};
use crate::observability::MetricsRegistry;
use crate::scan::{ScanConfig, Scanner};
use crate::sync::registry::MasterRegistry;
use crate::sync::slave::SlaveState;

/// Application state passed to handlers via Axum's `State` extractor.
///
/// Settings sit behind a `RwLock` because `/sync/bind` rewrites the slave's
/// master reference at runtime. The master registry has its own lock so a
/// registration never waits on a settings writer.
#[derive(Clone)]
pub struct AppState {
	pub settings: Arc<RwLock<Settings>>,
	pub scanner: Arc<Scanner>,
	pub master: Arc<Mutex<MasterRegistry>>,
	pub slave: Arc<SlaveState>,
	pub runner: Arc<dyn CommandRunner>,
	pub metrics: Arc<MetricsRegistry>,
}

impl AppState {
	pub fn new(settings: Settings, metrics: Arc<MetricsRegistry>) -> Self {
		let runner = Arc::new(ProcessRunner::new(Arc::clone(&metrics)));
		Self::with_runner(settings, metrics, runner)
	}

	pub fn with_runner(
		settings: Settings,
		metrics: Arc<MetricsRegistry>,
		runner: Arc<dyn CommandRunner>,
	) -> Self {
		Self {
			settings: Arc::new(RwLock::new(settings)),
			scanner: Arc::new(Scanner::new(Arc::clone(&metrics))),
			master: Arc::new(Mutex::new(MasterRegistry::new())),
			slave: Arc::new(SlaveState::default()),
			runner,
			metrics,
		}
	}

	/// A consistent copy of the current settings.
	pub async fn settings(&self) -> Settings {
		self.settings.read().await.clone()
	}

	pub async fn exec_policy(&self) -> ExecPolicy {
		ExecPolicy::from(&self.settings.read().await.exec)
	}

	pub async fn scan_config(&self) -> ScanConfig {
		ScanConfig::from_settings(&*self.settings.read().await)
	}
}
