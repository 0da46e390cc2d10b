use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Central registry for all Prometheus metrics
pub struct MetricsRegistry {
	registry: Registry,

	// Scanner
	pub scans_started: IntCounter,
	pub probes_total: IntCounter,
	pub probes_succeeded: IntCounter,
	pub directory_nodes: IntGauge,

	// Sync master / slave
	pub sync_registrations_total: IntCounter,
	pub sync_registry_full_total: IntCounter,
	pub sync_push_batches_total: IntCounter,
	pub sync_register_failures_total: IntCounter,
	pub sync_commands_applied_total: IntCounter,

	// Exec helper
	pub exec_runs_total: IntCounter,
	pub exec_timeouts_total: IntCounter,
	pub exec_duration_seconds: Histogram,
}

fn counter(name: &str, help: &str) -> prometheus::Result<IntCounter> {
	IntCounter::with_opts(Opts::new(name, help).namespace("autod"))
}

impl MetricsRegistry {
	pub fn new() -> prometheus::Result<Self> {
		let registry = Registry::new();

		let scans_started = counter("scans_started_total", "LAN scans started")?;
		let probes_total = counter("probes_total", "Peer probes attempted")?;
		let probes_succeeded = counter("probes_succeeded_total", "Peer probes that found a node")?;
		let directory_nodes = IntGauge::with_opts(
			Opts::new("directory_nodes", "Entries in the node directory").namespace("autod"),
		)?;

		let sync_registrations_total =
			counter("sync_registrations_total", "Slave registrations handled by the master")?;
		let sync_registry_full_total =
			counter("sync_registry_full_total", "Registrations refused because the registry is full")?;
		let sync_push_batches_total =
			counter("sync_push_batches_total", "Operator push batches applied")?;
		let sync_register_failures_total = counter(
			"sync_register_failures_total",
			"Slave registration attempts that failed",
		)?;
		let sync_commands_applied_total = counter(
			"sync_commands_applied_total",
			"Slot command batches applied by this slave",
		)?;

		let exec_runs_total = counter("exec_runs_total", "Subprocesses started by the exec helper")?;
		let exec_timeouts_total =
			counter("exec_timeouts_total", "Subprocesses killed after their time budget")?;
		let exec_duration_seconds = Histogram::with_opts(
			HistogramOpts::new("exec_duration_seconds", "Wall-clock duration of exec runs")
				.namespace("autod")
				.buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
		)?;

		registry.register(Box::new(scans_started.clone()))?;
		registry.register(Box::new(probes_total.clone()))?;
		registry.register(Box::new(probes_succeeded.clone()))?;
		registry.register(Box::new(directory_nodes.clone()))?;
		registry.register(Box::new(sync_registrations_total.clone()))?;
		registry.register(Box::new(sync_registry_full_total.clone()))?;
		registry.register(Box::new(sync_push_batches_total.clone()))?;
		registry.register(Box::new(sync_register_failures_total.clone()))?;
		registry.register(Box::new(sync_commands_applied_total.clone()))?;
		registry.register(Box::new(exec_runs_total.clone()))?;
		registry.register(Box::new(exec_timeouts_total.clone()))?;
		registry.register(Box::new(exec_duration_seconds.clone()))?;

		Ok(Self {
			registry,
			scans_started,
			probes_total,
			probes_succeeded,
			directory_nodes,
			sync_registrations_total,
			sync_registry_full_total,
			sync_push_batches_total,
			sync_register_failures_total,
			sync_commands_applied_total,
			exec_runs_total,
			exec_timeouts_total,
			exec_duration_seconds,
		})
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				log::error!("Failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}

/// Build the process-wide metrics registry
pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
	Ok(Arc::new(MetricsRegistry::new()?))
}
