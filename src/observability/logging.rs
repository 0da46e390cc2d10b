use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Output shape of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
	/// One JSON object per event
	Json,
	/// Compact human-readable lines
	#[default]
	Text,
}

/// Initialize logging to stderr. `log` records from library code are
/// bridged into the tracing subscriber.
pub fn init_logging(format: LogFormat) -> anyhow::Result<()> {
	// Get log level from environment or default to info
	let env_filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new("info"))
		.unwrap_or_else(|_| EnvFilter::new("info"));

	let registry = tracing_subscriber::registry().with(env_filter);

	let res = match format {
		LogFormat::Json => registry
			.with(
				tracing_subscriber::fmt::layer()
					.json()
					.with_writer(std::io::stderr)
					.with_target(true)
					.with_level(true)
					.with_thread_ids(true)
					.with_file(true)
					.with_line_number(true),
			)
			.try_init(),
		LogFormat::Text => registry
			.with(
				tracing_subscriber::fmt::layer()
					.compact()
					.with_writer(std::io::stderr)
					.with_target(true),
			)
			.try_init(),
	};
	res.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

	Ok(())
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	#[test]
	fn logging_initialization() {
		// Only one subscriber can be installed per process; a second call errors.
		let first = super::init_logging(super::LogFormat::Text);
		let second = super::init_logging(super::LogFormat::Json);
		assert!(first.is_ok() || second.is_err());
		assert!(second.is_err());
	}
}
