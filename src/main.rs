use std::path::PathBuf;

use anyhow::Context;
use autod::config::Settings;
use autod::observability::{LogFormat, init_logging};
use autod::relay::{RelayOptions, config::DEFAULT_CONFIG_PATH};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "autod", version, about = "autod - LAN control plane and UDP/UART relay")]
struct Cli {
	/// Log output format
	#[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
	log_format: LogFormat,
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the control-plane daemon (default)
	Serve {
		/// INI config file; defaults to ./autod.conf, then the user config dir, then /etc/autod.conf
		#[arg(long, env = "AUTOD_CONFIG")]
		config: Option<PathBuf>,
	},
	/// Run the UDP/UART fan-out relay
	Relay {
		/// Relay INI config file
		#[arg(long, default_value = DEFAULT_CONFIG_PATH)]
		config: PathBuf,
		/// HTML (optionally gzipped) served at / and /ui
		#[arg(long)]
		ui: Option<PathBuf>,
	},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	init_logging(cli.log_format)?;

	match cli.command.unwrap_or(Commands::Serve { config: None }) {
		Commands::Serve { config } => {
			let settings = Settings::load(config.as_deref()).context("loading settings")?;
			autod::run_autod(settings).await
		}
		Commands::Relay { config, ui } => {
			autod::run_relay(RelayOptions {
				config_path: config,
				ui_path: ui,
			})
			.await
		}
	}
}
