pub mod ini;

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::netif::Ipv4Subnet;
use crate::scan::ScanTuning;
use crate::sync::{SLOT_MAX_COMMANDS, SYNC_MAX_SLOTS};

pub use ini::{IniEntry, IniError};

/// Maximum `[announce] sse=` entries.
pub const MAX_SSE_ANNOUNCE: usize = 16;
/// Maximum `[scan] extra_subnet=` entries.
pub const MAX_EXTRA_SUBNETS: usize = 16;

const DEFAULT_CONFIG_NAME: &str = "autod.conf";

/// Runtime configuration for the control-plane daemon.
///
/// Values are loaded from an INI file (see [`Settings::load`]) and then
/// overlaid with environment variables prefixed with `AUTOD_`
/// (e.g. `AUTOD_PORT`, `AUTOD_SYNC_ROLE`).
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
	pub server: ServerSettings,
	pub exec: ExecSettings,
	pub caps: CapsSettings,
	pub announce: Vec<SseAnnounce>,
	pub scan: ScanSettings,
	pub ui: UiSettings,
	/// `[startup] exec=` command objects, run in order after the server starts.
	pub startup: Vec<serde_json::Value>,
	pub sync: SyncSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
	pub port: u16,
	pub bind: String,
	pub enable_scan: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSettings {
	pub interpreter: String,
	pub timeout_ms: u64,
	pub max_output_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsSettings {
	pub device: String,
	pub role: String,
	pub version: String,
	pub caps: Vec<String>,
	pub include_net_info: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseAnnounce {
	pub name: String,
	pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanSettings {
	pub extra_subnets: Vec<Ipv4Subnet>,
	pub tuning: ScanTuning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiSettings {
	pub path: String,
	pub serve: bool,
	pub public: bool,
}

/// One `[sync.slotN]` block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SlotConfig {
	pub name: String,
	pub prefer_id: String,
	/// Command templates (`{path, args?}` objects), passed to slaves verbatim.
	pub commands: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
	/// `master`, `slave`, or empty when sync is off.
	pub role: String,
	pub master_url: String,
	pub id: String,
	pub register_interval_s: i64,
	pub allow_bind: bool,
	pub slot_retention_s: i64,
	/// Always exactly [`SYNC_MAX_SLOTS`] entries.
	pub slots: Vec<SlotConfig>,
}

impl SyncSettings {
	pub fn is_master(&self) -> bool {
		self.role.eq_ignore_ascii_case("master")
	}

	pub fn is_slave(&self) -> bool {
		self.role.eq_ignore_ascii_case("slave")
	}
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			server: ServerSettings {
				port: 8080,
				bind: "0.0.0.0".to_string(),
				enable_scan: false,
			},
			exec: ExecSettings {
				interpreter: "/usr/bin/exec-handler.sh".to_string(),
				timeout_ms: 5000,
				max_output_bytes: 65536,
			},
			caps: CapsSettings {
				device: String::new(),
				role: String::new(),
				version: String::new(),
				caps: Vec::new(),
				include_net_info: true,
			},
			announce: Vec::new(),
			scan: ScanSettings::default(),
			ui: UiSettings {
				path: String::new(),
				serve: false,
				public: true,
			},
			startup: Vec::new(),
			sync: SyncSettings {
				role: String::new(),
				master_url: String::new(),
				id: String::new(),
				register_interval_s: 30,
				allow_bind: true,
				slot_retention_s: 0,
				slots: vec![SlotConfig::default(); SYNC_MAX_SLOTS],
			},
		}
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
}

/// Environment overrides mapped by the `config` crate from `AUTOD_*`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvOverrides {
	port: Option<u16>,
	bind: Option<String>,
	enable_scan: Option<bool>,
	sync_role: Option<String>,
	sync_master_url: Option<String>,
	sync_id: Option<String>,
}

impl Settings {
	/// Load settings from `path` (or the default search path), apply the
	/// environment overlay and fill in derived values.
	///
	/// A missing or unreadable file is not an error: defaults are used.
	pub fn load(path: Option<&Path>) -> Result<Settings, SettingsError> {
		let path = resolve_config_path(path);
		let mut settings = match std::fs::read_to_string(&path) {
			Ok(text) => {
				info!("loaded config from {}", path.display());
				Settings::from_ini_str(&text)
			}
			Err(e) => {
				warn!(
					"could not read config {} ({}), using defaults",
					path.display(),
					e
				);
				Settings::default()
			}
		};
		settings.apply_env()?;
		settings.ensure_sync_id();
		Ok(settings)
	}

	/// Build settings from INI text. Invalid values are logged and skipped.
	pub fn from_ini_str(text: &str) -> Settings {
		let mut s = Settings::default();
		for entry in ini::parse_lenient(text) {
			s.apply_entry(&entry);
		}
		s
	}

	fn apply_env(&mut self) -> Result<(), SettingsError> {
		let cfg = config::Config::builder()
			.add_source(config::Environment::with_prefix("AUTOD").try_parsing(true))
			.build()?;
		let env: EnvOverrides = cfg.try_deserialize()?;

		if let Some(p) = env.port.filter(|p| *p > 0) {
			self.server.port = p;
		}
		if let Some(b) = env.bind.filter(|b| !b.is_empty()) {
			self.server.bind = b;
		}
		if let Some(e) = env.enable_scan {
			self.server.enable_scan = e;
		}
		if let Some(r) = env.sync_role {
			self.sync.role = r;
		}
		if let Some(u) = env.sync_master_url {
			self.sync.master_url = u;
		}
		if let Some(id) = env.sync_id.filter(|id| !id.is_empty()) {
			self.sync.id = id;
		}
		Ok(())
	}

	/// Sync id falls back to the hostname, then to `autod-node`.
	pub fn ensure_sync_id(&mut self) {
		if !self.sync.id.is_empty() {
			return;
		}
		self.sync.id = hostname::get()
			.ok()
			.and_then(|s| s.into_string().ok())
			.filter(|s| !s.is_empty())
			.unwrap_or_else(|| "autod-node".to_string());
	}

	fn apply_entry(&mut self, e: &IniEntry) {
		let section = e.section.to_ascii_lowercase();
		let key = e.key.to_ascii_lowercase();
		let v = e.value.as_str();

		match (section.as_str(), key.as_str()) {
			("server", "port") => match parse_port(v) {
				Some(p) => self.server.port = p,
				None => warn!("[server] port={} is not in 1..65535, ignored", v),
			},
			("server", "bind") => self.server.bind = v.to_string(),
			("server", "enable_scan") => self.server.enable_scan = parse_flag(v),

			("exec", "interpreter") => self.exec.interpreter = v.to_string(),
			("exec", "timeout_ms") => {
				if let Some(n) = parse_positive(v) {
					self.exec.timeout_ms = n;
				}
			}
			("exec", "max_output_bytes") => {
				if let Some(n) = parse_positive(v) {
					self.exec.max_output_bytes = n as usize;
				}
			}

			("caps", "device") => self.caps.device = v.to_string(),
			("caps", "role") => self.caps.role = v.to_string(),
			("caps", "version") => self.caps.version = v.to_string(),
			("caps", "caps") => {
				self.caps.caps = v
					.split(',')
					.map(str::trim)
					.filter(|c| !c.is_empty())
					.map(str::to_string)
					.collect();
			}
			("caps", "include_net_info") => self.caps.include_net_info = parse_flag(v),

			("announce", "sse") => self.add_announce(v),

			("scan", "extra_subnet") | ("scan", "subnet") => self.add_subnet(v),
			("scan", "connect_timeout_ms") => {
				if let Some(n) = parse_positive(v) {
					self.scan.tuning.connect_timeout_ms = n;
				}
			}
			("scan", "health_timeout_ms") => {
				if let Some(n) = parse_positive(v) {
					self.scan.tuning.health_timeout_ms = n;
				}
			}
			("scan", "caps_timeout_ms") => {
				if let Some(n) = parse_positive(v) {
					self.scan.tuning.caps_timeout_ms = n;
				}
			}
			("scan", "concurrency") => {
				if let Some(n) = parse_positive(v) {
					self.scan.tuning.concurrency = n as usize;
				}
			}
			("scan", "stale_max_misses") => {
				if let Some(n) = parse_positive(v) {
					self.scan.tuning.stale_max_misses = n as u32;
				}
			}

			("ui", "ui_path") | ("ui", "path") => self.ui.path = v.to_string(),
			("ui", "serve_ui") => self.ui.serve = parse_flag(v),
			("ui", "ui_public") => self.ui.public = parse_flag(v),

			("startup", "exec") => match parse_command(v) {
				Some(cmd) => self.startup.push(cmd),
				None => warn!("[startup] exec on line {} is not a JSON object, ignored", e.line),
			},

			("sync", "role") => self.sync.role = v.to_string(),
			("sync", "master_url") => self.sync.master_url = v.to_string(),
			("sync", "id") => self.sync.id = v.to_string(),
			("sync", "register_interval_s") => {
				if let Some(n) = parse_positive(v) {
					self.sync.register_interval_s = n as i64;
				}
			}
			("sync", "allow_bind") => self.sync.allow_bind = parse_flag(v),
			("sync", "slot_retention_s") => {
				self.sync.slot_retention_s = v.parse::<i64>().unwrap_or(0).max(0)
			}

			(s, k) if s.starts_with("sync.slot") => self.apply_slot_entry(&s[9..], k, e),

			(s, k) => debug!("ignoring unknown config key [{}] {}", s, k),
		}
	}

	fn apply_slot_entry(&mut self, index: &str, key: &str, e: &IniEntry) {
		let idx = match index.parse::<usize>() {
			Ok(n) if (1..=SYNC_MAX_SLOTS).contains(&n) => n - 1,
			_ => {
				warn!(
					"[sync.slot{}] is outside 1..{}, ignored",
					index, SYNC_MAX_SLOTS
				);
				return;
			}
		};
		let slot = &mut self.sync.slots[idx];
		match key {
			"name" => slot.name = e.value.clone(),
			"prefer_id" => slot.prefer_id = e.value.clone(),
			"exec" | "command" => {
				if slot.commands.len() >= SLOT_MAX_COMMANDS {
					warn!(
						"[sync.slot{}] already has {} commands, extra ignored",
						idx + 1,
						SLOT_MAX_COMMANDS
					);
					return;
				}
				match parse_command(&e.value) {
					Some(cmd) => slot.commands.push(cmd),
					None => warn!(
						"[sync.slot{}] command on line {} is not a JSON object, ignored",
						idx + 1,
						e.line
					),
				}
			}
			other => debug!("ignoring unknown key {} in [sync.slot{}]", other, idx + 1),
		}
	}

	fn add_announce(&mut self, v: &str) {
		if v.is_empty() {
			return;
		}
		if self.announce.len() >= MAX_SSE_ANNOUNCE {
			warn!("more than {} sse announcements, extra ignored", MAX_SSE_ANNOUNCE);
			return;
		}
		let entry = match v.split_once('@') {
			Some((name, url)) if !name.trim().is_empty() && !url.trim().is_empty() => SseAnnounce {
				name: name.trim().to_string(),
				url: url.trim().to_string(),
			},
			_ => SseAnnounce {
				name: format!("sse{}", self.announce.len() + 1),
				url: v.to_string(),
			},
		};
		self.announce.push(entry);
	}

	fn add_subnet(&mut self, v: &str) {
		if self.scan.extra_subnets.len() >= MAX_EXTRA_SUBNETS {
			warn!("more than {} extra subnets, {} ignored", MAX_EXTRA_SUBNETS, v);
			return;
		}
		match v.parse::<Ipv4Subnet>() {
			Ok(net) => self.scan.extra_subnets.push(net),
			Err(e) => warn!("[scan] extra_subnet={} rejected: {}", v, e),
		}
	}
}

/// Explicit path wins; otherwise `./autod.conf`, the user config dir, then `/etc`.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
	if let Some(p) = explicit {
		return p.to_path_buf();
	}
	let local = PathBuf::from(DEFAULT_CONFIG_NAME);
	if local.exists() {
		return local;
	}
	if let Some(dir) = dirs::config_dir() {
		let user = dir.join("autod").join(DEFAULT_CONFIG_NAME);
		if user.exists() {
			return user;
		}
	}
	PathBuf::from("/etc").join(DEFAULT_CONFIG_NAME)
}

fn parse_flag(v: &str) -> bool {
	match v.to_ascii_lowercase().as_str() {
		"true" | "yes" | "on" => true,
		other => other.parse::<i64>().map(|n| n != 0).unwrap_or(false),
	}
}

fn parse_port(v: &str) -> Option<u16> {
	v.parse::<u16>().ok().filter(|p| *p > 0)
}

fn parse_positive(v: &str) -> Option<u64> {
	v.parse::<i64>().ok().filter(|n| *n > 0).map(|n| n as u64)
}

fn parse_command(v: &str) -> Option<serde_json::Value> {
	serde_json::from_str::<serde_json::Value>(v)
		.ok()
		.filter(|val| val.is_object())
}
