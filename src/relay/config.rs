//! Relay configuration: a flat INI file of tuning keys, `bind=` lines and
//! `uartN_*` line settings.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use super::dest::{DestError, MAX_UARTS, Target, parse_dest_list, parse_uart_token};
use crate::config::ini::{self, IniError};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/udp_relay.conf";
pub const MAX_BINDS: usize = 64;

const SOCKET_BUF_MIN: u32 = 1024;
const SOCKET_BUF_MAX: u32 = 64 * 1024 * 1024;
const BUFSZ_MIN: usize = 512;
const BUFSZ_MAX: usize = 64 * 1024;

/// Where a relay receives from. Its `Display` form is the relay id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
	Udp(u16),
	Uart(usize),
}

impl fmt::Display for Source {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Source::Udp(port) => write!(f, "{}", port),
			Source::Uart(n) => write!(f, "uart[{}]", n),
		}
	}
}

impl Source {
	pub fn parse(s: &str) -> Option<Source> {
		let s = s.trim();
		if let Some(n) = parse_uart_token(s) {
			return Some(Source::Uart(n));
		}
		s.parse::<u16>().ok().filter(|p| *p > 0).map(Source::Udp)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
	pub source: Source,
	pub dests: Vec<Target>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
	None,
	Even,
	Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
	None,
	RtsCts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UartConfig {
	pub index: usize,
	pub device: String,
	pub baud: u32,
	pub databits: u8,
	pub parity: Parity,
	pub stopbits: u8,
	pub flow: Flow,
	pub tx_buf: usize,
	pub rx_buf: usize,
}

impl UartConfig {
	pub fn new(index: usize) -> Self {
		Self {
			index,
			device: String::new(),
			baud: 115_200,
			databits: 8,
			parity: Parity::None,
			stopbits: 1,
			flow: Flow::None,
			tx_buf: 65_536,
			rx_buf: 4096,
		}
	}

	pub fn is_configured(&self) -> bool {
		!self.device.is_empty()
	}
}

/// Socket tuning applied to every relay listener. Zero means "leave the
/// kernel default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketTuning {
	pub rcvbuf: u32,
	pub sndbuf: u32,
	pub tos: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
	pub http_bind: Ipv4Addr,
	pub control_port: u16,
	pub src_ip: Ipv4Addr,
	pub tuning: SocketTuning,
	pub bufsz: usize,
	pub binds: Vec<BindSpec>,
	pub uarts: Vec<UartConfig>,
}

impl Default for RelayConfig {
	fn default() -> Self {
		Self {
			http_bind: Ipv4Addr::LOCALHOST,
			control_port: 9000,
			src_ip: Ipv4Addr::UNSPECIFIED,
			tuning: SocketTuning::default(),
			bufsz: 9000,
			binds: Vec::new(),
			uarts: (0..MAX_UARTS).map(UartConfig::new).collect(),
		}
	}
}

#[derive(Debug, Error)]
pub enum RelayConfigError {
	#[error(transparent)]
	Syntax(#[from] IniError),
	#[error("line {line}: bad bind source {value:?}")]
	BadBind { line: usize, value: String },
	#[error("line {line}: {source}")]
	BadDest {
		line: usize,
		#[source]
		source: DestError,
	},
	#[error("line {line}: {key}={value} is out of range")]
	BadValue {
		line: usize,
		key: String,
		value: String,
	},
	#[error("line {line}: a uart-bound relay cannot forward to a uart")]
	UartToUart { line: usize },
	#[error("line {line}: source {source_id} is bound twice")]
	DuplicateSource { line: usize, source_id: String },
	#[error("reading {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
}

impl RelayConfig {
	pub fn http_addr(&self) -> SocketAddr {
		SocketAddr::from((self.http_bind, self.control_port))
	}

	/// Parse relay INI text. Any malformed line rejects the whole document.
	pub fn parse(text: &str) -> Result<RelayConfig, RelayConfigError> {
		let mut cfg = RelayConfig::default();
		for e in ini::parse(text)? {
			cfg.apply_entry(&e.key, &e.value, e.line)?;
		}
		Ok(cfg)
	}

	/// Load from `path`; a missing file yields defaults.
	pub fn load(path: &Path) -> Result<RelayConfig, RelayConfigError> {
		match fs::read_to_string(path) {
			Ok(text) => RelayConfig::parse(&text),
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				info!("{} not found, starting with defaults", path.display());
				Ok(RelayConfig::default())
			}
			Err(source) => Err(RelayConfigError::Io {
				path: path.to_path_buf(),
				source,
			}),
		}
	}

	pub fn uart(&self, index: usize) -> Option<&UartConfig> {
		self.uarts.get(index)
	}

	fn apply_entry(&mut self, key: &str, value: &str, line: usize) -> Result<(), RelayConfigError> {
		let bad = || RelayConfigError::BadValue {
			line,
			key: key.to_string(),
			value: value.to_string(),
		};
		match key {
			"http_bind" => self.http_bind = value.parse().map_err(|_| bad())?,
			"control_port" => {
				self.control_port = value.parse().ok().filter(|p| *p > 0).ok_or_else(bad)?
			}
			"src_ip" => self.src_ip = value.parse().map_err(|_| bad())?,
			"rcvbuf" => self.tuning.rcvbuf = parse_socket_buf(value).ok_or_else(bad)?,
			"sndbuf" => self.tuning.sndbuf = parse_socket_buf(value).ok_or_else(bad)?,
			"tos" => self.tuning.tos = value.parse().map_err(|_| bad())?,
			"bufsz" => {
				self.bufsz = value
					.parse()
					.ok()
					.filter(|n| (BUFSZ_MIN..=BUFSZ_MAX).contains(n))
					.ok_or_else(bad)?
			}
			"bind" => self.add_bind(value, line)?,
			k if k.starts_with("dest_") || k.starts_with("group_") => {}
			k if k.starts_with("uart") => self.apply_uart_key(k, value, line)?,
			other => debug!("relay config line {}: unknown key {} ignored", line, other),
		}
		Ok(())
	}

	fn add_bind(&mut self, value: &str, line: usize) -> Result<(), RelayConfigError> {
		if self.binds.len() >= MAX_BINDS {
			warn!("relay config line {}: more than {} binds, ignored", line, MAX_BINDS);
			return Ok(());
		}
		let (src, list) = value.split_once(':').unwrap_or((value, ""));
		let source = Source::parse(src).ok_or_else(|| RelayConfigError::BadBind {
			line,
			value: src.trim().to_string(),
		})?;
		if self.binds.iter().any(|b| b.source == source) {
			return Err(RelayConfigError::DuplicateSource {
				line,
				source_id: source.to_string(),
			});
		}
		let dests = parse_dest_list(list).map_err(|source| RelayConfigError::BadDest { line, source })?;
		if matches!(source, Source::Uart(_)) && dests.iter().any(|d| matches!(d, Target::Uart(_))) {
			return Err(RelayConfigError::UartToUart { line });
		}
		self.binds.push(BindSpec { source, dests });
		Ok(())
	}

	fn apply_uart_key(&mut self, key: &str, value: &str, line: usize) -> Result<(), RelayConfigError> {
		let bad = || RelayConfigError::BadValue {
			line,
			key: key.to_string(),
			value: value.to_string(),
		};
		let Some((index, field)) = key
			.strip_prefix("uart")
			.and_then(|rest| rest.split_once('_'))
			.and_then(|(n, field)| n.parse::<usize>().ok().map(|n| (n, field)))
		else {
			debug!("relay config line {}: unknown key {} ignored", line, key);
			return Ok(());
		};
		let Some(uart) = self.uarts.get_mut(index) else {
			return Err(bad());
		};
		match field {
			"device" => uart.device = value.to_string(),
			"baud" => uart.baud = value.parse().ok().filter(|b| *b > 0).ok_or_else(bad)?,
			"databits" => {
				uart.databits = value
					.parse()
					.ok()
					.filter(|b| (5..=8).contains(b))
					.ok_or_else(bad)?
			}
			"parity" => {
				uart.parity = match value.to_ascii_lowercase().as_str() {
					"none" | "n" => Parity::None,
					"even" | "e" => Parity::Even,
					"odd" | "o" => Parity::Odd,
					_ => return Err(bad()),
				}
			}
			"stopbits" => {
				uart.stopbits = value
					.parse()
					.ok()
					.filter(|b| *b == 1 || *b == 2)
					.ok_or_else(bad)?
			}
			"flow" => {
				uart.flow = match value.to_ascii_lowercase().as_str() {
					"none" | "0" => Flow::None,
					"rtscts" | "1" => Flow::RtsCts,
					_ => return Err(bad()),
				}
			}
			"tx_buf" => uart.tx_buf = value.parse().ok().filter(|n| *n > 0).ok_or_else(bad)?,
			"rx_buf" => uart.rx_buf = value.parse().ok().filter(|n| *n > 0).ok_or_else(bad)?,
			_ => debug!("relay config line {}: unknown key {} ignored", line, key),
		}
		Ok(())
	}
}

fn parse_socket_buf(v: &str) -> Option<u32> {
	v.parse::<u32>()
		.ok()
		.filter(|n| *n == 0 || (SOCKET_BUF_MIN..=SOCKET_BUF_MAX).contains(n))
}

/// Replace `path` with `text` via `<path>.tmp`, fsync and rename.
pub fn persist(path: &Path, text: &str) -> io::Result<()> {
	let mut tmp = path.as_os_str().to_owned();
	tmp.push(".tmp");
	let tmp = PathBuf::from(tmp);
	let mut file = fs::File::create(&tmp)?;
	file.write_all(text.as_bytes())?;
	file.sync_all()?;
	drop(file);
	fs::rename(&tmp, path)
}
