//! Serial endpoints attached to the relay.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::UdpSocket;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use log::{debug, info};
use serde_json::{Value, json};
use thiserror::Error;

use super::config::{Flow, Parity, UartConfig};
use super::counters::Counters;
use super::ring::ByteRing;
use super::sys::{self, Epoll, READABLE, WRITABLE};

#[derive(Debug, Error)]
pub enum UartError {
	#[error("opening {device}: {source}")]
	Open {
		device: String,
		#[source]
		source: serialport::Error,
	},
	#[error("configuring {device}: {source}")]
	Setup {
		device: String,
		#[source]
		source: io::Error,
	},
}

/// What happened to one outbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
	Written,
	Queued,
	/// The remainder did not fit in the ring; carries the dropped byte count.
	Dropped(usize),
}

fn line_settings(cfg: &UartConfig) -> serialport::SerialPortBuilder {
	let data_bits = match cfg.databits {
		5 => serialport::DataBits::Five,
		6 => serialport::DataBits::Six,
		7 => serialport::DataBits::Seven,
		_ => serialport::DataBits::Eight,
	};
	let parity = match cfg.parity {
		Parity::None => serialport::Parity::None,
		Parity::Even => serialport::Parity::Even,
		Parity::Odd => serialport::Parity::Odd,
	};
	let stop_bits = if cfg.stopbits == 2 {
		serialport::StopBits::Two
	} else {
		serialport::StopBits::One
	};
	let flow = match cfg.flow {
		Flow::None => serialport::FlowControl::None,
		Flow::RtsCts => serialport::FlowControl::Hardware,
	};
	serialport::new(cfg.device.as_str(), cfg.baud)
		.data_bits(data_bits)
		.parity(parity)
		.stop_bits(stop_bits)
		.flow_control(flow)
		.timeout(Duration::ZERO)
}

pub struct UartRuntime {
	pub index: usize,
	pub device: String,
	tty: File,
	ring: ByteRing,
	scratch: Vec<u8>,
	sender: UdpSocket,
	pub counters: Counters,
	/// Bytes dropped because the outbound ring was full.
	pub tx_drops: u64,
	write_armed: bool,
}

impl UartRuntime {
	/// Open the device in raw mode with the configured line settings.
	pub fn open(cfg: &UartConfig) -> Result<UartRuntime, UartError> {
		let port = line_settings(cfg)
			.open_native()
			.map_err(|source| UartError::Open {
				device: cfg.device.clone(),
				source,
			})?;
		// SAFETY: into_raw_fd hands over sole ownership of the descriptor.
		let tty = unsafe { File::from_raw_fd(port.into_raw_fd()) };
		let rt = UartRuntime::from_file(cfg, tty).map_err(|source| UartError::Setup {
			device: cfg.device.clone(),
			source,
		})?;
		info!(
			"uart[{}] {} open at {} baud ({} data bits, {:?} parity, {} stop, flow {:?})",
			cfg.index, cfg.device, cfg.baud, cfg.databits, cfg.parity, cfg.stopbits, cfg.flow
		);
		Ok(rt)
	}

	/// Wrap an already-open descriptor.
	pub fn from_file(cfg: &UartConfig, tty: File) -> io::Result<UartRuntime> {
		sys::set_nonblocking(tty.as_raw_fd())?;
		Ok(UartRuntime {
			index: cfg.index,
			device: cfg.device.clone(),
			tty,
			ring: ByteRing::with_capacity(cfg.tx_buf),
			scratch: vec![0; cfg.rx_buf],
			sender: sys::sender_udp()?,
			counters: Counters::default(),
			tx_drops: 0,
			write_armed: false,
		})
	}

	pub fn fd(&self) -> RawFd {
		self.tty.as_raw_fd()
	}

	pub fn sender_fd(&self) -> RawFd {
		self.sender.as_raw_fd()
	}

	pub fn queued(&self) -> usize {
		self.ring.len()
	}

	pub fn register(&mut self, epoll: &Epoll) -> io::Result<()> {
		self.write_armed = false;
		epoll.add(self.fd(), READABLE)
	}

	/// Keep `EPOLLOUT` interest in step with the ring.
	pub fn sync_interest(&mut self, epoll: &Epoll) {
		let want = !self.ring.is_empty();
		if want == self.write_armed {
			return;
		}
		let events = if want { READABLE | WRITABLE } else { READABLE };
		match epoll.modify(self.fd(), events) {
			Ok(()) => self.write_armed = want,
			Err(e) => debug!("uart[{}] epoll mod: {}", self.index, e),
		}
	}

	/// Try a direct write first; whatever is left goes to the ring, or is
	/// dropped whole when the ring cannot take it.
	pub fn send(&mut self, payload: &[u8]) -> Outbound {
		let written = if self.ring.is_empty() {
			match (&self.tty).write(payload) {
				Ok(n) => n,
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
				Err(e) => {
					debug!("uart[{}] write: {}", self.index, e);
					0
				}
			}
		} else {
			0
		};
		self.counters.bytes_out += written as u64;
		let rest = &payload[written..];
		if rest.is_empty() {
			return Outbound::Written;
		}
		if self.ring.push(rest) {
			return Outbound::Queued;
		}
		self.tx_drops += rest.len() as u64;
		self.counters.send_errs += 1;
		Outbound::Dropped(rest.len())
	}

	/// Drain the ring until it empties or the device would block.
	pub fn flush(&mut self) -> io::Result<()> {
		while !self.ring.is_empty() {
			match (&self.tty).write(self.ring.peek()) {
				Ok(0) => break,
				Ok(n) => {
					self.ring.consume(n);
					self.counters.bytes_out += n as u64;
				}
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(e) => {
					self.counters.send_errs += 1;
					return Err(e);
				}
			}
		}
		Ok(())
	}

	/// One read into scratch. `Ok(None)` when nothing is pending; end of
	/// file is reported as `UnexpectedEof`.
	pub fn read(&mut self) -> io::Result<Option<&[u8]>> {
		match (&self.tty).read(&mut self.scratch) {
			Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
			Ok(n) => {
				self.counters.pkts_in += 1;
				self.counters.bytes_in += n as u64;
				self.counters.last_rx_ns = crate::clock::monotonic_ns();
				Ok(Some(&self.scratch[..n]))
			}
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
			Err(e) => Err(e),
		}
	}

	pub fn maybe_rollover(&mut self) {
		if self.counters.over_limit() || self.tx_drops > super::counters::BYTES_ROLLOVER_LIMIT {
			self.counters.halve();
			self.tx_drops >>= 1;
		}
	}

	pub fn reset_counters(&mut self) {
		self.counters.reset();
		self.tx_drops = 0;
	}

	pub fn status(&self) -> Value {
		json!({
			"index": self.index,
			"device": self.device,
			"pkts_in": self.counters.pkts_in,
			"bytes_in": self.counters.bytes_in,
			"bytes_out": self.counters.bytes_out,
			"send_errs": self.counters.send_errs,
			"tx_drops": self.tx_drops,
			"queued": self.ring.len(),
			"last_rx_ns": self.counters.last_rx_ns,
		})
	}
}
