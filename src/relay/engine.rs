//! Relay dataplane state: UDP relays, UART runtimes and the fan-out path.

use std::io;
use std::net::{SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::{Map, Value, json};

use super::action::{Action, ActionError, RelayAction};
use super::config::{RelayConfig, Source};
use super::counters::Counters;
use super::dest::{DestList, Target};
use super::sys::{self, Epoll, HANGUP, READABLE, WRITABLE};
use super::uart::{Outbound, UartRuntime};
use crate::clock::monotonic_ns;

/// Soft cap on the status document.
pub const STATUS_CAP: usize = 8192;

pub struct Relay {
	pub source: Source,
	socket: Option<UdpSocket>,
	pub dests: DestList,
	pub counters: Counters,
	last_overflow: Option<u32>,
}

impl Relay {
	fn new(source: Source, socket: Option<UdpSocket>, dests: DestList) -> Relay {
		Relay {
			source,
			socket,
			dests,
			counters: Counters::default(),
			last_overflow: None,
		}
	}

	fn fd(&self) -> Option<RawFd> {
		self.socket.as_ref().map(AsRawFd::as_raw_fd)
	}

	fn note_overflow(&mut self, total: Option<u32>) {
		let Some(total) = total else { return };
		let prev = self.last_overflow.replace(total).unwrap_or(0);
		self.counters.rx_drops += u64::from(total.wrapping_sub(prev));
	}

	fn note_received(&mut self, len: usize) {
		self.counters.pkts_in += 1;
		self.counters.bytes_in += len as u64;
		self.counters.last_rx_ns = monotonic_ns();
	}

	fn maybe_rollover(&mut self) {
		if self.counters.over_limit() {
			self.counters.halve();
			self.dests.halve();
		}
	}

	/// Fan `payload` out to a snapshot of the destination list. UDP copies
	/// leave through `fd`; UART copies go through the matching runtime.
	fn deliver(&mut self, fd: RawFd, payload: &[u8], uarts: &mut [Option<UartRuntime>], epoll: &Epoll) {
		let snapshot = self.dests.snapshot();
		let udp: Vec<SocketAddrV4> = snapshot
			.iter()
			.filter_map(|t| match t {
				Target::Udp(addr) => Some(*addr),
				Target::Uart(_) => None,
			})
			.collect();
		let (sent, err) = sys::send_fanout(fd, payload, &udp);
		for addr in &udp[..sent] {
			self.counters.bytes_out += payload.len() as u64;
			self.dests.record_sent(&Target::Udp(*addr));
		}
		if sent < udp.len() {
			self.counters.send_errs += (udp.len() - sent) as u64;
			if let Some(e) = err {
				debug!("relay {}: sendmmsg stopped after {}: {}", self.source, sent, e);
			}
		}

		for target in &snapshot {
			let Target::Uart(n) = target else { continue };
			let Some(uart) = uarts.get_mut(*n).and_then(Option::as_mut) else {
				self.counters.send_errs += 1;
				continue;
			};
			match uart.send(payload) {
				Outbound::Dropped(bytes) => {
					self.counters.send_errs += 1;
					debug!("relay {}: uart[{}] ring full, {} bytes dropped", self.source, n, bytes);
				}
				Outbound::Written | Outbound::Queued => {
					self.counters.bytes_out += payload.len() as u64;
					self.dests.record_sent(target);
				}
			}
			uart.sync_interest(epoll);
			uart.maybe_rollover();
		}
	}

	fn status(&self) -> Value {
		let mut obj = Map::new();
		obj.insert("id".into(), json!(self.source.to_string()));
		match self.source {
			Source::Udp(port) => obj.insert("port".into(), json!(port)),
			Source::Uart(n) => obj.insert("uart".into(), json!(n)),
		};
		let c = &self.counters;
		obj.insert("pkts_in".into(), json!(c.pkts_in));
		obj.insert("bytes_in".into(), json!(c.bytes_in));
		obj.insert("bytes_out".into(), json!(c.bytes_out));
		obj.insert("send_errs".into(), json!(c.send_errs));
		obj.insert("last_rx_ns".into(), json!(c.last_rx_ns));
		obj.insert("rx_drops".into(), json!(c.rx_drops));
		obj.insert("trunc_drops".into(), json!(c.trunc_drops));
		obj.insert("pkts_out_total".into(), json!(self.dests.total_out()));
		let dests: Vec<Value> = self
			.dests
			.iter()
			.map(|d| match d.target {
				Target::Udp(addr) => json!({"ip": addr.ip().to_string(), "port": addr.port(), "pkts": d.pkts_out}),
				Target::Uart(n) => json!({"uart": n, "pkts": d.pkts_out}),
			})
			.collect();
		obj.insert("dests".into(), Value::Array(dests));
		Value::Object(obj)
	}
}

/// All relay state touched by the event loop and the control API.
pub struct Engine {
	config: RelayConfig,
	epoll: Arc<Epoll>,
	relays: Vec<Relay>,
	uarts: Vec<Option<UartRuntime>>,
	scratch: Vec<u8>,
}

impl Engine {
	pub fn new(epoll: Arc<Epoll>) -> Engine {
		let config = RelayConfig::default();
		Engine {
			scratch: vec![0; config.bufsz],
			config,
			epoll,
			relays: Vec::new(),
			uarts: Vec::new(),
		}
	}

	pub fn config(&self) -> &RelayConfig {
		&self.config
	}

	pub fn relay(&self, source: Source) -> Option<&Relay> {
		self.relays.iter().find(|r| r.source == source)
	}

	pub fn relays(&self) -> &[Relay] {
		&self.relays
	}

	pub fn uart(&self, index: usize) -> Option<&UartRuntime> {
		self.uarts.get(index).and_then(Option::as_ref)
	}

	fn teardown(&mut self) {
		for relay in self.relays.drain(..) {
			if let Some(fd) = relay.fd() {
				self.epoll.delete(fd);
			}
		}
		for uart in self.uarts.drain(..).flatten() {
			self.epoll.delete(uart.fd());
		}
	}

	/// Replace every relay and UART runtime with the ones `cfg` describes.
	/// Sources that fail to open are logged and skipped; a UART-bound relay
	/// is kept even when its device is unavailable.
	pub fn apply_config(&mut self, cfg: RelayConfig) {
		self.teardown();
		let epoll = Arc::clone(&self.epoll);
		self.uarts = cfg
			.uarts
			.iter()
			.map(|u| {
				if !u.is_configured() {
					return None;
				}
				let mut rt = match UartRuntime::open(u) {
					Ok(rt) => rt,
					Err(e) => {
						warn!("uart[{}] disabled: {}", u.index, e);
						return None;
					}
				};
				match rt.register(&epoll) {
					Ok(()) => Some(rt),
					Err(e) => {
						warn!("uart[{}] epoll add: {}", u.index, e);
						None
					}
				}
			})
			.collect();

		for bind in &cfg.binds {
			let socket = match bind.source {
				Source::Udp(port) => match sys::bind_udp(cfg.src_ip, port, &cfg.tuning) {
					Ok(sock) => {
						if let Err(e) = epoll.add(sock.as_raw_fd(), READABLE) {
							warn!("relay {}: epoll add: {}", bind.source, e);
							continue;
						}
						Some(sock)
					}
					Err(e) => {
						warn!("relay {}: bind {}:{} failed: {}", bind.source, cfg.src_ip, port, e);
						continue;
					}
				},
				Source::Uart(n) => {
					if self.uart(n).is_none() {
						warn!("relay {}: uart not open, relay idle until reconfigured", bind.source);
					}
					None
				}
			};
			let dests = DestList::new(bind.dests.iter().copied());
			info!(
				"relay {} bound on {} ({} dests, bufsz={} rcvbuf={} sndbuf={} tos={})",
				bind.source,
				cfg.src_ip,
				dests.len(),
				cfg.bufsz,
				cfg.tuning.rcvbuf,
				cfg.tuning.sndbuf,
				cfg.tuning.tos
			);
			self.relays.push(Relay::new(bind.source, socket, dests));
		}
		self.scratch = vec![0; cfg.bufsz];
		self.config = cfg;
	}

	/// Handle one batch of ready descriptors.
	pub fn process(&mut self, ready: &[(RawFd, u32)]) {
		for &(fd, events) in ready {
			if let Some(i) = self.relays.iter().position(|r| r.fd() == Some(fd)) {
				self.drain_relay(i);
			} else if let Some(n) = self
				.uarts
				.iter()
				.position(|u| u.as_ref().is_some_and(|u| u.fd() == fd))
			{
				self.service_uart(n, events);
			}
		}
	}

	fn drain_relay(&mut self, i: usize) {
		let Engine {
			relays,
			uarts,
			scratch,
			epoll,
			..
		} = self;
		let epoll: &Epoll = epoll;
		let relay = &mut relays[i];
		let Some(fd) = relay.fd() else { return };
		loop {
			let dgram = match sys::recv_datagram(fd, scratch) {
				Ok(d) => d,
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => {
					debug!("relay {}: recvmsg: {}", relay.source, e);
					break;
				}
			};
			relay.note_overflow(dgram.overflow);
			if dgram.truncated {
				relay.counters.pkts_in += 1;
				relay.counters.trunc_drops += 1;
				relay.maybe_rollover();
				continue;
			}
			relay.note_received(dgram.len);
			relay.deliver(fd, &scratch[..dgram.len], uarts, epoll);
			relay.maybe_rollover();
		}
	}

	fn service_uart(&mut self, n: usize, events: u32) {
		let Engine {
			relays, uarts, epoll, ..
		} = self;
		let epoll: &Epoll = epoll;
		let Some(slot) = uarts.get_mut(n) else { return };
		let Some(uart) = slot.as_mut() else { return };
		let mut failure = None;

		if events & WRITABLE != 0 {
			if let Err(e) = uart.flush() {
				failure = Some(e);
			}
		}
		if failure.is_none() && events & (READABLE | HANGUP) != 0 {
			let sender = uart.sender_fd();
			let mut relay = relays.iter_mut().find(|r| r.source == Source::Uart(n));
			loop {
				match uart.read() {
					Ok(Some(data)) => {
						if let Some(r) = relay.as_mut() {
							r.note_received(data.len());
							r.deliver(sender, data, &mut [], epoll);
							r.maybe_rollover();
						}
					}
					Ok(None) => break,
					Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
					Err(e) => {
						failure = Some(e);
						break;
					}
				}
			}
			uart.maybe_rollover();
		}

		match failure {
			Some(e) => {
				warn!("uart[{}] {} disabled: {}", n, uart.device, e);
				let fd = uart.fd();
				epoll.delete(fd);
				*slot = None;
			}
			None => uart.sync_interest(epoll),
		}
	}

	/// Apply a control-API mutation to one relay.
	pub fn apply_action(&mut self, req: RelayAction) -> Result<(), ActionError> {
		let Some(relay) = self.relays.iter_mut().find(|r| r.source == req.relay) else {
			return Err(ActionError::BadAction(format!("no relay {}", req.relay)));
		};
		match req.action {
			Action::Set(targets) => relay.dests.replace(targets),
			Action::Append(targets) => {
				relay.dests.extend(targets);
			}
			Action::Clear => relay.dests.clear(),
			Action::ClearTo(target) => {
				if !relay.dests.remove(&target) {
					return Err(ActionError::BadAction(format!("{} not a destination", target)));
				}
			}
			Action::Reset => {
				relay.counters.reset();
				relay.dests.reset_counters();
				if let Source::Uart(n) = relay.source {
					if let Some(uart) = self.uarts.get_mut(n).and_then(Option::as_mut) {
						uart.reset_counters();
					}
				}
			}
		}
		Ok(())
	}

	/// Status document, truncated to [`STATUS_CAP`] bytes.
	pub fn status_json(&self) -> String {
		let relays: Vec<Value> = self.relays.iter().map(Relay::status).collect();
		let uarts: Vec<Value> = self.uarts.iter().flatten().map(UartRuntime::status).collect();
		let mut out = json!({"relays": relays, "uarts": uarts}).to_string();
		out.push('\n');
		if out.len() > STATUS_CAP {
			let mut cut = STATUS_CAP;
			while !out.is_char_boundary(cut) {
				cut -= 1;
			}
			out.truncate(cut);
		}
		out
	}
}

impl Drop for Engine {
	fn drop(&mut self) {
		self.teardown();
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::relay::action::parse_action;
	use crate::relay::config::BindSpec;
	use std::net::Ipv4Addr;
	use std::time::Duration;

	fn free_port() -> u16 {
		UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
	}

	fn sink() -> (UdpSocket, u16) {
		let s = UdpSocket::bind("127.0.0.1:0").unwrap();
		s.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
		let port = s.local_addr().unwrap().port();
		(s, port)
	}

	fn engine_with(bufsz: usize, source: u16, dests: &[u16]) -> Engine {
		let mut e = Engine::new(Arc::new(Epoll::new().unwrap()));
		let cfg = RelayConfig {
			src_ip: Ipv4Addr::LOCALHOST,
			bufsz,
			binds: vec![BindSpec {
				source: Source::Udp(source),
				dests: dests
					.iter()
					.map(|p| Target::Udp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, *p)))
					.collect(),
			}],
			..RelayConfig::default()
		};
		e.apply_config(cfg);
		e
	}

	fn pump(e: &mut Engine) {
		let mut ready = Vec::new();
		e.epoll.wait(2000, &mut ready).unwrap();
		e.process(&ready);
	}

	#[test]
	fn fans_out_to_every_destination() {
		let (a, pa) = sink();
		let (b, pb) = sink();
		let src = free_port();
		let mut e = engine_with(9000, src, &[pa, pb]);
		let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
		tx.send_to(&[1u8; 100], ("127.0.0.1", src)).unwrap();
		pump(&mut e);

		let mut buf = [0u8; 256];
		assert_eq!(a.recv(&mut buf).unwrap(), 100);
		assert_eq!(b.recv(&mut buf).unwrap(), 100);
		let r = e.relay(Source::Udp(src)).unwrap();
		assert_eq!(r.counters.pkts_in, 1);
		assert_eq!(r.counters.bytes_in, 100);
		assert_eq!(r.counters.bytes_out, 200);
		assert_eq!(r.dests.total_out(), 2);
	}

	#[test]
	fn oversized_datagram_is_dropped_whole() {
		let (a, pa) = sink();
		let src = free_port();
		let mut e = engine_with(512, src, &[pa]);
		let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
		tx.send_to(&[2u8; 1000], ("127.0.0.1", src)).unwrap();
		pump(&mut e);

		let r = e.relay(Source::Udp(src)).unwrap();
		assert_eq!(r.counters.trunc_drops, 1);
		assert_eq!(r.counters.bytes_out, 0);
		a.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
		let mut buf = [0u8; 16];
		assert!(a.recv(&mut buf).is_err());
	}

	#[test]
	fn actions_mutate_destinations() {
		let src = free_port();
		let mut e = engine_with(9000, src, &[5600, 5601, 5602]);
		let act = |verb: &str, body: Value| parse_action(verb, &body).unwrap();

		e.apply_action(act("clear_to", json!({"port": src, "dest": "127.0.0.1:5600"}))).unwrap();
		let ports: Vec<String> = e.relay(Source::Udp(src)).unwrap().dests.snapshot().iter().map(|t| t.to_string()).collect();
		assert_eq!(ports, vec!["127.0.0.1:5602", "127.0.0.1:5601"]);

		let missing = e.apply_action(act("clear_to", json!({"port": src, "dest": "127.0.0.1:9"})));
		assert!(matches!(missing, Err(ActionError::BadAction(_))));

		e.apply_action(act("append_range", json!({"port": src, "start": 7001, "end": 7000}))).unwrap();
		assert_eq!(e.relay(Source::Udp(src)).unwrap().dests.len(), 4);

		e.apply_action(act("clear", json!({"port": src}))).unwrap();
		assert!(e.relay(Source::Udp(src)).unwrap().dests.is_empty());

		let other = e.apply_action(act("clear", json!({"port": 1})));
		assert!(matches!(other, Err(ActionError::BadAction(_))));
	}

	#[test]
	fn uart_destination_without_runtime_counts_error() {
		let (a, pa) = sink();
		let src = free_port();
		let mut e = engine_with(9000, src, &[pa]);
		e.apply_action(parse_action("append", &json!({"port": src, "dests": ["uart[3]"]})).unwrap())
			.unwrap();
		let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
		tx.send_to(b"hi", ("127.0.0.1", src)).unwrap();
		pump(&mut e);
		let mut buf = [0u8; 8];
		assert_eq!(a.recv(&mut buf).unwrap(), 2);
		let r = e.relay(Source::Udp(src)).unwrap();
		assert_eq!(r.counters.send_errs, 1);
		assert_eq!(r.counters.bytes_out, 2);
	}

	#[test]
	fn status_lists_relays_and_destinations() {
		let src = free_port();
		let e = engine_with(9000, src, &[5600]);
		let v: Value = serde_json::from_str(&e.status_json()).unwrap();
		let relay = &v["relays"][0];
		assert_eq!(relay["port"], src);
		assert_eq!(relay["id"], src.to_string());
		assert_eq!(relay["dests"][0]["ip"], "127.0.0.1");
		assert_eq!(relay["dests"][0]["port"], 5600);
		assert_eq!(relay["dests"][0]["pkts"], 0);
		assert!(v["uarts"].as_array().unwrap().is_empty());
	}

	#[test]
	fn status_is_capped() {
		let src = free_port();
		let mut e = engine_with(9000, src, &[]);
		e.apply_action(parse_action("append_range", &json!({"port": src, "start": 1, "end": 128})).unwrap())
			.unwrap();
		assert_eq!(e.relay(Source::Udp(src)).unwrap().dests.len(), 128);
		assert!(e.status_json().len() <= STATUS_CAP);
	}

	#[test]
	fn reset_zeroes_counters() {
		let (_a, pa) = sink();
		let src = free_port();
		let mut e = engine_with(9000, src, &[pa]);
		let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
		tx.send_to(b"x", ("127.0.0.1", src)).unwrap();
		pump(&mut e);
		e.apply_action(parse_action("reset", &json!({"port": src})).unwrap()).unwrap();
		let r = e.relay(Source::Udp(src)).unwrap();
		assert_eq!(r.counters, Counters::default());
		assert_eq!(r.dests.total_out(), 0);
		assert_eq!(r.dests.len(), 1);
	}
}
