//! Destination tokens and per-relay destination lists.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;

/// Destinations per relay.
pub const MAX_DESTS: usize = 128;
/// UART runtimes, indexed `uart[0]`..`uart[7]`.
pub const MAX_UARTS: usize = 8;

const DEFAULT_DEST_IP: Ipv4Addr = Ipv4Addr::LOCALHOST;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
	Udp(SocketAddrV4),
	Uart(usize),
}

impl fmt::Display for Target {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Target::Udp(addr) => write!(f, "{}", addr),
			Target::Uart(n) => write!(f, "uart[{}]", n),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DestError {
	#[error("empty destination")]
	Empty,
	#[error("bad port in {0}")]
	BadPort(String),
	#[error("bad address in {0}")]
	BadAddress(String),
	#[error("bad uart token {0}")]
	BadUart(String),
}

/// `uart[N]` with N below [`MAX_UARTS`]; case-insensitive.
pub fn parse_uart_token(s: &str) -> Option<usize> {
	let s = s.trim();
	if s.len() < 6 || !s[..5].eq_ignore_ascii_case("uart[") {
		return None;
	}
	let n = s[5..].strip_suffix(']')?.parse::<usize>().ok()?;
	(n < MAX_UARTS).then_some(n)
}

fn parse_port(s: &str, token: &str) -> Result<u16, DestError> {
	s.trim()
		.parse::<u16>()
		.ok()
		.filter(|p| *p > 0)
		.ok_or_else(|| DestError::BadPort(token.to_string()))
}

/// Inclusive port run; reversed bounds are swapped.
pub fn port_range(ip: Ipv4Addr, a: u16, b: u16) -> impl Iterator<Item = Target> {
	let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
	(lo..=hi).map(move |p| Target::Udp(SocketAddrV4::new(ip, p)))
}

/// One token: `port`, `ip:port`, `ip:a-b`, `a-b` or `uart[N]`.
pub fn parse_dest_token(token: &str) -> Result<Vec<Target>, DestError> {
	let token = token.trim();
	if token.is_empty() {
		return Err(DestError::Empty);
	}
	if token.len() >= 5 && token[..4].eq_ignore_ascii_case("uart") {
		return parse_uart_token(token)
			.map(|n| vec![Target::Uart(n)])
			.ok_or_else(|| DestError::BadUart(token.to_string()));
	}
	let (ip, ports) = match token.split_once(':') {
		Some((ip, ports)) => (
			ip.trim()
				.parse::<Ipv4Addr>()
				.map_err(|_| DestError::BadAddress(token.to_string()))?,
			ports,
		),
		None => (DEFAULT_DEST_IP, token),
	};
	match ports.split_once('-') {
		Some((a, b)) => Ok(port_range(ip, parse_port(a, token)?, parse_port(b, token)?).collect()),
		None => Ok(vec![Target::Udp(SocketAddrV4::new(ip, parse_port(ports, token)?))]),
	}
}

/// Comma-separated tokens; an empty list is valid.
pub fn parse_dest_list(list: &str) -> Result<Vec<Target>, DestError> {
	let mut out = Vec::new();
	for token in list.split(',').filter(|t| !t.trim().is_empty()) {
		out.extend(parse_dest_token(token)?);
	}
	Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dest {
	pub target: Target,
	pub pkts_out: u64,
}

/// Ordered destinations of one relay. UART entries are unique; UDP
/// duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestList {
	items: Vec<Dest>,
}

impl DestList {
	pub fn new(targets: impl IntoIterator<Item = Target>) -> Self {
		let mut list = Self::default();
		list.extend(targets);
		list
	}

	/// Append one target. Returns false when the list is full; a UART
	/// already present is a no-op that still reports success.
	pub fn push(&mut self, target: Target) -> bool {
		if matches!(target, Target::Uart(_)) && self.items.iter().any(|d| d.target == target) {
			return true;
		}
		if self.items.len() >= MAX_DESTS {
			return false;
		}
		self.items.push(Dest {
			target,
			pkts_out: 0,
		});
		true
	}

	/// Append until full; returns how many were stored.
	pub fn extend(&mut self, targets: impl IntoIterator<Item = Target>) -> usize {
		let mut added = 0;
		for t in targets {
			if !self.push(t) {
				break;
			}
			added += 1;
		}
		added
	}

	pub fn replace(&mut self, targets: impl IntoIterator<Item = Target>) {
		self.items.clear();
		self.extend(targets);
	}

	pub fn clear(&mut self) {
		self.items.clear();
	}

	/// Remove the first entry equal to `target`, moving the last entry into its place.
	pub fn remove(&mut self, target: &Target) -> bool {
		match self.items.iter().position(|d| d.target == *target) {
			Some(i) => {
				self.items.swap_remove(i);
				true
			}
			None => false,
		}
	}

	pub fn snapshot(&self) -> Vec<Target> {
		self.items.iter().map(|d| d.target).collect()
	}

	/// Credit one delivery to the first entry matching `target`.
	pub fn record_sent(&mut self, target: &Target) {
		if let Some(d) = self.items.iter_mut().find(|d| d.target == *target) {
			d.pkts_out += 1;
		}
	}

	pub fn total_out(&self) -> u64 {
		self.items.iter().map(|d| d.pkts_out).sum()
	}

	pub fn halve(&mut self) {
		for d in &mut self.items {
			d.pkts_out >>= 1;
		}
	}

	pub fn reset_counters(&mut self) {
		for d in &mut self.items {
			d.pkts_out = 0;
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = &Dest> {
		self.items.iter()
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub fn has_uart(&self) -> bool {
		self.items.iter().any(|d| matches!(d.target, Target::Uart(_)))
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	fn udp(ip: [u8; 4], port: u16) -> Target {
		Target::Udp(SocketAddrV4::new(Ipv4Addr::from(ip), port))
	}

	#[test]
	fn token_forms() {
		assert_eq!(parse_dest_token("5600").unwrap(), vec![udp([127, 0, 0, 1], 5600)]);
		assert_eq!(
			parse_dest_token(" 10.0.0.2:14550 ").unwrap(),
			vec![udp([10, 0, 0, 2], 14550)]
		);
		assert_eq!(
			parse_dest_token("10.0.0.2:7002-7000").unwrap(),
			vec![udp([10, 0, 0, 2], 7000), udp([10, 0, 0, 2], 7001), udp([10, 0, 0, 2], 7002)]
		);
		assert_eq!(parse_dest_token("5-6").unwrap().len(), 2);
		assert_eq!(parse_dest_token("UART[3]").unwrap(), vec![Target::Uart(3)]);
	}

	#[test]
	fn bad_tokens() {
		assert!(matches!(parse_dest_token("0"), Err(DestError::BadPort(_))));
		assert!(matches!(parse_dest_token("65536"), Err(DestError::BadPort(_))));
		assert!(matches!(parse_dest_token("host:80"), Err(DestError::BadAddress(_))));
		assert!(matches!(parse_dest_token("uart[8]"), Err(DestError::BadUart(_))));
		assert!(matches!(parse_dest_token("xyz"), Err(DestError::BadPort(_))));
		assert!(parse_dest_list("5600,,5601").is_ok());
		assert!(parse_dest_list("").unwrap().is_empty());
	}

	#[test]
	fn uart_destinations_coalesce_udp_do_not() {
		let mut l = DestList::new(parse_dest_list("5600,5600,uart[1],uart[1]").unwrap());
		assert_eq!(l.len(), 3);
		assert!(l.has_uart());
		assert!(l.push(Target::Uart(1)));
		assert_eq!(l.len(), 3);
	}

	#[test]
	fn list_is_capped() {
		let mut l = DestList::default();
		let added = l.extend(parse_dest_token("1-200").unwrap());
		assert_eq!(added, MAX_DESTS);
		assert!(!l.push(udp([1, 1, 1, 1], 1)));
	}

	#[test]
	fn remove_swaps_with_last() {
		let mut l = DestList::new(parse_dest_list("5600,5601,5602,5603").unwrap());
		assert!(l.remove(&udp([127, 0, 0, 1], 5601)));
		assert_eq!(
			l.snapshot(),
			vec![udp([127, 0, 0, 1], 5600), udp([127, 0, 0, 1], 5603), udp([127, 0, 0, 1], 5602)]
		);
		assert!(!l.remove(&udp([127, 0, 0, 1], 5601)));
	}

	#[test]
	fn counters_credit_first_match_and_halve() {
		let a = udp([127, 0, 0, 1], 1);
		let mut l = DestList::new([a, a]);
		l.record_sent(&a);
		l.record_sent(&a);
		l.record_sent(&a);
		assert_eq!(l.total_out(), 3);
		l.halve();
		assert_eq!(l.total_out(), 1);
		l.reset_counters();
		assert_eq!(l.total_out(), 0);
	}
}
