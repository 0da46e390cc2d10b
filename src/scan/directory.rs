//! Bounded, freshness-tracked node directory.

use std::net::Ipv4Addr;

use serde::Serialize;

/// Directory capacity.
pub const MAX_NODES: usize = 64;

/// Identity and labels a probe learns about a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
	pub role: String,
	pub device: String,
	pub version: String,
	pub sync_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
	pub ip: Ipv4Addr,
	pub port: u16,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub role: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub device: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub version: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub sync_id: String,
	/// Wall-clock seconds of the last successful probe or self refresh.
	pub last_seen: i64,
	#[serde(skip)]
	pub seen_scan: u32,
	#[serde(skip)]
	pub misses: u32,
	#[serde(skip)]
	pub is_self: bool,
}

#[derive(Debug, Default)]
pub struct NodeDirectory {
	nodes: Vec<Node>,
}

impl NodeDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	/// Insert or refresh `(ip, port)`. Returns false when the directory is full.
	///
	/// An existing self flag is never cleared by a later non-self probe.
	pub fn upsert(
		&mut self,
		ip: Ipv4Addr,
		port: u16,
		info: &NodeInfo,
		is_self: bool,
		scan_seq: u32,
		now: i64,
	) -> bool {
		if let Some(node) = self.nodes.iter_mut().find(|n| n.ip == ip && n.port == port) {
			node.role = info.role.clone();
			node.device = info.device.clone();
			node.version = info.version.clone();
			node.sync_id = info.sync_id.clone();
			node.last_seen = now;
			node.seen_scan = scan_seq;
			node.misses = 0;
			node.is_self |= is_self;
			return true;
		}
		if self.nodes.len() >= MAX_NODES {
			return false;
		}
		self.nodes.push(Node {
			ip,
			port,
			role: info.role.clone(),
			device: info.device.clone(),
			version: info.version.clone(),
			sync_id: info.sync_id.clone(),
			last_seen: now,
			seen_scan: scan_seq,
			misses: 0,
			is_self,
		});
		true
	}

	/// Reconcile after scan `seq`: unseen non-self entries gain a miss and are
	/// dropped once they reach `stale_max_misses`.
	pub fn prune(&mut self, seq: u32, stale_max_misses: u32) {
		let limit = stale_max_misses.max(1);
		self.nodes.retain_mut(|n| {
			if n.is_self {
				return true;
			}
			if n.seen_scan == seq {
				n.misses = 0;
				return true;
			}
			n.misses += 1;
			n.misses < limit
		});
	}

	pub fn snapshot(&self, max: usize) -> Vec<Node> {
		self.nodes.iter().take(max).cloned().collect()
	}

	/// Non-self addresses already known for `port`.
	pub fn known_addresses(&self, port: u16) -> Vec<Ipv4Addr> {
		self.nodes
			.iter()
			.filter(|n| !n.is_self && n.port == port)
			.map(|n| n.ip)
			.collect()
	}
}
