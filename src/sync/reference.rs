//! Master references: `http://host[:port][/path]` and `sync://<id>[:port][/path]`.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::scan::Node;

pub const DEFAULT_REGISTER_PATH: &str = "/sync/register";

/// Upper bound on addresses considered when matching a hostname to the directory.
const MAX_CANDIDATES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
	#[error("empty master reference")]
	Empty,
	#[error("unsupported scheme in {0}")]
	UnsupportedScheme(String),
	#[error("missing host")]
	MissingHost,
	#[error("invalid port")]
	InvalidPort,
	#[error("missing sync id")]
	MissingId,
	#[error("no directory node matches {0}")]
	NotInDirectory(String),
}

/// A concrete registration endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
	pub host: String,
	pub port: u16,
	pub path: String,
	/// The URL named a port rather than defaulting to 80.
	pub explicit_port: bool,
}

impl HttpTarget {
	pub fn url(&self) -> String {
		format!("http://{}:{}{}", self.host, self.port, self.path)
	}
}

/// A cross-reference into the node directory by sync id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReference {
	pub id: String,
	/// `None` matches any port.
	pub port: Option<u16>,
	pub path: String,
}

impl SyncReference {
	pub fn canonical(&self) -> String {
		match self.port {
			Some(p) => format!("sync://{}:{}{}", self.id, p, self.path),
			None => format!("sync://{}{}", self.id, self.path),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterReference {
	Http(HttpTarget),
	Sync(SyncReference),
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
	if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
		Some(&s[prefix.len()..])
	} else {
		None
	}
}

fn split_path(rest: &str) -> (&str, String) {
	match rest.find('/') {
		Some(i) => (&rest[..i], rest[i..].to_string()),
		None => (rest, DEFAULT_REGISTER_PATH.to_string()),
	}
}

fn parse_port(s: &str) -> Result<u16, ReferenceError> {
	s.parse::<u16>()
		.ok()
		.filter(|p| *p > 0)
		.ok_or(ReferenceError::InvalidPort)
}

pub fn parse_http_url(s: &str) -> Result<HttpTarget, ReferenceError> {
	let s = s.trim();
	let rest = strip_prefix_ci(s, "http://")
		.ok_or_else(|| ReferenceError::UnsupportedScheme(s.to_string()))?;
	let (hostport, path) = split_path(rest);
	let (host, port, explicit_port) = match hostport.rsplit_once(':') {
		Some((h, p)) => (h, parse_port(p)?, true),
		None => (hostport, 80, false),
	};
	if host.is_empty() {
		return Err(ReferenceError::MissingHost);
	}
	Ok(HttpTarget {
		host: host.to_string(),
		port,
		path,
		explicit_port,
	})
}

/// Accepts `sync://id[:port][/path]` (scheme case-insensitive) or a bare id.
pub fn parse_sync_reference(s: &str) -> Result<SyncReference, ReferenceError> {
	let s = s.trim();
	let rest = match strip_prefix_ci(s, "sync://") {
		Some(rest) => rest,
		None if s.contains("://") => return Err(ReferenceError::UnsupportedScheme(s.to_string())),
		None => s,
	};
	let (idport, path) = split_path(rest);
	let (id, port) = match idport.rsplit_once(':') {
		Some((id, p)) => (id, Some(parse_port(p)?)),
		None => (idport, None),
	};
	if id.is_empty() {
		return Err(ReferenceError::MissingId);
	}
	Ok(SyncReference {
		id: id.to_string(),
		port,
		path,
	})
}

pub fn parse_master_reference(s: &str) -> Result<MasterReference, ReferenceError> {
	let s = s.trim();
	if s.is_empty() {
		return Err(ReferenceError::Empty);
	}
	if strip_prefix_ci(s, "http://").is_some() {
		parse_http_url(s).map(MasterReference::Http)
	} else {
		parse_sync_reference(s).map(MasterReference::Sync)
	}
}

/// Resolve a reference against a directory snapshot. HTTP URLs are used as-is.
pub fn resolve_target(reference: &MasterReference, nodes: &[Node]) -> Option<HttpTarget> {
	match reference {
		MasterReference::Http(t) => Some(t.clone()),
		MasterReference::Sync(r) => nodes
			.iter()
			.find(|n| {
				!n.sync_id.is_empty()
					&& n.sync_id.eq_ignore_ascii_case(&r.id)
					&& r.port.is_none_or(|p| p == n.port)
			})
			.map(|n| HttpTarget {
				host: n.ip.to_string(),
				port: if n.port == 0 { 80 } else { n.port },
				path: r.path.clone(),
				explicit_port: true,
			}),
	}
}

/// Canonicalise a reference to `sync://<id><path>`. A literal URL is mapped
/// through the directory by address.
pub async fn normalize_master_reference(value: &str, nodes: &[Node]) -> Result<String, ReferenceError> {
	match parse_master_reference(value)? {
		MasterReference::Sync(r) => Ok(r.canonical()),
		MasterReference::Http(t) => {
			let candidates = candidate_addresses(&t).await;
			nodes
				.iter()
				.find(|n| {
					!n.sync_id.is_empty()
						&& (!t.explicit_port || n.port == t.port)
						&& (candidates.contains(&n.ip) || n.ip.to_string() == t.host)
				})
				.map(|n| format!("sync://{}{}", n.sync_id, t.path))
				.ok_or_else(|| ReferenceError::NotInDirectory(t.url()))
		}
	}
}

async fn candidate_addresses(t: &HttpTarget) -> Vec<Ipv4Addr> {
	if let Ok(ip) = t.host.parse::<Ipv4Addr>() {
		return vec![ip];
	}
	match tokio::net::lookup_host((t.host.as_str(), t.port)).await {
		Ok(addrs) => addrs
			.filter_map(|a| match a.ip() {
				std::net::IpAddr::V4(v4) => Some(v4),
				std::net::IpAddr::V6(_) => None,
			})
			.take(MAX_CANDIDATES)
			.collect(),
		Err(e) => {
			log::debug!("lookup of {} failed: {}", t.host, e);
			Vec::new()
		}
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	fn node(ip: [u8; 4], port: u16, sync_id: &str) -> Node {
		Node {
			ip: Ipv4Addr::from(ip),
			port,
			role: String::new(),
			device: String::new(),
			version: String::new(),
			sync_id: sync_id.into(),
			last_seen: 0,
			seen_scan: 0,
			misses: 0,
			is_self: false,
		}
	}

	#[test]
	fn http_url_forms() {
		let t = parse_http_url("http://10.0.0.1").unwrap();
		assert_eq!((t.host.as_str(), t.port, t.path.as_str()), ("10.0.0.1", 80, DEFAULT_REGISTER_PATH));
		assert!(!t.explicit_port);
		let t = parse_http_url("HTTP://master:8081/custom").unwrap();
		assert_eq!((t.host.as_str(), t.port, t.path.as_str()), ("master", 8081, "/custom"));
		assert_eq!(t.url(), "http://master:8081/custom");
		assert_eq!(parse_http_url("http://h:0/"), Err(ReferenceError::InvalidPort));
		assert_eq!(parse_http_url("http://h:65536/"), Err(ReferenceError::InvalidPort));
		assert_eq!(parse_http_url("http://:80/"), Err(ReferenceError::MissingHost));
		assert!(matches!(parse_http_url("https://h/"), Err(ReferenceError::UnsupportedScheme(_))));
	}

	#[test]
	fn sync_reference_forms() {
		let r = parse_sync_reference("sync://m1/sync/register").unwrap();
		assert_eq!(r.id, "m1");
		assert_eq!(r.port, None);
		assert_eq!(r.canonical(), "sync://m1/sync/register");
		let r = parse_sync_reference("SYNC://m1").unwrap();
		assert_eq!(r.path, DEFAULT_REGISTER_PATH);
		let r = parse_sync_reference("m1").unwrap();
		assert_eq!(r.canonical(), "sync://m1/sync/register");
		let r = parse_sync_reference("sync://m1:9000/x").unwrap();
		assert_eq!(r.port, Some(9000));
		assert_eq!(parse_sync_reference("sync:///x"), Err(ReferenceError::MissingId));
		assert!(matches!(parse_sync_reference("ftp://m1"), Err(ReferenceError::UnsupportedScheme(_))));
	}

	#[test]
	fn sync_reference_resolves_first_match_case_insensitively() {
		let nodes = vec![
			node([10, 0, 0, 5], 8080, ""),
			node([10, 0, 0, 6], 9000, "M1"),
			node([10, 0, 0, 7], 8080, "m1"),
		];
		let r = parse_master_reference("sync://m1/sync/register").unwrap();
		let t = resolve_target(&r, &nodes).unwrap();
		assert_eq!(t.url(), "http://10.0.0.6:9000/sync/register");

		let r = parse_master_reference("sync://m1:8080").unwrap();
		let t = resolve_target(&r, &nodes).unwrap();
		assert_eq!(t.host, "10.0.0.7");

		let r = parse_master_reference("sync://absent").unwrap();
		assert!(resolve_target(&r, &nodes).is_none());
	}

	#[test]
	fn http_reference_is_used_literally() {
		let r = parse_master_reference("http://192.168.1.2:8080").unwrap();
		let t = resolve_target(&r, &[]).unwrap();
		assert_eq!(t.url(), "http://192.168.1.2:8080/sync/register");
	}

	#[tokio::test]
	async fn normalize_maps_url_through_directory() {
		let nodes = vec![node([10, 0, 0, 6], 8080, "m1")];
		assert_eq!(
			normalize_master_reference("http://10.0.0.6:8080/sync/register", &nodes)
				.await
				.unwrap(),
			"sync://m1/sync/register"
		);
		assert_eq!(
			normalize_master_reference("http://10.0.0.6", &nodes).await.unwrap(),
			"sync://m1/sync/register"
		);
		assert!(matches!(
			normalize_master_reference("http://10.0.0.6:9999", &nodes).await,
			Err(ReferenceError::NotInDirectory(_))
		));
		assert_eq!(
			normalize_master_reference("m1", &[]).await.unwrap(),
			"sync://m1/sync/register"
		);
		assert_eq!(
			normalize_master_reference("  ", &[]).await,
			Err(ReferenceError::Empty)
		);
	}
}
