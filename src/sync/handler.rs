//! `/sync/*` endpoints.

use std::net::{IpAddr, SocketAddr};

use axum::Json;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use log::{debug, info, warn};
use serde_json::{Map, Value, json};

use super::SYNC_MAX_SLOTS;
use super::reference::normalize_master_reference;
use super::registry::{PushBatch, RegisterOutcome, Registration, SlotMove};
use crate::clock::monotonic_ms;
use crate::scan::MAX_NODES;
use crate::server::ApiError;
use crate::server::body::{read_json, str_field, str_list};
use crate::state::AppState;

fn peer_ip(req: &Request<Body>) -> Option<IpAddr> {
	req.extensions()
		.get::<ConnectInfo<SocketAddr>>()
		.map(|ConnectInfo(addr)| addr.ip())
}

fn require(ok: bool, req: &Request<Body>, method: Method) -> Result<(), ApiError> {
	if !ok {
		return Err(ApiError::NotFound);
	}
	if req.method() != method {
		return Err(ApiError::MethodNotAllowed);
	}
	Ok(())
}

/// Caps arrive as a comma string or an array of strings.
fn caps_field(v: &Value) -> Option<String> {
	match v.get("caps") {
		Some(Value::String(s)) => Some(s.clone()),
		Some(Value::Array(_)) => Some(str_list(v.get("caps")).join(",")),
		_ => None,
	}
}

pub fn parse_registration(v: &Value, remote: Option<IpAddr>) -> Result<Registration, ApiError> {
	let id = str_field(v, "id").ok_or(ApiError::MissingId)?;
	let text = |k: &str| str_field(v, k).unwrap_or_default().to_string();
	Ok(Registration {
		id: id.to_string(),
		remote_ip: remote.map(|ip| ip.to_string()).unwrap_or_default(),
		address: str_field(v, "address")
			.or_else(|| str_field(v, "callback_url"))
			.unwrap_or_default()
			.to_string(),
		device: text("device"),
		role: text("role"),
		version: text("version"),
		caps: caps_field(v),
		ack_generation: v.get("ack_generation").and_then(Value::as_i64).unwrap_or(0),
	})
}

pub async fn register(State(state): State<AppState>, req: Request<Body>) -> Result<Response, ApiError> {
	let settings = state.settings().await;
	require(settings.sync.is_master(), &req, Method::POST)?;
	let remote = peer_ip(&req);
	let v = read_json(req).await?;
	let reg = parse_registration(&v, remote)?;

	if let Some(IpAddr::V4(ip)) = remote {
		let scanner = state.scanner.clone();
		let port = match settings.server.port {
			0 => 8080,
			p => p,
		};
		let tuning = settings.scan.tuning;
		tokio::spawn(async move {
			if !scanner.probe_one(ip, port, &tuning).await {
				debug!("registering slave at {} did not answer a probe", ip);
			}
		});
	}

	let outcome = {
		let mut master = state.master.lock().await;
		master.register(
			&reg,
			&settings.sync.slots,
			settings.sync.slot_retention_s,
			monotonic_ms(),
		)
	};
	let interval_s = settings.sync.register_interval_s;
	let body = match outcome {
		Err(_) => {
			state.metrics.sync_registry_full_total.inc();
			warn!("slave {} rejected: registry full", reg.id);
			return Err(ApiError::RegistryFull);
		}
		Ok(RegisterOutcome::Waiting) => json!({
			"status": "waiting",
			"id": reg.id,
			"interval_s": interval_s,
			"reason": "no_slots_available",
			"max_slots": SYNC_MAX_SLOTS,
			"slot": Value::Null,
		}),
		Ok(RegisterOutcome::Registered {
			slot,
			slot_generation,
			send_generation,
			label,
			commands,
		}) => {
			let mut out = Map::new();
			out.insert("status".into(), json!("registered"));
			out.insert("id".into(), json!(reg.id));
			out.insert("interval_s".into(), json!(interval_s));
			out.insert("generation".into(), json!(send_generation));
			out.insert("slot".into(), json!(slot + 1));
			out.insert("slot_generation".into(), json!(slot_generation));
			if let Some(label) = label {
				out.insert("slot_label".into(), json!(label));
			}
			if let Some(commands) = commands {
				if send_generation > 0 {
					info!(
						"sending generation {} of slot {} to {}",
						send_generation,
						slot + 1,
						reg.id
					);
				}
				out.insert("commands".into(), Value::Array(commands));
			}
			Value::Object(out)
		}
	};
	state.metrics.sync_registrations_total.inc();
	Ok((StatusCode::OK, Json(body)).into_response())
}

pub async fn slaves(State(state): State<AppState>, req: Request<Body>) -> Result<Response, ApiError> {
	let settings = state.settings().await;
	require(settings.sync.is_master(), &req, Method::GET)?;
	let snapshot = {
		let mut master = state.master.lock().await;
		master.prune(settings.sync.slot_retention_s, monotonic_ms());
		master.snapshot(&settings.sync.slots)
	};
	Ok((StatusCode::OK, Json(snapshot)).into_response())
}

fn move_from(item: &Value) -> Option<SlotMove> {
	let id = str_field(item, "slave_id").or_else(|| str_field(item, "id"))?;
	let slot = match item.get("slot")? {
		Value::Null => None,
		other => Some(other.as_i64()?),
	};
	Some(SlotMove {
		id: id.to_string(),
		slot,
	})
}

/// Collect moves, replays and deletions from a `/sync/push` body.
/// Items with a missing id or a non-integer slot are skipped.
pub fn parse_push(v: &Value) -> PushBatch {
	let mut moves: Vec<SlotMove> = v
		.get("moves")
		.and_then(Value::as_array)
		.map(|items| items.iter().filter_map(move_from).collect())
		.unwrap_or_default();
	if let Some(single) = move_from(v) {
		moves.push(single);
	}

	let replay_slots = match v.get("replay_slots") {
		Some(Value::Array(items)) => items.iter().filter_map(Value::as_i64).collect(),
		Some(n) => n.as_i64().into_iter().collect(),
		None => Vec::new(),
	};
	let mut delete_ids = str_list(v.get("delete_ids"));
	if let Some(id) = str_field(v, "delete_id") {
		delete_ids.push(id.to_string());
	}

	PushBatch {
		moves,
		replay_slots,
		replay_ids: str_list(v.get("replay_ids")),
		delete_ids,
	}
}

pub async fn push(State(state): State<AppState>, req: Request<Body>) -> Result<Response, ApiError> {
	let settings = state.settings().await;
	require(settings.sync.is_master(), &req, Method::POST)?;
	let v = read_json(req).await?;
	let batch = parse_push(&v);

	let outcome = {
		let mut master = state.master.lock().await;
		master.apply_push(
			&batch,
			&settings.sync.slots,
			settings.sync.slot_retention_s,
			monotonic_ms(),
		)?
	};
	state.metrics.sync_push_batches_total.inc();
	info!(
		"push applied: {} moves, {} replays, {} deleted",
		outcome.moves,
		outcome.replayed_slots,
		outcome.deleted_ids.len()
	);

	let mut out = Map::new();
	out.insert("status".into(), json!("updated"));
	out.insert("moves".into(), json!(outcome.moves));
	out.insert("replayed_slots".into(), json!(outcome.replayed_slots));
	out.insert("deleted".into(), json!(outcome.deleted_ids.len()));
	if !outcome.deleted_ids.is_empty() {
		out.insert("deleted_ids".into(), json!(outcome.deleted_ids));
	}
	out.insert("assignments".into(), json!(outcome.assignments));
	Ok((StatusCode::OK, Json(Value::Object(out))).into_response())
}

pub async fn bind(State(state): State<AppState>, req: Request<Body>) -> Result<Response, ApiError> {
	let settings = state.settings().await;
	require(
		settings.sync.is_slave() && settings.sync.allow_bind,
		&req,
		Method::POST,
	)?;
	let v = read_json(req).await?;
	let master_id = str_field(&v, "master_id");
	let master_url = str_field(&v, "master_url");
	if master_id.is_none() && master_url.is_none() {
		return Err(ApiError::MissingMasterReference);
	}

	let nodes = state.scanner.nodes(MAX_NODES).await;
	let mut normalized = None;
	for candidate in [master_id, master_url].into_iter().flatten() {
		match normalize_master_reference(candidate, &nodes).await {
			Ok(r) => {
				normalized = Some(r);
				break;
			}
			Err(e) => debug!("bind reference {} rejected: {}", candidate, e),
		}
	}
	let normalized = normalized.ok_or(ApiError::InvalidMasterReference)?;
	let interval = v
		.get("register_interval_s")
		.and_then(Value::as_i64)
		.filter(|n| *n > 0);

	let register_interval_s = {
		let mut s = state.settings.write().await;
		s.sync.master_url = normalized.clone();
		if let Some(n) = interval {
			s.sync.register_interval_s = n;
		}
		s.sync.register_interval_s
	};
	state.slave.reset().await;
	info!("bound to master {}", normalized);

	Ok((
		StatusCode::OK,
		Json(json!({
			"status": "bound",
			"master_url": normalized,
			"register_interval_s": register_interval_s,
		})),
	)
		.into_response())
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::net::Ipv4Addr;

	use super::*;

	#[test]
	fn registration_requires_id() {
		assert!(matches!(
			parse_registration(&json!({"id": "  "}), None),
			Err(ApiError::MissingId)
		));
		let r = parse_registration(
			&json!({"id": "s1", "caps": ["a", "b"], "ack_generation": 3, "callback_url": "http://x"}),
			Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
		)
		.unwrap();
		assert_eq!(r.caps.as_deref(), Some("a,b"));
		assert_eq!(r.ack_generation, 3);
		assert_eq!(r.address, "http://x");
		assert_eq!(r.remote_ip, "10.0.0.2");
	}

	#[test]
	fn push_body_shapes() {
		let b = parse_push(&json!({
			"moves": [
				{"slave_id": "a", "slot": 2},
				{"id": "b", "slot": null},
				{"id": "c", "slot": "3"},
				{"slot": 1}
			],
			"replay_slots": 4,
			"replay_ids": "a",
			"delete_ids": ["x", "y"],
			"delete_id": "z"
		}));
		assert_eq!(
			b.moves,
			vec![
				SlotMove { id: "a".into(), slot: Some(2) },
				SlotMove { id: "b".into(), slot: None },
			]
		);
		assert_eq!(b.replay_slots, vec![4]);
		assert_eq!(b.replay_ids, vec!["a"]);
		assert_eq!(b.delete_ids, vec!["x", "y", "z"]);
	}

	#[test]
	fn single_top_level_move() {
		let b = parse_push(&json!({"slave_id": "a", "slot": 1, "replay_slots": [1, 2]}));
		assert_eq!(b.moves.len(), 1);
		assert_eq!(b.replay_slots, vec![1, 2]);
		assert!(parse_push(&json!({})).is_empty());
	}
}
