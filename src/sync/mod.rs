//! Master/slave slot orchestration.
//!
//! The master keeps a [`registry::MasterRegistry`] behind a single lock and
//! answers `/sync/register`, `/sync/slaves` and `/sync/push`. A slave runs
//! [`slave::SlaveWorker`], which registers periodically and applies the
//! command batches it is handed.

pub mod handler;
pub mod reference;
pub mod registry;
pub mod slave;

use serde_json::{Map, Value, json};

use crate::config::Settings;
use slave::SlaveTracking;

/// Number of slots on a master.
pub const SYNC_MAX_SLOTS: usize = 10;
/// Command templates per slot.
pub const SLOT_MAX_COMMANDS: usize = 16;
/// Slave records a master will track.
pub const SYNC_MAX_SLAVES: usize = 64;

/// Capability advertised in `/caps` for the configured sync role.
pub fn sync_capability(settings: &Settings) -> Option<&'static str> {
	if settings.sync.role.is_empty() {
		None
	} else if settings.sync.is_master() {
		Some("sync-master")
	} else {
		Some("sync-slave")
	}
}

/// The `sync` block of `/caps`, or `None` when no role is configured.
pub fn status_block(settings: &Settings, tracking: &SlaveTracking) -> Option<Value> {
	let sync = &settings.sync;
	if sync.role.is_empty() {
		return None;
	}
	let mut out = Map::new();
	out.insert("role".into(), json!(sync.role));
	if !sync.id.is_empty() {
		out.insert("id".into(), json!(sync.id));
	}
	out.insert("allow_bind".into(), json!(u8::from(sync.allow_bind)));
	if sync.is_slave() {
		if !sync.master_url.is_empty() {
			out.insert("master_url".into(), json!(sync.master_url));
		}
		out.insert("register_interval_s".into(), json!(sync.register_interval_s));
		out.insert(
			"last_received_generation".into(),
			json!(tracking.last_received_generation),
		);
		out.insert("applied_generation".into(), json!(tracking.applied_generation));
		if tracking.current_slot > 0 {
			out.insert("current_slot".into(), json!(tracking.current_slot));
			if !tracking.current_slot_label.is_empty() {
				out.insert(
					"current_slot_label".into(),
					json!(tracking.current_slot_label),
				);
			}
		}
	}
	Some(Value::Object(out))
}
