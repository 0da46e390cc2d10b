//! Master-side slave records and the slot table.
//!
//! All operations are synchronous and take the current monotonic time as an
//! argument; the caller holds the master lock for the whole call.

use serde::Serialize;
use thiserror::Error;

use super::{SYNC_MAX_SLAVES, SYNC_MAX_SLOTS};
use crate::config::SlotConfig;

/// A slave as last seen by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveRecord {
	pub id: String,
	pub remote_ip: String,
	pub address: String,
	pub device: String,
	pub role: String,
	pub version: String,
	pub caps: String,
	pub last_seen_ms: i64,
	/// Zero-based slot index.
	pub slot: Option<usize>,
	/// Slot named in the last register response; acks only count against it.
	pub reported_slot: Option<usize>,
	pub last_ack_generation: u64,
}

impl SlaveRecord {
	fn new(id: &str) -> Self {
		Self {
			id: id.to_string(),
			remote_ip: String::new(),
			address: String::new(),
			device: String::new(),
			role: String::new(),
			version: String::new(),
			caps: String::new(),
			last_seen_ms: 0,
			slot: None,
			reported_slot: None,
			last_ack_generation: 0,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SlotState {
	assignee: Option<String>,
	generation: u64,
	manual_override: bool,
}

/// Fields a slave reports in `/sync/register`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
	pub id: String,
	pub remote_ip: String,
	pub address: String,
	pub device: String,
	pub role: String,
	pub version: String,
	pub caps: Option<String>,
	pub ack_generation: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
	/// Every slot is taken.
	Waiting,
	Registered {
		/// Zero-based slot index.
		slot: usize,
		slot_generation: u64,
		/// `slot_generation` when commands must be (re)applied, else 0.
		send_generation: u64,
		label: Option<String>,
		commands: Option<Vec<serde_json::Value>>,
	},
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
	#[error("registry_full")]
	Full,
}

/// One requested move; `slot` is 1-based as received, `None` unassigns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMove {
	pub id: String,
	pub slot: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushBatch {
	pub moves: Vec<SlotMove>,
	/// 1-based slot numbers as received.
	pub replay_slots: Vec<i64>,
	pub replay_ids: Vec<String>,
	pub delete_ids: Vec<String>,
}

impl PushBatch {
	pub fn is_empty(&self) -> bool {
		self.moves.is_empty()
			&& self.replay_slots.is_empty()
			&& self.replay_ids.is_empty()
			&& self.delete_ids.is_empty()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
	#[error("no_moves_provided")]
	NoMoves,
	#[error("slot_out_of_range")]
	SlotOutOfRange { slot: i64 },
	#[error("slave_not_found")]
	SlaveNotFound { id: String },
	#[error("slot_unassigned")]
	SlotUnassigned { slot: i64 },
	#[error("replay_slave_not_found")]
	ReplaySlaveNotFound { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
	pub slot: usize,
	pub slave_id: String,
	pub generation: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub slot_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
	pub moves: usize,
	pub replayed_slots: usize,
	pub deleted_ids: Vec<String>,
	pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlaveView {
	pub id: String,
	pub remote_ip: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub address: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub device: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub role: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub caps: Option<String>,
	pub last_seen_ms: i64,
	pub last_ack_generation: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub slot: Option<usize>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub slot_generation: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub slot_label: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub preferred_slot: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
	pub slot: usize,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub label: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub prefer_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub assigned_id: Option<String>,
	pub generation: u64,
	pub manual_override: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
	pub slaves: Vec<SlaveView>,
	pub slots: Vec<SlotView>,
}

fn non_empty(s: &str) -> Option<String> {
	(!s.is_empty()).then(|| s.to_string())
}

fn slot_label(cfg: &[SlotConfig], slot: usize) -> Option<String> {
	cfg.get(slot).and_then(|c| non_empty(&c.name))
}

fn prefer_id(cfg: &[SlotConfig], slot: usize) -> &str {
	cfg.get(slot).map(|c| c.prefer_id.as_str()).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct MasterRegistry {
	records: Vec<SlaveRecord>,
	slots: Vec<SlotState>,
}

impl Default for MasterRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl MasterRegistry {
	pub fn new() -> Self {
		Self {
			records: Vec::new(),
			slots: vec![SlotState::default(); SYNC_MAX_SLOTS],
		}
	}

	pub fn records(&self) -> &[SlaveRecord] {
		&self.records
	}

	pub fn record(&self, id: &str) -> Option<&SlaveRecord> {
		self.records.iter().find(|r| r.id == id)
	}

	/// Zero-based slot currently held by `id`.
	pub fn slot_of(&self, id: &str) -> Option<usize> {
		self.slots
			.iter()
			.position(|s| s.assignee.as_deref() == Some(id))
	}

	pub fn generation(&self, slot: usize) -> u64 {
		self.slots.get(slot).map(|s| s.generation).unwrap_or(0)
	}

	pub fn assignee(&self, slot: usize) -> Option<&str> {
		self.slots.get(slot).and_then(|s| s.assignee.as_deref())
	}

	pub fn manual_override(&self, slot: usize) -> bool {
		self.slots.get(slot).map(|s| s.manual_override).unwrap_or(false)
	}

	fn find(&self, id: &str) -> Option<usize> {
		self.records.iter().position(|r| r.id == id)
	}

	fn mark_generation(&mut self, slot: usize) {
		let st = &mut self.slots[slot];
		st.generation = st.generation.saturating_add(1).max(1);
	}

	fn ensure_generation(&mut self, slot: usize) {
		if self.slots[slot].generation == 0 {
			self.slots[slot].generation = 1;
		}
	}

	fn unlink(&mut self, id: &str, slot: usize) {
		if let Some(r) = self.find(id) {
			if self.records[r].slot == Some(slot) {
				self.records[r].slot = None;
				self.records[r].last_ack_generation = 0;
			}
		}
	}

	fn release_slot(&mut self, slot: usize) {
		if let Some(id) = self.slots[slot].assignee.take() {
			self.unlink(&id, slot);
		}
		self.slots[slot].manual_override = false;
		self.mark_generation(slot);
	}

	/// Remove `id` entirely, releasing any slot it holds. Returns false if unknown.
	pub fn delete_record(&mut self, id: &str) -> bool {
		let Some(r) = self.find(id) else {
			return false;
		};
		for slot in 0..SYNC_MAX_SLOTS {
			if self.slots[slot].assignee.as_deref() == Some(id) {
				self.release_slot(slot);
			}
		}
		self.records.remove(r);
		true
	}

	/// Release slots whose assignee is gone or stale, then forget stale
	/// unassigned records. Staleness only applies when `retention_s > 0`.
	pub fn prune(&mut self, retention_s: i64, now_ms: i64) {
		let cutoff = now_ms - retention_s.saturating_mul(1000);
		let stale = |r: &SlaveRecord| retention_s > 0 && r.last_seen_ms > 0 && r.last_seen_ms < cutoff;

		for slot in 0..SYNC_MAX_SLOTS {
			let Some(id) = self.slots[slot].assignee.clone() else {
				continue;
			};
			let release = match self.find(&id) {
				None => true,
				Some(r) => stale(&self.records[r]),
			};
			if release {
				log::info!("releasing slot {} held by {}", slot + 1, id);
				self.release_slot(slot);
			}
		}

		if retention_s > 0 {
			self.records.retain(|r| r.slot.is_some() || !stale(r));
		}
	}

	/// Force the occupant of `slot` to receive commands again.
	pub fn force_replay(&mut self, slot: usize) -> bool {
		let Some(id) = self.slots[slot].assignee.clone() else {
			return false;
		};
		if let Some(r) = self.find(&id) {
			self.records[r].last_ack_generation = 0;
		}
		self.mark_generation(slot);
		true
	}

	fn preferred_slot(cfg: &[SlotConfig], id: &str) -> Option<usize> {
		(0..SYNC_MAX_SLOTS).find(|&s| {
			let p = prefer_id(cfg, s);
			!p.is_empty() && p == id
		})
	}

	fn assign_slot(&mut self, r: usize, slot: usize) {
		let id = self.records[r].id.clone();
		if self.slots[slot].assignee.as_deref() == Some(id.as_str()) {
			self.records[r].slot = Some(slot);
			self.records[r].last_ack_generation = 0;
			self.ensure_generation(slot);
			return;
		}
		for other in 0..SYNC_MAX_SLOTS {
			if other != slot && self.slots[other].assignee.as_deref() == Some(id.as_str()) {
				self.slots[other].assignee = None;
				self.slots[other].manual_override = false;
				self.mark_generation(other);
			}
		}
		if let Some(prev) = self.slots[slot].assignee.take() {
			self.unlink(&prev, slot);
		}
		self.slots[slot].assignee = Some(id);
		self.slots[slot].manual_override = false;
		self.records[r].slot = Some(slot);
		self.records[r].last_ack_generation = 0;
		self.mark_generation(slot);
	}

	fn auto_assign(&mut self, r: usize, forbid: Option<usize>, cfg: &[SlotConfig]) -> Option<usize> {
		let id = self.records[r].id.clone();

		if let Some(s) = self.records[r].slot {
			if Some(s) == forbid {
				self.records[r].slot = None;
			} else if self.slots[s].assignee.as_deref() != Some(id.as_str()) {
				self.assign_slot(r, s);
				return Some(s);
			} else {
				self.ensure_generation(s);
				return Some(s);
			}
		}

		if let Some(p) = Self::preferred_slot(cfg, &id).filter(|p| Some(*p) != forbid) {
			let st = &self.slots[p];
			let held_elsewhere = st.assignee.as_deref().is_some_and(|a| a != id);
			if !(st.manual_override && held_elsewhere) {
				let displaced = st.assignee.clone().filter(|a| *a != id);
				self.assign_slot(r, p);
				if let Some(d) = displaced {
					if let Some(di) = self.find(&d) {
						self.records[di].slot = None;
						let moved = self.auto_assign(di, Some(p), cfg);
						log::info!(
							"{} displaced from slot {} by preferred {}, now {:?}",
							d,
							p + 1,
							id,
							moved.map(|s| s + 1)
						);
					}
				}
				return Some(p);
			}
		}

		if let Some(s) = (0..SYNC_MAX_SLOTS)
			.find(|&s| Some(s) != forbid && self.slots[s].assignee.as_deref() == Some(id.as_str()))
		{
			self.assign_slot(r, s);
			return Some(s);
		}

		if let Some(s) =
			(0..SYNC_MAX_SLOTS).find(|&s| Some(s) != forbid && self.slots[s].assignee.is_none())
		{
			self.assign_slot(r, s);
			return Some(s);
		}

		None
	}

	/// Handle one `/sync/register` call.
	pub fn register(
		&mut self,
		reg: &Registration,
		cfg: &[SlotConfig],
		retention_s: i64,
		now_ms: i64,
	) -> Result<RegisterOutcome, RegistryError> {
		self.prune(retention_s, now_ms);

		let r = match self.find(&reg.id) {
			Some(r) => r,
			None => {
				if self.records.len() >= SYNC_MAX_SLAVES {
					return Err(RegistryError::Full);
				}
				self.records.push(SlaveRecord::new(&reg.id));
				self.records.len() - 1
			}
		};

		{
			let rec = &mut self.records[r];
			rec.last_seen_ms = now_ms;
			rec.remote_ip = reg.remote_ip.clone();
			if !reg.address.is_empty() {
				rec.address = reg.address.clone();
			}
			if !reg.device.is_empty() {
				rec.device = reg.device.clone();
			}
			if !reg.role.is_empty() {
				rec.role = reg.role.clone();
			}
			if !reg.version.is_empty() {
				rec.version = reg.version.clone();
			}
			if let Some(caps) = &reg.caps {
				rec.caps = caps.clone();
			}
		}

		let Some(slot) = self.auto_assign(r, None, cfg) else {
			self.records[r].reported_slot = None;
			return Ok(RegisterOutcome::Waiting);
		};

		let slot_generation = self.slots[slot].generation;
		let rec = &mut self.records[r];
		let changed = rec.reported_slot != Some(slot);
		rec.reported_slot = Some(slot);
		if changed {
			rec.last_ack_generation = 0;
		} else if reg.ack_generation > 0 {
			let ack = reg.ack_generation as u64;
			if ack > slot_generation {
				rec.last_ack_generation = 0;
			} else if ack > rec.last_ack_generation {
				rec.last_ack_generation = ack;
			}
		}

		let send_generation = if slot_generation > rec.last_ack_generation {
			slot_generation
		} else {
			0
		};
		let commands = (send_generation > 0)
			.then(|| cfg.get(slot).map(|c| c.commands.clone()).unwrap_or_default());

		Ok(RegisterOutcome::Registered {
			slot,
			slot_generation,
			send_generation,
			label: slot_label(cfg, slot),
			commands,
		})
	}

	/// Apply an operator batch. Either the whole batch applies or nothing changes.
	pub fn apply_push(
		&mut self,
		batch: &PushBatch,
		cfg: &[SlotConfig],
		retention_s: i64,
		now_ms: i64,
	) -> Result<PushOutcome, PushError> {
		if batch.is_empty() {
			return Err(PushError::NoMoves);
		}

		let mut next = self.clone();
		let outcome = next.apply_push_inner(batch, cfg, retention_s, now_ms)?;
		*self = next;
		Ok(outcome)
	}

	fn apply_push_inner(
		&mut self,
		batch: &PushBatch,
		cfg: &[SlotConfig],
		retention_s: i64,
		now_ms: i64,
	) -> Result<PushOutcome, PushError> {
		self.prune(retention_s, now_ms);

		let mut deleted_ids = Vec::new();
		for id in &batch.delete_ids {
			if id.is_empty() || deleted_ids.contains(id) {
				continue;
			}
			if self.delete_record(id) {
				deleted_ids.push(id.clone());
			}
		}

		let mut planned: Vec<Option<String>> =
			self.slots.iter().map(|s| s.assignee.clone()).collect();
		let mut touched = [false; SYNC_MAX_SLOTS];

		for mv in &batch.moves {
			let target = match mv.slot {
				None => None,
				Some(n) if (1..=SYNC_MAX_SLOTS as i64).contains(&n) => Some((n - 1) as usize),
				Some(n) => return Err(PushError::SlotOutOfRange { slot: n }),
			};
			if self.find(&mv.id).is_none() {
				return Err(PushError::SlaveNotFound { id: mv.id.clone() });
			}
			for (s, p) in planned.iter_mut().enumerate() {
				if p.as_deref() == Some(mv.id.as_str()) {
					*p = None;
					touched[s] = true;
				}
			}
			if let Some(s) = target {
				planned[s] = Some(mv.id.clone());
				touched[s] = true;
			}
		}

		let mut replay = [false; SYNC_MAX_SLOTS];
		for &n in &batch.replay_slots {
			if !(1..=SYNC_MAX_SLOTS as i64).contains(&n) {
				return Err(PushError::SlotOutOfRange { slot: n });
			}
			let s = (n - 1) as usize;
			if planned[s].is_none() {
				return Err(PushError::SlotUnassigned { slot: n });
			}
			replay[s] = true;
		}
		for id in &batch.replay_ids {
			match planned.iter().position(|p| p.as_deref() == Some(id.as_str())) {
				Some(s) => replay[s] = true,
				None => return Err(PushError::ReplaySlaveNotFound { id: id.clone() }),
			}
		}

		for slot in 0..SYNC_MAX_SLOTS {
			if touched[slot] || planned[slot] != self.slots[slot].assignee {
				self.write_slot(slot, planned[slot].as_deref(), cfg);
			}
		}

		let mut replayed_slots = 0;
		for slot in 0..SYNC_MAX_SLOTS {
			if replay[slot] && self.force_replay(slot) {
				replayed_slots += 1;
			}
		}

		Ok(PushOutcome {
			moves: batch.moves.len(),
			replayed_slots,
			deleted_ids,
			assignments: self.assignments(cfg),
		})
	}

	/// Commit one planned slot value. Every write advances the generation.
	fn write_slot(&mut self, slot: usize, new_id: Option<&str>, cfg: &[SlotConfig]) {
		let current = self.slots[slot].assignee.clone();
		if current.as_deref() != new_id {
			if let Some(cur) = current {
				self.unlink(&cur, slot);
			}
			if let Some(id) = new_id {
				if let Some(r) = self.find(id) {
					self.records[r].slot = Some(slot);
					self.records[r].last_ack_generation = 0;
				}
			}
			self.slots[slot].assignee = new_id.map(str::to_string);
		} else if let Some(id) = new_id {
			if let Some(r) = self.find(id) {
				self.records[r].slot = Some(slot);
			}
		}
		let prefer = prefer_id(cfg, slot);
		self.slots[slot].manual_override =
			new_id.is_some_and(|id| !prefer.is_empty() && prefer != id);
		self.mark_generation(slot);
	}

	pub fn assignments(&self, cfg: &[SlotConfig]) -> Vec<Assignment> {
		self.slots
			.iter()
			.enumerate()
			.filter_map(|(s, st)| {
				st.assignee.as_ref().map(|id| Assignment {
					slot: s + 1,
					slave_id: id.clone(),
					generation: st.generation,
					slot_label: slot_label(cfg, s),
				})
			})
			.collect()
	}

	pub fn snapshot(&self, cfg: &[SlotConfig]) -> RegistrySnapshot {
		let slaves = self
			.records
			.iter()
			.map(|r| {
				let slot = r.slot.filter(|s| self.slots[*s].assignee.as_deref() == Some(r.id.as_str()));
				SlaveView {
					id: r.id.clone(),
					remote_ip: r.remote_ip.clone(),
					address: non_empty(&r.address),
					device: non_empty(&r.device),
					role: non_empty(&r.role),
					version: non_empty(&r.version),
					caps: non_empty(&r.caps),
					last_seen_ms: r.last_seen_ms,
					last_ack_generation: r.last_ack_generation,
					slot: slot.map(|s| s + 1),
					slot_generation: slot.map(|s| self.slots[s].generation),
					slot_label: slot.and_then(|s| slot_label(cfg, s)),
					preferred_slot: Self::preferred_slot(cfg, &r.id).map(|s| s + 1),
				}
			})
			.collect();

		let slots = self
			.slots
			.iter()
			.enumerate()
			.map(|(s, st)| SlotView {
				slot: s + 1,
				label: slot_label(cfg, s),
				prefer_id: non_empty(prefer_id(cfg, s)),
				assigned_id: st.assignee.clone(),
				generation: st.generation,
				manual_override: st.manual_override,
			})
			.collect();

		RegistrySnapshot { slaves, slots }
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	fn slots() -> Vec<SlotConfig> {
		let mut cfg = vec![SlotConfig::default(); SYNC_MAX_SLOTS];
		cfg[0].name = "front".into();
		cfg[0].commands = vec![serde_json::json!({"path": "/opt/front.sh"})];
		cfg[2].name = "rear".into();
		cfg[2].commands = vec![
			serde_json::json!({"path": "/opt/rear.sh", "args": ["1"]}),
			serde_json::json!({"path": "/opt/rear2.sh"}),
		];
		cfg
	}

	fn reg(id: &str, ack: i64) -> Registration {
		Registration {
			id: id.into(),
			remote_ip: "10.0.0.9".into(),
			ack_generation: ack,
			..Registration::default()
		}
	}

	fn registered(out: RegisterOutcome) -> (usize, u64, u64, Option<Vec<serde_json::Value>>) {
		match out {
			RegisterOutcome::Registered {
				slot,
				slot_generation,
				send_generation,
				commands,
				..
			} => (slot, slot_generation, send_generation, commands),
			RegisterOutcome::Waiting => panic!("expected a slot"),
		}
	}

	/// Every slot has at most one assignee, every record is in at most one
	/// slot, and record pointers agree with the table.
	fn assert_consistent(reg: &MasterRegistry) {
		for r in reg.records() {
			let held: Vec<usize> = (0..SYNC_MAX_SLOTS)
				.filter(|&s| reg.assignee(s) == Some(r.id.as_str()))
				.collect();
			assert!(held.len() <= 1, "{} in {:?}", r.id, held);
			if let Some(s) = r.slot {
				assert_eq!(reg.assignee(s), Some(r.id.as_str()));
			}
		}
	}

	#[test]
	fn first_registration_takes_lowest_free_slot_with_commands() {
		let cfg = slots();
		let mut m = MasterRegistry::new();
		let (slot, gen_, send, cmds) = registered(m.register(&reg("s1", 0), &cfg, 0, 1000).unwrap());
		assert_eq!(slot, 0);
		assert_eq!(gen_, 1);
		assert_eq!(send, 1);
		assert_eq!(cmds.unwrap().len(), 1);
		assert_consistent(&m);
	}

	#[test]
	fn acked_slave_receives_generation_zero() {
		let cfg = slots();
		let mut m = MasterRegistry::new();
		let (_, g, _, _) = registered(m.register(&reg("s1", 0), &cfg, 0, 1000).unwrap());
		let (_, _, send, cmds) = registered(m.register(&reg("s1", g as i64), &cfg, 0, 2000).unwrap());
		assert_eq!(send, 0);
		assert!(cmds.is_none());
		assert_eq!(m.record("s1").unwrap().last_ack_generation, g);
	}

	#[test]
	fn ack_beyond_generation_resets_and_replays() {
		let cfg = slots();
		let mut m = MasterRegistry::new();
		registered(m.register(&reg("s1", 0), &cfg, 0, 1000).unwrap());
		registered(m.register(&reg("s1", 1), &cfg, 0, 1500).unwrap());
		let (_, g, send, cmds) = registered(m.register(&reg("s1", 99), &cfg, 0, 2000).unwrap());
		assert_eq!(send, g);
		assert!(cmds.is_some());
		assert_eq!(m.record("s1").unwrap().last_ack_generation, 0);
	}

	#[test]
	fn waiting_when_all_slots_taken() {
		let cfg = slots();
		let mut m = MasterRegistry::new();
		for i in 0..SYNC_MAX_SLOTS {
			registered(m.register(&reg(&format!("s{}", i), 0), &cfg, 0, 1000).unwrap());
		}
		let before: Vec<u64> = (0..SYNC_MAX_SLOTS).map(|s| m.generation(s)).collect();
		assert_eq!(
			m.register(&reg("late", 0), &cfg, 0, 1000).unwrap(),
			RegisterOutcome::Waiting
		);
		let after: Vec<u64> = (0..SYNC_MAX_SLOTS).map(|s| m.generation(s)).collect();
		assert_eq!(before, after);
		assert!(m.record("late").unwrap().slot.is_none());
	}

	#[test]
	fn registry_full_beyond_max_slaves() {
		let cfg = slots();
		let mut m = MasterRegistry::new();
		for i in 0..SYNC_MAX_SLAVES {
			m.register(&reg(&format!("n{}", i), 0), &cfg, 0, 1000).unwrap();
		}
		assert_eq!(
			m.register(&reg("one-more", 0), &cfg, 0, 1000),
			Err(RegistryError::Full)
		);
	}

	#[test]
	fn preferred_slot_displaces_occupant() {
		let mut cfg = slots();
		cfg[0].prefer_id = "cam-a".into();
		let mut m = MasterRegistry::new();
		registered(m.register(&reg("other", 0), &cfg, 0, 1000).unwrap());
		assert_eq!(m.slot_of("other"), Some(0));

		let (slot, _, _, _) = registered(m.register(&reg("cam-a", 0), &cfg, 0, 1100).unwrap());
		assert_eq!(slot, 0);
		assert_eq!(m.slot_of("other"), Some(1));
		assert_eq!(m.record("other").unwrap().last_ack_generation, 0);
		assert_consistent(&m);
	}

	#[test]
	fn manual_override_blocks_preference() {
		let mut cfg = slots();
		cfg[0].prefer_id = "cam-a".into();
		let mut m = MasterRegistry::new();
		registered(m.register(&reg("other", 0), &cfg, 0, 1000).unwrap());
		registered(m.register(&reg("cam-a", 0), &cfg, 0, 1000).unwrap());
		m.apply_push(
			&PushBatch {
				moves: vec![SlotMove {
					id: "other".into(),
					slot: Some(1),
				}],
				..PushBatch::default()
			},
			&cfg,
			0,
			1200,
		)
		.unwrap();
		assert!(m.manual_override(0));
		assert!(m.record("cam-a").unwrap().slot.is_none());

		let (slot, _, _, _) = registered(m.register(&reg("cam-a", 0), &cfg, 0, 1300).unwrap());
		assert_ne!(slot, 0);
		assert_eq!(m.slot_of("other"), Some(0));
		assert_consistent(&m);
	}

	#[test]
	fn operator_move_bumps_generation_and_replays() {
		let cfg = slots();
		let mut m = MasterRegistry::new();
		let (_, g, _, _) = registered(m.register(&reg("s1", 0), &cfg, 0, 1000).unwrap());
		registered(m.register(&reg("s1", g as i64), &cfg, 0, 1100).unwrap());

		let out = m
			.apply_push(
				&PushBatch {
					moves: vec![SlotMove {
						id: "s1".into(),
						slot: Some(3),
					}],
					..PushBatch::default()
				},
				&cfg,
				0,
				1200,
			)
			.unwrap();
		assert_eq!(out.moves, 1);
		assert_eq!(out.assignments.len(), 1);
		assert_eq!(out.assignments[0].slot, 3);
		assert_eq!(out.assignments[0].slave_id, "s1");
		assert_eq!(out.assignments[0].slot_label.as_deref(), Some("rear"));
		assert!(m.generation(0) > g);

		let (slot, g3, send, cmds) =
			registered(m.register(&reg("s1", g as i64), &cfg, 0, 1300).unwrap());
		assert_eq!(slot, 2);
		assert_eq!(send, g3);
		assert_eq!(cmds.unwrap().len(), 2);
		assert_consistent(&m);
	}

	#[test]
	fn replay_forces_redelivery() {
		let cfg = slots();
		let mut m = MasterRegistry::new();
		let (_, g, _, _) = registered(m.register(&reg("s1", 0), &cfg, 0, 1000).unwrap());
		registered(m.register(&reg("s1", g as i64), &cfg, 0, 1100).unwrap());

		let out = m
			.apply_push(
				&PushBatch {
					replay_slots: vec![1],
					..PushBatch::default()
				},
				&cfg,
				0,
				1200,
			)
			.unwrap();
		assert_eq!(out.replayed_slots, 1);
		let g2 = m.generation(0);
		assert_eq!(g2, g + 1);

		let (_, _, send, cmds) = registered(m.register(&reg("s1", g as i64), &cfg, 0, 1300).unwrap());
		assert_eq!(send, g2);
		assert!(cmds.is_some());
	}

	#[test]
	fn repeated_identical_push_advances_by_same_delta() {
		let cfg = slots();
		let mut m = MasterRegistry::new();
		registered(m.register(&reg("s1", 0), &cfg, 0, 1000).unwrap());
		registered(m.register(&reg("s2", 0), &cfg, 0, 1000).unwrap());
		let batch = PushBatch {
			moves: vec![
				SlotMove {
					id: "s1".into(),
					slot: Some(5),
				},
				SlotMove {
					id: "s2".into(),
					slot: None,
				},
			],
			..PushBatch::default()
		};
		let g0: Vec<u64> = (0..SYNC_MAX_SLOTS).map(|s| m.generation(s)).collect();
		let first = m.apply_push(&batch, &cfg, 0, 1100).unwrap();
		let g1: Vec<u64> = (0..SYNC_MAX_SLOTS).map(|s| m.generation(s)).collect();
		let second = m.apply_push(&batch, &cfg, 0, 1200).unwrap();
		let g2: Vec<u64> = (0..SYNC_MAX_SLOTS).map(|s| m.generation(s)).collect();

		assert_eq!(
			first.assignments.iter().map(|a| (a.slot, a.slave_id.clone())).collect::<Vec<_>>(),
			second.assignments.iter().map(|a| (a.slot, a.slave_id.clone())).collect::<Vec<_>>()
		);
		for s in 0..SYNC_MAX_SLOTS {
			assert!(g1[s] >= g0[s]);
			assert!(g2[s] >= g1[s]);
		}
		assert_eq!(g2[4] - g1[4], 1);
		assert_eq!(g2[1] - g1[1], 0);
		assert_consistent(&m);
	}

	#[test]
	fn batch_validation_is_atomic() {
		let cfg = slots();
		let mut m = MasterRegistry::new();
		registered(m.register(&reg("s1", 0), &cfg, 0, 1000).unwrap());
		registered(m.register(&reg("s2", 0), &cfg, 0, 1000).unwrap());
		let before = m.snapshot(&cfg);

		let err = m
			.apply_push(
				&PushBatch {
					delete_ids: vec!["s2".into()],
					moves: vec![SlotMove {
						id: "s1".into(),
						slot: Some(11),
					}],
					..PushBatch::default()
				},
				&cfg,
				0,
				1100,
			)
			.unwrap_err();
		assert_eq!(err, PushError::SlotOutOfRange { slot: 11 });
		assert_eq!(m.snapshot(&cfg), before);

		let err = m
			.apply_push(
				&PushBatch {
					moves: vec![SlotMove {
						id: "ghost".into(),
						slot: Some(2),
					}],
					..PushBatch::default()
				},
				&cfg,
				0,
				1100,
			)
			.unwrap_err();
		assert_eq!(err, PushError::SlaveNotFound { id: "ghost".into() });

		let err = m
			.apply_push(
				&PushBatch {
					replay_slots: vec![7],
					..PushBatch::default()
				},
				&cfg,
				0,
				1100,
			)
			.unwrap_err();
		assert_eq!(err, PushError::SlotUnassigned { slot: 7 });

		let err = m
			.apply_push(
				&PushBatch {
					replay_slots: vec![0],
					..PushBatch::default()
				},
				&cfg,
				0,
				1100,
			)
			.unwrap_err();
		assert_eq!(err, PushError::SlotOutOfRange { slot: 0 });

		let err = m
			.apply_push(
				&PushBatch {
					replay_ids: vec!["ghost".into()],
					..PushBatch::default()
				},
				&cfg,
				0,
				1100,
			)
			.unwrap_err();
		assert_eq!(err, PushError::ReplaySlaveNotFound { id: "ghost".into() });

		assert_eq!(
			m.apply_push(&PushBatch::default(), &cfg, 0, 1100).unwrap_err(),
			PushError::NoMoves
		);
		assert_eq!(m.snapshot(&cfg), before);
	}

	#[test]
	fn move_onto_occupied_slot_displaces() {
		let cfg = slots();
		let mut m = MasterRegistry::new();
		registered(m.register(&reg("s1", 0), &cfg, 0, 1000).unwrap());
		registered(m.register(&reg("s2", 0), &cfg, 0, 1000).unwrap());
		m.apply_push(
			&PushBatch {
				moves: vec![SlotMove {
					id: "s2".into(),
					slot: Some(1),
				}],
				..PushBatch::default()
			},
			&cfg,
			0,
			1100,
		)
		.unwrap();
		assert_eq!(m.slot_of("s2"), Some(0));
		assert_eq!(m.slot_of("s1"), None);
		assert!(m.record("s1").unwrap().slot.is_none());
		assert_consistent(&m);
	}

	#[test]
	fn delete_releases_slot_and_reports_ids() {
		let cfg = slots();
		let mut m = MasterRegistry::new();
		registered(m.register(&reg("s1", 0), &cfg, 0, 1000).unwrap());
		let g = m.generation(0);
		let out = m
			.apply_push(
				&PushBatch {
					delete_ids: vec!["s1".into(), "s1".into(), "ghost".into()],
					..PushBatch::default()
				},
				&cfg,
				0,
				1100,
			)
			.unwrap();
		assert_eq!(out.deleted_ids, vec!["s1".to_string()]);
		assert!(m.record("s1").is_none());
		assert!(m.assignee(0).is_none());
		assert!(m.generation(0) > g);
	}

	#[test]
	fn retention_releases_stale_slots_and_records() {
		let cfg = slots();
		let mut m = MasterRegistry::new();
		registered(m.register(&reg("old", 0), &cfg, 60, 1_000).unwrap());
		registered(m.register(&reg("new", 0), &cfg, 60, 50_000).unwrap());

		m.prune(60, 70_000);
		assert!(m.assignee(0).is_none());
		assert!(m.record("old").is_none());
		assert_eq!(m.slot_of("new"), Some(1));
		assert_consistent(&m);
	}

	#[test]
	fn zero_retention_never_expires() {
		let cfg = slots();
		let mut m = MasterRegistry::new();
		registered(m.register(&reg("old", 0), &cfg, 0, 1).unwrap());
		m.prune(0, i64::MAX / 2);
		assert_eq!(m.slot_of("old"), Some(0));
	}

	#[test]
	fn snapshot_reports_slot_and_preference() {
		let mut cfg = slots();
		cfg[3].prefer_id = "s9".into();
		let mut m = MasterRegistry::new();
		let mut r = reg("s9", 0);
		r.caps = Some("dvr,osd".into());
		r.device = "cam".into();
		registered(m.register(&r, &cfg, 0, 1000).unwrap());
		let snap = m.snapshot(&cfg);
		assert_eq!(snap.slaves.len(), 1);
		let v = &snap.slaves[0];
		assert_eq!(v.slot, Some(4));
		assert_eq!(v.preferred_slot, Some(4));
		assert_eq!(v.caps.as_deref(), Some("dvr,osd"));
		assert_eq!(snap.slots.len(), SYNC_MAX_SLOTS);
		assert_eq!(snap.slots[3].assigned_id.as_deref(), Some("s9"));
		assert_eq!(snap.slots[3].prefer_id.as_deref(), Some("s9"));
		assert!(!snap.slots[3].manual_override);

		let json = serde_json::to_value(&snap).unwrap();
		assert!(json["slaves"][0].get("address").is_none());
		assert_eq!(json["slots"][0]["label"], "front");
	}
}
