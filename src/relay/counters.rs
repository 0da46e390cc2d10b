//! Traffic counters shared by UDP relays and UART runtimes.

use serde::Serialize;

pub const PKTS_ROLLOVER_LIMIT: u64 = 1_000_000_000;
pub const BYTES_ROLLOVER_LIMIT: u64 = 1 << 40;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
	pub pkts_in: u64,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub send_errs: u64,
	pub rx_drops: u64,
	pub trunc_drops: u64,
	pub last_rx_ns: u64,
}

impl Counters {
	pub fn over_limit(&self) -> bool {
		self.pkts_in > PKTS_ROLLOVER_LIMIT
			|| self.send_errs > PKTS_ROLLOVER_LIMIT
			|| self.rx_drops > PKTS_ROLLOVER_LIMIT
			|| self.trunc_drops > PKTS_ROLLOVER_LIMIT
			|| self.bytes_in > BYTES_ROLLOVER_LIMIT
			|| self.bytes_out > BYTES_ROLLOVER_LIMIT
	}

	/// Halve every counter; `last_rx_ns` is a timestamp and is kept.
	pub fn halve(&mut self) {
		self.pkts_in >>= 1;
		self.bytes_in >>= 1;
		self.bytes_out >>= 1;
		self.send_errs >>= 1;
		self.rx_drops >>= 1;
		self.trunc_drops >>= 1;
	}

	pub fn reset(&mut self) {
		*self = Self::default();
	}
}
