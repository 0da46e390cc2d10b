//! Wall-clock and monotonic time helpers.

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
	chrono::Utc::now().timestamp()
}

/// Nanoseconds on `CLOCK_MONOTONIC`, or 0 if the clock cannot be read.
pub fn monotonic_ns() -> u64 {
	let mut ts = libc::timespec {
		tv_sec: 0,
		tv_nsec: 0,
	};
	// SAFETY: `ts` is a valid, writable timespec.
	let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
	if rc != 0 {
		return 0;
	}
	(ts.tv_sec as u64)
		.saturating_mul(1_000_000_000)
		.saturating_add(ts.tv_nsec as u64)
}

/// Milliseconds on `CLOCK_MONOTONIC`.
pub fn monotonic_ms() -> i64 {
	(monotonic_ns() / 1_000_000) as i64
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn monotonic_clock_advances() {
		let a = monotonic_ns();
		std::thread::sleep(std::time::Duration::from_millis(2));
		let b = monotonic_ns();
		assert!(a > 0);
		assert!(b > a);
	}
}
