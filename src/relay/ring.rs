//! Bounded outbound byte queue for UART writes.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct ByteRing {
	buf: VecDeque<u8>,
	cap: usize,
}

impl ByteRing {
	pub fn with_capacity(cap: usize) -> Self {
		Self {
			buf: VecDeque::with_capacity(cap),
			cap,
		}
	}

	pub fn len(&self) -> usize {
		self.buf.len()
	}

	pub fn is_empty(&self) -> bool {
		self.buf.is_empty()
	}

	pub fn space(&self) -> usize {
		self.cap - self.buf.len()
	}

	/// Append all of `data` or nothing.
	pub fn push(&mut self, data: &[u8]) -> bool {
		if data.len() > self.space() {
			return false;
		}
		self.buf.extend(data);
		true
	}

	/// Longest contiguous run at the head.
	pub fn peek(&self) -> &[u8] {
		self.buf.as_slices().0
	}

	pub fn consume(&mut self, n: usize) {
		self.buf.drain(..n.min(self.buf.len()));
	}

	pub fn clear(&mut self) {
		self.buf.clear();
	}
}
