//! Sends blocked on acknowledgment.
//!
//! Reliability is stop-and-wait per `(session, seq)`, not per session: any
//! number of a session's packets may be in flight at once, each with its
//! own retransmit timer, and the receiver's reorder buffer restores
//! ordering. Sequence numbers are never reused within a session, so a key
//! cannot collide while its packet is in flight.

use hashbrown::HashMap;
use stakker::{FixedTimerKey, Ret};

/// One reliable send awaiting its ACK.
pub struct Waiter {
	/// The encoded frame, kept for retransmission.
	pub buf: Vec<u8>,
	/// Transmissions so far, the initial send included.
	pub tries: u32,
	/// The armed retransmit timer.
	pub timer: FixedTimerKey,
	/// Told the outcome when the wait ends; `None` for fire-and-forget DATA.
	pub done: Option<Ret<bool>>,
}

/// The pending-ack table. An entry exists exactly while some send is
/// waiting on the ACK for its key.
#[derive(Default)]
pub struct PendingAcks {
	waiting: HashMap<(u32, u32), Waiter>,
}

impl PendingAcks {
	/// Park a send. Returns a displaced waiter for the same key, which the
	/// caller must dispose of (cancel its timer, fail its completion).
	pub fn insert(&mut self, key: (u32, u32), waiter: Waiter) -> Option<Waiter> {
		self.waiting.insert(key, waiter)
	}

	/// Take the waiter for an arriving ACK; `None` for unmatched ACKs.
	pub fn remove(&mut self, key: (u32, u32)) -> Option<Waiter> {
		self.waiting.remove(&key)
	}

	pub fn len(&self) -> usize {
		self.waiting.len()
	}

	pub fn is_empty(&self) -> bool {
		self.waiting.is_empty()
	}
}
