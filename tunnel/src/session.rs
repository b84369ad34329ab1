//! One session per tunneled TCP connection, plus the registry that owns
//! them all.
//!
//! A session pairs the local socket with two pieces of protocol state: the
//! monotonic outbound sequence allocator, and the reorder buffer that turns
//! the tunnel's unordered arrivals back into the byte stream the local
//! socket expects. The registry is the sole owner of session lifecycles;
//! everything else refers to sessions by id.

use core::fmt;
use std::net::TcpStream;

use hashbrown::HashMap;
use log::{debug, trace, warn};
use runtime::{Io, Result};

/// Where a session's inbound payloads land. `Io<TcpStream>` in production;
/// tests substitute an in-memory sink.
pub trait Sink {
	fn send(&mut self, buf: &[u8]) -> Result;
}

impl Sink for Io<TcpStream> {
	fn send(&mut self, buf: &[u8]) -> Result {
		Io::write(self, buf)
	}
}

/// Why a delivery could not happen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gone {
	/// The local socket has closed; the session awaits reaping.
	Closed,
	/// No session with that id.
	Unknown,
}

/// One tunneled TCP connection.
///
/// The link field doubles as the session's reader: registering the socket
/// with the reactor is what starts reads flowing, and dropping the session
/// deregisters it, which both stops the reads and closes the write side
/// (after any queued bytes drain).
pub struct Session<L> {
	link: L,
	/// Next outbound sequence number to hand out.
	next_seq: u32,
	/// Highest contiguous inbound sequence already written to the link.
	delivered: u32,
	/// Out-of-order arrivals waiting for the gap below them to fill.
	/// Every key is strictly greater than `delivered`.
	pending: HashMap<u32, Vec<u8>>,
	/// No further delivery is possible.
	closed: bool,
	/// A TERMINATE for this session is already on its way.
	draining: bool,
}

impl<L: Sink> Session<L> {
	fn new(link: L) -> Self {
		Self { link, next_seq: 1, delivered: 0, pending: HashMap::new(), closed: false, draining: false }
	}

	/// Allocate the sequence number for the next outbound chunk. Strictly
	/// monotonic from 1; called only from the session's own read events, so
	/// outbound ordering follows from single-producer discipline.
	pub fn next_seq(&mut self) -> u32 {
		let seq = self.next_seq;
		self.next_seq += 1;
		seq
	}

	/// Deliver an inbound chunk. Chunks may arrive in any order and more
	/// than once; the local socket sees each sequence exactly once, in
	/// order, with no gaps.
	pub fn write(&mut self, seq: u32, data: Vec<u8>) -> Result {
		if self.closed {
			return Err(());
		}

		if seq <= self.delivered || self.pending.contains_key(&seq) {
			debug!("Ignoring repeated chunk (seq {seq})");
			return Ok(());
		}

		self.pending.insert(seq, data);

		// Flush the contiguous run this chunk may have completed.
		while let Some(data) = self.pending.remove(&(self.delivered + 1)) {
			if self.link.send(&data).is_err() {
				self.closed = true;
				return Err(());
			}

			self.delivered += 1;
		}

		Ok(())
	}

	#[cfg(test)]
	pub(crate) fn state(&self) -> (u32, usize) {
		(self.delivered, self.pending.len())
	}
}

/// All live sessions, keyed by id. Sessions are created here and destroyed
/// only through [`Registry::remove`].
pub struct Registry<L = Io<TcpStream>> {
	sessions: HashMap<u32, Session<L>>,
	/// Source of fresh ids for locally accepted connections.
	next_id: u32,
}

impl<L> Default for Registry<L> {
	fn default() -> Self {
		Self { sessions: HashMap::new(), next_id: 0 }
	}
}

impl<L: Sink> Registry<L> {
	/// Allocate a fresh session id for a newly accepted connection.
	pub fn alloc_id(&mut self) -> u32 {
		let id = self.next_id;
		self.next_id += 1;
		id
	}

	pub fn contains(&self, id: u32) -> bool {
		self.sessions.contains_key(&id)
	}

	pub fn get_mut(&mut self, id: u32) -> Option<&mut Session<L>> {
		self.sessions.get_mut(&id)
	}

	pub fn add(&mut self, id: u32, link: L) -> Result {
		match self.sessions.entry(id) {
			hashbrown::hash_map::Entry::Occupied(_) => {
				warn!("Session {id} already exists");
				Err(())
			}
			hashbrown::hash_map::Entry::Vacant(slot) => {
				debug!("Added session {id}");
				slot.insert(Session::new(link));
				Ok(())
			}
		}
	}

	/// Destroy a session. Dropping it deregisters the socket, which stops
	/// the inbound reads and closes the write side once its queue drains.
	pub fn remove(&mut self, id: u32) -> Result {
		match self.sessions.remove(&id) {
			Some(_) => {
				debug!("Removed session {id}");
				Ok(())
			}
			None => {
				debug!("Session {id} is not registered");
				Err(())
			}
		}
	}

	/// Forward one inbound chunk to a session. A `Closed` outcome means the
	/// caller must funnel the id to the stale path; the session stays
	/// registered until the reaper takes it.
	pub fn write_to(&mut self, id: u32, seq: u32, data: Vec<u8>) -> Result<(), Gone> {
		let session = self.sessions.get_mut(&id).ok_or(Gone::Unknown)?;

		session.write(seq, data).map_err(|()| {
			trace!("Session {id} can no longer deliver");
			Gone::Closed
		})
	}

	/// Mark a session as draining. Returns false when the id is unknown or
	/// already draining, making the stale path idempotent.
	pub fn begin_drain(&mut self, id: u32) -> bool {
		match self.sessions.get_mut(&id) {
			Some(session) if !session.draining => {
				session.draining = true;
				true
			}
			Some(_) => false,
			None => {
				trace!("Session {id} is already gone");
				false
			}
		}
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}
}

impl<L> fmt::Debug for Registry<L> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("Registry").field("sessions", &self.sessions.len()).finish()
	}
}
