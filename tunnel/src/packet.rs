//! The framed datagram riding inside each ICMP echo payload.
//!
//! Wire layout, big-endian: `session:u32, seq:u32, host_len:u32,
//! action:u16, direction:u16, port:u32`, then `host_len` bytes of UTF-8
//! destination host, then the payload as the remaining bytes. The explicit
//! host length gives a self-describing boundary, so payloads can hold
//! arbitrary binary data without escaping.

use core::fmt;
use core::str::Utf8Error;

use byteorder::{BigEndian, ByteOrder};

/// Fixed frame header length in bytes.
pub const HEADER_LEN: usize = 20;

/// What the receiving peer should do with a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
	/// Open a TCP connection to the carried destination.
	Start = 0,
	/// Tear the session down.
	Terminate = 1,
	/// Deliver the payload to the session's local socket.
	Data = 2,
	/// Acknowledge receipt of the frame with the same `(session, seq)`.
	Ack = 3,
}

impl Action {
	fn from_wire(val: u16) -> Result<Self, DecodeError> {
		match val {
			0 => Ok(Self::Start),
			1 => Ok(Self::Terminate),
			2 => Ok(Self::Data),
			3 => Ok(Self::Ack),
			_ => Err(DecodeError::Action(val)),
		}
	}
}

/// Which peer a frame is headed toward. Each peer stamps its outbound
/// frames with the other side's tag and drops inbound frames carrying the
/// tag it stamps itself: those are its own traffic looped back by the raw
/// socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
	ProxyServer = 0,
	ProxyClient = 1,
}

impl Role {
	fn from_wire(val: u16) -> Result<Self, DecodeError> {
		match val {
			0 => Ok(Self::ProxyServer),
			1 => Ok(Self::ProxyClient),
			_ => Err(DecodeError::Direction(val)),
		}
	}
}

/// One tunnel frame. `seq` is 0 for control frames (START, TERMINATE and
/// their ACKs) and the per-session sequence number for DATA; an ACK echoes
/// the `(session, seq)` of the frame it acknowledges.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
	pub session: u32,
	pub seq: u32,
	pub action: Action,
	pub direction: Role,
	/// Destination host; only START carries one.
	pub host: String,
	/// Destination port; only START carries one.
	pub port: u16,
	/// Application bytes; only DATA carries any.
	pub payload: Vec<u8>,
}

impl Frame {
	pub fn start(session: u32, direction: Role, host: String, port: u16) -> Self {
		Self { session, seq: 0, action: Action::Start, direction, host, port, payload: Vec::new() }
	}

	pub fn data(session: u32, seq: u32, direction: Role, payload: Vec<u8>) -> Self {
		Self { session, seq, action: Action::Data, direction, host: String::new(), port: 0, payload }
	}

	pub fn terminate(session: u32, direction: Role) -> Self {
		Self { session, seq: 0, action: Action::Terminate, direction, host: String::new(), port: 0, payload: Vec::new() }
	}

	pub fn ack(session: u32, seq: u32, direction: Role) -> Self {
		Self { session, seq, action: Action::Ack, direction, host: String::new(), port: 0, payload: Vec::new() }
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut head = [0; HEADER_LEN];

		BigEndian::write_u32(&mut head[0..4], self.session);
		BigEndian::write_u32(&mut head[4..8], self.seq);
		BigEndian::write_u32(&mut head[8..12], self.host.len() as u32);
		BigEndian::write_u16(&mut head[12..14], self.action as u16);
		BigEndian::write_u16(&mut head[14..16], self.direction as u16);
		BigEndian::write_u32(&mut head[16..20], self.port as u32);

		let mut buf = Vec::with_capacity(HEADER_LEN + self.host.len() + self.payload.len());
		buf.extend_from_slice(&head);
		buf.extend_from_slice(self.host.as_bytes());
		buf.extend_from_slice(&self.payload);
		buf
	}

	pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
		if buf.len() < HEADER_LEN {
			return Err(DecodeError::Truncated);
		}

		let session = BigEndian::read_u32(&buf[0..4]);
		let seq = BigEndian::read_u32(&buf[4..8]);
		let host_len = BigEndian::read_u32(&buf[8..12]) as usize;
		let action = Action::from_wire(BigEndian::read_u16(&buf[12..14]))?;
		let direction = Role::from_wire(BigEndian::read_u16(&buf[14..16]))?;
		let port = BigEndian::read_u32(&buf[16..20]) as u16;

		let rest = &buf[HEADER_LEN..];

		if host_len > rest.len() {
			return Err(DecodeError::Truncated);
		}

		let host = core::str::from_utf8(&rest[..host_len]).map_err(DecodeError::Host)?.to_owned();
		let payload = rest[host_len..].to_vec();

		Ok(Self { session, seq, action, direction, host, port, payload })
	}
}

impl fmt::Debug for Frame {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let mut out = f.debug_struct("Frame");

		out.field("session", &self.session)
			.field("seq", &self.seq)
			.field("action", &self.action)
			.field("direction", &self.direction);

		if self.action == Action::Start {
			out.field("host", &self.host).field("port", &self.port);
		}

		out.field("payload", &self.payload.len()).finish()
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
	/// The buffer ends inside the header or the host string.
	Truncated,
	/// Unknown action enumerant.
	Action(u16),
	/// Unknown direction enumerant.
	Direction(u16),
	/// The destination host bytes are not UTF-8.
	Host(Utf8Error),
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Truncated => write!(f, "truncated tunnel frame"),
			Self::Action(val) => write!(f, "unknown action {val}"),
			Self::Direction(val) => write!(f, "unknown direction {val}"),
			Self::Host(err) => write!(f, "destination host is not UTF-8: {err}"),
		}
	}
}
