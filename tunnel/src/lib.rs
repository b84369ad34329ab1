//! A bidirectional TCP-over-ICMP tunnel engine.
//!
//! Two peers shuttle TCP byte streams as echo-request/reply payloads: the
//! origin side (`proxy_client`) accepts local connections and asks the
//! egress side (`proxy_server`) to open the real destination, after which
//! both pump application bytes through framed, acknowledged, retransmitted
//! ICMP datagrams. One [`Tunnel`] actor owns everything: the raw socket,
//! the session registry, and the pending-ack table.

use core::time::Duration;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::OwnedFd;

use hashbrown::HashSet;
use log::{debug, info, trace, warn};
use runtime::{Io, Listen};
use stakker::{call, fwd_to, ret, ret_some_to, FixedTimerKey, Ret, CX};

pub mod endpoint;
pub mod icmp;
pub mod packet;
pub mod pending;
pub mod session;

use endpoint::Endpoint;
use icmp::Kind;
use packet::{Action, Frame, Role};
use pending::{PendingAcks, Waiter};
use session::{Gone, Registry};

/// Bytes read from a local TCP socket per chunk. One chunk rides one echo,
/// so IP(20) + ICMP(8) + frame header must still fit the path MTU on top.
pub const DATA_SIZE: usize = 1024;

/// How long a send waits for its ACK before retransmitting.
pub const RESPONSE_WAIT_TIME: Duration = Duration::from_secs(1);

/// Transmissions per packet (the first included) before giving up.
pub const MAX_TRANSMITS: u32 = 3;

/// What distinguishes the two peers: only the origin side accepts local
/// connections, and only the egress side honors START.
enum Peer {
	/// Origin side. Accepted connections arrive off the listener; every one
	/// asks the far end to connect to `host:port`.
	Client { _listener: Listen, host: String, port: u16 },
	/// Egress side. Destination connects in flight, by session id.
	Server { connecting: HashSet<u32> },
}

/// The tunnel engine. Everything happens on one event loop: reactor
/// forwards deliver socket traffic into the methods below, deferred
/// self-calls serialize session teardown, and timers drive retransmission.
pub struct Tunnel {
	link: Endpoint,
	registry: Registry,
	pending: PendingAcks,
	/// The role tag stamped on outbound frames: the peer they are FOR.
	/// Inbound frames carrying the same tag are our own loopback echo.
	dir: Role,
	peer: Peer,
}

impl Tunnel {
	/// Origin-side tunnel: accept on `listener`, reach the peer at
	/// `peer_addr`, and have it connect every session to `host:port`.
	pub fn client(cx: CX![], sock: OwnedFd, peer_addr: Ipv4Addr, listener: TcpListener, host: String, port: u16) -> Option<Self> {
		info!("Tunneling to {host}:{port} via {peer_addr}");

		Some(Self {
			link: Endpoint::new(sock, fwd_to!([cx], recv() as (Vec<u8>)), Some(peer_addr), 0),
			registry: Registry::default(),
			pending: PendingAcks::default(),
			dir: Role::ProxyServer,
			peer: Peer::Client {
				_listener: Listen::new(listener, fwd_to!([cx], accept() as (TcpStream, SocketAddr))),
				host,
				port,
			},
		})
	}

	/// Egress-side tunnel: the peer announces itself with its first packet.
	pub fn server(cx: CX![], sock: OwnedFd) -> Option<Self> {
		info!("Waiting for a peer to make contact");

		Some(Self {
			link: Endpoint::new(sock, fwd_to!([cx], recv() as (Vec<u8>)), None, 0),
			registry: Registry::default(),
			pending: PendingAcks::default(),
			dir: Role::ProxyClient,
			peer: Peer::Server { connecting: HashSet::new() },
		})
	}

	/// A local connection was accepted: claim an id and ask the far end to
	/// open the destination. The session only joins the registry once the
	/// START is acknowledged.
	fn accept(&mut self, cx: CX![], stream: TcpStream, addr: SocketAddr) {
		let Peer::Client { host, port, .. } = &self.peer else { return };
		let (host, port) = (host.clone(), *port);

		let id = self.registry.alloc_id();
		info!("New local connection from {addr} (session {id})");

		let frame = Frame::start(id, self.dir, host, port);
		let done = ret_some_to!([cx], started(id, stream) as (bool));
		self.transmit(cx, frame, Some(done));
	}

	/// Outcome of a START. On success the socket goes live; on failure it
	/// drops here, which closes the local connection.
	fn started(&mut self, cx: CX![], id: u32, stream: TcpStream, ok: bool) {
		if !ok {
			info!("Far end never acknowledged session {id}; closing the local connection");
			return;
		}

		let link = Io::stream(stream, fwd_to!([cx], tcp_in(id) as (Vec<u8>)), DATA_SIZE);
		let _ = self.registry.add(id, link);
	}

	/// One chunk read from a session's local socket; an empty chunk is EOF
	/// or a reset. This is the only place outbound sequences are allocated.
	fn tcp_in(&mut self, cx: CX![], id: u32, buf: Vec<u8>) {
		if buf.is_empty() {
			// Surface through the stale path; never tear down inline.
			call!([cx], reap(id));
			return;
		}

		let Some(session) = self.registry.get_mut(id) else {
			trace!("Read for session {id} raced its removal");
			return;
		};

		let seq = session.next_seq();
		let frame = Frame::data(id, seq, self.dir, buf);
		self.transmit(cx, frame, None);
	}

	/// One raw datagram off the ICMP socket.
	fn recv(&mut self, cx: CX![], raw: Vec<u8>) {
		let Ok(msg) = self.link.accept(&raw) else { return };

		let frame = match Frame::decode(&msg.payload) {
			Ok(frame) => frame,
			Err(err) => {
				debug!("Dropping undecodable tunnel frame: {err}");
				return;
			}
		};

		if frame.direction == self.dir {
			trace!("Ignoring our own traffic looped back");
			return;
		}

		debug!("Received {frame:?}");

		match frame.action {
			Action::Start => self.start(cx, frame),
			Action::Data => self.data(cx, frame),
			Action::Terminate => self.terminate(frame),
			Action::Ack => self.ack(cx, frame),
		}
	}

	/// START: the egress side opens the destination connection. No ACK goes
	/// out until the connect succeeds; a refused destination stays silent
	/// and the far end's retransmits expire on their own.
	fn start(&mut self, cx: CX![], frame: Frame) {
		if !matches!(self.peer, Peer::Server { .. }) {
			debug!("Ignoring START on the origin side");
			return;
		}

		let id = frame.session;

		if self.registry.contains(id) {
			// A retransmitted START for a session already up: repeat the ACK.
			self.send_ack(id, frame.seq);
			return;
		}

		if let Peer::Server { connecting } = &mut self.peer {
			if !connecting.insert(id) {
				debug!("START for session {id} is already connecting");
				return;
			}
		}

		let Some(addr) = resolve(&frame.host, frame.port) else {
			warn!("Cannot resolve {}:{}", frame.host, frame.port);

			if let Peer::Server { connecting } = &mut self.peer {
				connecting.remove(&id);
			}

			return;
		};

		debug!("Session {id}: connecting to {addr}");
		runtime::connect(addr, fwd_to!([cx], connected(id) as (io::Result<TcpStream>)));
	}

	/// Outcome of an egress-side destination connect.
	fn connected(&mut self, cx: CX![], id: u32, res: io::Result<TcpStream>) {
		if let Peer::Server { connecting } = &mut self.peer {
			connecting.remove(&id);
		}

		let stream = match res {
			Ok(stream) => stream,
			Err(err) => {
				debug!("Session {id}: destination refused: {err}");
				return;
			}
		};

		let link = Io::stream(stream, fwd_to!([cx], tcp_in(id) as (Vec<u8>)), DATA_SIZE);

		if self.registry.add(id, link).is_ok() {
			self.send_ack(id, 0);
		}
	}

	/// DATA: hand the payload to the session's reorder buffer. Duplicates
	/// and closed-but-present sessions are still ACKed, since the ACK is what
	/// stops the peer's retransmits, and delivery is idempotent.
	fn data(&mut self, cx: CX![], frame: Frame) {
		match self.registry.write_to(frame.session, frame.seq, frame.payload) {
			Ok(()) => self.send_ack(frame.session, frame.seq),
			Err(Gone::Closed) => {
				self.send_ack(frame.session, frame.seq);
				call!([cx], reap(frame.session));
			}
			Err(Gone::Unknown) => debug!("DATA for unknown session {}", frame.session),
		}
	}

	/// TERMINATE: drop the session and confirm, even if it was already gone
	/// (the confirm is what stops the peer resending).
	fn terminate(&mut self, frame: Frame) {
		let _ = self.registry.remove(frame.session);
		self.send_ack(frame.session, frame.seq);
	}

	/// ACK: release whoever is blocked on this `(session, seq)`.
	fn ack(&mut self, cx: CX![], frame: Frame) {
		let key = (frame.session, frame.seq);

		let Some(waiter) = self.pending.remove(key) else {
			trace!("ACK for {key:?} matches nothing in flight");
			return;
		};

		cx.timer_del(waiter.timer);

		if let Some(done) = waiter.done {
			ret!([done], true);
		}
	}

	/// The stale reaper: sessions that died (local EOF, reset, or spent
	/// retransmits) funnel here by id. Tells the peer, then removes.
	/// Idempotent, so a session failing twice over is harmless.
	fn reap(&mut self, cx: CX![], id: u32) {
		if !self.registry.begin_drain(id) {
			return;
		}

		debug!("Reaping session {id}");

		let frame = Frame::terminate(id, self.dir);
		let done = ret_some_to!([cx], reaped(id) as (bool));
		self.transmit(cx, frame, Some(done));
	}

	/// TERMINATE concluded, acknowledged or abandoned: the session goes.
	fn reaped(&mut self, _cx: CX![], id: u32, _ok: bool) {
		let _ = self.registry.remove(id);
	}

	/// Reliable send: transmit now, then hold the frame in the pending
	/// table; [`Self::expire`] retransmits on each ACK timeout until the
	/// budget is spent.
	fn transmit(&mut self, cx: CX![], frame: Frame, done: Option<Ret<bool>>) {
		let key = (frame.session, frame.seq);
		debug!("Sending {frame:?}");

		let buf = frame.encode();
		let _ = self.link.send(Kind::EchoRequest, &buf);

		let timer = Self::arm(cx, key);

		if let Some(old) = self.pending.insert(key, Waiter { buf, tries: 1, timer, done }) {
			// Keys cannot collide while in flight; treat a stray as lost.
			warn!("Displaced an in-flight send for {key:?}");
			cx.timer_del(old.timer);

			if let Some(done) = old.done {
				ret!([done], false);
			}
		}
	}

	fn arm(cx: CX![], key: (u32, u32)) -> FixedTimerKey {
		let actor = cx.access_actor().clone();
		cx.after(RESPONSE_WAIT_TIME, move |s| actor.apply(s, move |this, cx| this.expire(cx, key)))
	}

	/// An ACK timeout fired: retransmit, or give up and funnel the session
	/// to the reaper.
	fn expire(&mut self, cx: CX![], key: (u32, u32)) {
		let Some(mut waiter) = self.pending.remove(key) else { return };

		if waiter.tries < MAX_TRANSMITS {
			waiter.tries += 1;
			debug!("No ACK for {key:?}; retransmitting ({} of {MAX_TRANSMITS})", waiter.tries);

			let _ = self.link.send(Kind::EchoRequest, &waiter.buf);
			waiter.timer = Self::arm(cx, key);
			self.pending.insert(key, waiter);
			return;
		}

		info!("Giving up on session {} seq {} after {MAX_TRANSMITS} transmits", key.0, key.1);

		if let Some(done) = waiter.done {
			ret!([done], false);
		}

		call!([cx], reap(key.0));
	}

	/// ACKs ride echo replies and are never retried: a lost ACK just means
	/// one more retransmit from the peer, and handling is idempotent.
	fn send_ack(&self, session: u32, seq: u32) {
		let frame = Frame::ack(session, seq, self.dir);
		let _ = self.link.send(Kind::EchoReply, &frame.encode());
	}
}

/// Resolve a destination to its first IPv4 address. Blocking, but only the
/// egress side does it, once per START.
fn resolve(host: &str, port: u16) -> Option<SocketAddrV4> {
	use std::net::ToSocketAddrs;

	let addrs = match (host, port).to_socket_addrs() {
		Ok(addrs) => addrs,
		Err(err) => {
			debug!("Resolving {host} failed: {err}");
			return None;
		}
	};

	addrs.filter_map(|addr| match addr {
		SocketAddr::V4(v4) => Some(v4),
		SocketAddr::V6(_) => None,
	})
	.next()
}

#[cfg(test)]
impl Tunnel {
	/// Origin-side engine running over an arbitrary packet socket, with the
	/// peer at a real port instead of raw-ICMP's port 0.
	fn test_client(cx: CX![], sock: OwnedFd, peer: SocketAddrV4, listener: TcpListener, host: String, port: u16) -> Option<Self> {
		Some(Self {
			link: Endpoint::new(sock, fwd_to!([cx], recv() as (Vec<u8>)), Some(*peer.ip()), peer.port()),
			registry: Registry::default(),
			pending: PendingAcks::default(),
			dir: Role::ProxyServer,
			peer: Peer::Client {
				_listener: Listen::new(listener, fwd_to!([cx], accept() as (TcpStream, SocketAddr))),
				host,
				port,
			},
		})
	}

	/// Egress-side engine over an arbitrary packet socket; ACKs and data go
	/// back to the learned peer address at `reply_port`.
	fn test_server(cx: CX![], sock: OwnedFd, reply_port: u16) -> Option<Self> {
		Some(Self {
			link: Endpoint::new(sock, fwd_to!([cx], recv() as (Vec<u8>)), None, reply_port),
			registry: Registry::default(),
			pending: PendingAcks::default(),
			dir: Role::ProxyClient,
			peer: Peer::Server { connecting: HashSet::new() },
		})
	}
}

/// Engine tests. A UDP socket pair stands in for the raw ICMP link: the
/// engine's side is registered as its packet socket, and the test side
/// plays the remote peer, speaking real ICMP bytes (inbound ones wrapped in
/// a hand-built IPv4 header, since that is what a raw socket read carries).
/// Time is virtual: the Stakker clock only moves when a test advances it.
#[cfg(test)]
mod tests {
	use std::io::{ErrorKind, Read, Write};
	use std::net::UdpSocket;
	use std::time::Instant;

	use stakker::{actor, ret_nop, ActorOwn, Stakker};

	use super::*;
	use crate::icmp::Message;

	struct Rig {
		stakker: Stakker,
		now: Instant,
	}

	impl Rig {
		fn new() -> Self {
			let now = Instant::now();
			Self { stakker: Stakker::new(now), now }
		}

		/// Interleave the actor queue with the reactor until both go quiet.
		fn pump(&mut self) {
			let mut quiet = 0;

			while quiet < 2 {
				self.stakker.run(self.now, false);

				match runtime::poll_io(Some(Duration::from_millis(10))) {
					Ok(true) => quiet = 0,
					_ => quiet += 1,
				}
			}

			self.stakker.run(self.now, false);
		}

		/// Move the virtual clock, firing due timers, then settle.
		fn advance(&mut self, dur: Duration) {
			self.now += dur;
			self.pump();
		}
	}

	/// Just past the ACK timeout.
	const TICK: Duration = Duration::from_millis(1050);

	/// The test's half of the fake wire.
	struct Far {
		sock: UdpSocket,
		engine: SocketAddrV4,
	}

	fn wire() -> (Far, OwnedFd, SocketAddrV4) {
		let engine = UdpSocket::bind("127.0.0.1:0").unwrap();
		engine.set_nonblocking(true).unwrap();

		let far = UdpSocket::bind("127.0.0.1:0").unwrap();

		let engine_at = match engine.local_addr().unwrap() {
			SocketAddr::V4(v4) => v4,
			SocketAddr::V6(_) => unreachable!(),
		};
		let far_at = match far.local_addr().unwrap() {
			SocketAddr::V4(v4) => v4,
			SocketAddr::V6(_) => unreachable!(),
		};

		(Far { sock: far, engine: engine_at }, OwnedFd::from(engine), far_at)
	}

	/// The 20 bytes a raw-socket read would carry in front of the ICMP
	/// message: version 4, no options, unfragmented, source 127.0.0.1.
	fn ip_wrap(icmp: &[u8]) -> Vec<u8> {
		let mut buf = vec![0; icmp::IPV4_HEADER_LEN];
		buf[0] = 0x45;
		buf[8] = 64;
		buf[9] = 1;
		buf[12..16].copy_from_slice(&[127, 0, 0, 1]);
		buf[16..20].copy_from_slice(&[127, 0, 0, 1]);
		buf.extend_from_slice(icmp);
		buf
	}

	impl Far {
		fn send_frame(&self, kind: Kind, frame: &Frame) {
			self.send_icmp(&icmp::encode(kind, icmp::IDENT, icmp::MARKER, &frame.encode()));
		}

		fn send_icmp(&self, msg: &[u8]) {
			self.sock.send_to(&ip_wrap(msg), self.engine).unwrap();
		}

		/// The next datagram the engine put on the wire.
		fn expect(&self) -> (Message, Frame) {
			self.sock.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

			let mut buf = [0; 2048];
			let (n, _) = self.sock.recv_from(&mut buf).expect("engine sent a datagram");

			let msg = icmp::decode(&buf[..n]).expect("engine speaks valid ICMP");
			let frame = Frame::decode(&msg.payload).expect("engine sends valid frames");
			(msg, frame)
		}

		fn expect_quiet(&self) {
			self.sock.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

			let mut buf = [0; 2048];
			match self.sock.recv_from(&mut buf) {
				Ok((n, _)) => {
					let msg = icmp::decode(&buf[..n]).unwrap();
					panic!("expected silence, got {:?}", Frame::decode(&msg.payload));
				}
				Err(err) => assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)),
			}
		}
	}

	fn client_rig(host: &str, port: u16) -> (Rig, ActorOwn<Tunnel>, Far, std::net::SocketAddr) {
		let mut rig = Rig::new();
		let (far, fd, far_at) = wire();

		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		listener.set_nonblocking(true).unwrap();
		let local = listener.local_addr().unwrap();

		let stakker = &mut rig.stakker;
		let host = host.to_owned();
		let tunnel = actor!(stakker, Tunnel::test_client(fd, far_at, listener, host, port), ret_nop!());

		(rig, tunnel, far, local)
	}

	fn server_rig() -> (Rig, ActorOwn<Tunnel>, Far) {
		let mut rig = Rig::new();
		let (far, fd, far_at) = wire();

		let stakker = &mut rig.stakker;
		let tunnel = actor!(stakker, Tunnel::test_server(fd, far_at.port()), ret_nop!());

		(rig, tunnel, far)
	}

	#[test]
	fn client_sends_start_then_data_in_sequence() {
		let (mut rig, _tunnel, far, local) = client_rig("dest.example", 4321);
		rig.pump();

		let mut stream = TcpStream::connect(local).unwrap();
		rig.pump();

		let (msg, start) = far.expect();
		assert_eq!(msg.kind, Kind::EchoRequest);
		assert_eq!(msg.ident, icmp::IDENT);
		assert_eq!(start.action, Action::Start);
		assert_eq!(start.direction, Role::ProxyServer);
		assert_eq!((start.session, start.seq), (0, 0));
		assert_eq!((start.host.as_str(), start.port), ("dest.example", 4321));

		// Until the far end ACKs, nothing is registered and no data flows.
		stream.write_all(b"hello").unwrap();
		far.send_frame(Kind::EchoReply, &Frame::ack(0, 0, Role::ProxyClient));
		rig.pump();

		let (msg, data) = far.expect();
		assert_eq!(msg.kind, Kind::EchoRequest);
		assert_eq!(data.action, Action::Data);
		assert_eq!((data.session, data.seq), (0, 1));
		assert_eq!(data.payload, b"hello");

		far.send_frame(Kind::EchoReply, &Frame::ack(0, 1, Role::ProxyClient));

		// A second chunk takes the next sequence number.
		stream.write_all(b" world").unwrap();
		rig.pump();

		let (_, data) = far.expect();
		assert_eq!((data.session, data.seq), (0, 2));
		assert_eq!(data.payload, b" world");
	}

	#[test]
	fn lost_ack_means_exactly_one_retransmit() {
		let (mut rig, _tunnel, far, local) = client_rig("dest.example", 80);
		rig.pump();

		let mut stream = TcpStream::connect(local).unwrap();
		rig.pump();

		far.expect();
		far.send_frame(Kind::EchoReply, &Frame::ack(0, 0, Role::ProxyClient));
		rig.pump();

		stream.write_all(b"pay").unwrap();
		rig.pump();

		let (_, first) = far.expect();
		assert_eq!((first.session, first.seq), (0, 1));

		// Drop the first ACK on the floor; the timeout resends the frame.
		rig.advance(TICK);
		let (_, second) = far.expect();
		assert_eq!(second, first);

		// ACK the retransmit; no further copies may appear.
		far.send_frame(Kind::EchoReply, &Frame::ack(0, 1, Role::ProxyClient));
		rig.pump();
		rig.advance(TICK);
		rig.advance(TICK);
		far.expect_quiet();
	}

	#[test]
	fn unanswered_start_spends_three_transmits_and_closes_local() {
		let (mut rig, _tunnel, far, local) = client_rig("dest.example", 80);
		rig.pump();

		let mut stream = TcpStream::connect(local).unwrap();
		rig.pump();

		for _ in 0..MAX_TRANSMITS {
			let (_, frame) = far.expect();
			assert_eq!(frame.action, Action::Start);
			rig.advance(TICK);
		}

		// The budget is spent: no fourth transmit, no TERMINATE for a
		// session that never existed.
		far.expect_quiet();
		rig.advance(TICK);
		far.expect_quiet();

		// The local connection was dropped.
		stream.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
		let mut buf = [0; 8];
		assert_eq!(stream.read(&mut buf).unwrap(), 0);
	}

	#[test]
	fn server_connects_acks_and_reassembles_out_of_order_data() {
		let (mut rig, _tunnel, far) = server_rig();
		rig.pump();

		let dest = TcpListener::bind("127.0.0.1:0").unwrap();
		let dest_port = dest.local_addr().unwrap().port();

		far.send_frame(Kind::EchoRequest, &Frame::start(5, Role::ProxyServer, "127.0.0.1".into(), dest_port));
		rig.pump();

		let (msg, ack) = far.expect();
		assert_eq!(msg.kind, Kind::EchoReply);
		assert_eq!(ack.action, Action::Ack);
		assert_eq!((ack.session, ack.seq), (5, 0));

		let (mut sink, _) = dest.accept().unwrap();
		sink.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

		// Chunk 2 first: ACKed immediately, delivered only after chunk 1.
		far.send_frame(Kind::EchoRequest, &Frame::data(5, 2, Role::ProxyServer, b"BB".to_vec()));
		rig.pump();
		assert_eq!(far.expect().1.seq, 2);

		let mut buf = [0; 16];
		assert!(matches!(sink.read(&mut buf), Err(ref err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut));

		far.send_frame(Kind::EchoRequest, &Frame::data(5, 1, Role::ProxyServer, b"AA".to_vec()));
		rig.pump();
		assert_eq!(far.expect().1.seq, 1);

		let mut got = [0; 4];
		sink.read_exact(&mut got).unwrap();
		assert_eq!(&got, b"AABB");

		// A duplicate is ACKed again but never re-delivered.
		far.send_frame(Kind::EchoRequest, &Frame::data(5, 2, Role::ProxyServer, b"BB".to_vec()));
		rig.pump();
		assert_eq!(far.expect().1.seq, 2);

		far.send_frame(Kind::EchoRequest, &Frame::data(5, 3, Role::ProxyServer, b"CC".to_vec()));
		rig.pump();
		assert_eq!(far.expect().1.seq, 3);

		let mut got = [0; 2];
		sink.read_exact(&mut got).unwrap();
		assert_eq!(&got, b"CC");

		assert!(matches!(sink.read(&mut buf), Err(ref err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut));
	}

	#[test]
	fn refused_destination_stays_silent() {
		let (mut rig, _tunnel, far) = server_rig();
		rig.pump();

		// Grab a port with no listener behind it.
		let vacant = TcpListener::bind("127.0.0.1:0").unwrap();
		let port = vacant.local_addr().unwrap().port();
		drop(vacant);

		far.send_frame(Kind::EchoRequest, &Frame::start(9, Role::ProxyServer, "127.0.0.1".into(), port));
		rig.pump();

		far.expect_quiet();
	}

	#[test]
	fn local_eof_terminates_and_removes_the_session() {
		let (mut rig, _tunnel, far) = server_rig();
		rig.pump();

		let dest = TcpListener::bind("127.0.0.1:0").unwrap();
		let dest_port = dest.local_addr().unwrap().port();

		far.send_frame(Kind::EchoRequest, &Frame::start(3, Role::ProxyServer, "127.0.0.1".into(), dest_port));
		rig.pump();
		far.expect();

		let (sink, _) = dest.accept().unwrap();

		// Closing the destination connection is the session's EOF.
		drop(sink);
		rig.pump();

		let (msg, frame) = far.expect();
		assert_eq!(msg.kind, Kind::EchoRequest);
		assert_eq!(frame.action, Action::Terminate);
		assert_eq!((frame.session, frame.seq), (3, 0));

		// Never ACK it: the reaper retransmits, then gives up without
		// looping, and the session is gone either way.
		rig.advance(TICK);
		assert_eq!(far.expect().1.action, Action::Terminate);
		rig.advance(TICK);
		assert_eq!(far.expect().1.action, Action::Terminate);
		rig.advance(TICK);
		far.expect_quiet();
		rig.advance(TICK);
		far.expect_quiet();

		// DATA for the dead session earns no ACK.
		far.send_frame(Kind::EchoRequest, &Frame::data(3, 1, Role::ProxyServer, b"late".to_vec()));
		rig.pump();
		far.expect_quiet();
	}

	#[test]
	fn remote_terminate_closes_the_local_connection() {
		let (mut rig, _tunnel, far, local) = client_rig("dest.example", 80);
		rig.pump();

		let mut stream = TcpStream::connect(local).unwrap();
		rig.pump();

		far.expect();
		far.send_frame(Kind::EchoReply, &Frame::ack(0, 0, Role::ProxyClient));
		rig.pump();

		far.send_frame(Kind::EchoRequest, &Frame::terminate(0, Role::ProxyClient));
		rig.pump();

		let (msg, ack) = far.expect();
		assert_eq!(msg.kind, Kind::EchoReply);
		assert_eq!(ack.action, Action::Ack);
		assert_eq!((ack.session, ack.seq), (0, 0));

		stream.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
		let mut buf = [0; 8];
		assert_eq!(stream.read(&mut buf).unwrap(), 0);
	}

	#[test]
	fn own_direction_and_foreign_ident_are_ignored() {
		let (mut rig, _tunnel, far) = server_rig();
		rig.pump();

		// A frame stamped with the direction WE stamp: our own echo.
		far.send_frame(Kind::EchoRequest, &Frame::data(1, 1, Role::ProxyClient, b"loop".to_vec()));
		rig.pump();
		far.expect_quiet();

		// Someone else's ping: right shape, wrong identifier.
		let frame = Frame::data(1, 1, Role::ProxyServer, b"x".to_vec());
		far.send_icmp(&icmp::encode(Kind::EchoRequest, 0x1111, icmp::MARKER, &frame.encode()));
		rig.pump();
		far.expect_quiet();
	}

	#[test]
	fn start_retransmit_for_live_session_is_reacked() {
		let (mut rig, _tunnel, far) = server_rig();
		rig.pump();

		let dest = TcpListener::bind("127.0.0.1:0").unwrap();
		let dest_port = dest.local_addr().unwrap().port();
		let start = Frame::start(8, Role::ProxyServer, "127.0.0.1".into(), dest_port);

		far.send_frame(Kind::EchoRequest, &start);
		rig.pump();
		assert_eq!(far.expect().1.action, Action::Ack);

		let _sink = dest.accept().unwrap();

		// The ACK was lost; the peer tries again. One session, one more ACK.
		far.send_frame(Kind::EchoRequest, &start);
		rig.pump();

		let (_, ack) = far.expect();
		assert_eq!(ack.action, Action::Ack);
		assert_eq!((ack.session, ack.seq), (8, 0));
		far.expect_quiet();
	}
}
