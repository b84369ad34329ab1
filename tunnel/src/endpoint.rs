//! The raw-ICMP side of the tunnel: one packet socket shared by every
//! session, plus the single mutable cell holding the peer's address.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{FromRawFd, OwnedFd};

use log::{debug, info, trace, warn};
use runtime::{Io, Result};
use stakker::Fwd;

use crate::icmp::{self, Kind, Message};

/// Raw-socket read buffer; each read is one whole IP packet.
const RECV_SIZE: usize = 4096;

/// Open the raw ICMP socket. Needs CAP_NET_RAW (or root) on Linux; callers
/// treat failure as fatal and report it before the event loop starts.
pub fn open_socket() -> io::Result<OwnedFd> {
	let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, libc::IPPROTO_ICMP) };

	if fd < 0 {
		return Err(io::Error::last_os_error());
	}

	Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// The tunnel's view of the wire. Owns the packet socket's registration and
/// the peer address, which is either configured up front (origin side) or
/// learned from the first validated inbound packet (egress side).
pub struct Endpoint {
	link: Io<OwnedFd>,
	remote: Option<Ipv4Addr>,
	/// Destination port for sends. Meaningless for raw ICMP, hence 0 in
	/// production; tests run the endpoint over a UDP socket and need a real
	/// port.
	port: u16,
}

impl Endpoint {
	pub fn new(sock: OwnedFd, fwd: Fwd<Vec<u8>>, remote: Option<Ipv4Addr>, port: u16) -> Self {
		Self { link: Io::packet(sock, fwd, RECV_SIZE), remote, port }
	}

	/// Stamp the magic fields onto `payload` and post it to the peer.
	pub fn send(&self, kind: Kind, payload: &[u8]) -> Result {
		let Some(remote) = self.remote else {
			warn!("No peer address known yet; dropping outbound packet");
			return Err(());
		};

		let buf = icmp::encode(kind, icmp::IDENT, icmp::MARKER, payload);
		self.link.write_to(&buf, SocketAddrV4::new(remote, self.port))
	}

	/// Validate one raw read from the socket: strip the IP header, check the
	/// ICMP envelope, and require the magic identifier. The first packet
	/// that passes all of it teaches an egress-side endpoint its peer; the
	/// cell is set once and never changes after that. Learning from anything
	/// less than a fully validated packet, or from later packets, would let
	/// stray ICMP (including our own traffic looped back) hijack the reply
	/// path.
	pub fn accept(&mut self, raw: &[u8]) -> Result<Message> {
		let (src, rest) = match icmp::strip_ipv4(raw) {
			Ok(parts) => parts,
			Err(err) => {
				debug!("Dropping raw packet: {err}");
				return Err(());
			}
		};

		let msg = match icmp::decode(rest) {
			Ok(msg) => msg,
			Err(err) => {
				debug!("Dropping ICMP packet from {src}: {err}");
				return Err(());
			}
		};

		if msg.ident != icmp::IDENT {
			// Some other ICMP user on this host (an ordinary ping, say).
			trace!("Ignoring ICMP traffic with identifier 0x{:04x}", msg.ident);
			return Err(());
		}

		if msg.marker != icmp::MARKER {
			// The marker is advisory; note it and carry on.
			trace!("Unexpected sequence marker 0x{:04x} from {src}", msg.marker);
		}

		match self.remote {
			None => {
				info!("Peer endpoint is {src}");
				self.remote = Some(src);
			}
			Some(known) if known != src => trace!("Validated packet from {src}, expected {known}"),
			Some(_) => {}
		}

		Ok(msg)
	}
}
