//! Single-threaded poll(2) reactor bridging nonblocking sockets into a
//! [`stakker`] event loop. Sockets are registered with a forward that
//! receives their inbound traffic; outbound writes are attempted
//! immediately and buffered until POLLOUT when the kernel pushes back.

use core::cell::RefCell;
use core::time::Duration;
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use log::{debug, error, warn};
use stakker::Fwd;

pub mod logger;
mod rt;

pub use rt::*;

pub type Result<T = (), E = ()> = core::result::Result<T, E>;

mod sys {
	use std::io::{self, ErrorKind};
	use std::mem;
	use std::net::SocketAddrV4;
	use std::os::fd::{FromRawFd, OwnedFd, RawFd};

	pub use libc::{poll, pollfd as Poll, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

	fn sockaddr(addr: SocketAddrV4) -> libc::sockaddr_in {
		libc::sockaddr_in {
			sin_family: libc::AF_INET as libc::sa_family_t,
			sin_port: addr.port().to_be(),
			sin_addr: libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() },
			sin_zero: [0; 8],
		}
	}

	/// Map a raw syscall return to `Ok(Some(n))`, `Ok(None)` for WouldBlock, or the OS error.
	fn check(val: isize) -> io::Result<Option<usize>> {
		match TryInto::<usize>::try_into(val) {
			Ok(n) => Ok(Some(n)),
			Err(_) => {
				let err = io::Error::last_os_error();

				match err.kind() {
					ErrorKind::WouldBlock | ErrorKind::Interrupted => Ok(None),
					_ => Err(err),
				}
			}
		}
	}

	pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
		check(unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) })
	}

	pub fn send(fd: RawFd, buf: &[u8]) -> io::Result<Option<usize>> {
		check(unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), libc::MSG_NOSIGNAL) })
	}

	pub fn send_to(fd: RawFd, buf: &[u8], dst: SocketAddrV4) -> io::Result<Option<usize>> {
		let addr = sockaddr(dst);

		check(unsafe {
			libc::sendto(
				fd,
				buf.as_ptr() as *const libc::c_void,
				buf.len(),
				libc::MSG_NOSIGNAL,
				&addr as *const libc::sockaddr_in as *const libc::sockaddr,
				mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
			)
		})
	}

	/// Fetch and clear the pending error on a socket (SO_ERROR).
	pub fn take_error(fd: RawFd) -> io::Result<()> {
		let mut err: libc::c_int = 0;
		let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

		let ret = unsafe {
			libc::getsockopt(
				fd,
				libc::SOL_SOCKET,
				libc::SO_ERROR,
				&mut err as *mut libc::c_int as *mut libc::c_void,
				&mut len,
			)
		};

		if ret != 0 {
			Err(io::Error::last_os_error())
		} else if err != 0 {
			Err(io::Error::from_raw_os_error(err))
		} else {
			Ok(())
		}
	}

	/// Begin a nonblocking connect. Completion is signalled by POLLOUT; the
	/// outcome is read with [`take_error`].
	pub fn connect_v4(addr: SocketAddrV4) -> io::Result<OwnedFd> {
		let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0) };

		if fd < 0 {
			return Err(io::Error::last_os_error());
		}

		let sock = unsafe { OwnedFd::from_raw_fd(fd) };
		let sa = sockaddr(addr);

		let ret = unsafe {
			libc::connect(
				fd,
				&sa as *const libc::sockaddr_in as *const libc::sockaddr,
				mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
			)
		};

		if ret == 0 {
			return Ok(sock);
		}

		let err = io::Error::last_os_error();

		match err.raw_os_error() {
			Some(libc::EINPROGRESS) => Ok(sock),
			_ => Err(err),
		}
	}
}

use sys::*;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new()
		})
	};
}

pub(crate) struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
}

impl State {
	pub(crate) fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	fn idx_of(&self, raw: RawFd) -> usize {
		self.fds.iter().position(|f| f.fd == raw).expect("Socket is present")
	}

	fn register(&mut self, fd: RawFd, events: i16, src: Source) {
		self.fds.push(Poll { fd, events, revents: 0 });
		self.entries.push(Entry::new(src));
	}

	fn remove(&mut self, idx: usize) {
		self.entries.swap_remove(idx);
		self.fds.swap_remove(idx);
	}

	/// Returns whether any more I/O is waiting.
	pub(crate) fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	fn write(&mut self, raw: RawFd, buf: &[u8], dst: Option<SocketAddrV4>) -> Result {
		let idx = self.idx_of(raw);
		let entry = &mut self.entries[idx];

		if entry.broken {
			debug!("Dropping write to a failed socket");
			return Err(());
		}

		entry.queue.push_back(Out { buf: buf.into(), at: 0, dst });

		// A single element means the queue was idle; try to push it out now.
		if entry.queue.len() == 1 {
			entry.flush_write(raw);
		}

		if entry.broken {
			return Err(());
		}

		if !entry.queue.is_empty() {
			self.fds[idx].events |= POLLOUT;
		}

		Ok(())
	}

	/// Poll the fds. Returns whether any file descriptors were ready for I/O.
	pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let mut pending: u32 = match ret.try_into() {
			Ok(n) => n,
			// A signal (Ctrl+C) interrupts poll; the outer loop notices the exit flag.
			Err(_) if io::Error::last_os_error().kind() == ErrorKind::Interrupted => return Ok(false),
			Err(_) => {
				error!("poll() failed: {}", io::Error::last_os_error());
				return Err(());
			}
		};

		if pending == 0 {
			return Ok(false);
		}

		let mut fatal = false;

		for idx in 0..self.fds.len() {
			let Poll { fd, revents, .. } = self.fds[idx];

			if revents == 0 {
				continue;
			}

			self.fds[idx].revents = 0;

			let entry = &mut self.entries[idx];

			if entry.service(fd, revents).is_err() {
				fatal = true;
			}

			self.fds[idx].events = entry.wanted();

			pending -= 1;

			if pending == 0 {
				break;
			}
		}

		// Drop entries that finished their lifecycle during this wakeup.
		let mut idx = 0;
		while idx < self.entries.len() {
			if self.entries[idx].done {
				self.remove(idx);
			} else {
				idx += 1;
			}
		}

		if fatal {
			return Err(());
		}

		Ok(true)
	}
}

/// One queued outbound buffer; `at` tracks how much of it has been sent.
struct Out {
	buf: Box<[u8]>,
	at: usize,
	dst: Option<SocketAddrV4>,
}

enum Source {
	/// A connected byte stream. EOF and peer resets are forwarded once as an
	/// empty read.
	Stream { fwd: Fwd<Vec<u8>>, cap: usize },
	/// A datagram or raw socket; reads are whole packets. Read failure here is
	/// fatal to the reactor.
	Packet { fwd: Fwd<Vec<u8>>, cap: usize },
	/// A listening socket; forwards accepted connections.
	Listener { sock: TcpListener, fwd: Fwd<(TcpStream, SocketAddr)> },
	/// An in-flight nonblocking connect; forwards the outcome once and
	/// deregisters itself.
	Connect { sock: Option<OwnedFd>, fwd: Fwd<io::Result<TcpStream>> },
}

struct Entry {
	src: Source,
	queue: VecDeque<Out>,
	/// EOF has been observed and forwarded; stop reading.
	eof: bool,
	/// The write side is unusable; queued data has been discarded.
	broken: bool,
	/// Remove this entry on the next sweep.
	done: bool,
	/// Keeps a dropped handle's socket open until its queue drains.
	keep: Option<Box<dyn AsRawFd>>,
}

impl Entry {
	fn new(src: Source) -> Self {
		Self { src, queue: VecDeque::new(), eof: false, broken: false, done: false, keep: None }
	}

	/// The poll events this entry currently cares about.
	fn wanted(&self) -> i16 {
		if self.done {
			return 0;
		}

		match self.src {
			Source::Connect { .. } => POLLOUT,
			Source::Listener { .. } => POLLIN,
			Source::Stream { .. } | Source::Packet { .. } => {
				let mut events = 0;

				if !self.eof && self.keep.is_none() {
					events |= POLLIN;
				}

				if !self.queue.is_empty() && !self.broken {
					events |= POLLOUT;
				}

				events
			}
		}
	}

	/// Service one poll wakeup. `Err` means the reactor must shut down.
	fn service(&mut self, fd: RawFd, revents: i16) -> Result {
		let failed = revents & (POLLERR | POLLNVAL) != 0;
		let hup = revents & POLLHUP != 0;

		match &mut self.src {
			Source::Connect { sock, fwd } => {
				if revents & (POLLOUT | POLLERR | POLLHUP | POLLNVAL) != 0 {
					let sock = sock.take().expect("Connect completes once");

					fwd.fwd(take_error(fd).map(|()| TcpStream::from(sock)));
					self.done = true;
				}

				return Ok(());
			}
			Source::Listener { sock, fwd } => {
				if failed {
					error!("Listening socket failed");
					return Err(());
				}

				if revents & (POLLIN | POLLHUP) != 0 {
					loop {
						match sock.accept() {
							Ok((stream, addr)) => {
								if let Err(err) = stream.set_nonblocking(true) {
									warn!("Could not make accepted connection nonblocking: {err}");
									continue;
								}

								fwd.fwd((stream, addr));
							}
							Err(err) if err.kind() == ErrorKind::WouldBlock => break,
							Err(err) if err.kind() == ErrorKind::Interrupted => continue,
							Err(err) => {
								warn!("accept() failed: {err}");
								break;
							}
						}
					}
				}

				return Ok(());
			}
			Source::Stream { fwd, cap } => {
				if (revents & POLLIN != 0 || failed || hup) && !self.eof {
					let cap = *cap;

					loop {
						let mut buf = vec![0; cap];

						match recv(fd, &mut buf) {
							Ok(Some(n)) if n > 0 => {
								buf.truncate(n);
								fwd.fwd(buf);
							}
							// Clean EOF; the peer may still accept writes.
							Ok(Some(_)) => {
								self.eof = true;
								fwd.fwd(Vec::new());
								break;
							}
							Ok(None) => break,
							// A reset closes both directions at once.
							Err(err) => {
								debug!("Stream read failed: {err}");
								self.eof = true;
								self.broken = true;
								fwd.fwd(Vec::new());
								break;
							}
						}
					}
				}
			}
			Source::Packet { fwd, cap } => {
				if failed {
					error!("Packet socket failed");
					return Err(());
				}

				if revents & POLLIN != 0 {
					let cap = *cap;

					loop {
						let mut buf = vec![0; cap];

						match recv(fd, &mut buf) {
							Ok(Some(n)) => {
								buf.truncate(n);
								fwd.fwd(buf);
							}
							Ok(None) => break,
							Err(err) => {
								error!("Packet socket read failed: {err}");
								return Err(());
							}
						}
					}
				}
			}
		}

		if self.broken {
			self.queue.clear();
		} else if revents & POLLOUT != 0 {
			self.flush_write(fd);
		}

		// An error while no read data is pending means the stream is gone for
		// good; make sure the EOF notification went out.
		if failed {
			self.broken = true;
			self.queue.clear();

			if let Source::Stream { fwd, .. } = &self.src {
				if !self.eof {
					self.eof = true;
					fwd.fwd(Vec::new());
				}
			}
		}

		if self.keep.is_some() && (self.queue.is_empty() || self.broken) {
			self.done = true;
		}

		Ok(())
	}

	fn flush_write(&mut self, fd: RawFd) {
		while let Some(out) = self.queue.front_mut() {
			let ret = match out.dst {
				Some(dst) => send_to(fd, &out.buf[out.at..], dst),
				None => send(fd, &out.buf[out.at..]),
			};

			match ret {
				Ok(Some(n)) => {
					out.at += n;

					if out.at >= out.buf.len() {
						self.queue.pop_front();
					}
				}
				Ok(None) => break,
				// Losing one datagram is no worse than the network losing it.
				Err(err) if out.dst.is_some() => {
					warn!("Datagram send failed: {err}");
					self.queue.pop_front();
				}
				Err(err) => {
					debug!("Stream write failed: {err}");
					self.broken = true;
					self.queue.clear();
					break;
				}
			}
		}

		if self.keep.is_some() && (self.queue.is_empty() || self.broken) {
			self.done = true;
		}
	}
}

/// A registered socket. Inbound traffic arrives through the forward supplied
/// at registration; [`Io::write`] / [`Io::write_to`] queue outbound traffic.
///
/// Dropping the handle deregisters the socket. If queued writes remain, the
/// socket lingers write-only until they drain, then closes.
pub struct Io<T: AsRawFd + 'static> {
	inner: Option<T>,
}

impl<T: AsRawFd + 'static> Io<T> {
	/// Register a connected byte-stream socket. Reads are forwarded in chunks
	/// of at most `cap` bytes; EOF or a peer reset arrives as one empty chunk.
	pub fn stream(inner: T, fwd: Fwd<Vec<u8>>, cap: usize) -> Self {
		Self::register(inner, Source::Stream { fwd, cap })
	}

	/// Register a datagram or raw socket. Each read forwards one whole packet
	/// of at most `cap` bytes.
	pub fn packet(inner: T, fwd: Fwd<Vec<u8>>, cap: usize) -> Self {
		Self::register(inner, Source::Packet { fwd, cap })
	}

	fn register(inner: T, src: Source) -> Self {
		State::with(|state| {
			state.register(inner.as_raw_fd(), POLLIN, src);
			Self { inner: Some(inner) }
		})
	}

	fn raw(&self) -> RawFd {
		self.inner.as_ref().expect("Socket is held until drop").as_raw_fd()
	}

	/// Write to a connected socket, queueing whatever the kernel won't take.
	pub fn write(&self, buf: &[u8]) -> Result {
		State::with(|state| state.write(self.raw(), buf, None))
	}

	/// Send one datagram to an explicit destination.
	pub fn write_to(&self, buf: &[u8], dst: SocketAddrV4) -> Result {
		State::with(|state| state.write(self.raw(), buf, Some(dst)))
	}
}

impl<T: AsRawFd + 'static> Drop for Io<T> {
	fn drop(&mut self) {
		let inner = self.inner.take().expect("Socket is held until drop");

		State::with(|state| {
			let idx = state.idx_of(inner.as_raw_fd());
			let entry = &mut state.entries[idx];

			if entry.queue.is_empty() || entry.broken {
				state.remove(idx);
			} else {
				// Unsent bytes remain: keep the fd alive, write-only, until
				// the queue drains.
				entry.keep = Some(Box::new(inner));
				state.fds[idx].events = POLLOUT;
			}
		})
	}
}

/// A registered listening socket; accepted connections (already nonblocking)
/// arrive through the forward. The listener itself must be nonblocking.
pub struct Listen {
	raw: RawFd,
}

impl Listen {
	pub fn new(sock: TcpListener, fwd: Fwd<(TcpStream, SocketAddr)>) -> Self {
		State::with(|state| {
			let raw = sock.as_raw_fd();
			state.register(raw, POLLIN, Source::Listener { sock, fwd });
			Self { raw }
		})
	}
}

impl Drop for Listen {
	fn drop(&mut self) {
		State::with(|state| {
			let idx = state.idx_of(self.raw);
			state.remove(idx);
		})
	}
}

/// Run one reactor turn: poll every registered socket, waiting at most
/// `timeout` (`None` waits indefinitely), and deliver whatever is ready.
/// [`exec`] drives this internally; callers embedding the reactor in their
/// own loop (a test harness, say) interleave it with [`Stakker::run`].
///
/// [`Stakker::run`]: stakker::Stakker::run
pub fn poll_io(timeout: Option<Duration>) -> Result<bool> {
	State::with(|state| state.poll(timeout))
}

/// Start a nonblocking connect to `addr`. The outcome, a connected stream
/// or the failure (e.g. ECONNREFUSED), is forwarded exactly once.
pub fn connect(addr: SocketAddrV4, fwd: Fwd<io::Result<TcpStream>>) {
	match connect_v4(addr) {
		Ok(sock) => State::with(|state| {
			state.register(sock.as_raw_fd(), POLLOUT, Source::Connect { sock: Some(sock), fwd });
		}),
		Err(err) => fwd.fwd(Err(err)),
	}
}
