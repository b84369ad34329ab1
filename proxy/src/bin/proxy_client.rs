//! Origin-side proxy: listens on a local TCP port and tunnels every
//! accepted connection to a configured destination via the peer.

use std::net::{Ipv4Addr, TcpListener};
use std::process::ExitCode;

use getopts::Options;
use log::{error, LevelFilter};
use stakker::{actor, ret_shutdown};
use tunnel::Tunnel;

fn main() -> ExitCode {
	let args: Vec<String> = std::env::args().collect();

	let mut opts = Options::new();
	opts.optflagmulti("v", "verbose", "raise log verbosity (repeat for trace)");
	opts.optflag("h", "help", "print this help");

	let usage = format!("Usage: {} [-v] <peer_ipv4> <listen_port> <dest_host> <dest_port>", args[0]);

	let matches = match opts.parse(&args[1..]) {
		Ok(matches) => matches,
		Err(err) => {
			eprintln!("{err}");
			eprint!("{}", opts.usage(&usage));
			return ExitCode::FAILURE;
		}
	};

	if matches.opt_present("h") {
		print!("{}", opts.usage(&usage));
		return ExitCode::SUCCESS;
	}

	runtime::logger::init(match matches.opt_count("v") {
		0 => LevelFilter::Info,
		1 => LevelFilter::Debug,
		_ => LevelFilter::Trace,
	});

	let [peer, listen_port, host, port] = matches.free.as_slice() else {
		eprint!("{}", opts.usage(&usage));
		return ExitCode::FAILURE;
	};

	let Ok(peer) = peer.parse::<Ipv4Addr>() else {
		error!("'{peer}' is not an IPv4 address");
		return ExitCode::FAILURE;
	};

	let (Ok(listen_port), Ok(port)) = (listen_port.parse::<u16>(), port.parse::<u16>()) else {
		error!("Ports must be 1-65535");
		return ExitCode::FAILURE;
	};

	// Everything fatal happens before the event loop, so a privilege problem
	// is one clear line and a nonzero exit.
	let sock = match tunnel::endpoint::open_socket() {
		Ok(sock) => sock,
		Err(err) => {
			error!("Cannot open a raw ICMP socket: {err} (root or CAP_NET_RAW is required)");
			return ExitCode::FAILURE;
		}
	};

	let listener = match TcpListener::bind(("127.0.0.1", listen_port)) {
		Ok(listener) => listener,
		Err(err) => {
			error!("Cannot listen on 127.0.0.1:{listen_port}: {err}");
			return ExitCode::FAILURE;
		}
	};

	if let Err(err) = listener.set_nonblocking(true) {
		error!("Cannot make the listener nonblocking: {err}");
		return ExitCode::FAILURE;
	}

	let mut stakker0 = runtime::init();
	let stakker = &mut stakker0;

	let tunnel = actor!(
		stakker,
		Tunnel::client(sock, peer, listener, host.clone(), port),
		ret_shutdown!(stakker)
	);

	match runtime::exec(stakker, move || drop(tunnel)) {
		Ok(()) => ExitCode::SUCCESS,
		Err(()) => ExitCode::FAILURE,
	}
}
