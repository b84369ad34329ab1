//! Egress-side proxy: learns its peer from the first tunneled packet and
//! opens destination TCP connections on request.

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

	let usage = format!("Usage: {} [-v]", args[0]);

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

	if !matches.free.is_empty() {
		eprint!("{}", opts.usage(&usage));
		return ExitCode::FAILURE;
	}

	runtime::logger::init(match matches.opt_count("v") {
		0 => LevelFilter::Info,
		1 => LevelFilter::Debug,
		_ => LevelFilter::Trace,
	});

	let sock = match tunnel::endpoint::open_socket() {
		Ok(sock) => sock,
		Err(err) => {
			error!("Cannot open a raw ICMP socket: {err} (root or CAP_NET_RAW is required)");
			return ExitCode::FAILURE;
		}
	};

	let mut stakker0 = runtime::init();
	let stakker = &mut stakker0;

	let tunnel = actor!(stakker, Tunnel::server(sock), ret_shutdown!(stakker));

	match runtime::exec(stakker, move || drop(tunnel)) {
		Ok(()) => ExitCode::SUCCESS,
		Err(()) => ExitCode::FAILURE,
	}
}
