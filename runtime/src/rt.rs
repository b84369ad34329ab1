use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use stakker::Stakker;

use crate::{Result, State};

static EXIT: AtomicBool = AtomicBool::new(false);

pub fn init() -> Stakker {
	// Get both a monotonic and an absolute representation of the time.
	let now = Instant::now();
	let now_sys = SystemTime::now();
	// Initialise Stakker with the monotonic time.
	let mut s = Stakker::new(now);
	// Set the Stakker systime to the start time.
	s.set_systime(Some(now_sys));
	s
}

/// Run the event loop until shutdown, Ctrl+C, or a fatal socket failure.
/// `exit_fn` must drop the application's actors; it runs exactly once,
/// before the final deferral-queue drain.
pub fn exec(stakker: &mut Stakker, exit_fn: impl FnOnce()) -> Result {
	ctrlc::set_handler(|| EXIT.store(true, Ordering::Relaxed))
		.map_err(|err| log::error!("Error occurred while setting Ctrl+C handler: {err}"))?;

	let res = 'poll: {
		let mut t = Instant::now();
		let mut idle_pending = stakker.run(t, false);

		while stakker.not_shutdown() {
			// Break out of the loop if an exit is requested.
			if EXIT.load(Ordering::Relaxed) {
				break;
			}

			let timeout = if idle_pending {
				// Poll the file descriptors without a timeout if there are items in the idle queue.
				Some(Duration::from_secs(0))
			} else {
				// Otherwise, get the timeout for the next timer.
				stakker.next_wait(t)
			};

			// If there is no timeout and no more sockets to poll, there is no more work to do. Exit.
			if timeout.is_none() && !State::with(|s| s.is_io()) {
				break;
			}

			// Poll the file descriptors.
			let Ok(is_io) = State::with(|s| s.poll(timeout)) else {
				break 'poll Err(());
			};

			t = Instant::now();
			// If there is still no I/O ready after a non-blocking poll, run the idle queue.
			idle_pending = stakker.run(t, idle_pending && !is_io);
		}

		Ok(())
	};

	// Drop the application actors and drain the deferral queue so every
	// socket deregisters before the process exits.
	exit_fn();
	stakker.run(Instant::now(), false);

	res
}
