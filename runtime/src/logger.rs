use std::time::SystemTime;

use log::{Level, LevelFilter};
use nu_ansi_term::ansi::RESET;
use nu_ansi_term::{Color, Style};

struct Logger;

static LOGGER: Logger = Logger;

/// Install the stderr logger with the given maximum level.
pub fn init(level: LevelFilter) {
	if log::set_logger(&LOGGER).is_ok() {
		log::set_max_level(level);
	}
}

fn color(level: Level) -> Color {
	match level {
		Level::Trace => Color::Purple,
		Level::Debug => Color::Blue,
		Level::Info => Color::Green,
		Level::Warn => Color::Yellow,
		Level::Error => Color::Red,
	}
}

impl log::Log for Logger {
	fn enabled(&self, meta: &log::Metadata) -> bool {
		meta.level() <= log::max_level()
	}

	fn log(&self, record: &log::Record) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let time = humantime::format_rfc3339_seconds(SystemTime::now());
		let dim = Style::new().dimmed().prefix();
		let bold = Style::new().bold().prefix();

		eprintln!(
			"{dim}{time}{RESET} {}{:5}{RESET} {bold}{}{RESET}{dim}:{RESET} {}",
			color(record.level()).bold().prefix(),
			record.level(),
			record.target(),
			record.args()
		);
	}

	fn flush(&self) {}
}
