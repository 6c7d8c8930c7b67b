use std::path::Path;

use fern::colors::{Color, ColoredLevelConfig};
use log::Level;

/// Install the process-wide logger: coloured lines on stderr and, when
/// `log_file` is set, plain lines appended to that file.
pub fn init_logging(level: Level, log_file: Option<&Path>) -> anyhow::Result<()> {
	let colours = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::Blue)
		.trace(Color::BrightBlack);

	let stderr = fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {:<5} [{}] {}",
				chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
				colours.color(record.level()),
				record.target(),
				message
			))
		})
		.chain(std::io::stderr());

	let mut dispatch = fern::Dispatch::new()
		.level(level.to_level_filter())
		.chain(stderr);

	if let Some(path) = log_file {
		let file = fern::Dispatch::new()
			.format(|out, message, record| {
				out.finish(format_args!(
					"{} {:<5} [{}] {}",
					chrono::Utc::now().to_rfc3339(),
					record.level(),
					record.target(),
					message
				))
			})
			.chain(fern::log_file(path)?);
		dispatch = dispatch.chain(file);
	}

	dispatch
		.apply()
		.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

	Ok(())
}
