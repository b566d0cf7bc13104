//! Global logging setup, grounded on the teacher's `logging.rs`: `fern`
//! dispatch with colored levels, chained to stdout.

use crate::config::LoggingConfig;

pub fn setup_logging(conf: &LoggingConfig) -> Result<(), String> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            let level = record.level();
            let colored_level = match level {
                log::Level::Error => format!("\x1b[31m{level}\x1b[0m"),
                log::Level::Warn => format!("\x1b[33m{level}\x1b[0m"),
                log::Level::Info => format!("\x1b[32m{level}\x1b[0m"),
                log::Level::Debug => format!("\x1b[34m{level}\x1b[0m"),
                log::Level::Trace => format!("\x1b[36m{level}\x1b[0m"),
            };
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                colored_level,
                message
            ));
        })
        .level(conf.level);

    if conf.log_to_stdout {
        dispatch = dispatch.chain(std::io::stdout());
    }

    dispatch.apply().map_err(|e| format!("error setting up logger: {e}"))
}
