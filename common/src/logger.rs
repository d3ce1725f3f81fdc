//! The module containing the stderr logger shared by both daemons.

use std::io::Write;

/// Initializes the logger instance. The level comes from the `HYBMEM_LOG`
/// environment variable when set, `default` otherwise.
pub fn init_stderr_logger(default: log::LevelFilter) {
    let level = std::env::var("HYBMEM_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default);
    log::set_logger(&STDERR_LOGGER)
        .map(|()| log::set_max_level(level))
        .unwrap();
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Trace
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let stderr = std::io::stderr();
            let _ = writeln!(
                stderr.lock(),
                "{}: {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static STDERR_LOGGER: StderrLogger = StderrLogger;
