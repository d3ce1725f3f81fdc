//! The module containing various constants that may be modified by developers.

/// The logging level when the `HYBMEM_LOG` environment variable is unset.
pub const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Info;

/// The maximum number of simultaneously managed processes.
pub const MAX_PIDS: usize = 5;
