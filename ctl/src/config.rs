//! The module containing various constants that may be modified by developers.

use std::time::Duration;

/// The logging level when the `HYBMEM_LOG` environment variable is unset.
pub const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Info;

/// DRAM utilisation the threshold controller steers towards.
pub const DRAM_TARGET: f64 = 0.80;

/// Overshoot tolerated above [`DRAM_TARGET`] before pages leave DRAM.
pub const DRAM_THRESH_PLUS: f64 = 0.05;

/// Undershoot tolerated below [`DRAM_TARGET`] before pages enter DRAM. Wider
/// than the positive band: overshooting DRAM is cheap, leaving it idle wastes
/// fast memory.
pub const DRAM_THRESH_NEGATIVE: f64 = 0.15;

/// How often the threshold controller samples DRAM utilisation.
pub const MEMCHECK_INTERVAL: Duration = Duration::from_secs(2);

/// How often the switch controller runs an exchange round.
pub const SWITCH_INTERVAL: Duration = Duration::from_secs(5);

/// Readiness-wait bound of the control socket, so shutdown is prompt.
pub const POLL_TIMEOUT_MS: i32 = 1000;

/// Default path of the local datagram socket bound for inspector replies.
pub const CTL_SOCKET: &str = "/tmp/hybmem-ctl.sock";

/// Default path of the stream socket accepting external bind/unbind requests.
pub const CONTROL_SOCKET: &str = "./socket";
