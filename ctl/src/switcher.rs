//! The module containing the switch controller.
//!
//! Unconditionally asks for a full exchange batch every interval and swaps
//! the returned halves; sizing is left to the inspector, which pairs as many
//! hot NVRAM pages with cold DRAM pages as it can.

use crate::{config::SWITCH_INTERVAL, shared::Shared};
use hybmem_common::{FindMode, MAX_N_SWITCH};
use log::{error, info};

/// The periodic loop body of the switch thread.
pub fn run(shared: &Shared) {
    while !shared.exiting() {
        if shared.switch_active() {
            match shared.find_and_migrate(MAX_N_SWITCH, FindMode::Switch) {
                Ok(moved) if moved > 0 => {
                    info!(
                        "DRAM<->NVRAM: switched {moved} out of {} pages",
                        MAX_N_SWITCH * 2
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    error!("switch round failed: {err}");
                    shared.request_exit();
                }
            }
        }
        shared.sleep(SWITCH_INTERVAL);
    }
}
