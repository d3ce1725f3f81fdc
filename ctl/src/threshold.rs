//! The module containing the threshold controller.
//!
//! Every sampling interval the controller reads the DRAM tier's utilisation
//! and steers it back into the configured band: overshoot sends cold DRAM
//! pages to NVRAM, undershoot pulls hot NVRAM pages in, each round sized by
//! how many pages separate the tier from the target.

use crate::{
    config::{DRAM_TARGET, DRAM_THRESH_NEGATIVE, DRAM_THRESH_PLUS, MEMCHECK_INTERVAL},
    numa::{MigrationBackend, NumaError},
    shared::Shared,
};
use hybmem_common::{FindMode, Tier, TierLayout, MAX_N_FIND};
use log::{error, info, warn};

/// One utilisation sample of the DRAM tier.
#[derive(Debug, Clone, Copy)]
pub struct DramUsage {
    /// Used fraction in `[0, 1]`.
    pub fraction: f64,
    /// Total bytes across the tier's nodes.
    pub total_bytes: u64,
}

/// The periodic loop body of the threshold thread.
pub fn run(shared: &Shared) {
    while !shared.exiting() {
        if shared.thresh_active() {
            match dram_usage(shared.backend(), shared.layout()) {
                Ok(usage) => steer(shared, usage),
                Err(err) => warn!("cannot sample DRAM usage: {err}"),
            }
        }
        shared.sleep(MEMCHECK_INTERVAL);
    }
}

/// Sums free and total bytes across the DRAM nodes.
pub fn dram_usage(
    backend: &dyn MigrationBackend,
    layout: &TierLayout,
) -> Result<DramUsage, NumaError> {
    let mut total = 0u64;
    let mut free = 0u64;
    for &node in layout.nodes(Tier::Dram) {
        total += backend.node_total_bytes(node)?;
        free += backend.node_free_bytes(node)?;
    }
    if total == 0 {
        return Err(NumaError::Malformed(layout.nodes(Tier::Dram)[0]));
    }
    Ok(DramUsage {
        fraction: (total - free) as f64 / total as f64,
        total_bytes: total,
    })
}

/// How many pages to move to walk the utilisation from `from` to `to`,
/// clamped to what one FIND can carry.
#[must_use]
pub fn pages_to_move(from: f64, to: f64, total_bytes: u64, page_size: u64) -> usize {
    let bytes = (from - to).abs() * total_bytes as f64;
    ((bytes / page_size as f64).ceil() as usize).min(MAX_N_FIND)
}

fn steer(shared: &Shared, usage: DramUsage) {
    info!("current DRAM usage: {:.2}%", usage.fraction * 100.0);
    let page_size = shared.backend().page_size();
    if usage.fraction > DRAM_TARGET + DRAM_THRESH_PLUS {
        let n = pages_to_move(usage.fraction, DRAM_TARGET, usage.total_bytes, page_size);
        match shared.find_and_migrate(n, FindMode::Dram) {
            Ok(moved) if moved > 0 => info!("DRAM->NVRAM: migrated {moved} out of {n} pages"),
            Ok(_) => {}
            Err(err) => {
                error!("threshold round failed: {err}");
                shared.request_exit();
            }
        }
    } else if usage.fraction < DRAM_TARGET - DRAM_THRESH_NEGATIVE {
        let n = pages_to_move(DRAM_TARGET, usage.fraction, usage.total_bytes, page_size);
        match shared.find_and_migrate(n, FindMode::Nvram) {
            Ok(moved) if moved > 0 => info!("NVRAM->DRAM: migrated {moved} out of {n} pages"),
            Ok(_) => {}
            Err(err) => {
                error!("threshold round failed: {err}");
                shared.request_exit();
            }
        }
    }
}
