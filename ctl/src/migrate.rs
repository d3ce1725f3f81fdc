//! The module containing the migration executor.
//!
//! Candidates arrive PID-major from the inspector. The executor fills the
//! destination tier's nodes in list order up to their free capacity, batches
//! one `move_pages` call per (pid, run) and falls back to per-address moves
//! when a batch fails. Failed pages are logged and counted, never fatal.

use crate::numa::MigrationBackend;
use hybmem_common::{AddrRecord, Tier, TierLayout};
use log::{debug, warn};

/// What one migration round achieved.
#[derive(Debug, Default, Clone, Copy)]
pub struct MigrationReport {
    /// Pages that reached their destination node.
    pub migrated: usize,
    /// Pages that still refused to move after the per-address retry.
    pub failed: usize,
    /// Candidates beyond the destination tier's capacity, left in place.
    pub dropped: usize,
}

/// The migration executor over a backend and the tier layout.
#[derive(Debug)]
pub struct Migrator<'a> {
    backend: &'a dyn MigrationBackend,
    layout: &'a TierLayout,
}

impl<'a> Migrator<'a> {
    /// A new executor borrowing `backend` and `layout`.
    #[must_use]
    pub fn new(backend: &'a dyn MigrationBackend, layout: &'a TierLayout) -> Self {
        Self { backend, layout }
    }

    /// Moves `candidates` onto the nodes of `dest`, dropping whatever the
    /// tier has no room for.
    pub fn migrate(&self, candidates: &[AddrRecord], dest: Tier) -> MigrationReport {
        let assigned = self.plan(candidates, dest);
        let dropped = candidates.len() - assigned.len();
        if dropped > 0 {
            warn!("destination tier is full, leaving {dropped} pages in place");
        }
        let (migrated, failed) = self.run(&assigned);
        MigrationReport {
            migrated,
            failed,
            dropped,
        }
    }

    /// Pairwise exchange: `hot` NVRAM pages go to DRAM while `cold` DRAM
    /// pages go to NVRAM, alternating so each direction frees room for the
    /// other. The loop ends when a full round moves nothing on either side,
    /// which also covers genuinely exhausted destinations.
    pub fn exchange(&self, hot: &[AddrRecord], cold: &[AddrRecord]) -> MigrationReport {
        let mut report = MigrationReport::default();
        let mut hot_done = 0;
        let mut cold_done = 0;
        loop {
            let cold_round = self.round(&cold[cold_done..], Tier::Nvram, &mut report);
            cold_done += cold_round;
            let hot_round = self.round(&hot[hot_done..], Tier::Dram, &mut report);
            hot_done += hot_round;
            if (cold_round == 0 && hot_round == 0)
                || (cold_done == cold.len() && hot_done == hot.len())
            {
                break;
            }
        }
        report.dropped = (cold.len() - cold_done) + (hot.len() - hot_done);
        report
    }

    // One capacity-bounded pass over `candidates`; returns how many were
    // attempted (and thereby consumed).
    fn round(&self, candidates: &[AddrRecord], dest: Tier, report: &mut MigrationReport) -> usize {
        let assigned = self.plan(candidates, dest);
        let (migrated, failed) = self.run(&assigned);
        report.migrated += migrated;
        report.failed += failed;
        assigned.len()
    }

    // Assigns candidates to destination nodes in tier order, each node taking
    // as many pages as its free byte count covers.
    fn plan(&self, candidates: &[AddrRecord], dest: Tier) -> Vec<(AddrRecord, u32)> {
        let page_size = self.backend.page_size();
        let mut assigned = Vec::with_capacity(candidates.len());
        for &node in self.layout.nodes(dest) {
            if assigned.len() == candidates.len() {
                break;
            }
            let free = match self.backend.node_free_bytes(node) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("skipping node {node}: {err}");
                    continue;
                }
            };
            let room = usize::try_from(free / page_size).unwrap_or(usize::MAX);
            assigned.extend(
                candidates[assigned.len()..]
                    .iter()
                    .take(room)
                    .map(|record| (*record, node)),
            );
        }
        assigned
    }

    // Issues the batched moves, one call per PID run, with per-address
    // fallback on batch failure.
    fn run(&self, assigned: &[(AddrRecord, u32)]) -> (usize, usize) {
        let mut migrated = 0;
        let mut failed = 0;
        for run in assigned.chunk_by(|a, b| a.0.pid_retval == b.0.pid_retval) {
            let pid = run[0].0.pid_retval;
            let addrs: Vec<u64> = run.iter().map(|(record, _)| record.addr).collect();
            let nodes: Vec<u32> = run.iter().map(|(_, node)| *node).collect();
            match self.backend.move_pages(pid, &addrs, &nodes) {
                Ok(()) => migrated += run.len(),
                Err(err) => {
                    debug!("batched move for pid {pid} failed ({err}), retrying per page");
                    for (record, node) in run {
                        match self.backend.move_pages(pid, &[record.addr], &[*node]) {
                            Ok(()) => migrated += 1,
                            Err(err) => {
                                warn!(
                                    "cannot migrate addr {:#x} of pid {pid}: {err}",
                                    record.addr
                                );
                                failed += 1;
                            }
                        }
                    }
                }
            }
        }
        (migrated, failed)
    }
}
