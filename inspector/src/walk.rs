//! The module containing the cursor-resumable walk engine and the find,
//! exchange-composition and clear operations built on it.

use crate::{
    paging::{AddressSpace, PageRef, WalkStep},
    policy::{PageClass, Policy},
    registry::{Cursor, ProcessTable},
};
use hybmem_common::{AddrRecord, Tier, TierLayout, MAX_N_FIND, MAX_N_SWITCH};
use log::warn;

/// The pre-allocated candidate pools. `found` doubles as the response buffer;
/// nothing on the request path allocates once these exist.
#[derive(Debug)]
pub struct FindBuffers {
    /// Pages chosen for migration, later followed by separator/status rows.
    pub found: Vec<AddrRecord>,
    /// Second-choice pages salvaged when primaries run short.
    pub backup: Vec<AddrRecord>,
    /// Second-choice pool of the exchange walk's NVRAM phase.
    pub switch_backup: Vec<AddrRecord>,
}

impl FindBuffers {
    /// Allocates the three pools at their protocol-bounded capacities.
    #[must_use]
    pub fn new() -> Self {
        Self {
            found: Vec::with_capacity(MAX_N_FIND + 2),
            backup: Vec::with_capacity(MAX_N_FIND),
            switch_backup: Vec::with_capacity(MAX_N_SWITCH),
        }
    }

    /// Empties all three pools.
    pub fn reset(&mut self) {
        self.found.clear();
        self.backup.clear();
        self.switch_backup.clear();
    }
}

impl Default for FindBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks managed address spaces under `policy` until `found` holds `target`
/// records, resuming from and updating the cursor of the policy's tier.
///
/// The order covers one full cycle without revisiting: the cursor process
/// from its resume address to the ceiling, every other process whole (in
/// table order, wrapping), and finally the cursor process from zero back to
/// the resume address. Secondary picks land in `secondary` while it has room
/// for the primaries still missing.
fn cursor_walk<S: AddressSpace>(
    table: &mut ProcessTable<S>,
    layout: &TierLayout,
    policy: &Policy,
    target: usize,
    found: &mut Vec<AddrRecord>,
    secondary: &mut Vec<AddrRecord>,
    max_user_addr: u64,
) {
    let count = table.len();
    if count == 0 {
        return;
    }
    let start = table.cursor(policy.tier);
    let first = if start.index < count { start.index } else { 0 };

    // One full cycle: (first, resume..ceiling), the other processes whole,
    // then (first, 0..=resume).
    let mut legs = Vec::with_capacity(count + 1);
    legs.push((first, start.addr, max_user_addr));
    for offset in 1..count {
        legs.push(((first + offset) % count, 0, max_user_addr));
    }
    legs.push((first, 0, start.addr + 1));

    let mut stop_addr = None;
    for (index, from, to) in legs {
        let entry = table.entry_mut(index);
        let pid = entry.pid;
        let result = entry.space.walk(from, to, &mut |page| {
            if found.len() == target {
                stop_addr = Some(page.addr());
                return WalkStep::Stop;
            }
            let flags = page.flags();
            if !flags.present() || !flags.writable() || !layout.contains(page.node(), policy.tier)
            {
                return WalkStep::Continue;
            }
            match (policy.classify)(flags) {
                PageClass::Primary => {
                    found.push(AddrRecord::owner(page.addr(), pid));
                    return WalkStep::Continue;
                }
                PageClass::Secondary => {
                    if secondary.len() < target - found.len() {
                        secondary.push(AddrRecord::owner(page.addr(), pid));
                    }
                }
                PageClass::Skip => {}
            }
            if policy.clear_nonprimary {
                page.clear_referenced();
            }
            WalkStep::Continue
        });
        if let Err(err) = result {
            warn!("walk of pid {pid} failed, skipping: {err}");
        }
        if found.len() >= target {
            table.set_cursor(
                policy.tier,
                Cursor {
                    index,
                    addr: stop_addr.unwrap_or(start.addr),
                },
            );
            return;
        }
    }
    // A whole cycle came up short; the cursor keeps the last fully-scanned
    // position so the next walk starts where this one did.
    table.set_cursor(policy.tier, start);
}

/// Fills `bufs.found` with up to `n` candidates under `policy`, promoting
/// second-choice pages in insertion order when primaries run short.
pub fn find<S: AddressSpace>(
    table: &mut ProcessTable<S>,
    layout: &TierLayout,
    policy: &Policy,
    n: usize,
    bufs: &mut FindBuffers,
    max_user_addr: u64,
) {
    bufs.reset();
    let FindBuffers { found, backup, .. } = bufs;
    cursor_walk(table, layout, policy, n, found, backup, max_user_addr);
    if found.len() < n {
        let take = backup.len().min(n - found.len());
        found.extend(backup.drain(..take));
    }
}

/// Composes the hot/cold exchange response: up to `n` hot NVRAM pages, the
/// separator row, and an equal number of cold DRAM pages.
///
/// Imbalances are repaired by promoting second-choice pages of the short
/// side; whatever still cannot be paired is cut, so both runs always end up
/// the same length. An exchange with nothing to offer leaves `found` empty.
pub fn switch_walk<S: AddressSpace>(
    table: &mut ProcessTable<S>,
    layout: &TierLayout,
    n: usize,
    bufs: &mut FindBuffers,
    max_user_addr: u64,
) {
    bufs.reset();
    let FindBuffers {
        found,
        backup,
        switch_backup,
    } = bufs;

    cursor_walk(
        table,
        layout,
        &Policy::switch_nvram(),
        n,
        found,
        switch_backup,
        max_user_addr,
    );
    let hot = found.len();
    if hot == 0 && switch_backup.is_empty() {
        return;
    }

    // Separator sits at the end of the NVRAM run; the DRAM phase appends
    // past it, aiming for one cold page per hot page plus promotable spares.
    found.push(AddrRecord::status(0));
    let dram_target = (hot + switch_backup.len()).min(n);
    let total = found.len() + dram_target;
    cursor_walk(
        table,
        layout,
        &Policy::dram(),
        total,
        found,
        backup,
        max_user_addr,
    );
    let cold = found.len() - hot - 1;

    if cold == hot {
        if hot == 0 {
            // Nothing paired on either side; drop the lone separator.
            found.clear();
        }
        return;
    }
    if cold < hot && !backup.is_empty() {
        let missing = hot - cold;
        if backup.len() < missing {
            // Not enough spares: keep only as many hot pages as the DRAM
            // side can pair, shifting the cold run left over the cut.
            let paired = cold + backup.len();
            let cold_run = found[hot + 1..].to_vec();
            found.truncate(paired);
            found.push(AddrRecord::status(0));
            found.extend_from_slice(&cold_run);
            let take = backup.len();
            found.extend(backup.drain(..take));
        } else {
            found.extend(backup.drain(..missing));
        }
    } else if cold > hot && !switch_backup.is_empty() {
        // The cold side won; raise the hot side from its spares and trim the
        // cold run to the new pair count.
        let take = switch_backup.len().min(cold - hot);
        let paired = hot + take;
        let cold_run = found[hot + 1..=hot + paired].to_vec();
        found.truncate(hot);
        found.extend(switch_backup.drain(..take));
        found.push(AddrRecord::status(0));
        found.extend_from_slice(&cold_run);
    } else {
        // One side is empty and nothing can be promoted.
        found.clear();
    }
}

/// Clears the reference bits of every eligible NVRAM page of every managed
/// process. No cursor is involved; the walk always covers whole spaces.
pub fn clear_walk<S: AddressSpace>(
    table: &mut ProcessTable<S>,
    layout: &TierLayout,
    max_user_addr: u64,
) {
    for index in 0..table.len() {
        let entry = table.entry_mut(index);
        let pid = entry.pid;
        let result = entry.space.walk(0, max_user_addr, &mut |page| {
            let flags = page.flags();
            if flags.present() && flags.writable() && layout.contains(page.node(), Tier::Nvram) {
                page.clear_referenced();
            }
            WalkStep::Continue
        });
        if let Err(err) = result {
            warn!("clear walk of pid {pid} failed, skipping: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Cursor;
    use crate::testutil::{dram_page, nvram_page, MockSpace, MAX_ADDR};

    fn single_process(pages: Vec<crate::testutil::MockPage>) -> ProcessTable<MockSpace> {
        let mut table = ProcessTable::new();
        table.insert(100, MockSpace::new(pages)).unwrap();
        table
    }

    fn addrs(records: &[AddrRecord]) -> Vec<u64> {
        records.iter().map(|record| record.addr).collect()
    }

    #[test]
    fn find_picks_cold_writable_dram_pages() {
        // Three cold DRAM pages and one referenced page that is not
        // writable; the latter never qualifies.
        let mut unwritable = dram_page(0x4000, true, false);
        unwritable.flags.set_writable(false);
        let mut table = single_process(vec![
            dram_page(0x1000, false, false),
            dram_page(0x2000, false, false),
            dram_page(0x3000, false, false),
            unwritable,
        ]);
        let mut bufs = FindBuffers::new();
        let layout = TierLayout::default();
        find(&mut table, &layout, &Policy::dram(), 10, &mut bufs, MAX_ADDR);
        assert_eq!(addrs(&bufs.found), vec![0x1000, 0x2000, 0x3000]);
        assert!(bufs.found.iter().all(|record| record.pid_retval == 100));
    }

    #[test]
    fn find_promotes_backups_in_insertion_order() {
        let mut table = single_process(vec![
            dram_page(0x1000, true, false), // clean but referenced: secondary
            dram_page(0x2000, false, false), // cold: primary
            dram_page(0x3000, true, false), // secondary
        ]);
        let mut bufs = FindBuffers::new();
        let layout = TierLayout::default();
        find(&mut table, &layout, &Policy::dram(), 3, &mut bufs, MAX_ADDR);
        assert_eq!(addrs(&bufs.found), vec![0x2000, 0x1000, 0x3000]);
    }

    #[test]
    fn find_clears_reference_bits_behind_the_walk() {
        let space = MockSpace::new(vec![
            dram_page(0x1000, true, true),  // hot: skipped, cleared
            dram_page(0x2000, true, false), // secondary, cleared
            dram_page(0x3000, false, false), // primary, untouched
        ]);
        let mut table = ProcessTable::new();
        table.insert(100, space.clone()).unwrap();
        let mut bufs = FindBuffers::new();
        let layout = TierLayout::default();
        find(&mut table, &layout, &Policy::dram(), 1, &mut bufs, MAX_ADDR);
        assert_eq!(addrs(&bufs.found), vec![0x3000]);
        assert!(!space.flags_of(0x1000).accessed());
        assert!(!space.flags_of(0x1000).dirty());
        assert!(!space.flags_of(0x2000).accessed());

        // The formerly hot pages now read as cold, so the next walk picks
        // them up.
        find(&mut table, &layout, &Policy::dram(), 2, &mut bufs, MAX_ADDR);
        assert_eq!(addrs(&bufs.found), vec![0x1000, 0x2000]);
    }

    #[test]
    fn cursor_resumes_past_the_last_pick() {
        let mut table = single_process(vec![
            dram_page(0x1000, false, false),
            dram_page(0x2000, false, false),
            dram_page(0x3000, false, false),
            dram_page(0x4000, false, false),
        ]);
        let mut bufs = FindBuffers::new();
        let layout = TierLayout::default();
        find(&mut table, &layout, &Policy::dram(), 2, &mut bufs, MAX_ADDR);
        assert_eq!(addrs(&bufs.found), vec![0x1000, 0x2000]);
        // The walk stopped when it saw 0x3000 with the quota already met.
        assert_eq!(table.cursor(Tier::Dram), Cursor { index: 0, addr: 0x3000 });

        find(&mut table, &layout, &Policy::dram(), 2, &mut bufs, MAX_ADDR);
        assert_eq!(addrs(&bufs.found), vec![0x3000, 0x4000]);
    }

    #[test]
    fn walk_rotates_fairly_across_processes() {
        let mut table = ProcessTable::new();
        table
            .insert(100, MockSpace::new(vec![dram_page(0x1000, false, false)]))
            .unwrap();
        table
            .insert(
                200,
                MockSpace::new(vec![
                    dram_page(0x1000, false, false),
                    dram_page(0x2000, false, false),
                ]),
            )
            .unwrap();
        let mut bufs = FindBuffers::new();
        let layout = TierLayout::default();
        find(&mut table, &layout, &Policy::dram(), 2, &mut bufs, MAX_ADDR);
        assert_eq!(
            bufs.found,
            vec![AddrRecord::owner(0x1000, 100), AddrRecord::owner(0x1000, 200)]
        );
        assert_eq!(table.cursor(Tier::Dram), Cursor { index: 1, addr: 0x2000 });

        // The next walk resumes inside pid 200 rather than starting over.
        find(&mut table, &layout, &Policy::dram(), 1, &mut bufs, MAX_ADDR);
        assert_eq!(bufs.found, vec![AddrRecord::owner(0x2000, 200)]);
    }

    #[test]
    fn short_cycle_keeps_the_cursor_in_place() {
        let mut table = single_process(vec![dram_page(0x1000, true, true)]);
        table.set_cursor(Tier::Dram, Cursor { index: 0, addr: 0x5000 });
        let mut bufs = FindBuffers::new();
        let layout = TierLayout::default();
        find(&mut table, &layout, &Policy::dram(), 4, &mut bufs, MAX_ADDR);
        assert!(bufs.found.is_empty());
        assert_eq!(table.cursor(Tier::Dram), Cursor { index: 0, addr: 0x5000 });
    }

    #[test]
    fn switch_pairs_equal_halves_with_backup_promotion() {
        // Four hot NVRAM pages, two cold DRAM pages, three clean-but-hot
        // DRAM spares: the DRAM side is topped up to four.
        let mut table = single_process(vec![
            nvram_page(0x1_1000, true, true),
            nvram_page(0x1_2000, true, true),
            nvram_page(0x1_3000, true, true),
            nvram_page(0x1_4000, true, true),
            dram_page(0x2_1000, false, false),
            dram_page(0x2_2000, false, false),
            dram_page(0x2_3000, true, false),
            dram_page(0x2_4000, true, false),
            dram_page(0x2_5000, true, false),
        ]);
        let mut bufs = FindBuffers::new();
        let layout = TierLayout::default();
        switch_walk(&mut table, &layout, 10, &mut bufs, MAX_ADDR);

        assert_eq!(bufs.found.len(), 9);
        assert_eq!(
            addrs(&bufs.found[..4]),
            vec![0x1_1000, 0x1_2000, 0x1_3000, 0x1_4000]
        );
        assert_eq!(bufs.found[4], AddrRecord::status(0));
        assert_eq!(
            addrs(&bufs.found[5..]),
            vec![0x2_1000, 0x2_2000, 0x2_3000, 0x2_4000]
        );
    }

    #[test]
    fn switch_truncates_the_hot_side_when_spares_run_out() {
        let mut table = single_process(vec![
            nvram_page(0x1_1000, true, true),
            nvram_page(0x1_2000, true, true),
            nvram_page(0x1_3000, true, true),
            nvram_page(0x1_4000, true, true),
            dram_page(0x2_1000, false, false),
            dram_page(0x2_2000, true, false),
        ]);
        let mut bufs = FindBuffers::new();
        let layout = TierLayout::default();
        switch_walk(&mut table, &layout, 10, &mut bufs, MAX_ADDR);

        // One cold page plus one spare pair with two of the four hot pages.
        assert_eq!(bufs.found.len(), 5);
        assert_eq!(addrs(&bufs.found[..2]), vec![0x1_1000, 0x1_2000]);
        assert_eq!(bufs.found[2], AddrRecord::status(0));
        assert_eq!(addrs(&bufs.found[3..]), vec![0x2_1000, 0x2_2000]);
    }

    #[test]
    fn switch_promotes_hot_spares_when_the_cold_side_wins() {
        let mut table = single_process(vec![
            nvram_page(0x1_1000, true, true),
            nvram_page(0x1_2000, true, false), // spare
            nvram_page(0x1_3000, true, false), // spare
            dram_page(0x2_1000, false, false),
            dram_page(0x2_2000, false, false),
            dram_page(0x2_3000, false, false),
        ]);
        let mut bufs = FindBuffers::new();
        let layout = TierLayout::default();
        switch_walk(&mut table, &layout, 10, &mut bufs, MAX_ADDR);

        assert_eq!(bufs.found.len(), 7);
        assert_eq!(
            addrs(&bufs.found[..3]),
            vec![0x1_1000, 0x1_2000, 0x1_3000]
        );
        assert_eq!(bufs.found[3], AddrRecord::status(0));
        assert_eq!(
            addrs(&bufs.found[4..]),
            vec![0x2_1000, 0x2_2000, 0x2_3000]
        );
    }

    #[test]
    fn switch_with_nothing_hot_returns_empty() {
        let mut table = single_process(vec![
            nvram_page(0x1_1000, false, false),
            dram_page(0x2_1000, false, false),
        ]);
        let mut bufs = FindBuffers::new();
        let layout = TierLayout::default();
        switch_walk(&mut table, &layout, 10, &mut bufs, MAX_ADDR);
        assert!(bufs.found.is_empty());
    }

    #[test]
    fn switch_with_no_pairable_cold_side_returns_empty() {
        let mut table = single_process(vec![
            nvram_page(0x1_1000, true, true),
            nvram_page(0x1_2000, true, true),
        ]);
        let mut bufs = FindBuffers::new();
        let layout = TierLayout::default();
        switch_walk(&mut table, &layout, 10, &mut bufs, MAX_ADDR);
        assert!(bufs.found.is_empty());
    }

    #[test]
    fn switch_with_only_hot_spares_and_no_cold_side_returns_empty() {
        let mut table = single_process(vec![nvram_page(0x1_1000, true, false)]);
        let mut bufs = FindBuffers::new();
        let layout = TierLayout::default();
        switch_walk(&mut table, &layout, 10, &mut bufs, MAX_ADDR);
        assert!(bufs.found.is_empty());
    }

    #[test]
    fn clear_walk_strips_every_eligible_nvram_page() {
        let space = MockSpace::new(vec![
            nvram_page(0x1000, true, true),
            nvram_page(0x2000, true, false),
            dram_page(0x3000, true, true),
        ]);
        let mut table = ProcessTable::new();
        table.insert(100, space.clone()).unwrap();
        let layout = TierLayout::default();
        clear_walk(&mut table, &layout, MAX_ADDR);
        assert!(!space.flags_of(0x1000).accessed());
        assert!(!space.flags_of(0x2000).accessed());
        // DRAM pages are out of scope for the NVRAM clear.
        assert!(space.flags_of(0x3000).accessed());
    }
}
