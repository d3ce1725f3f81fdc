//! The module containing the page classification policies.
//!
//! A policy files every eligible page (present, writable, backed by the
//! scanned tier) as a primary pick, a secondary pick or a pass. Policies that
//! set [`Policy::clear_nonprimary`] also turn the level-triggered reference
//! bits into an edge-triggered signal: every eligible page that was *not* a
//! primary pick gets its Accessed and Dirty bits cleared after observation,
//! so the next walk sees only references made since this one.
//!
//! Clearing Dirty here is a deliberate policy choice; on hosts whose
//! writeback path treats a clean bit as "nothing to write back" it can lose
//! data. Confirm the host's writeback contract before enabling these
//! policies on such a host.

use crate::paging::PteFlags;
use hybmem_common::Tier;

/// Where a policy files an eligible page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    /// Push to `found`.
    Primary,
    /// Push to the secondary pool if it still has room.
    Secondary,
    /// Leave in place.
    Skip,
}

/// One classification policy: the tier it scans, the classifier itself and
/// whether non-primary eligible pages get their reference bits cleared.
#[derive(derivative::Derivative, Clone, Copy)]
#[derivative(Debug)]
pub struct Policy {
    /// The tier whose backing nodes make a page eligible.
    pub tier: Tier,
    /// Files one eligible page.
    #[derivative(Debug = "ignore")]
    pub classify: fn(PteFlags) -> PageClass,
    /// Whether to clear A and D on eligible pages not picked as primary.
    pub clear_nonprimary: bool,
}

impl Policy {
    /// Cold pages out of DRAM: primaries are unreferenced pages, secondaries
    /// are clean-but-referenced ones.
    #[must_use]
    pub fn dram() -> Self {
        Self {
            tier: Tier::Dram,
            classify: |flags| {
                if !flags.accessed() {
                    PageClass::Primary
                } else if !flags.dirty() {
                    PageClass::Secondary
                } else {
                    PageClass::Skip
                }
            },
            clear_nonprimary: true,
        }
    }

    /// Hot written pages out of NVRAM: primaries are referenced and modified,
    /// everything else eligible is a secondary.
    #[must_use]
    pub fn nvram() -> Self {
        Self {
            tier: Tier::Nvram,
            classify: |flags| {
                if flags.accessed() && flags.dirty() {
                    PageClass::Primary
                } else {
                    PageClass::Secondary
                }
            },
            clear_nonprimary: true,
        }
    }

    /// Read-hot NVRAM pages without the reference-bit side effect.
    #[must_use]
    pub fn nvram_intensive() -> Self {
        Self {
            tier: Tier::Nvram,
            classify: intensive_classes,
            clear_nonprimary: false,
        }
    }

    /// Diagnostic policy: modified NVRAM pages, referenced ones first.
    #[must_use]
    pub fn nvram_write() -> Self {
        Self {
            tier: Tier::Nvram,
            classify: |flags| {
                if flags.dirty() && flags.accessed() {
                    PageClass::Primary
                } else if flags.dirty() {
                    PageClass::Secondary
                } else {
                    PageClass::Skip
                }
            },
            clear_nonprimary: false,
        }
    }

    /// The NVRAM phase of the hot/cold exchange: intensive classification
    /// with the reference bits cleared behind the walk.
    #[must_use]
    pub fn switch_nvram() -> Self {
        Self {
            tier: Tier::Nvram,
            classify: intensive_classes,
            clear_nonprimary: true,
        }
    }
}

// Referenced-and-modified first, referenced-but-clean as second choice.
fn intensive_classes(flags: PteFlags) -> PageClass {
    if flags.accessed() {
        if flags.dirty() {
            PageClass::Primary
        } else {
            PageClass::Secondary
        }
    } else {
        PageClass::Skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(accessed: bool, dirty: bool) -> PteFlags {
        let mut flags = PteFlags(0);
        flags.set_present(true);
        flags.set_writable(true);
        flags.set_accessed(accessed);
        flags.set_dirty(dirty);
        flags
    }

    #[test]
    fn dram_prefers_cold_then_clean() {
        let policy = Policy::dram();
        assert_eq!((policy.classify)(flags(false, false)), PageClass::Primary);
        assert_eq!((policy.classify)(flags(false, true)), PageClass::Primary);
        assert_eq!((policy.classify)(flags(true, false)), PageClass::Secondary);
        assert_eq!((policy.classify)(flags(true, true)), PageClass::Skip);
    }

    #[test]
    fn nvram_prefers_hot_dirty_then_anything() {
        let policy = Policy::nvram();
        assert_eq!((policy.classify)(flags(true, true)), PageClass::Primary);
        assert_eq!((policy.classify)(flags(true, false)), PageClass::Secondary);
        assert_eq!((policy.classify)(flags(false, true)), PageClass::Secondary);
        assert_eq!((policy.classify)(flags(false, false)), PageClass::Secondary);
    }

    #[test]
    fn intensive_ignores_unreferenced() {
        let policy = Policy::nvram_intensive();
        assert_eq!((policy.classify)(flags(true, true)), PageClass::Primary);
        assert_eq!((policy.classify)(flags(true, false)), PageClass::Secondary);
        assert_eq!((policy.classify)(flags(false, true)), PageClass::Skip);
        assert!(!policy.clear_nonprimary);
    }

    #[test]
    fn write_wants_modified_only() {
        let policy = Policy::nvram_write();
        assert_eq!((policy.classify)(flags(true, true)), PageClass::Primary);
        assert_eq!((policy.classify)(flags(false, true)), PageClass::Secondary);
        assert_eq!((policy.classify)(flags(true, false)), PageClass::Skip);
        assert_eq!((policy.classify)(flags(false, false)), PageClass::Skip);
    }

    #[test]
    fn switch_phase_clears_behind_itself() {
        assert!(Policy::switch_nvram().clear_nonprimary);
        assert!(!Policy::nvram_intensive().clear_nonprimary);
    }
}
