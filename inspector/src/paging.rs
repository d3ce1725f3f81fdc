//! The module containing the interface to the host's page walker.
//!
//! The mechanism that actually walks a process's page tables belongs to the
//! host OS; this module only fixes the seam the inspector drives it through.
//! An [`AddressSpace`] runs a callback for every mapped user page while
//! holding that space's read lock, handing the callback a [`PageRef`] through
//! which the page's reference bits can be observed and cleared.

use bitfield::bitfield;
use core::fmt;

bitfield! {
    /// Normalized leaf page-table entry bits, laid out as on x86. Hosts for
    /// other architectures map their bit positions onto these.
    /*
         6              1
         3..............2 11...7 6 5 4.2 1 0
        +----------------+------+-+-+---+-+-+
        |xxxxxxxxxxxxxxxx|xxxxxx|D|A|xxx|W|P|
        +----------------+------+-+-+---+-+-+
    */
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct PteFlags(u64);
    impl Debug;
    pub present, set_present: 0;
    pub writable, set_writable: 1;
    pub accessed, set_accessed: 5;
    pub dirty, set_dirty: 6;
}

/// What the visitor asks the walker to do after a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStep {
    /// Keep walking.
    Continue,
    /// Abort the walk of this range.
    Stop,
}

/// One visited page, observed under the owning space's read lock.
pub trait PageRef {
    /// Virtual address of the page.
    fn addr(&self) -> u64;

    /// The entry bits at observation time.
    fn flags(&self) -> PteFlags;

    /// NUMA node of the backing frame.
    fn node(&self) -> u32;

    /// Clears the reference bits of the entry as one protected
    /// read-modify-write. A bare store would race hardware A/D updates, so
    /// hosts must route this through their protected PTE modification
    /// sequence. Hosts clear both Accessed and Dirty when they can; a host
    /// whose interface has no per-page Dirty reset (the procfs binding)
    /// may clear Accessed alone and keep reporting the stale Dirty state.
    fn clear_referenced(&mut self);
}

/// Errors surfaced by a host binding.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The host interface could not be read or written.
    #[error("host access failed: {0}")]
    Io(#[from] std::io::Error),
}

/// An attached process address space.
pub trait AddressSpace: fmt::Debug {
    /// Runs `visit` for every mapped user page in `[start, end)`, in address
    /// order, under the space's read lock. Returns early when `visit` asks to
    /// stop. The lock never outlives one call.
    fn walk(
        &mut self,
        start: u64,
        end: u64,
        visit: &mut dyn FnMut(&mut dyn PageRef) -> WalkStep,
    ) -> Result<(), HostError>;
}

/// The host surface the inspector runs against: resolves PIDs to address
/// spaces and answers liveness queries.
pub trait Host {
    /// The address-space handle this host hands out.
    type Space: AddressSpace;

    /// Attaches to the address space of `pid`, or `None` if the process does
    /// not exist.
    fn open(&self, pid: i32) -> Option<Self::Space>;

    /// Whether `pid` still resolves to a live process.
    fn alive(&self, pid: i32) -> bool;

    /// The exclusive upper bound of user virtual addresses, derived at
    /// start-up.
    fn max_user_addr(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_sit_at_the_x86_positions() {
        let mut flags = PteFlags(0);
        flags.set_present(true);
        flags.set_writable(true);
        flags.set_accessed(true);
        flags.set_dirty(true);
        assert_eq!(flags.0, 0b110_0011);
    }
}
