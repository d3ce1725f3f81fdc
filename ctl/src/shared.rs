//! The module containing the state shared by the controller threads.
//!
//! Two locks serialise the interesting paths: the placement lock covers a
//! whole FIND → migrate transaction so two controllers can never act on
//! overlapping candidate sets, and the channel's own lock (inside
//! [`Channel`]) covers each wire round-trip. The channel lock is only ever
//! taken inside the placement lock, never the other way around.

use crate::{
    channel::Channel,
    error::CtlError,
    migrate::{MigrationReport, Migrator},
    numa::MigrationBackend,
};
use hybmem_common::{FindMode, Tier, TierLayout};
use log::error;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    thread,
    time::Duration,
};

/// Everything the four controller threads share.
#[derive(Debug)]
pub struct Shared {
    channel: Channel,
    backend: Box<dyn MigrationBackend>,
    layout: TierLayout,
    exit: AtomicBool,
    switch_on: AtomicBool,
    thresh_on: AtomicBool,
    placement: Mutex<()>,
}

impl Shared {
    /// Bundles the channel, backend and layout; both controllers start
    /// enabled.
    #[must_use]
    pub fn new(channel: Channel, backend: Box<dyn MigrationBackend>, layout: TierLayout) -> Self {
        Self {
            channel,
            backend,
            layout,
            exit: AtomicBool::new(false),
            switch_on: AtomicBool::new(true),
            thresh_on: AtomicBool::new(true),
            placement: Mutex::new(()),
        }
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn exiting(&self) -> bool {
        self.exit.load(Ordering::Relaxed)
    }

    /// Flags shutdown; threads notice between sleeps and iterations.
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Relaxed);
    }

    /// Whether the switch controller is enabled.
    #[must_use]
    pub fn switch_active(&self) -> bool {
        self.switch_on.load(Ordering::Relaxed)
    }

    /// Whether the threshold controller is enabled.
    #[must_use]
    pub fn thresh_active(&self) -> bool {
        self.thresh_on.load(Ordering::Relaxed)
    }

    /// Flips the switch controller; returns the new state.
    pub fn toggle_switch(&self) -> bool {
        !self.switch_on.fetch_xor(true, Ordering::Relaxed)
    }

    /// Flips the threshold controller; returns the new state.
    pub fn toggle_thresh(&self) -> bool {
        !self.thresh_on.fetch_xor(true, Ordering::Relaxed)
    }

    /// The tier layout in force.
    #[must_use]
    pub fn layout(&self) -> &TierLayout {
        &self.layout
    }

    /// The NUMA backend in force.
    #[must_use]
    pub fn backend(&self) -> &dyn MigrationBackend {
        self.backend.as_ref()
    }

    /// Sleeps up to `total`, waking early when shutdown is flagged.
    pub fn sleep(&self, total: Duration) {
        const SLICE: Duration = Duration::from_millis(100);
        let mut left = total;
        while !self.exiting() && !left.is_zero() {
            let step = left.min(SLICE);
            thread::sleep(step);
            left -= step;
        }
    }

    /// Asks the inspector to manage `pid`. A channel failure is fatal.
    pub fn bind(&self, pid: i32) -> bool {
        self.channel.bind(pid).unwrap_or_else(|err| self.fail(&err))
    }

    /// Asks the inspector to forget `pid`. A channel failure is fatal.
    pub fn unbind(&self, pid: i32) -> bool {
        self.channel
            .unbind(pid)
            .unwrap_or_else(|err| self.fail(&err))
    }

    /// One FIND → migrate transaction under the placement lock. Returns the
    /// number of pages that physically moved.
    pub fn find_and_migrate(&self, n: usize, mode: FindMode) -> Result<usize, CtlError> {
        let _placement = self.placement.lock().unwrap();
        let reply = self.channel.find(n, mode)?;
        let migrator = Migrator::new(self.backend.as_ref(), &self.layout);
        let report = match mode {
            FindMode::Dram => migrator.migrate(reply.candidates(), Tier::Nvram),
            FindMode::Nvram => migrator.migrate(reply.candidates(), Tier::Dram),
            FindMode::Switch => match reply.exchange_halves()? {
                Some((hot, cold)) => migrator.exchange(hot, cold),
                None => MigrationReport::default(),
            },
            // Diagnostic modes observe without moving anything.
            FindMode::NvramWrite | FindMode::NvramClear | FindMode::NvramIntensive => {
                MigrationReport::default()
            }
        };
        Ok(report.migrated)
    }

    fn fail(&self, err: &CtlError) -> bool {
        error!("{err}");
        self.request_exit();
        false
    }
}
