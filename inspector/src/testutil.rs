//! Test doubles for the host walker seam.

use crate::paging::{AddressSpace, Host, HostError, PageRef, PteFlags, WalkStep};
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::Rc,
};

pub(crate) const DRAM_NODE: u32 = 0;
pub(crate) const NVRAM_NODE: u32 = 2;
pub(crate) const MAX_ADDR: u64 = 0x8000_0000_0000;

#[derive(Debug, Clone)]
pub(crate) struct MockPage {
    pub(crate) addr: u64,
    pub(crate) flags: PteFlags,
    pub(crate) node: u32,
}

fn page(addr: u64, node: u32, accessed: bool, dirty: bool) -> MockPage {
    let mut flags = PteFlags(0);
    flags.set_present(true);
    flags.set_writable(true);
    flags.set_accessed(accessed);
    flags.set_dirty(dirty);
    MockPage { addr, flags, node }
}

pub(crate) fn dram_page(addr: u64, accessed: bool, dirty: bool) -> MockPage {
    page(addr, DRAM_NODE, accessed, dirty)
}

pub(crate) fn nvram_page(addr: u64, accessed: bool, dirty: bool) -> MockPage {
    page(addr, NVRAM_NODE, accessed, dirty)
}

/// An in-memory address space. Clones share the same page array so tests can
/// observe reference-bit side effects from outside the table.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockSpace {
    pages: Rc<RefCell<Vec<MockPage>>>,
}

impl MockSpace {
    pub(crate) fn new(mut pages: Vec<MockPage>) -> Self {
        pages.sort_by_key(|page| page.addr);
        Self {
            pages: Rc::new(RefCell::new(pages)),
        }
    }

    pub(crate) fn flags_of(&self, addr: u64) -> PteFlags {
        self.pages
            .borrow()
            .iter()
            .find(|page| page.addr == addr)
            .map(|page| page.flags)
            .expect("no such page")
    }
}

struct MockRef<'a> {
    page: &'a mut MockPage,
}

impl PageRef for MockRef<'_> {
    fn addr(&self) -> u64 {
        self.page.addr
    }

    fn flags(&self) -> PteFlags {
        self.page.flags
    }

    fn node(&self) -> u32 {
        self.page.node
    }

    fn clear_referenced(&mut self) {
        self.page.flags.set_accessed(false);
        self.page.flags.set_dirty(false);
    }
}

impl AddressSpace for MockSpace {
    fn walk(
        &mut self,
        start: u64,
        end: u64,
        visit: &mut dyn FnMut(&mut dyn PageRef) -> WalkStep,
    ) -> Result<(), HostError> {
        let mut pages = self.pages.borrow_mut();
        for page in pages
            .iter_mut()
            .filter(|page| page.addr >= start && page.addr < end)
        {
            let mut page_ref = MockRef { page };
            if visit(&mut page_ref) == WalkStep::Stop {
                break;
            }
        }
        Ok(())
    }
}

/// A host with a fixed set of attachable processes; `kill` flips one dead so
/// refresh pruning can be exercised.
#[derive(Debug, Default)]
pub(crate) struct MockHost {
    spaces: HashMap<i32, MockSpace>,
    dead: RefCell<HashSet<i32>>,
}

impl MockHost {
    pub(crate) fn add(&mut self, pid: i32, space: MockSpace) {
        let _ = self.spaces.insert(pid, space);
    }

    pub(crate) fn kill(&self, pid: i32) {
        let _ = self.dead.borrow_mut().insert(pid);
    }
}

impl Host for MockHost {
    type Space = MockSpace;

    fn open(&self, pid: i32) -> Option<MockSpace> {
        if self.alive(pid) {
            self.spaces.get(&pid).cloned()
        } else {
            None
        }
    }

    fn alive(&self, pid: i32) -> bool {
        self.spaces.contains_key(&pid) && !self.dead.borrow().contains(&pid)
    }

    fn max_user_addr(&self) -> u64 {
        MAX_ADDR
    }
}
