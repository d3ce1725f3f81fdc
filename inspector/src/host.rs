//! The module containing the procfs/sysfs binding of the host walker seam.
//!
//! A privileged inspector runs against the kernel's idle-page tracking:
//! presence and the soft-dirty signal come from `/proc/<pid>/pagemap`, the
//! reference signal from `/sys/kernel/mm/page_idle/bitmap`, and frames map to
//! NUMA nodes through the sysfs memory-block directory. Clearing the
//! reference bits marks the frame idle, which the kernel applies as one
//! protected PTE update on its side; per-page clearing of the soft-dirty
//! signal is not offered by procfs, so the dirty bit is reported but left in
//! place (see `/proc/<pid>/clear_refs` for the whole-process form).
//!
//! Requires `CAP_SYS_ADMIN` (pagemap hides frame numbers otherwise) and a
//! kernel built with idle-page tracking.

use crate::paging::{AddressSpace, Host, HostError, PageRef, PteFlags, WalkStep};
use log::debug;
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    sync::Arc,
};

const PAGEMAP_PRESENT: u64 = 1 << 63;
const PAGEMAP_SOFT_DIRTY: u64 = 1 << 55;
const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;

// Pagemap entries fetched per pread.
const PAGEMAP_CHUNK: usize = 64;

/// The production [`Host`] over procfs and sysfs.
#[derive(Debug)]
pub struct ProcfsHost {
    page_size: u64,
    max_user_addr: u64,
    blocks: Arc<BlockMap>,
}

impl ProcfsHost {
    /// Probes the host interfaces once and caches the page size, the user
    /// address ceiling and the frame-to-node map.
    pub fn new() -> Result<Self, HostError> {
        // Safety: sysconf has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        Ok(Self {
            page_size,
            max_user_addr: derive_max_user_addr(),
            blocks: Arc::new(BlockMap::load()?),
        })
    }
}

impl Host for ProcfsHost {
    type Space = ProcfsSpace;

    fn open(&self, pid: i32) -> Option<ProcfsSpace> {
        match ProcfsSpace::attach(pid, self.page_size, Arc::clone(&self.blocks)) {
            Ok(space) => Some(space),
            Err(err) => {
                debug!("cannot attach to pid {pid}: {err}");
                None
            }
        }
    }

    fn alive(&self, pid: i32) -> bool {
        // Safety: signal 0 only performs the existence and permission checks.
        unsafe { libc::kill(pid, 0) == 0 }
    }

    fn max_user_addr(&self) -> u64 {
        self.max_user_addr
    }
}

/// One managed process seen through `/proc/<pid>`.
#[derive(Debug)]
pub struct ProcfsSpace {
    pid: i32,
    page_size: u64,
    pagemap: File,
    idle: File,
    blocks: Arc<BlockMap>,
}

impl ProcfsSpace {
    fn attach(pid: i32, page_size: u64, blocks: Arc<BlockMap>) -> Result<Self, HostError> {
        let pagemap = File::open(format!("/proc/{pid}/pagemap"))?;
        let idle = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/sys/kernel/mm/page_idle/bitmap")?;
        Ok(Self {
            pid,
            page_size,
            pagemap,
            idle,
            blocks,
        })
    }

    // Start, end and writability of each mapping, in address order.
    fn vmas(&self) -> io::Result<Vec<(u64, u64, bool)>> {
        let maps = fs::read_to_string(format!("/proc/{}/maps", self.pid))?;
        let mut out = Vec::new();
        for line in maps.lines() {
            let mut fields = line.split_whitespace();
            let Some(range) = fields.next() else { continue };
            let Some(perms) = fields.next() else { continue };
            let Some((lo, hi)) = range.split_once('-') else { continue };
            let (Ok(lo), Ok(hi)) = (u64::from_str_radix(lo, 16), u64::from_str_radix(hi, 16))
            else {
                continue;
            };
            out.push((lo, hi, perms.as_bytes().get(1) == Some(&b'w')));
        }
        Ok(out)
    }

    fn idle_bit(&self, pfn: u64) -> io::Result<bool> {
        let mut word = [0u8; 8];
        self.idle.read_exact_at(&mut word, (pfn / 64) * 8)?;
        Ok(u64::from_ne_bytes(word) & (1 << (pfn % 64)) != 0)
    }
}

impl AddressSpace for ProcfsSpace {
    fn walk(
        &mut self,
        start: u64,
        end: u64,
        visit: &mut dyn FnMut(&mut dyn PageRef) -> WalkStep,
    ) -> Result<(), HostError> {
        let vmas = self.vmas()?;
        let mut entries = [0u8; 8 * PAGEMAP_CHUNK];
        for (vma_start, vma_end, writable) in vmas {
            let lo = vma_start.max(start);
            let hi = vma_end.min(end);
            let mut addr = lo;
            while addr < hi {
                let left = (hi - addr) / self.page_size;
                let chunk = usize::try_from(left).unwrap_or(PAGEMAP_CHUNK).min(PAGEMAP_CHUNK);
                if chunk == 0 {
                    break;
                }
                let buf = &mut entries[..chunk * 8];
                if self.pagemap.read_exact_at(buf, (addr / self.page_size) * 8).is_err() {
                    // The mapping shrank under us; move on to the next one.
                    break;
                }
                for i in 0..chunk {
                    let entry = u64::from_ne_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
                    if entry & PAGEMAP_PRESENT == 0 {
                        continue;
                    }
                    let pfn = entry & PAGEMAP_PFN_MASK;
                    if pfn == 0 {
                        // Frame number hidden; nothing useful to classify.
                        continue;
                    }
                    let Some(node) = self.blocks.node_of(pfn * self.page_size) else {
                        continue;
                    };
                    let mut flags = PteFlags(0);
                    flags.set_present(true);
                    flags.set_writable(writable);
                    // A read failure counts as referenced so the page is
                    // never treated as migration-cold by mistake.
                    flags.set_accessed(!self.idle_bit(pfn).unwrap_or(false));
                    flags.set_dirty(entry & PAGEMAP_SOFT_DIRTY != 0);
                    let mut page = ProcfsPage {
                        addr: addr + i as u64 * self.page_size,
                        flags,
                        node,
                        pfn,
                        idle: &self.idle,
                    };
                    if visit(&mut page) == WalkStep::Stop {
                        return Ok(());
                    }
                }
                addr += chunk as u64 * self.page_size;
            }
        }
        Ok(())
    }
}

struct ProcfsPage<'a> {
    addr: u64,
    flags: PteFlags,
    node: u32,
    pfn: u64,
    idle: &'a File,
}

impl PageRef for ProcfsPage<'_> {
    fn addr(&self) -> u64 {
        self.addr
    }

    fn flags(&self) -> PteFlags {
        self.flags
    }

    fn node(&self) -> u32 {
        self.node
    }

    fn clear_referenced(&mut self) {
        // Setting the idle bit makes the kernel strip the referenced state
        // through its protected PTE sequence.
        let word = (1u64 << (self.pfn % 64)).to_ne_bytes();
        if let Err(err) = self.idle.write_all_at(&word, (self.pfn / 64) * 8) {
            debug!("cannot mark pfn {} idle: {err}", self.pfn);
        }
        self.flags.set_accessed(false);
    }
}

// Frame-address to NUMA-node resolution via the sysfs memory-block layout.
#[derive(Debug)]
struct BlockMap {
    block_size: u64,
    nodes: HashMap<u64, u32>,
}

impl BlockMap {
    fn load() -> Result<Self, HostError> {
        let raw = fs::read_to_string("/sys/devices/system/memory/block_size_bytes")?;
        let block_size = u64::from_str_radix(raw.trim(), 16)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut nodes = HashMap::new();
        for entry in fs::read_dir("/sys/devices/system/node")? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(node) = name
                .to_str()
                .and_then(|name| name.strip_prefix("node"))
                .and_then(|id| id.parse::<u32>().ok())
            else {
                continue;
            };
            for block in fs::read_dir(entry.path())? {
                let block = block?;
                let block_name = block.file_name();
                let Some(index) = block_name
                    .to_str()
                    .and_then(|name| name.strip_prefix("memory"))
                    .and_then(|id| id.parse::<u64>().ok())
                else {
                    continue;
                };
                let _ = nodes.insert(index, node);
            }
        }
        debug!("mapped {} memory blocks of {block_size:#x} bytes", nodes.len());
        Ok(Self { block_size, nodes })
    }

    fn node_of(&self, phys: u64) -> Option<u32> {
        self.nodes.get(&(phys / self.block_size)).copied()
    }
}

/// The exclusive upper bound of user virtual addresses, taken from the top of
/// our own address space with a per-architecture floor. Deriving it at
/// start-up keeps the walk range correct across paging configurations.
fn derive_max_user_addr() -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            const FLOOR: u64 = 0x7fff_ffff_f000;
        } else if #[cfg(target_arch = "aarch64")] {
            const FLOOR: u64 = 0xffff_ffff_f000;
        } else {
            const FLOOR: u64 = 0xc000_0000;
        }
    }
    let Ok(maps) = fs::read_to_string("/proc/self/maps") else {
        return FLOOR;
    };
    maps.lines()
        .filter(|line| !line.ends_with("[vsyscall]"))
        .filter_map(|line| line.split('-').nth(1)?.split_whitespace().next())
        .filter_map(|end| u64::from_str_radix(end, 16).ok())
        .max()
        .map_or(FLOOR, |top| top.max(FLOOR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_is_at_least_the_architecture_floor() {
        assert!(derive_max_user_addr() >= 0xc000_0000);
    }

    #[test]
    fn pagemap_bits_decode() {
        let entry = PAGEMAP_PRESENT | PAGEMAP_SOFT_DIRTY | 0x1234;
        assert_ne!(entry & PAGEMAP_PRESENT, 0);
        assert_ne!(entry & PAGEMAP_SOFT_DIRTY, 0);
        assert_eq!(entry & PAGEMAP_PFN_MASK, 0x1234);
    }
}
