//! The module containing the NUMA seam and its syscall/sysfs binding.
//!
//! The executor only needs three things from the host: the page size, the
//! free/total byte counts of a node, and a batched page-move primitive. They
//! sit behind [`MigrationBackend`] so the executor is testable without a
//! NUMA machine.

use core::fmt;
use std::{fs, io};

/// `MPOL_MF_MOVE` flag for `move_pages(2)`; not exposed by the `libc` crate.
const MPOL_MF_MOVE: libc::c_int = 1 << 1;

/// Errors raised by a NUMA backend.
#[derive(Debug, thiserror::Error)]
pub enum NumaError {
    /// The batched move call failed as a whole.
    #[error("move_pages failed: {0}")]
    MovePages(io::Error),
    /// A node's meminfo could not be read.
    #[error("cannot read meminfo of node {node}: {err}")]
    NodeInfo {
        /// The node queried.
        node: u32,
        /// The underlying failure.
        err: io::Error,
    },
    /// A node's meminfo did not carry the requested field.
    #[error("meminfo of node {0} is malformed")]
    Malformed(u32),
}

/// Host operations the migration executor runs on.
pub trait MigrationBackend: Send + Sync + fmt::Debug {
    /// The host page size in bytes.
    fn page_size(&self) -> u64;

    /// Free bytes on `node`.
    fn node_free_bytes(&self, node: u32) -> Result<u64, NumaError>;

    /// Total bytes on `node`.
    fn node_total_bytes(&self, node: u32) -> Result<u64, NumaError>;

    /// Moves the pages of `pid` at `addrs` to the paired `nodes` in one
    /// batched call.
    fn move_pages(&self, pid: i32, addrs: &[u64], nodes: &[u32]) -> Result<(), NumaError>;
}

/// The production backend: `move_pages(2)` plus the per-node sysfs meminfo.
#[derive(Debug)]
pub struct SysNuma {
    page_size: u64,
}

impl SysNuma {
    /// Caches the host page size.
    #[must_use]
    pub fn new() -> Self {
        // Safety: sysconf has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        Self { page_size }
    }

    fn meminfo_bytes(&self, node: u32, field: &str) -> Result<u64, NumaError> {
        let path = format!("/sys/devices/system/node/node{node}/meminfo");
        let text = fs::read_to_string(path).map_err(|err| NumaError::NodeInfo { node, err })?;
        // Lines read "Node 0 MemFree: 16273224 kB".
        for line in text.lines() {
            let mut fields = line.split_whitespace().skip(2);
            if fields.next() == Some(field) {
                let kb = fields
                    .next()
                    .and_then(|value| value.parse::<u64>().ok())
                    .ok_or(NumaError::Malformed(node))?;
                return Ok(kb * 1024);
            }
        }
        Err(NumaError::Malformed(node))
    }
}

impl Default for SysNuma {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationBackend for SysNuma {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn node_free_bytes(&self, node: u32) -> Result<u64, NumaError> {
        self.meminfo_bytes(node, "MemFree:")
    }

    fn node_total_bytes(&self, node: u32) -> Result<u64, NumaError> {
        self.meminfo_bytes(node, "MemTotal:")
    }

    fn move_pages(&self, pid: i32, addrs: &[u64], nodes: &[u32]) -> Result<(), NumaError> {
        let pages: Vec<*mut libc::c_void> =
            addrs.iter().map(|&addr| addr as *mut libc::c_void).collect();
        let dest: Vec<libc::c_int> = nodes.iter().map(|&node| node as libc::c_int).collect();
        let mut status = vec![-123_i32; addrs.len()];
        // Safety: the three arrays stay alive across the call and are all
        // sized by the count passed in.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                pid,
                addrs.len() as libc::c_ulong,
                pages.as_ptr(),
                dest.as_ptr(),
                status.as_mut_ptr(),
                MPOL_MF_MOVE,
            )
        };
        match rc {
            0 => Ok(()),
            rc if rc > 0 => Err(NumaError::MovePages(io::Error::other(format!(
                "{rc} pages were not moved"
            )))),
            _ => Err(NumaError::MovePages(io::Error::last_os_error())),
        }
    }
}
