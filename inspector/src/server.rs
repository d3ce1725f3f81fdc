//! The module containing the [`Inspector`] owner type and its request loop.
//!
//! All inspector state hangs off one owner whose methods are the request
//! handlers. Requests are served one at a time, so the handlers need no
//! internal synchronization; the only lock ever taken is the address-space
//! read lock of the process currently being walked, inside the host.

use crate::{
    config::MAX_PIDS,
    paging::Host,
    policy::Policy,
    registry::ProcessTable,
    walk::{self, FindBuffers},
};
use hybmem_common::{
    segment, AddrRecord, FindMode, OpCode, Request, TierLayout, MAX_N_FIND, MAX_N_SWITCH,
    REQUEST_BYTES,
};
use log::{debug, info, warn};
use std::os::unix::net::UnixDatagram;

/// The singleton owner of all inspector state.
#[derive(Debug)]
pub struct Inspector<H: Host> {
    host: H,
    layout: TierLayout,
    table: ProcessTable<H::Space>,
    bufs: FindBuffers,
    max_user_addr: u64,
}

impl<H: Host> Inspector<H> {
    /// Builds the inspector over `host` with pre-allocated buffers.
    pub fn new(host: H, layout: TierLayout) -> Self {
        let max_user_addr = host.max_user_addr();
        Self {
            host,
            layout,
            table: ProcessTable::new(),
            bufs: FindBuffers::new(),
            max_user_addr,
        }
    }

    /// Handles one request and returns the response records, trailing status
    /// row included. The returned slice borrows the reusable buffer and is
    /// valid until the next call.
    pub fn handle(&mut self, request: &Request) -> &[AddrRecord] {
        let status = match request.op {
            OpCode::Find => self.op_find(request),
            OpCode::Bind => {
                self.refresh();
                self.bufs.reset();
                self.op_bind(request.pid_or_count)
            }
            OpCode::Unbind => {
                self.bufs.reset();
                let status = self.op_unbind(request.pid_or_count);
                self.refresh();
                status
            }
        };
        self.bufs.found.push(AddrRecord::status(status));
        &self.bufs.found
    }

    /// Serves requests forever. Only a channel failure breaks the loop.
    pub fn serve(&mut self, socket: &UnixDatagram) -> std::io::Result<()> {
        let mut buf = [0u8; REQUEST_BYTES];
        loop {
            let (len, peer) = socket.recv_from(&mut buf)?;
            let request = match Request::from_bytes(&buf[..len]) {
                Ok(request) => request,
                Err(err) => {
                    warn!("dropping malformed request: {err}");
                    continue;
                }
            };
            debug!("received {request:?}");
            let records = self.handle(&request);
            let packets = segment(records);
            if records.len() == 1 {
                info!("sending 1 entry to the controller");
            } else {
                info!(
                    "sending {} entries to the controller in {} packets",
                    records.len(),
                    packets.len()
                );
            }
            let Some(path) = peer.as_pathname() else {
                warn!("peer socket is unnamed, dropping response");
                continue;
            };
            for packet in packets {
                let _ = socket.send_to(&packet, path)?;
            }
        }
    }

    // Prunes entries whose process died since the last request.
    fn refresh(&mut self) {
        let host = &self.host;
        self.table.prune(|pid| host.alive(pid));
        debug!(
            "managed set after refresh: {:?}",
            self.table.pids().collect::<Vec<_>>()
        );
    }

    fn op_find(&mut self, request: &Request) -> i32 {
        self.refresh();
        self.bufs.reset();
        if self.table.is_empty() {
            return 0;
        }
        let mode = match request.mode() {
            Ok(mode) => mode,
            Err(err) => {
                warn!("rejecting find: {err}");
                return -1;
            }
        };
        let n = usize::try_from(request.pid_or_count).unwrap_or(0);
        let limit = if mode == FindMode::Switch {
            MAX_N_SWITCH
        } else {
            MAX_N_FIND
        };
        if n > limit {
            warn!("rejecting find for {n} pages: the response can carry {limit}");
            return -1;
        }
        match mode {
            FindMode::Dram => self.run_find(&Policy::dram(), n),
            FindMode::Nvram => self.run_find(&Policy::nvram(), n),
            FindMode::NvramIntensive => self.run_find(&Policy::nvram_intensive(), n),
            FindMode::NvramWrite => self.run_find(&Policy::nvram_write(), n),
            FindMode::NvramClear => {
                walk::clear_walk(&mut self.table, &self.layout, self.max_user_addr);
            }
            FindMode::Switch => {
                walk::switch_walk(&mut self.table, &self.layout, n, &mut self.bufs, self.max_user_addr);
            }
        }
        0
    }

    fn run_find(&mut self, policy: &Policy, n: usize) {
        walk::find(
            &mut self.table,
            &self.layout,
            policy,
            n,
            &mut self.bufs,
            self.max_user_addr,
        );
    }

    fn op_bind(&mut self, pid: i32) -> i32 {
        if pid <= 0 {
            warn!("invalid pid {pid} in bind request");
            return -1;
        }
        if self.table.len() >= MAX_PIDS {
            info!("managed set at capacity, refusing pid {pid}");
            return -1;
        }
        let Some(space) = self.host.open(pid) else {
            info!("could not bind pid {pid}: no such process");
            return -1;
        };
        match self.table.insert(pid, space) {
            Ok(()) => {
                info!("bound pid {pid}");
                0
            }
            Err(err) => {
                info!("could not bind pid {pid}: {err}");
                -1
            }
        }
    }

    fn op_unbind(&mut self, pid: i32) -> i32 {
        if pid <= 0 {
            warn!("invalid pid {pid} in unbind request");
            return -1;
        }
        match self.table.remove(pid) {
            Ok(()) => {
                info!("unbound pid {pid}");
                0
            }
            Err(err) => {
                info!("could not unbind pid {pid}: {err}");
                -1
            }
        }
    }
}
