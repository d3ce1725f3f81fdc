//! The module containing the request/response channel to the inspector.
//!
//! One mutex serialises every round-trip: the request datagram goes out and
//! the multi-part response is reassembled before anyone else may talk. The
//! lock lives here so callers cannot interleave halves of two conversations
//! on the shared receive buffer.

use crate::error::CtlError;
use hybmem_common::{AddrRecord, FindMode, ProtocolError, Reassembler, Request, PACKET_BYTES};
use log::warn;
use std::{
    fs,
    os::unix::net::UnixDatagram,
    path::Path,
    sync::Mutex,
};

/// The connected datagram channel plus its receive buffer.
#[derive(Debug)]
pub struct Channel {
    io: Mutex<ChannelIo>,
}

#[derive(Debug)]
struct ChannelIo {
    socket: UnixDatagram,
    buf: Vec<u8>,
}

impl Channel {
    /// Binds `local` for replies and connects to the inspector at `remote`.
    pub fn connect(remote: &Path, local: &Path) -> Result<Self, CtlError> {
        let _ = fs::remove_file(local);
        let socket = UnixDatagram::bind(local)?;
        socket.connect(remote)?;
        Ok(Self {
            io: Mutex::new(ChannelIo {
                socket,
                buf: vec![0u8; PACKET_BYTES],
            }),
        })
    }

    /// Sends one request and reassembles the full response.
    pub fn round_trip(&self, request: &Request) -> Result<Vec<AddrRecord>, CtlError> {
        let mut io = self.io.lock().unwrap();
        let ChannelIo { socket, buf } = &mut *io;
        let _ = socket.send(&request.to_bytes())?;
        let mut reassembler = Reassembler::new();
        loop {
            let len = socket.recv(buf)?;
            match reassembler.push(&buf[..len]) {
                Ok(true) => break,
                Ok(false) => {}
                // An overlong response can never complete; give up on it.
                Err(err @ ProtocolError::TooManyPackets) => return Err(err.into()),
                Err(err) => warn!("dropping malformed packet: {err}"),
            }
        }
        Ok(reassembler.into_records())
    }

    /// Asks the inspector to manage `pid`. `true` on success.
    pub fn bind(&self, pid: i32) -> Result<bool, CtlError> {
        let records = self.round_trip(&Request::bind(pid))?;
        Ok(records.first().is_some_and(|record| record.pid_retval == 0))
    }

    /// Asks the inspector to forget `pid`. `true` on success.
    pub fn unbind(&self, pid: i32) -> Result<bool, CtlError> {
        let records = self.round_trip(&Request::unbind(pid))?;
        Ok(records.first().is_some_and(|record| record.pid_retval == 0))
    }

    /// Runs a FIND and wraps the response for candidate extraction.
    pub fn find(&self, n: usize, mode: FindMode) -> Result<FindReply, CtlError> {
        let count = i32::try_from(n).unwrap_or(i32::MAX);
        let records = self.round_trip(&Request::find(count, mode))?;
        Ok(FindReply { records })
    }
}

/// One FIND response. Candidate rows run up to the first separator/status
/// row; an exchange response carries two equal candidate runs around the
/// separator.
#[derive(Debug)]
pub struct FindReply {
    records: Vec<AddrRecord>,
}

impl FindReply {
    /// The rows before the first separator or status row.
    #[must_use]
    pub fn candidates(&self) -> &[AddrRecord] {
        &self.records[..self.stop()]
    }

    /// Splits an exchange response into its paired halves: hot NVRAM pages
    /// first, cold DRAM pages second. `Ok(None)` when the exchange found
    /// nothing to pair.
    pub fn exchange_halves(&self) -> Result<Option<(&[AddrRecord], &[AddrRecord])>, CtlError> {
        let hot = self.stop();
        if hot == 0 {
            return Ok(None);
        }
        let cold_start = hot + 1;
        let cold_end = cold_start + hot;
        if cold_end > self.records.len() {
            return Err(CtlError::UnpairedExchange);
        }
        Ok(Some((
            &self.records[..hot],
            &self.records[cold_start..cold_end],
        )))
    }

    fn stop(&self) -> usize {
        self.records
            .iter()
            .position(AddrRecord::ends_run)
            .unwrap_or(self.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybmem_common::segment;
    use std::thread;

    fn reply(records: Vec<AddrRecord>) -> FindReply {
        FindReply { records }
    }

    #[test]
    fn candidates_stop_at_the_status_row() {
        let find = reply(vec![
            AddrRecord::owner(0x1000, 100),
            AddrRecord::owner(0x2000, 100),
            AddrRecord::status(0),
        ]);
        assert_eq!(find.candidates().len(), 2);

        let empty = reply(vec![AddrRecord::status(0)]);
        assert!(empty.candidates().is_empty());
    }

    #[test]
    fn exchange_halves_split_around_the_separator() {
        let find = reply(vec![
            AddrRecord::owner(0x1000, 100),
            AddrRecord::owner(0x2000, 100),
            AddrRecord::status(0),
            AddrRecord::owner(0x3000, 100),
            AddrRecord::owner(0x4000, 200),
            AddrRecord::status(0),
        ]);
        let (hot, cold) = find.exchange_halves().unwrap().unwrap();
        assert_eq!(hot.len(), 2);
        assert_eq!(cold.len(), 2);
        assert_eq!(cold[0].addr, 0x3000);
    }

    #[test]
    fn empty_exchange_is_not_an_error() {
        let find = reply(vec![AddrRecord::status(0)]);
        assert!(find.exchange_halves().unwrap().is_none());
    }

    #[test]
    fn short_exchange_is_rejected() {
        let find = reply(vec![
            AddrRecord::owner(0x1000, 100),
            AddrRecord::owner(0x2000, 100),
            AddrRecord::status(0),
            AddrRecord::owner(0x3000, 100),
            AddrRecord::status(0),
        ]);
        assert!(matches!(
            find.exchange_halves(),
            Err(CtlError::UnpairedExchange)
        ));
    }

    #[test]
    fn round_trip_reassembles_multi_packet_responses() {
        let dir = tempfile::tempdir().unwrap();
        let remote_path = dir.path().join("inspector.sock");
        let local_path = dir.path().join("ctl.sock");
        let remote = UnixDatagram::bind(&remote_path).unwrap();

        let server = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (len, peer) = remote.recv_from(&mut buf).unwrap();
            let request = Request::from_bytes(&buf[..len]).unwrap();
            assert_eq!(request.pid_or_count, 300);

            let mut records: Vec<_> = (0u64..300)
                .map(|i| AddrRecord::owner(0x1000 + i * 0x1000, 100))
                .collect();
            records.push(AddrRecord::status(0));
            for packet in segment(&records) {
                let _ = remote
                    .send_to(&packet, peer.as_pathname().unwrap())
                    .unwrap();
            }
        });

        let channel = Channel::connect(&remote_path, &local_path).unwrap();
        let find = channel.find(300, FindMode::Dram).unwrap();
        assert_eq!(find.candidates().len(), 300);
        server.join().unwrap();
    }
}
