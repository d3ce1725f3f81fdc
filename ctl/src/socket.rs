//! The module containing the external bind/unbind endpoint.
//!
//! External agents connect to a stream socket at a well-known path and write
//! back-to-back request records. Only BIND and UNBIND are honoured here; a
//! FIND has no business arriving over this channel and is rejected with a
//! diagnostic. The accept loop waits with a bounded timeout so shutdown is
//! noticed promptly.

use crate::{config::POLL_TIMEOUT_MS, shared::Shared};
use hybmem_common::{OpCode, Request, REQUEST_BYTES};
use log::{error, info, warn};
use std::{
    fs,
    io::{self, Read},
    os::fd::AsRawFd,
    os::unix::net::UnixListener,
    path::Path,
};

/// The subset of controller operations external agents may drive.
pub trait BindSink {
    /// Manage a process; `true` on success.
    fn bind(&self, pid: i32) -> bool;
    /// Stop managing a process; `true` on success.
    fn unbind(&self, pid: i32) -> bool;
}

impl BindSink for Shared {
    fn bind(&self, pid: i32) -> bool {
        Shared::bind(self, pid)
    }

    fn unbind(&self, pid: i32) -> bool {
        Shared::unbind(self, pid)
    }
}

/// The loop body of the socket thread.
pub fn run(shared: &Shared, path: &Path) {
    let _ = fs::remove_file(path);
    let listener = match UnixListener::bind(path) {
        Ok(listener) => listener,
        Err(err) => {
            error!("cannot bind control socket {}: {err}", path.display());
            return;
        }
    };
    info!("control socket listening on {}", path.display());

    while !shared.exiting() {
        let mut fds = libc::pollfd {
            fd: listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // Safety: fds points at one valid pollfd for the duration of the
        // call.
        let ready = unsafe { libc::poll(&mut fds, 1, POLL_TIMEOUT_MS) };
        if ready < 0 {
            error!("control socket poll failed: {}", io::Error::last_os_error());
            break;
        }
        if ready == 0 {
            continue;
        }
        match listener.accept() {
            Ok((mut stream, _)) => {
                if let Err(err) = serve_conn(&mut stream, shared) {
                    warn!("control connection failed: {err}");
                }
            }
            Err(err) => warn!("control accept failed: {err}"),
        }
    }
    let _ = fs::remove_file(path);
}

/// Drains one connection's back-to-back requests until the peer hangs up.
pub fn serve_conn<R: Read>(conn: &mut R, sink: &impl BindSink) -> io::Result<()> {
    let mut buf = [0u8; REQUEST_BYTES];
    loop {
        let mut filled = 0;
        while filled < REQUEST_BYTES {
            let n = conn.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(());
        }
        if filled < REQUEST_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated control request",
            ));
        }
        let request = match Request::from_bytes(&buf) {
            Ok(request) => request,
            Err(err) => {
                warn!("dropping malformed control request: {err}");
                continue;
            }
        };
        match request.op {
            OpCode::Bind => {
                let pid = request.pid_or_count;
                if sink.bind(pid) {
                    info!("bind request success (pid={pid})");
                } else {
                    warn!("bind request failed (pid={pid})");
                }
            }
            OpCode::Unbind => {
                let pid = request.pid_or_count;
                if sink.unbind(pid) {
                    info!("unbind request success (pid={pid})");
                } else {
                    warn!("unbind request failed (pid={pid})");
                }
            }
            OpCode::Find => {
                warn!("find requests are not accepted on the control socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybmem_common::FindMode;
    use std::{cell::RefCell, io::Cursor};

    #[derive(Default)]
    struct RecordingSink {
        bound: RefCell<Vec<i32>>,
        unbound: RefCell<Vec<i32>>,
    }

    impl BindSink for RecordingSink {
        fn bind(&self, pid: i32) -> bool {
            self.bound.borrow_mut().push(pid);
            true
        }

        fn unbind(&self, pid: i32) -> bool {
            self.unbound.borrow_mut().push(pid);
            false
        }
    }

    fn stream_of(requests: &[Request]) -> Cursor<Vec<u8>> {
        let mut bytes = Vec::new();
        for request in requests {
            bytes.extend_from_slice(&request.to_bytes());
        }
        Cursor::new(bytes)
    }

    #[test]
    fn back_to_back_requests_are_dispatched() {
        let sink = RecordingSink::default();
        let mut conn = stream_of(&[
            Request::bind(100),
            Request::bind(200),
            Request::unbind(100),
        ]);
        serve_conn(&mut conn, &sink).unwrap();
        assert_eq!(*sink.bound.borrow(), vec![100, 200]);
        assert_eq!(*sink.unbound.borrow(), vec![100]);
    }

    #[test]
    fn find_requests_are_rejected() {
        let sink = RecordingSink::default();
        let mut conn = stream_of(&[Request::find(10, FindMode::Dram), Request::bind(300)]);
        serve_conn(&mut conn, &sink).unwrap();
        assert_eq!(*sink.bound.borrow(), vec![300]);
    }

    #[test]
    fn truncated_requests_error_out() {
        let sink = RecordingSink::default();
        let mut bytes = Request::bind(100).to_bytes().to_vec();
        bytes.truncate(7);
        let mut conn = Cursor::new(bytes);
        assert!(serve_conn(&mut conn, &sink).is_err());
        assert!(sink.bound.borrow().is_empty());
    }
}
