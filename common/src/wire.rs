//! The module containing the request/response records and packet framing.

use bitfield::bitfield;

/// Record payload bytes per packet. The theoretical channel maximum is much
/// larger, but one page worth of payload is the conventional ceiling.
pub const MAX_PAYLOAD: usize = 4096;

/// The maximum number of packets forming one logical response.
pub const MAX_PACKETS: usize = 512;

/// Encoded size of one [`AddrRecord`]: 8-byte address, 4-byte pid/retval,
/// 4 bytes of padding so records stay 8-byte aligned in the payload.
pub const RECORD_BYTES: usize = 16;

/// Encoded size of one [`Request`].
pub const REQUEST_BYTES: usize = 12;

/// Encoded size of one [`PacketHeader`].
pub const HEADER_BYTES: usize = 8;

/// How many records fit in one packet payload.
pub const RECORDS_PER_PACKET: usize = MAX_PAYLOAD / RECORD_BYTES;

/// Encoded size of a full packet.
pub const PACKET_BYTES: usize = HEADER_BYTES + MAX_PAYLOAD;

/// The number of pages that fit in exactly [`MAX_PACKETS`] packets, leaving
/// room for the trailing status record.
pub const MAX_N_FIND: usize = RECORDS_PER_PACKET * MAX_PACKETS - 1;

/// The number of page pairs that fit in exactly [`MAX_PACKETS`] packets,
/// leaving room for the separator and the trailing status record.
pub const MAX_N_SWITCH: usize = (MAX_N_FIND - 1) / 2;

/// Errors raised while decoding datagrams. The receiver drops the offending
/// message and keeps serving.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The buffer is shorter than the fixed layout requires.
    #[error("truncated message: got {got} bytes, need {need}")]
    Truncated {
        /// Bytes available.
        got: usize,
        /// Bytes the layout requires.
        need: usize,
    },
    /// The operation code is not FIND, BIND or UNBIND.
    #[error("unknown op code {0}")]
    UnknownOpCode(i32),
    /// The FIND mode is outside the table in the module docs.
    #[error("unknown find mode {0}")]
    UnknownMode(i32),
    /// The payload length is not a whole number of records, or the record
    /// count in the header disagrees with the payload length.
    #[error("malformed payload of {0} bytes")]
    MalformedPayload(usize),
    /// More than [`MAX_PACKETS`] packets arrived without a DONE flag.
    #[error("response exceeds {MAX_PACKETS} packets")]
    TooManyPackets,
}

/// Operations the inspector accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    /// Walk managed address spaces and return candidate pages.
    Find = 0,
    /// Insert a process into the managed set.
    Bind = 1,
    /// Remove a process from the managed set.
    Unbind = 2,
}

impl TryFrom<i32> for OpCode {
    type Error = ProtocolError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Find),
            1 => Ok(Self::Bind),
            2 => Ok(Self::Unbind),
            other => Err(ProtocolError::UnknownOpCode(other)),
        }
    }
}

/// Classification policy selector carried by FIND requests. See the policy
/// table in the inspector for what each mode picks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FindMode {
    /// Cold pages out of DRAM.
    Dram = 0,
    /// Hot written pages out of NVRAM.
    Nvram = 1,
    /// Composite hot/cold exchange walk.
    Switch = 2,
    /// Diagnostic: written pages on NVRAM, no reference-bit side effect.
    NvramWrite = 3,
    /// Clear the reference bits of every eligible NVRAM page.
    NvramClear = 4,
    /// Hot pages on NVRAM regardless of the dirty bit, no side effect.
    NvramIntensive = 5,
}

impl TryFrom<i32> for FindMode {
    type Error = ProtocolError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Dram),
            1 => Ok(Self::Nvram),
            2 => Ok(Self::Switch),
            3 => Ok(Self::NvramWrite),
            4 => Ok(Self::NvramClear),
            5 => Ok(Self::NvramIntensive),
            other => Err(ProtocolError::UnknownMode(other)),
        }
    }
}

/// A three-integer request, sent as a single datagram. `pid_or_count` carries
/// the page count for FIND and the target PID for BIND/UNBIND; `mode` is only
/// meaningful for FIND.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    /// The requested operation.
    pub op: OpCode,
    /// Page count (FIND) or PID (BIND/UNBIND).
    pub pid_or_count: i32,
    /// Raw mode selector; decoded with [`Request::mode`].
    pub mode: i32,
}

impl Request {
    /// A FIND request for up to `count` pages under `mode`.
    #[must_use]
    pub fn find(count: i32, mode: FindMode) -> Self {
        Self {
            op: OpCode::Find,
            pid_or_count: count,
            mode: mode as i32,
        }
    }

    /// A BIND request for `pid`.
    #[must_use]
    pub fn bind(pid: i32) -> Self {
        Self {
            op: OpCode::Bind,
            pid_or_count: pid,
            mode: 0,
        }
    }

    /// An UNBIND request for `pid`.
    #[must_use]
    pub fn unbind(pid: i32) -> Self {
        Self {
            op: OpCode::Unbind,
            pid_or_count: pid,
            mode: 0,
        }
    }

    /// Decodes the mode selector of a FIND request.
    pub fn mode(&self) -> Result<FindMode, ProtocolError> {
        FindMode::try_from(self.mode)
    }

    /// Encodes the request as three native-endian 32-bit integers.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; REQUEST_BYTES] {
        let mut buf = [0u8; REQUEST_BYTES];
        buf[0..4].copy_from_slice(&(self.op as i32).to_ne_bytes());
        buf[4..8].copy_from_slice(&self.pid_or_count.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.mode.to_ne_bytes());
        buf
    }

    /// Decodes a request datagram. The mode field is validated lazily so
    /// BIND/UNBIND requests with garbage in it still parse.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < REQUEST_BYTES {
            return Err(ProtocolError::Truncated {
                got: buf.len(),
                need: REQUEST_BYTES,
            });
        }
        let op = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
        Ok(Self {
            op: OpCode::try_from(op)?,
            pid_or_count: i32::from_ne_bytes(buf[4..8].try_into().unwrap()),
            mode: i32::from_ne_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

/// One (virtual address, pid-or-return-code) pair. The second field is
/// overloaded: FIND rows carry the owning PID, command rows carry the
/// operation status, and a zero acts as the in-stream separator of SWITCH
/// responses. The typed helpers below give the tagged view.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AddrRecord {
    /// Virtual address of the page, zero for status/separator rows.
    pub addr: u64,
    /// Owning PID, operation status or separator marker.
    pub pid_retval: i32,
}

impl AddrRecord {
    /// A FIND result row owned by `pid`.
    #[must_use]
    pub fn owner(addr: u64, pid: i32) -> Self {
        Self {
            addr,
            pid_retval: pid,
        }
    }

    /// A trailing status row (0 ok, -1 error).
    #[must_use]
    pub fn status(code: i32) -> Self {
        Self {
            addr: 0,
            pid_retval: code,
        }
    }

    /// Whether this row ends the run of result rows. PIDs are strictly
    /// positive, so the first non-positive row is a separator or status.
    #[must_use]
    pub fn ends_run(&self) -> bool {
        self.pid_retval <= 0
    }

    /// Encodes the record into the first [`RECORD_BYTES`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`RECORD_BYTES`].
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.addr.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.pid_retval.to_ne_bytes());
        buf[12..16].fill(0);
    }

    /// Decodes one record from the first [`RECORD_BYTES`] bytes of `buf`.
    pub fn read_from(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < RECORD_BYTES {
            return Err(ProtocolError::Truncated {
                got: buf.len(),
                need: RECORD_BYTES,
            });
        }
        Ok(Self {
            addr: u64::from_ne_bytes(buf[0..8].try_into().unwrap()),
            pid_retval: i32::from_ne_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

bitfield! {
    /// The per-packet header word. `count` is the number of records in the
    /// payload; MULTI marks every packet of a multi-part response except the
    /// last, which carries DONE instead.
    /*
         6                     1 1 1
         3.....................8 7 6 15.......0
        +-----------------------+-+-+----------+
        |xxxxxxxxxxxxxxxxxxxxxxx|D|M|  count   |
        +-----------------------+-+-+----------+
    */
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct PacketHeader(u64);
    impl Debug;
    pub count, set_count: 15, 0;
    pub multi, set_multi: 16;
    pub done, set_done: 17;
}

impl PacketHeader {
    /// Encodes the header as a native-endian word.
    #[must_use]
    pub fn to_bytes(self) -> [u8; HEADER_BYTES] {
        self.0.to_ne_bytes()
    }

    /// Decodes a header from the start of a datagram.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_BYTES {
            return Err(ProtocolError::Truncated {
                got: buf.len(),
                need: HEADER_BYTES,
            });
        }
        Ok(Self(u64::from_ne_bytes(buf[0..HEADER_BYTES].try_into().unwrap())))
    }
}

/// Splits `records` into encoded datagrams: full MULTI packets followed by a
/// DONE packet carrying the tail. A response always holds at least the status
/// record, so the iterator never yields zero packets for valid input.
#[must_use]
pub fn segment(records: &[AddrRecord]) -> Vec<Vec<u8>> {
    // An exact multiple still ends with a full DONE packet rather than an
    // empty one.
    let full = records.len().div_ceil(RECORDS_PER_PACKET).max(1);
    let mut packets = Vec::with_capacity(full);
    for (i, chunk) in records.chunks(RECORDS_PER_PACKET).enumerate() {
        let last = (i + 1) * RECORDS_PER_PACKET >= records.len();
        let mut header = PacketHeader(0);
        header.set_count(chunk.len() as u64);
        header.set_multi(!last);
        header.set_done(last);
        let mut buf = vec![0u8; HEADER_BYTES + chunk.len() * RECORD_BYTES];
        buf[0..HEADER_BYTES].copy_from_slice(&header.to_bytes());
        for (j, record) in chunk.iter().enumerate() {
            let off = HEADER_BYTES + j * RECORD_BYTES;
            record.write_to(&mut buf[off..off + RECORD_BYTES]);
        }
        packets.push(buf);
    }
    if packets.is_empty() {
        // Degenerate empty response still needs a DONE packet on the wire.
        let mut header = PacketHeader(0);
        header.set_done(true);
        packets.push(header.to_bytes().to_vec());
    }
    packets
}

/// Collects the packets of one logical response back into a record list.
#[derive(Debug, Default)]
pub struct Reassembler {
    records: Vec<AddrRecord>,
    packets: usize,
}

impl Reassembler {
    /// An empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one datagram. Returns `true` once the DONE packet arrived.
    pub fn push(&mut self, datagram: &[u8]) -> Result<bool, ProtocolError> {
        if self.packets == MAX_PACKETS {
            return Err(ProtocolError::TooManyPackets);
        }
        let header = PacketHeader::from_bytes(datagram)?;
        let payload = &datagram[HEADER_BYTES..];
        if payload.len() % RECORD_BYTES != 0
            || payload.len() / RECORD_BYTES != header.count() as usize
        {
            return Err(ProtocolError::MalformedPayload(payload.len()));
        }
        for chunk in payload.chunks(RECORD_BYTES) {
            self.records.push(AddrRecord::read_from(chunk)?);
        }
        self.packets += 1;
        Ok(header.done())
    }

    /// Consumes the reassembler, yielding the collected records.
    #[must_use]
    pub fn into_records(self) -> Vec<AddrRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let req = Request::find(1500, FindMode::Switch);
        let parsed = Request::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(parsed.op, OpCode::Find);
        assert_eq!(parsed.pid_or_count, 1500);
        assert_eq!(parsed.mode().unwrap(), FindMode::Switch);
    }

    #[test]
    fn request_rejects_bad_op() {
        let mut buf = Request::bind(42).to_bytes();
        buf[0..4].copy_from_slice(&7i32.to_ne_bytes());
        assert!(matches!(
            Request::from_bytes(&buf),
            Err(ProtocolError::UnknownOpCode(7))
        ));
    }

    #[test]
    fn bind_ignores_mode_garbage() {
        let mut buf = Request::bind(42).to_bytes();
        buf[8..12].copy_from_slice(&99i32.to_ne_bytes());
        let parsed = Request::from_bytes(&buf).unwrap();
        assert_eq!(parsed.op, OpCode::Bind);
        assert!(parsed.mode().is_err());
    }

    #[test]
    fn record_round_trip_with_padding() {
        let mut buf = [0xaau8; RECORD_BYTES];
        AddrRecord::owner(0x7f00_0000_1000, 1234).write_to(&mut buf);
        assert_eq!(&buf[12..16], &[0, 0, 0, 0]);
        let parsed = AddrRecord::read_from(&buf).unwrap();
        assert_eq!(parsed.addr, 0x7f00_0000_1000);
        assert_eq!(parsed.pid_retval, 1234);
    }

    #[test]
    fn size_constants_line_up() {
        assert_eq!(RECORDS_PER_PACKET, 256);
        assert_eq!(MAX_N_FIND, 131_071);
        assert_eq!(MAX_N_SWITCH, 65_535);
    }

    fn response_of(n: usize) -> Vec<AddrRecord> {
        let mut records: Vec<_> = (0..n)
            .map(|i| AddrRecord::owner(0x1000 + (i as u64) * 0x1000, 100))
            .collect();
        // FIND responses end with the trailing status record.
        let last = records.len() - 1;
        records[last] = AddrRecord::status(0);
        records
    }

    #[test]
    fn multi_packet_framing() {
        // 1500 records: 5 full MULTI packets of 256, one DONE packet of 220,
        // whose last record is the terminator.
        let records = response_of(1500);
        let packets = segment(&records);
        assert_eq!(packets.len(), 6);
        for packet in &packets[..5] {
            let header = PacketHeader::from_bytes(packet).unwrap();
            assert_eq!(header.count(), 256);
            assert!(header.multi() && !header.done());
        }
        let tail = PacketHeader::from_bytes(&packets[5]).unwrap();
        assert_eq!(tail.count(), 220);
        assert!(!tail.multi() && tail.done());

        let mut reassembler = Reassembler::new();
        for (i, packet) in packets.iter().enumerate() {
            let done = reassembler.push(packet).unwrap();
            assert_eq!(done, i == 5);
        }
        let collected = reassembler.into_records();
        assert_eq!(collected.len(), 1500);
        assert_eq!(collected[1499], AddrRecord::status(0));
        assert_eq!(collected[..1499], records[..1499]);
    }

    #[test]
    fn exact_multiple_ends_with_full_done_packet() {
        let packets = segment(&response_of(512));
        assert_eq!(packets.len(), 2);
        let tail = PacketHeader::from_bytes(&packets[1]).unwrap();
        assert_eq!(tail.count(), 256);
        assert!(tail.done());
    }

    #[test]
    fn single_record_response_is_one_done_packet() {
        let packets = segment(&[AddrRecord::status(-1)]);
        assert_eq!(packets.len(), 1);
        let header = PacketHeader::from_bytes(&packets[0]).unwrap();
        assert_eq!(header.count(), 1);
        assert!(header.done() && !header.multi());
    }

    #[test]
    fn reassembler_rejects_ragged_payload() {
        let mut packet = segment(&[AddrRecord::status(0)]).remove(0);
        packet.truncate(HEADER_BYTES + RECORD_BYTES - 3);
        assert!(matches!(
            Reassembler::new().push(&packet),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }
}
