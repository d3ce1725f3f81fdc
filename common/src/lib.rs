//! Fixed-layout records and datagram framing shared by the placement
//! controller and the page inspector, plus the DRAM/NVRAM tier model and the
//! stderr logger both daemons install.
//!
//! The two daemons exchange native-endian records over a datagram channel: a
//! 12-byte [`Request`] from controller to inspector, answered by one or more
//! packets carrying 16-byte [`AddrRecord`]s. A logical response may span
//! multiple packets; all but the last carry the MULTI flag and the last
//! carries DONE (see [`segment`] and [`Reassembler`]).

#![allow(clippy::cast_possible_truncation)]

pub mod logger;
mod tier;
mod wire;

/// Default rendezvous path of the inspector's request socket.
pub const DEFAULT_INSPECTOR_SOCKET: &str = "/tmp/hybmem-inspector.sock";

pub use tier::{Tier, TierLayout, TierLayoutError};
pub use wire::{
    segment, AddrRecord, FindMode, OpCode, PacketHeader, ProtocolError, Reassembler, Request,
    HEADER_BYTES, MAX_N_FIND, MAX_N_SWITCH, MAX_PACKETS, MAX_PAYLOAD, PACKET_BYTES, RECORDS_PER_PACKET,
    RECORD_BYTES, REQUEST_BYTES,
};
