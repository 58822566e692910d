//! Multiplexed register sub-frame format.
//!
//! A payload is a sequence of sub-frames. Register reads and replies share one
//! header layout:
//!
//! ```text
//! ┌───────────────────────┬─────────────────┬─────────────────┬──────────────┐
//! │ base | type<<2 | n    │ count (varuint) │ start (varuint) │ values       │
//! │ 1 byte                │ only if n == 0  │                 │ replies only │
//! └───────────────────────┴─────────────────┴─────────────────┴──────────────┘
//! ```
//!
//! Values are little-endian. `0x50` bytes are padding.

use crate::{ControllerId, RegisterAddress, WireType};
use can_transport::CanId;

/// Read request base opcode.
pub const READ_BASE: u8 = 0x10;
/// Read reply base opcode.
pub const REPLY_BASE: u8 = 0x20;
/// Write error: register (varuint), error code (varuint).
pub const WRITE_ERROR: u8 = 0x30;
/// Read error: register (varuint), error code (varuint).
pub const READ_ERROR: u8 = 0x31;
/// Server to client stream data: channel (varuint), length (varuint), bytes.
pub const STREAM_SERVER_TO_CLIENT: u8 = 0x41;
/// No-op; also used to pad FD payloads.
pub const NOP: u8 = 0x50;

/// Largest register count that fits in the header's low two bits.
const INLINE_COUNT_MAX: usize = 3;

/// Bit 15 of the arbitration id asks the controller to reply.
const REPLY_REQUESTED: u32 = 0x8000;

pub fn varuint_len(mut value: u32) -> usize {
    let mut n = 1;
    while value >= 0x80 {
        value >>= 7;
        n += 1;
    }
    n
}

pub fn write_varuint(out: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Encoded size of a read or reply header for `count` registers at `start`.
pub fn header_len(count: usize, start: RegisterAddress) -> usize {
    let count_len = if count > INLINE_COUNT_MAX {
        varuint_len(count as u32)
    } else {
        0
    };
    1 + count_len + varuint_len(start.raw())
}

pub fn write_header(
    out: &mut Vec<u8>,
    base: u8,
    wire: WireType,
    count: usize,
    start: RegisterAddress,
) {
    let inline = if (1..=INLINE_COUNT_MAX).contains(&count) {
        count as u8
    } else {
        0
    };
    out.push(base | wire.code() << 2 | inline);
    if inline == 0 {
        write_varuint(out, count as u32);
    }
    write_varuint(out, start.raw());
}

/// Forward-only cursor over a payload; every read fails softly at the end.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    /// LEB128, at most five bytes.
    pub fn varuint(&mut self) -> Option<u32> {
        let mut value: u32 = 0;
        for i in 0..5 {
            let b = self.u8()?;
            value |= u32::from(b & 0x7F) << (7 * i);
            if b & 0x80 == 0 {
                return Some(value);
            }
        }
        None
    }

    /// Count and start address following a read or reply opcode.
    pub fn register_header(&mut self, opcode: u8) -> Option<(WireType, usize, RegisterAddress)> {
        let wire = WireType::from_code(opcode >> 2);
        let count = match usize::from(opcode & 0x03) {
            0 => self.varuint()? as usize,
            n => n,
        };
        let start = RegisterAddress(self.varuint()?);
        Some((wire, count, start))
    }
}

/// Identifier for a request to `controller` that asks for a reply.
pub fn request_id(prefix: u16, source: u8, controller: ControllerId) -> Option<CanId> {
    let raw = u32::from(prefix) << 16
        | REPLY_REQUESTED
        | u32::from(source & 0x7F) << 8
        | u32::from(controller.raw());
    CanId::extended(raw)
}

/// Identifier a reply from `controller` to `source` carries.
pub fn reply_id(prefix: u16, controller: ControllerId, source: u8) -> Option<CanId> {
    let raw = u32::from(prefix) << 16 | u32::from(controller.raw()) << 8 | u32::from(source & 0x7F);
    CanId::extended(raw)
}

/// Routing fields of an arbitration id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Routing {
    pub prefix: u16,
    pub source: u8,
    pub destination: u8,
    pub reply_requested: bool,
}

pub fn routing(id: CanId) -> Routing {
    let raw = id.raw();
    Routing {
        prefix: (raw >> 16) as u16,
        source: ((raw >> 8) & 0x7F) as u8,
        destination: (raw & 0x7F) as u8,
        reply_requested: raw & REPLY_REQUESTED != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varuint_lengths_and_bytes() {
        let mut out = Vec::new();
        write_varuint(&mut out, 0x7F);
        assert_eq!(out, [0x7F]);
        out.clear();
        write_varuint(&mut out, 0x80);
        assert_eq!(out, [0x80, 0x01]);
        assert_eq!(varuint_len(0x3FFF), 2);
        assert_eq!(varuint_len(0x4000), 3);
        assert_eq!(varuint_len(u32::MAX), 5);

        let mut r = Reader::new(&out);
        assert_eq!(r.varuint(), Some(0x80));
        assert!(r.is_empty());
    }

    #[test]
    fn truncated_varuint_fails() {
        let mut r = Reader::new(&[0x80]);
        assert_eq!(r.varuint(), None);
    }

    #[test]
    fn header_inlines_small_counts() {
        let mut out = Vec::new();
        write_header(&mut out, READ_BASE, WireType::Int16, 3, RegisterAddress(0x072));
        assert_eq!(out, [0x17, 0x72]);
        assert_eq!(out.len(), header_len(3, RegisterAddress(0x072)));

        out.clear();
        write_header(&mut out, READ_BASE, WireType::Float32, 5, RegisterAddress(0x050));
        assert_eq!(out, [0x1C, 0x05, 0x50]);
        assert_eq!(out.len(), header_len(5, RegisterAddress(0x050)));

        let mut r = Reader::new(&out[1..]);
        assert_eq!(
            r.register_header(out[0]),
            Some((WireType::Float32, 5, RegisterAddress(0x050)))
        );
    }

    #[test]
    fn arbitration_ids_route_both_ways() {
        let ctrl = ControllerId::new(1).unwrap();
        let req = request_id(0, 0, ctrl).unwrap();
        assert_eq!(req.raw(), 0x8001);
        assert!(req.is_extended());
        let r = routing(req);
        assert!(r.reply_requested);
        assert_eq!((r.source, r.destination), (0, 1));

        let reply = reply_id(0, ctrl, 0).unwrap();
        assert_eq!(reply.raw(), 0x0100);
        let r = routing(reply);
        assert!(!r.reply_requested);
        assert_eq!((r.source, r.destination), (1, 0));
    }
}
