use crate::decode::{decode_reply, DecodeOutcome};
use crate::wire::{header_len, write_header, READ_BASE};
use crate::{QueryError, QuerySpec, RegisterAddress, Resolution, Result, WireType};
use core::ops::Range;
use std::collections::BTreeMap;

/// One register inside a request, with where its value sits in the expected reply.
#[derive(Clone, Debug, PartialEq)]
pub struct Slot {
    pub address: RegisterAddress,
    pub resolution: Resolution,
    pub reply_range: Range<usize>,
}

/// A range read: consecutive registers sharing one wire type.
#[derive(Clone, Debug, PartialEq)]
pub struct SubRequest {
    pub start: RegisterAddress,
    pub wire: WireType,
    pub slots: Vec<Slot>,
}

/// One independently sendable request payload.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestFrame {
    payload: Vec<u8>,
    subrequests: Vec<SubRequest>,
    expected_reply_len: usize,
}

impl RequestFrame {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn subrequests(&self) -> &[SubRequest] {
        &self.subrequests
    }

    /// Size of a reply that answers every register of this frame.
    pub fn expected_reply_len(&self) -> usize {
        self.expected_reply_len
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> + '_ {
        self.subrequests.iter().flat_map(|s| s.slots.iter())
    }

    pub fn addresses(&self) -> impl Iterator<Item = RegisterAddress> + '_ {
        self.slots().map(|s| s.address)
    }

    /// Resolutions this frame asked for, keyed by address.
    pub fn requested(&self) -> BTreeMap<RegisterAddress, Resolution> {
        self.slots().map(|s| (s.address, s.resolution)).collect()
    }

    /// Decode a reply to this frame.
    pub fn decode(&self, reply: &[u8]) -> DecodeOutcome {
        decode_reply(reply, &self.requested())
    }
}

/// Packs a [`QuerySpec`] into request frames bounded by a payload size.
#[derive(Clone, Copy, Debug)]
pub struct FrameEncoder {
    max_payload: usize,
}

impl FrameEncoder {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Build the request frames for `spec`.
    ///
    /// Consecutive addresses of one wire type become a single range read. Both
    /// the request and its full reply fit in `max_payload`; runs that do not fit
    /// are split across frames. An empty spec yields no frames.
    pub fn encode(&self, spec: &QuerySpec) -> Result<Vec<RequestFrame>> {
        let mut frames = Vec::new();
        let mut cur = FrameBuilder::default();

        for run in runs(spec) {
            let mut rest = run.as_slice();
            while let Some(&(start, res)) = rest.first() {
                let wire = res.wire_type();
                let fit = self.fitting_count(&cur, start, wire, rest.len());
                if fit == 0 {
                    if cur.is_empty() {
                        return Err(QueryError::InvalidConfig(format!(
                            "max payload of {} bytes cannot carry register {start}",
                            self.max_payload
                        )));
                    }
                    frames.push(std::mem::take(&mut cur).finish());
                    continue;
                }
                let (head, tail) = rest.split_at(fit);
                cur.push(start, wire, head);
                rest = tail;
            }
        }
        if !cur.is_empty() {
            frames.push(cur.finish());
        }
        tracing::trace!(
            registers = spec.len(),
            frames = frames.len(),
            max_payload = self.max_payload,
            "encoded query"
        );
        Ok(frames)
    }

    /// How many of the next `available` registers fit into `cur`.
    fn fitting_count(
        &self,
        cur: &FrameBuilder,
        start: RegisterAddress,
        wire: WireType,
        available: usize,
    ) -> usize {
        let mut fit = 0;
        for count in 1..=available {
            let header = header_len(count, start);
            let request = cur.payload.len() + header;
            let reply = cur.reply_len + header + count * wire.size();
            if request > self.max_payload || reply > self.max_payload {
                break;
            }
            fit = count;
        }
        fit
    }
}

/// Maximal runs of consecutive addresses sharing a wire type.
fn runs(spec: &QuerySpec) -> Vec<Vec<(RegisterAddress, Resolution)>> {
    let mut out: Vec<Vec<(RegisterAddress, Resolution)>> = Vec::new();
    for (addr, res) in spec.iter() {
        let extends = out.last().and_then(|run| run.last()).is_some_and(|&(prev, prev_res)| {
            prev.next() == Some(addr) && prev_res.wire_type() == res.wire_type()
        });
        match out.last_mut() {
            Some(run) if extends => run.push((addr, res)),
            _ => out.push(vec![(addr, res)]),
        }
    }
    out
}

#[derive(Default)]
struct FrameBuilder {
    payload: Vec<u8>,
    subrequests: Vec<SubRequest>,
    reply_len: usize,
}

impl FrameBuilder {
    fn is_empty(&self) -> bool {
        self.subrequests.is_empty()
    }

    fn push(&mut self, start: RegisterAddress, wire: WireType, regs: &[(RegisterAddress, Resolution)]) {
        write_header(&mut self.payload, READ_BASE, wire, regs.len(), start);
        let mut offset = self.reply_len + header_len(regs.len(), start);
        let slots = regs
            .iter()
            .map(|&(address, resolution)| {
                let range = offset..offset + wire.size();
                offset = range.end;
                Slot {
                    address,
                    resolution,
                    reply_range: range,
                }
            })
            .collect();
        self.reply_len = offset;
        self.subrequests.push(SubRequest { start, wire, slots });
    }

    fn finish(self) -> RequestFrame {
        RequestFrame {
            payload: self.payload,
            subrequests: self.subrequests,
            expected_reply_len: self.reply_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QuerySpecBuilder;

    fn spec(regs: &[(u32, Resolution)]) -> QuerySpec {
        regs.iter()
            .fold(QuerySpecBuilder::new(), |b, (a, r)| b.with(RegisterAddress(*a), *r))
            .build()
            .unwrap()
    }

    #[test]
    fn empty_spec_yields_no_frames() {
        let frames = FrameEncoder::new(64).encode(&QuerySpec::empty()).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn contiguous_same_width_registers_coalesce() {
        let s = spec(&[
            (0x072, Resolution::Int16),
            (0x073, Resolution::Int16),
            (0x074, Resolution::Int16),
            (0x080, Resolution::Int16),
            (0x081, Resolution::Int16),
            (0x082, Resolution::Int16),
        ]);
        let frames = FrameEncoder::new(64).encode(&s).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[0x17, 0x72, 0x17, 0x80, 0x01]);
        assert_eq!(frames[0].subrequests().len(), 2);
        // two replies of header(2 or 3 bytes) + 3 * 2 bytes
        assert_eq!(frames[0].expected_reply_len(), 2 + 6 + 3 + 6);
    }

    #[test]
    fn unsigned_and_signed_share_a_width_class() {
        let s = spec(&[(0x200, Resolution::UInt16), (0x201, Resolution::Int16)]);
        let frames = FrameEncoder::new(64).encode(&s).unwrap();
        assert_eq!(frames[0].subrequests().len(), 1);
        assert_eq!(frames[0].payload(), &[0x16, 0x80, 0x04]);
    }

    #[test]
    fn mixed_types_split_into_subrequests() {
        let s = spec(&[
            (0x000, Resolution::UInt8),
            (0x001, Resolution::Float32),
            (0x002, Resolution::Float32),
            (0x003, Resolution::Float32),
            (0x00d, Resolution::fixed(8, 0.5).unwrap()),
            (0x00e, Resolution::fixed(8, 1.0).unwrap()),
            (0x00f, Resolution::UInt8),
        ]);
        let frames = FrameEncoder::new(64).encode(&s).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].payload(),
            &[0x11, 0x00, 0x1f, 0x01, 0x13, 0x0d]
        );
        let slots: Vec<_> = frames[0].slots().map(|s| s.reply_range.clone()).collect();
        assert_eq!(slots[0], 2..3);
        assert_eq!(slots[1], 5..9);
        assert_eq!(slots[4], 19..20);
    }

    #[test]
    fn classic_payload_splits_runs() {
        let s = spec(&[
            (0x050, Resolution::Float32),
            (0x051, Resolution::Float32),
            (0x052, Resolution::Float32),
        ]);
        let frames = FrameEncoder::new(8).encode(&s).unwrap();
        // a reply of header (2) + one float (4) fits; two floats do not
        assert_eq!(frames.len(), 3);
        for f in &frames {
            assert!(f.payload().len() <= 8);
            assert!(f.expected_reply_len() <= 8);
        }
        let addrs: Vec<_> = frames.iter().flat_map(|f| f.addresses()).collect();
        assert_eq!(
            addrs,
            vec![RegisterAddress(0x050), RegisterAddress(0x051), RegisterAddress(0x052)]
        );
    }

    #[test]
    fn payload_too_small_is_a_config_error() {
        let s = spec(&[(0x001, Resolution::Float32)]);
        let err = FrameEncoder::new(4).encode(&s).unwrap_err();
        assert!(matches!(err, QueryError::InvalidConfig(_)));
    }

    #[test]
    fn long_runs_use_explicit_count() {
        let regs: Vec<_> = (0x100..0x108).map(|a| (a, Resolution::Int8)).collect();
        let frames = FrameEncoder::new(64).encode(&spec(&regs)).unwrap();
        assert_eq!(frames[0].payload(), &[0x10, 0x08, 0x80, 0x02]);
    }
}
