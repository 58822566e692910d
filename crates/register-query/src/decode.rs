use crate::wire::{Reader, NOP, READ_ERROR, REPLY_BASE, STREAM_SERVER_TO_CLIENT, WRITE_ERROR};
use crate::{RegisterAddress, Resolution};
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Decoded register values of one query.
///
/// A missing address means the controller did not report that register this
/// cycle; it is never stored as zero.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct QueryResult {
    values: BTreeMap<RegisterAddress, f64>,
}

impl QueryResult {
    pub fn get(&self, addr: RegisterAddress) -> Option<f64> {
        self.values.get(&addr).copied()
    }

    pub fn contains(&self, addr: RegisterAddress) -> bool {
        self.values.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegisterAddress, f64)> + '_ {
        self.values.iter().map(|(a, v)| (*a, *v))
    }

    pub fn values(&self) -> &BTreeMap<RegisterAddress, f64> {
        &self.values
    }

    /// Fold another partial result into this one.
    pub fn merge(&mut self, other: QueryResult) {
        self.values.extend(other.values);
    }
}

impl FromIterator<(RegisterAddress, f64)> for QueryResult {
    fn from_iter<I: IntoIterator<Item = (RegisterAddress, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Everything learned from one reply payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodeOutcome {
    pub result: QueryResult,
    /// Reply values for registers that were not requested.
    pub ignored: usize,
    /// Registers the controller reported as unreadable, with their error codes.
    pub read_errors: Vec<(RegisterAddress, u32)>,
    /// The payload ended inside a sub-frame.
    pub truncated: bool,
}

/// Decode a reply payload against the resolutions that were requested.
///
/// Complete values are kept even when the payload is cut short. Values for
/// addresses outside `requested` are skipped, as are error and stream
/// sub-frames. An unrecognised opcode ends decoding.
pub fn decode_reply(
    payload: &[u8],
    requested: &BTreeMap<RegisterAddress, Resolution>,
) -> DecodeOutcome {
    let mut out = DecodeOutcome::default();
    let mut values = BTreeMap::new();
    let mut r = Reader::new(payload);

    while let Some(opcode) = r.u8() {
        match opcode {
            NOP => continue,
            op if op & 0xF0 == REPLY_BASE => {
                let Some((wire, count, start)) = r.register_header(op) else {
                    out.truncated = true;
                    break;
                };
                for i in 0..count {
                    let Some(bytes) = r.take(wire.size()) else {
                        out.truncated = true;
                        break;
                    };
                    let addr = RegisterAddress(start.raw().wrapping_add(i as u32));
                    let Some(res) = requested.get(&addr) else {
                        out.ignored += 1;
                        continue;
                    };
                    if let (Some(v), Entry::Vacant(slot)) = (res.decode(wire, bytes), values.entry(addr)) {
                        slot.insert(v);
                    }
                }
                if out.truncated {
                    break;
                }
            }
            READ_ERROR | WRITE_ERROR => {
                let (Some(reg), Some(code)) = (r.varuint(), r.varuint()) else {
                    out.truncated = true;
                    break;
                };
                if opcode == READ_ERROR {
                    out.read_errors.push((RegisterAddress(reg), code));
                }
            }
            STREAM_SERVER_TO_CLIENT => {
                let skipped = r
                    .varuint()
                    .and_then(|_channel| r.varuint())
                    .and_then(|len| r.take(len as usize));
                if skipped.is_none() {
                    out.truncated = true;
                    break;
                }
            }
            other => {
                tracing::debug!(opcode = other, remaining = r.remaining(), "unknown sub-frame; stop decoding");
                break;
            }
        }
    }

    if out.ignored > 0 {
        tracing::debug!(ignored = out.ignored, "reply carried unrequested registers");
    }
    out.result = QueryResult { values };
    out
}
