//! In-process controller that answers register reads, for tests and demos.

use crate::wire::{self, Reader, NOP, READ_BASE, READ_ERROR, REPLY_BASE};
use crate::{ControllerId, RegisterAddress, Resolution, WireType};
use can_transport::{fd_padded_len, CanFrame, MockBus, CLASSIC_MAX_PAYLOAD, FD_MAX_PAYLOAD};
use std::collections::BTreeMap;

/// Error code reported for registers the simulator does not have.
pub const UNKNOWN_REGISTER_CODE: u32 = 1;

#[derive(Clone, Copy, Debug)]
struct SimRegister {
    resolution: Resolution,
    value: f64,
    /// Added to `value` after every answered request.
    step: f64,
}

/// A simulated controller with a fixed register table.
#[derive(Clone, Debug)]
pub struct SimController {
    id: ControllerId,
    prefix: u16,
    registers: BTreeMap<RegisterAddress, SimRegister>,
    answered: usize,
}

impl SimController {
    pub fn new(id: ControllerId) -> Self {
        Self {
            id,
            prefix: 0,
            registers: BTreeMap::new(),
            answered: 0,
        }
    }

    pub fn with_prefix(mut self, prefix: u16) -> Self {
        self.prefix = prefix;
        self
    }

    /// Expose `addr`; `resolution` decides how integer reads are scaled.
    pub fn with_register(mut self, addr: RegisterAddress, resolution: Resolution, value: f64) -> Self {
        self.registers.insert(
            addr,
            SimRegister {
                resolution,
                value,
                step: 0.0,
            },
        );
        self
    }

    /// Advance `addr` by `step` after each answered request.
    pub fn with_ramp(mut self, addr: RegisterAddress, step: f64) -> Self {
        if let Some(reg) = self.registers.get_mut(&addr) {
            reg.step = step;
        }
        self
    }

    pub fn set(&mut self, addr: RegisterAddress, value: f64) {
        if let Some(reg) = self.registers.get_mut(&addr) {
            reg.value = value;
        }
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    /// Requests answered so far.
    pub fn answered(&self) -> usize {
        self.answered
    }

    /// Answer `frame` if it is a request addressed to this controller.
    ///
    /// Replies that would overflow the frame are cut at the payload limit.
    pub fn respond(&mut self, frame: &CanFrame) -> Option<CanFrame> {
        if !frame.id.is_extended() {
            return None;
        }
        let routing = wire::routing(frame.id);
        if !routing.reply_requested
            || routing.prefix != self.prefix
            || routing.destination != self.id.raw()
        {
            return None;
        }

        let mut reply = Vec::new();
        let mut r = Reader::new(frame.payload());
        while let Some(op) = r.u8() {
            if op == NOP {
                continue;
            }
            if op & 0xF0 != READ_BASE {
                break;
            }
            let Some((wire, count, start)) = r.register_header(op) else {
                break;
            };
            self.answer_read(&mut reply, wire, count, start);
        }

        let max = if frame.fd {
            FD_MAX_PAYLOAD
        } else {
            CLASSIC_MAX_PAYLOAD
        };
        reply.truncate(max);
        let id = wire::reply_id(self.prefix, self.id, routing.source)?;
        let out = if frame.fd {
            let padded = fd_padded_len(reply.len()).unwrap_or(FD_MAX_PAYLOAD);
            reply.resize(padded, NOP);
            CanFrame::new_fd(id, &reply)
        } else {
            CanFrame::new(id, &reply)
        };

        self.answered += 1;
        for reg in self.registers.values_mut() {
            reg.value += reg.step;
        }
        out
    }

    fn answer_read(&self, out: &mut Vec<u8>, wire: WireType, count: usize, start: RegisterAddress) {
        let addrs: Vec<RegisterAddress> = (0..count as u32)
            .filter_map(|i| start.raw().checked_add(i).map(RegisterAddress))
            .collect();
        // Known registers are answered in runs; unknown ones get a read error.
        let mut i = 0;
        while i < addrs.len() {
            let run_start = i;
            while i < addrs.len() && self.registers.contains_key(&addrs[i]) {
                i += 1;
            }
            if i > run_start {
                let run = &addrs[run_start..i];
                wire::write_header(out, REPLY_BASE, wire, run.len(), run[0]);
                for addr in run {
                    if let Some(reg) = self.registers.get(addr) {
                        out.extend(reg.resolution.encode_as(wire, reg.value));
                    }
                }
            } else {
                out.push(READ_ERROR);
                wire::write_varuint(out, addrs[i].raw());
                wire::write_varuint(out, UNKNOWN_REGISTER_CODE);
                i += 1;
            }
        }
    }

    /// A mock bus on which this controller answers every request.
    pub fn into_bus(self, name: &str) -> MockBus {
        shared_bus(name, vec![self])
    }
}

/// A mock bus shared by several simulated controllers.
pub fn shared_bus(name: &str, mut controllers: Vec<SimController>) -> MockBus {
    MockBus::with_responder(name, move |frame| {
        controllers
            .iter_mut()
            .filter_map(|c| c.respond(frame))
            .collect()
    })
}
