use crate::encode::{FrameEncoder, RequestFrame};
use crate::metrics::QueryMetrics;
use crate::wire::{self, NOP};
use crate::{
    ControllerId, QueryError, QueryResult, QuerySpec, RegisterAddress, ResolutionRegistry, Result,
};
use can_transport::{fd_padded_len, CanBus, CanFrame, TransportError, CLASSIC_MAX_PAYLOAD};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Bus-side settings of a [`QueryClient`].
#[derive(Clone, Debug)]
pub struct QueryConfig {
    /// Our own 7-bit bus id.
    pub source_id: u8,
    /// Upper 13 bits of every arbitration id.
    pub prefix: u16,
    /// Payload cap; the bus limit applies when unset or smaller.
    pub max_payload: Option<usize>,
    /// Send CAN-FD frames.
    pub fd: bool,
    /// Upper bound on stale frames discarded before a request.
    pub drain_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            source_id: 0,
            prefix: 0,
            max_payload: None,
            fd: true,
            drain_limit: 16,
        }
    }
}

/// Where one `query` call currently is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    Sending,
    AwaitingResponse,
    Merging,
    Complete,
    TimedOut,
}

struct RoundTrip {
    controller: ControllerId,
    phase: Phase,
}

impl RoundTrip {
    fn new(controller: ControllerId) -> Self {
        Self {
            controller,
            phase: Phase::Idle,
        }
    }

    fn enter(&mut self, next: Phase) {
        tracing::trace!(controller = %self.controller, from = ?self.phase, to = ?next, "query phase");
        self.phase = next;
    }
}

struct Session<B> {
    bus: B,
    /// Requests per controller whose reply has not been seen yet. Replies come
    /// back in request order, so the next that many matching frames are stale.
    owed: HashMap<ControllerId, usize>,
}

/// Issues register queries over one shared bus.
///
/// Each `query` holds the bus for all of its round trips, so queries against
/// any controller on this bus run strictly one after another.
pub struct QueryClient<B> {
    session: Mutex<Session<B>>,
    config: QueryConfig,
    metrics: Option<QueryMetrics>,
}

impl<B: CanBus> QueryClient<B> {
    pub fn new(bus: B, config: QueryConfig) -> Result<Self> {
        if config.source_id > ControllerId::MAX {
            return Err(QueryError::InvalidConfig(format!(
                "source id {} exceeds 7 bits",
                config.source_id
            )));
        }
        if config.prefix > 0x1FFF {
            return Err(QueryError::InvalidConfig(format!(
                "prefix 0x{:x} exceeds 13 bits",
                config.prefix
            )));
        }
        Ok(Self {
            session: Mutex::new(Session {
                bus,
                owed: HashMap::new(),
            }),
            config,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: QueryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Run `f` with exclusive access to the bus.
    pub fn with_bus<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.lock().bus)
    }

    /// Whether `controller` still owes the reply to an earlier request.
    pub fn owes_reply(&self, controller: ControllerId) -> bool {
        self.lock().owed.get(&controller).is_some_and(|n| *n > 0)
    }

    /// Read every register of `spec` from `controller`.
    ///
    /// The spec may need several frames; each waits up to `timeout` for its
    /// reply. A timeout on any frame fails the whole query. Registers the
    /// controller did not report are absent from the result.
    pub fn query(
        &self,
        controller: ControllerId,
        spec: &QuerySpec,
        timeout: Duration,
    ) -> Result<QueryResult> {
        let mut rt = RoundTrip::new(controller);
        if spec.is_empty() {
            rt.enter(Phase::Complete);
            return Ok(QueryResult::default());
        }

        let mut session = self.lock();
        let encoder = FrameEncoder::new(self.effective_max_payload(&session.bus));
        let frames = encoder.encode(spec)?;
        let can_frames = frames
            .iter()
            .map(|f| self.to_can_frame(controller, f))
            .collect::<Result<Vec<_>>>()?;

        if !session.owed.is_empty() {
            self.drain(&mut session);
        }
        let mut stale = session.owed.get(&controller).copied().unwrap_or(0);

        let started = Instant::now();
        let mut partials = Vec::with_capacity(frames.len());
        for (frame, can_frame) in frames.iter().zip(&can_frames) {
            rt.enter(Phase::Sending);
            session
                .owed
                .insert(controller, (stale + 1).min(self.config.drain_limit.max(1)));
            session.bus.send(can_frame)?;
            self.count(|m| m.tx_frames.inc());

            rt.enter(Phase::AwaitingResponse);
            let reply = match self.await_reply(&mut session, controller, stale, timeout) {
                Ok(reply) => reply,
                Err(e) => {
                    if matches!(e, QueryError::Timeout(_)) {
                        rt.enter(Phase::TimedOut);
                        self.count(|m| m.timeouts.inc());
                    }
                    return Err(e);
                }
            };
            session.owed.remove(&controller);
            stale = 0;
            partials.push(frame.decode(reply.payload()));
        }

        rt.enter(Phase::Merging);
        let mut result = QueryResult::default();
        for outcome in partials {
            self.count(|m| m.ignored_registers.inc_by(outcome.ignored as u64));
            result.merge(outcome.result);
        }
        self.count(|m| {
            m.queries.inc();
            m.round_trip_seconds.observe(started.elapsed().as_secs_f64());
        });
        rt.enter(Phase::Complete);
        Ok(result)
    }

    /// Resolve `addrs` through `registry` and query exactly those registers.
    ///
    /// Unknown addresses fail before anything is sent.
    pub fn query_registers(
        &self,
        controller: ControllerId,
        registry: &ResolutionRegistry,
        addrs: &[RegisterAddress],
        timeout: Duration,
    ) -> Result<QueryResult> {
        let spec = addrs
            .iter()
            .fold(crate::QuerySpecBuilder::new().registry(registry.clone()), |b, a| {
                b.read(*a)
            })
            .build()?;
        self.query(controller, &spec, timeout)
    }

    fn lock(&self) -> MutexGuard<'_, Session<B>> {
        // A panic mid-query leaves the controller marked as owing a reply,
        // which the next query drains; the session itself stays usable.
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn effective_max_payload(&self, bus: &B) -> usize {
        let mut max = bus.max_payload();
        if let Some(cap) = self.config.max_payload {
            max = max.min(cap);
        }
        if !self.config.fd {
            return max.min(CLASSIC_MAX_PAYLOAD);
        }
        // padded requests must still fit
        (0..=max)
            .rev()
            .find(|n| fd_padded_len(*n) == Some(*n))
            .unwrap_or(0)
    }

    fn to_can_frame(&self, controller: ControllerId, frame: &RequestFrame) -> Result<CanFrame> {
        let id = wire::request_id(self.config.prefix, self.config.source_id, controller)
            .ok_or_else(|| QueryError::InvalidConfig("arbitration id out of range".into()))?;
        let built = if self.config.fd {
            let mut payload = frame.payload().to_vec();
            let padded = fd_padded_len(payload.len()).unwrap_or(payload.len());
            payload.resize(padded, NOP);
            CanFrame::new_fd(id, &payload)
        } else {
            CanFrame::new(id, frame.payload())
        };
        built.ok_or_else(|| {
            QueryError::InvalidConfig(format!(
                "request of {} bytes does not fit a frame",
                frame.payload().len()
            ))
        })
    }

    fn is_reply(&self, frame: &CanFrame, controller: ControllerId) -> bool {
        if !frame.id.is_extended() {
            return false;
        }
        let r = wire::routing(frame.id);
        !r.reply_requested
            && r.prefix == self.config.prefix
            && r.source == controller.raw()
            && r.destination == self.config.source_id
    }

    /// Wait for the reply to the request just sent.
    ///
    /// `stale` earlier replies from `controller` may still be in flight ahead
    /// of ours, so the `stale + 1`-th matching frame is the answer. If the
    /// deadline passes after at least one match, the newest match is taken;
    /// the missing ones were lost.
    fn await_reply(
        &self,
        session: &mut Session<B>,
        controller: ControllerId,
        stale: usize,
        timeout: Duration,
    ) -> Result<CanFrame> {
        let deadline = Instant::now()
            .checked_add(timeout)
            .ok_or_else(|| QueryError::InvalidConfig(format!("timeout {timeout:?} too large")))?;
        let mut wanted = stale + 1;
        let mut newest = None;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return newest.ok_or(QueryError::Timeout(controller));
            }
            let remaining_ms = (deadline - now).as_millis().max(1) as u64;
            match session.bus.recv(Some(remaining_ms)) {
                Ok(frame) => {
                    self.count(|m| m.rx_frames.inc());
                    if !self.is_reply(&frame, controller) {
                        tracing::trace!(id = %frame.id, %controller, "discarding unrelated frame");
                        continue;
                    }
                    wanted -= 1;
                    if wanted == 0 {
                        return Ok(frame);
                    }
                    tracing::debug!(%controller, wanted, "late reply to an earlier request");
                    newest = Some(frame);
                }
                Err(TransportError::Timeout) => {
                    return newest.ok_or(QueryError::Timeout(controller))
                }
                Err(TransportError::InvalidFrame(reason)) => {
                    tracing::trace!(reason, %controller, "skipping unparseable frame");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Discard whatever is already queued, settling debts of the controllers
    /// whose late replies turn up.
    fn drain(&self, session: &mut Session<B>) {
        let mut drained = 0usize;
        for _ in 0..self.config.drain_limit {
            let frame = match session.bus.recv(Some(0)) {
                Ok(frame) => frame,
                Err(TransportError::InvalidFrame(_)) => continue,
                Err(_) => break,
            };
            drained += 1;
            tracing::debug!(id = %frame.id, "drained stale frame");
            let settled = session
                .owed
                .keys()
                .copied()
                .find(|c| self.is_reply(&frame, *c));
            if let Some(c) = settled {
                if let Some(n) = session.owed.get_mut(&c) {
                    *n = n.saturating_sub(1);
                }
            }
        }
        session.owed.retain(|_, n| *n > 0);
        self.count(|m| m.drained_frames.inc_by(drained as u64));
    }

    fn count(&self, f: impl FnOnce(&QueryMetrics)) {
        if let Some(m) = &self.metrics {
            f(m);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{QuerySpecBuilder, Resolution};
    use can_transport::MockBus;

    const CTRL: u8 = 1;

    fn ctrl() -> ControllerId {
        ControllerId::new(CTRL).unwrap()
    }

    fn reply_frame(payload: &[u8]) -> CanFrame {
        let id = wire::reply_id(0, ctrl(), 0).unwrap();
        let mut p = payload.to_vec();
        p.resize(fd_padded_len(p.len()).unwrap(), NOP);
        CanFrame::new_fd(id, &p).unwrap()
    }

    fn int16_spec() -> QuerySpec {
        QuerySpecBuilder::new()
            .with(RegisterAddress(0x072), Resolution::Int16)
            .build()
            .unwrap()
    }

    #[test]
    fn empty_spec_issues_no_traffic() -> anyhow::Result<()> {
        let client = QueryClient::new(MockBus::open("mock0")?, QueryConfig::default())?;
        let out = client.query(ctrl(), &QuerySpec::empty(), Duration::from_millis(10))?;
        assert!(out.is_empty());
        assert!(client.with_bus(|b| b.sent().is_empty()));
        Ok(())
    }

    #[test]
    fn request_carries_routing_and_padding() -> anyhow::Result<()> {
        let bus = MockBus::with_responder("mock0", |_| vec![reply_frame(&[0x25, 0x72, 0xD1, 0xFD])]);
        let client = QueryClient::new(bus, QueryConfig::default())?;
        let out = client.query(ctrl(), &int16_spec(), Duration::from_millis(10))?;
        assert_eq!(out.get(RegisterAddress(0x072)), Some(-559.0));

        client.with_bus(|b| {
            let sent = &b.sent()[0];
            assert_eq!(sent.id.raw(), 0x8001);
            assert!(sent.fd);
            assert_eq!(sent.payload(), &[0x15, 0x72]);
        });
        assert!(!client.owes_reply(ctrl()));
        Ok(())
    }

    #[test]
    fn frames_from_other_controllers_are_skipped() -> anyhow::Result<()> {
        let other = wire::reply_id(0, ControllerId::new(2).unwrap(), 0).unwrap();
        let bus = MockBus::with_responder("mock0", move |_| {
            vec![
                CanFrame::new_fd(other, &[0x25, 0x72, 0x01, 0x00]).unwrap(),
                reply_frame(&[0x25, 0x72, 0x02, 0x00]),
            ]
        });
        let client = QueryClient::new(bus, QueryConfig::default())?;
        let out = client.query(ctrl(), &int16_spec(), Duration::from_millis(10))?;
        assert_eq!(out.get(RegisterAddress(0x072)), Some(2.0));
        Ok(())
    }

    #[test]
    fn missing_reply_times_out_and_marks_debt() -> anyhow::Result<()> {
        let client = QueryClient::new(MockBus::open("mock0")?, QueryConfig::default())?;
        let err = client
            .query(ctrl(), &int16_spec(), Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, QueryError::Timeout(c) if c == ctrl()));
        assert!(client.owes_reply(ctrl()));
        Ok(())
    }

    /// Reports one garbled frame ahead of whatever the inner bus delivers.
    struct GarbledFirst {
        inner: MockBus,
        garbled: bool,
    }

    impl CanBus for GarbledFirst {
        fn open(name: &str) -> can_transport::Result<Self> {
            Ok(Self {
                inner: MockBus::open(name)?,
                garbled: false,
            })
        }

        fn list() -> can_transport::Result<Vec<can_transport::BusInfo>> {
            MockBus::list()
        }

        fn max_payload(&self) -> usize {
            self.inner.max_payload()
        }

        fn recv(&mut self, timeout_ms: Option<u64>) -> can_transport::Result<CanFrame> {
            if !self.garbled {
                self.garbled = true;
                return Err(TransportError::InvalidFrame("unknown header"));
            }
            self.inner.recv(timeout_ms)
        }

        fn send(&mut self, frame: &CanFrame) -> can_transport::Result<()> {
            self.inner.send(frame)
        }
    }

    #[test]
    fn garbled_frame_does_not_abort_the_wait() -> anyhow::Result<()> {
        let bus = GarbledFirst {
            inner: MockBus::with_responder("mock0", |_| vec![reply_frame(&[0x25, 0x72, 0x03, 0x00])]),
            garbled: false,
        };
        let client = QueryClient::new(bus, QueryConfig::default())?;
        let out = client.query(ctrl(), &int16_spec(), Duration::from_millis(10))?;
        assert_eq!(out.get(RegisterAddress(0x072)), Some(3.0));
        assert!(!client.owes_reply(ctrl()));
        Ok(())
    }

    #[test]
    fn io_error_while_waiting_is_reported() -> anyhow::Result<()> {
        struct Unplugged;
        impl CanBus for Unplugged {
            fn open(_: &str) -> can_transport::Result<Self> {
                Ok(Unplugged)
            }
            fn list() -> can_transport::Result<Vec<can_transport::BusInfo>> {
                Ok(Vec::new())
            }
            fn recv(&mut self, _: Option<u64>) -> can_transport::Result<CanFrame> {
                Err(TransportError::Io("device unplugged".into()))
            }
            fn send(&mut self, _: &CanFrame) -> can_transport::Result<()> {
                Ok(())
            }
        }
        let config = QueryConfig {
            fd: false,
            ..QueryConfig::default()
        };
        let client = QueryClient::new(Unplugged, config)?;
        let err = client
            .query(ctrl(), &int16_spec(), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, QueryError::Transport(TransportError::Io(_))));
        Ok(())
    }

    #[test]
    fn unknown_register_sends_nothing() -> anyhow::Result<()> {
        let client = QueryClient::new(MockBus::open("mock0")?, QueryConfig::default())?;
        let err = client
            .query_registers(
                ctrl(),
                &ResolutionRegistry::new(),
                &[RegisterAddress(0x001), RegisterAddress(0x3ff)],
                Duration::from_millis(5),
            )
            .unwrap_err();
        assert!(matches!(err, QueryError::UnknownRegister(RegisterAddress(0x3ff))));
        assert!(client.with_bus(|b| b.sent().is_empty()));
        Ok(())
    }

    #[test]
    fn classic_mode_uses_eight_byte_frames() -> anyhow::Result<()> {
        let bus = MockBus::with_responder("mock0", |_| Vec::new());
        let config = QueryConfig {
            fd: false,
            ..QueryConfig::default()
        };
        let client = QueryClient::new(bus, config)?;
        let _ = client.query(ctrl(), &int16_spec(), Duration::from_millis(1));
        client.with_bus(|b| {
            assert!(!b.sent()[0].fd);
            assert_eq!(b.sent()[0].payload(), &[0x15, 0x72]);
        });
        Ok(())
    }

    #[test]
    fn odd_payload_cap_rounds_down_to_fd_length() -> anyhow::Result<()> {
        let mut bus = MockBus::open("mock0")?;
        bus.set_max_payload(10);
        let client = QueryClient::new(bus, QueryConfig::default())?;
        assert_eq!(client.with_bus(|b| client.effective_max_payload(b)), 8);
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_config() {
        let config = QueryConfig {
            source_id: 0x80,
            ..QueryConfig::default()
        };
        assert!(QueryClient::new(MockBus::open("mock0").unwrap(), config).is_err());
    }
}
