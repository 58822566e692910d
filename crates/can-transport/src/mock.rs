use crate::{BusInfo, CanBus, CanFrame, Result, TransportError, FD_MAX_PAYLOAD};
use std::collections::VecDeque;

/// Produces the frames a simulated peer puts on the bus in answer to one sent frame.
pub type Responder = Box<dyn FnMut(&CanFrame) -> Vec<CanFrame> + Send>;

/// A simple in-process mock bus. Each bus instance is independent.
///
/// Sent frames are recorded and handed to an optional responder; whatever the
/// responder returns is queued for `recv`. An empty queue reports
/// [`TransportError::Timeout`] immediately instead of sleeping.
pub struct MockBus {
    name: String,
    max_payload: usize,
    rx: VecDeque<CanFrame>,
    sent: Vec<CanFrame>,
    responder: Option<Responder>,
}

impl MockBus {
    /// A bus whose peer answers every sent frame through `responder`.
    pub fn with_responder(
        name: &str,
        responder: impl FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static,
    ) -> Self {
        let mut bus = Self::new(name);
        bus.responder = Some(Box::new(responder));
        bus
    }

    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            max_payload: FD_MAX_PAYLOAD,
            rx: VecDeque::new(),
            sent: Vec::new(),
            responder: None,
        }
    }

    /// Limit the payload size this bus accepts (8 emulates a classic CAN link).
    pub fn set_max_payload(&mut self, max: usize) {
        self.max_payload = max.min(FD_MAX_PAYLOAD);
    }

    /// Queue a frame as if a peer had put it on the bus.
    pub fn inject(&mut self, mut frame: CanFrame) {
        if frame.timestamp.is_none() {
            frame.stamp_now();
        }
        self.rx.push_back(frame);
    }

    /// Every frame sent so far, oldest first.
    pub fn sent(&self) -> &[CanFrame] {
        &self.sent
    }

    /// Number of frames waiting to be received.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl CanBus for MockBus {
    fn open(name: &str) -> Result<Self> {
        Ok(Self::new(name))
    }

    fn list() -> Result<Vec<BusInfo>> {
        Ok(vec![BusInfo {
            name: "mock0".to_string(),
            driver: "mock".to_string(),
        }])
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn recv(&mut self, _timeout_ms: Option<u64>) -> Result<CanFrame> {
        self.rx.pop_front().ok_or(TransportError::Timeout)
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let len = usize::from(frame.len);
        if len > self.max_payload {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_payload,
            });
        }
        tracing::trace!(bus = %self.name, id = %frame.id, len, "mock send");
        self.sent.push(frame.clone());
        if let Some(responder) = self.responder.as_mut() {
            for reply in responder(frame) {
                self.inject(reply);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CanId;

    fn frame(id: u16, data: &[u8]) -> CanFrame {
        CanFrame::new(CanId::standard(id).unwrap(), data).unwrap()
    }

    #[test]
    fn empty_queue_times_out() {
        let mut bus = MockBus::open("mock0").unwrap();
        assert!(matches!(bus.recv(Some(10)), Err(TransportError::Timeout)));
    }

    #[test]
    fn responder_replies_are_received_in_order() -> anyhow::Result<()> {
        let mut bus = MockBus::with_responder("mock0", |f| {
            vec![frame(0x100, f.payload()), frame(0x101, &[0xAA])]
        });
        bus.send(&frame(0x010, &[1, 2]))?;
        assert_eq!(bus.sent().len(), 1);
        assert_eq!(bus.pending(), 2);

        let first = bus.recv(None)?;
        assert_eq!(first.id.raw(), 0x100);
        assert_eq!(first.payload(), &[1, 2]);
        assert!(first.timestamp.is_some());
        assert_eq!(bus.recv(None)?.id.raw(), 0x101);
        Ok(())
    }

    #[test]
    fn classic_limit_rejects_fd_payload() {
        let mut bus = MockBus::open("mock0").unwrap();
        bus.set_max_payload(8);
        let id = CanId::extended(0x8001).unwrap();
        let fd = CanFrame::new_fd(id, &[0u8; 12]).unwrap();
        assert!(matches!(
            bus.send(&fd),
            Err(TransportError::FrameTooLarge { len: 12, max: 8 })
        ));
        assert!(bus.sent().is_empty());
    }
}
