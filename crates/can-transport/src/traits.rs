use crate::{BusInfo, CanFrame, Result, CLASSIC_MAX_PAYLOAD};

/// Blocking access to one CAN channel, classic or FD.
///
/// Implementations are used from a single thread at a time; callers that
/// share a bus put it behind a lock.
pub trait CanBus {
    /// Open a CAN interface by name (e.g., "mock0" or a serial device path).
    fn open(name: &str) -> Result<Self>
    where
        Self: Sized;

    /// Interfaces this backend can see.
    fn list() -> Result<Vec<BusInfo>>;

    /// Largest payload one frame may carry on this channel.
    fn max_payload(&self) -> usize {
        CLASSIC_MAX_PAYLOAD
    }

    /// Receive one frame, waiting at most `timeout_ms` (`Some(0)` polls).
    ///
    /// Returns [`TransportError::Timeout`](crate::TransportError::Timeout)
    /// when nothing arrives in time.
    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame>;

    /// Send one frame; frames longer than [`max_payload`](Self::max_payload) are rejected.
    fn send(&mut self, frame: &CanFrame) -> Result<()>;
}
