//! can-transport: cross-platform CAN bus abstractions
//!
//! This crate provides traits and types for interacting with Controller Area Network (CAN)
//! interfaces, classic and FD, with feature-gated backends. The default build enables a
//! `mock` backend so that binaries and tests run on any host without native drivers.

mod types;
pub use types::{
    dlc_for_len, fd_padded_len, len_for_dlc, BusInfo, CanFrame, CanId, Timestamp,
    CLASSIC_MAX_PAYLOAD, FD_MAX_PAYLOAD,
};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::CanBus;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBus, Responder};

#[cfg(feature = "slcan")]
mod slcan;

#[cfg(feature = "slcan")]
pub use slcan::{SlcanBitrate, SlcanBus, SlcanDataBitrate};
