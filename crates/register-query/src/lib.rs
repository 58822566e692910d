//! register-query: typed, multiplexed register reads over a shared CAN bus

mod types;
pub use types::{ControllerId, IntWidth, RegisterAddress, Resolution, WireType};

mod error;
pub use error::{QueryError, Result};

pub mod wire;

mod registry;
pub use registry::{
    build_query_spec, QuerySpec, QuerySpecBuilder, Register, ResolutionRegistry, DEFAULT_QUERY,
};

mod encode;
pub use encode::{FrameEncoder, RequestFrame, Slot, SubRequest};

mod decode;
pub use decode::{decode_reply, DecodeOutcome, QueryResult};

mod coordinator;
pub use coordinator::{Phase, QueryClient, QueryConfig};

mod metrics;
pub use metrics::{MetricsHub, QueryMetrics};

mod loader;
pub use loader::{
    load_profile_file, load_profiles_dir, parse_address, parse_profile, AddressRepr, ProfileSet,
    QueryProfile, RegisterEntry, ResolutionKind, TransportSettings,
};

#[cfg(feature = "tokio")]
mod async_client;
#[cfg(feature = "tokio")]
pub use async_client::AsyncQueryClient;

#[cfg(feature = "sim")]
pub mod sim;
