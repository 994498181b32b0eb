// Public API - probing engine, transport trait and data types
pub mod config;
pub mod probe;
pub mod prober;
pub mod state;

pub use config::Config;
pub use probe::{NO_RESPONSE_MS, ProbeError, ProbeReply, ProbeTransport, UdpProbeTransport};
pub use prober::{PingEvent, PingTracker};
pub use state::{PingResult, ServerDescriptor};
