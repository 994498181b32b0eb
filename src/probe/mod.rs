pub mod transport;
pub mod udp;

pub use transport::*;
pub use udp::*;
