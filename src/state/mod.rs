pub mod registry;
pub mod server;

pub use registry::*;
pub use server::*;
