pub mod comms;
pub mod error;
pub mod relay;
pub mod security;
pub mod utils;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
