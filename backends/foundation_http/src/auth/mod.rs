//! Credential sources consumed by request signing.

mod credentials;

pub use credentials::*;
