//! # Perch Core
//!
//! Core types, the advertisement model, and error handling for the Perch
//! federation control plane.
//!
//! This crate provides the foundational abstractions used throughout the
//! workspace:
//! - Server and namespace advertisements (wire and internal forms)
//! - Capability, kind, and sort-method enums
//! - Downtime windows
//! - Error types
//! - The retry backoff function

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod ads;
pub mod backoff;
pub mod downtime;
pub mod error;
pub mod types;

pub use ads::{
    NamespaceAd, OriginAdvertiseV1, OriginAdvertiseV2, ServerAd, TokenGenRule, TokenIssuer,
    TokenStrategy,
};
pub use backoff::{backoff, backoff_with_jitter};
pub use downtime::{Downtime, DowntimeSource};
pub use error::{Error, Result};
pub use types::*;

/// `Server` response-header value prefix identifying a federation process
pub const SERVER_HEADER_PREFIX: &str = "pelican/";

/// Version string advertised in `Server` and `User-Agent` headers
pub fn server_header() -> String {
    format!("{}{}", SERVER_HEADER_PREFIX, env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_header() {
        assert!(server_header().starts_with("pelican/"));
    }
}
