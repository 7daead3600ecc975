//! # Perch Director
//!
//! The federation's request router. Servers advertise themselves through
//! the verified registration endpoints; clients ask for objects and get
//! a `307` to the best server that can satisfy them.
//!
//! The crate is organized around [`DirectorState`]: ingestion
//! ([`ingest`]), the redirect engine ([`redirect`] and [`sort`]),
//! per-server health probes ([`probe`]), bounded presence checks
//! ([`stat`]), and the HTTP surface ([`api`]).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod api;
pub mod config;
pub mod ingest;
pub mod probe;
pub mod redirect;
pub mod shutdown;
pub mod sort;
pub mod stat;
pub mod state;
pub mod tokens;

pub use api::{DirectorApi, DirectorServer};
pub use config::DirectorConfig;
pub use ingest::{Ingestor, Rejection};
pub use probe::ProbeManager;
pub use redirect::{handle_redirect, RedirectRequest, LISTINGS_UNSUPPORTED_MSG};
pub use shutdown::{ShutdownSignal, SignalHandler};
pub use sort::AdaptiveStats;
pub use stat::{ObjectMeta, StatOutcome, StatRegistry};
pub use state::DirectorState;
pub use tokens::DirectorTokens;
