//! # Perch Ads
//!
//! The director's soft state: a TTL'd store of server advertisements,
//! namespace prefix lookups over its snapshots, and the disqualification
//! filter set.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod filter;
pub mod namespace;
pub mod store;

pub use filter::FilterSet;
pub use namespace::{
    link_depth, longest_prefix_namespace, namespaces_from_origins, path_has_prefix,
    servers_for_object,
};
pub use store::{AdEvent, AdStore, UpsertOutcome, DEFAULT_AD_TTL};
