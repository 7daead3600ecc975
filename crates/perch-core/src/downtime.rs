//! Downtime windows declared by servers, operators, or the registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who declared a downtime window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DowntimeSource {
    /// The server declared it in its own advertisement
    Server,
    /// Pulled from the federation registry's downtime list
    Registry,
    /// Imported from the legacy topology feed
    Topology,
}

/// A time-bounded declaration that a server is unavailable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Downtime {
    /// Name of the affected server
    pub server_name: String,

    /// Window start
    pub start_time: DateTime<Utc>,

    /// Window end; `None` means indefinite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Where the declaration came from
    #[serde(default = "default_source")]
    pub source: DowntimeSource,

    /// Free-form operator note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_source() -> DowntimeSource {
    DowntimeSource::Server
}

impl Downtime {
    /// Whether the window covers the given instant.
    ///
    /// A window that has not started yet does not disqualify, and neither
    /// does one that has fully passed.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if now < self.start_time {
            return false;
        }
        match self.end_time {
            Some(end) => now < end,
            None => true,
        }
    }
}

impl fmt::Display for Downtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end_time {
            Some(end) => write!(f, "{} [{} .. {}]", self.server_name, self.start_time, end),
            None => write!(f, "{} [{} .. )", self.server_name, self.start_time),
        }
    }
}

/// True if any window in the slice covers `now`
pub fn any_active(windows: &[Downtime], now: DateTime<Utc>) -> bool {
    windows.iter().any(|d| d.is_active(now))
}
