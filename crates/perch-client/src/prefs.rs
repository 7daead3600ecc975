//! Preferred-server list parsing
//!
//! Users may pin caches: `--preferred-caches https://c1.org,https://c2.org,+`.
//! The trailing `+` means "try these first, then fall back to the
//! director's list"; without it the pinned servers are the whole list.

use perch_core::{Error, Result};
use url::Url;

/// A parsed preferred-server directive
#[derive(Debug, Clone, PartialEq)]
pub struct PreferredServers {
    /// Servers to try first, in the order given
    pub servers: Vec<Url>,
    /// Whether the director's list is appended after the pins
    pub append_rest: bool,
}

impl PreferredServers {
    /// Parse a list of entries; the `+` sentinel must come last.
    pub fn parse(entries: &[String]) -> Result<Option<Self>> {
        if entries.is_empty() {
            return Ok(None);
        }
        let mut servers = Vec::new();
        let mut append_rest = false;
        for (i, entry) in entries.iter().enumerate() {
            let entry = entry.trim();
            if entry == "+" {
                if i != entries.len() - 1 {
                    return Err(Error::BadUrl(
                        "the '+' entry must be the last preferred server".to_string(),
                    ));
                }
                append_rest = true;
                continue;
            }
            let url = Url::parse(entry)
                .map_err(|e| Error::BadUrl(format!("preferred server {entry}: {e}")))?;
            servers.push(url);
        }
        if servers.is_empty() {
            return Err(Error::BadUrl(
                "preferred servers list contains only '+'".to_string(),
            ));
        }
        Ok(Some(Self {
            servers,
            append_rest,
        }))
    }

    /// Merge the pinned servers with the director's candidate list.
    ///
    /// Pins come first; director-provided entries for the same host are
    /// dropped so a server is never tried twice.
    pub fn merge(&self, director_list: Vec<Url>) -> Vec<Url> {
        let mut merged = self.servers.clone();
        if self.append_rest {
            for candidate in director_list {
                let duplicate = merged.iter().any(|pinned| {
                    pinned.host_str() == candidate.host_str() && pinned.port() == candidate.port()
                });
                if !duplicate {
                    merged.push(candidate);
                }
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<Url> {
        list.iter().map(|u| Url::parse(u).unwrap()).collect()
    }

    #[test]
    fn test_empty_is_none() {
        assert_eq!(PreferredServers::parse(&[]).unwrap(), None);
    }

    #[test]
    fn test_plain_list_replaces() {
        let prefs = PreferredServers::parse(&[
            "https://c1.org".to_string(),
            "https://c2.org".to_string(),
        ])
        .unwrap()
        .unwrap();
        assert!(!prefs.append_rest);
        let merged = prefs.merge(urls(&["https://director-pick.org/f"]));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_plus_appends_rest() {
        let prefs = PreferredServers::parse(&[
            "https://c1.org".to_string(),
            "+".to_string(),
        ])
        .unwrap()
        .unwrap();
        assert!(prefs.append_rest);
        let merged = prefs.merge(urls(&["https://d1.org/f", "https://d2.org/f"]));
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].host_str(), Some("c1.org"));
    }

    #[test]
    fn test_merge_dedupes_by_host() {
        let prefs = PreferredServers::parse(&[
            "https://c1.org".to_string(),
            "+".to_string(),
        ])
        .unwrap()
        .unwrap();
        let merged = prefs.merge(urls(&["https://c1.org/f", "https://d1.org/f"]));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_plus_must_be_last() {
        let err = PreferredServers::parse(&[
            "+".to_string(),
            "https://c1.org".to_string(),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::BadUrl(_)));
    }

    #[test]
    fn test_only_plus_rejected() {
        assert!(PreferredServers::parse(&["+".to_string()]).is_err());
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(PreferredServers::parse(&["not a url".to_string()]).is_err());
    }
}
