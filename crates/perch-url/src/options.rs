//! Recognized federation URL query options

use perch_core::{Error, Result};

/// Client-side unpacking hint carried by `pack=`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackMode {
    /// Choose the format from the object name
    Auto,
    /// Plain tar
    Tar,
    /// Gzip-compressed tar
    TarGz,
    /// Xz-compressed tar
    TarXz,
    /// Zip archive
    Zip,
}

impl PackMode {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "auto" | "" => Ok(Self::Auto),
            "tar" => Ok(Self::Tar),
            "tar.gz" => Ok(Self::TarGz),
            "tar.xz" => Ok(Self::TarXz),
            "zip" => Ok(Self::Zip),
            other => Err(Error::BadUrl(format!("invalid pack value: {other}"))),
        }
    }
}

/// The enumerated query options a federation URL may carry.
///
/// `directread` and `prefercached` are mutually exclusive: one demands
/// the origin, the other demands a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Bypass caches and read the origin directly
    pub direct_read: bool,

    /// Require the cache path; fail rather than fall back to the origin
    pub prefer_cached: bool,

    /// Unpack the object client-side after transfer
    pub pack: Option<PackMode>,

    /// Transfer a directory tree rather than a single object
    pub recursive: bool,

    /// Skip the director's object-presence check
    pub skip_stat: bool,
}

impl QueryOptions {
    /// Parse a raw query string.
    ///
    /// Unknown keys are an error under strict validation; with
    /// `tolerate_unknown` they are logged and dropped so older clients
    /// keep working against newer directors.
    pub fn parse(query: &str, tolerate_unknown: bool) -> Result<Self> {
        let mut opts = Self::default();
        if query.is_empty() {
            return Ok(opts);
        }
        for pair in query.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => (pair, ""),
            };
            match key {
                "directread" => opts.direct_read = true,
                "prefercached" => opts.prefer_cached = true,
                "pack" => opts.pack = Some(PackMode::parse(value)?),
                "recursive" => opts.recursive = true,
                "skipstat" => opts.skip_stat = true,
                unknown => {
                    if tolerate_unknown {
                        crate::note_unknown_query(unknown);
                    } else {
                        return Err(Error::UnknownQuery(unknown.to_string()));
                    }
                }
            }
        }
        if opts.direct_read && opts.prefer_cached {
            return Err(Error::BadUrl(
                "cannot require both directread and prefercached".to_string(),
            ));
        }
        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_query() {
        let opts = QueryOptions::parse("", false).unwrap();
        assert_eq!(opts, QueryOptions::default());
    }

    #[test]
    fn test_all_known_options() {
        let opts = QueryOptions::parse("directread&pack=tar.gz&recursive&skipstat", false).unwrap();
        assert!(opts.direct_read);
        assert!(!opts.prefer_cached);
        assert_eq!(opts.pack, Some(PackMode::TarGz));
        assert!(opts.recursive);
        assert!(opts.skip_stat);
    }

    #[test]
    fn test_pack_values() {
        assert_eq!(
            QueryOptions::parse("pack=auto", false).unwrap().pack,
            Some(PackMode::Auto)
        );
        assert_eq!(
            QueryOptions::parse("pack=zip", false).unwrap().pack,
            Some(PackMode::Zip)
        );
        assert!(QueryOptions::parse("pack=rar", false).is_err());
    }

    #[test]
    fn test_exclusive_pair() {
        let err = QueryOptions::parse("prefercached&directread", false).unwrap_err();
        assert!(matches!(err, Error::BadUrl(_)));
    }

    #[test]
    fn test_unknown_key() {
        assert!(matches!(
            QueryOptions::parse("bogus=1", false),
            Err(Error::UnknownQuery(_))
        ));
        assert!(QueryOptions::parse("bogus=1", true).is_ok());
    }
}
