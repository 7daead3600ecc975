//! Namespace lookups over an ad-store snapshot
//!
//! Namespaces are matched by longest path prefix with component
//! boundaries: `/foo` covers `/foo/bar` but not `/foobar`.

use perch_core::{NamespaceAd, ServerAd, ServerKind};

/// True if `path` lives under `prefix` (component-wise)
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Directory depth of `path` below `prefix`; errors mirror an exact
/// component mismatch.
pub fn link_depth(path: &str, prefix: &str) -> Option<usize> {
    if path.is_empty() || prefix.is_empty() {
        return None;
    }
    if !path_has_prefix(path, prefix) {
        return None;
    }
    let rest = path[prefix.trim_end_matches('/').len()..].trim_matches('/');
    if rest.is_empty() {
        Some(0)
    } else {
        Some(rest.split('/').count())
    }
}

/// The longest-prefix namespace advertisement matching an object path.
///
/// Ties at the same depth prefer a live (non-topology) advertisement.
pub fn longest_prefix_namespace(ads: &[ServerAd], object_path: &str) -> Option<NamespaceAd> {
    let mut best: Option<&NamespaceAd> = None;
    for ad in ads {
        for ns in &ad.namespaces {
            if !path_has_prefix(object_path, &ns.path) {
                continue;
            }
            best = match best {
                None => Some(ns),
                Some(current) => {
                    let (cur_len, new_len) = (
                        current.path.trim_end_matches('/').len(),
                        ns.path.trim_end_matches('/').len(),
                    );
                    if new_len > cur_len
                        || (new_len == cur_len && current.from_topology && !ns.from_topology)
                    {
                        Some(ns)
                    } else {
                        Some(current)
                    }
                }
            };
        }
    }
    best.cloned()
}

/// Servers of the given kind advertising a namespace that covers the
/// object path.
pub fn servers_for_object<'a>(
    ads: &'a [ServerAd],
    object_path: &str,
    kind: ServerKind,
) -> Vec<&'a ServerAd> {
    ads.iter()
        .filter(|ad| ad.kind == kind)
        .filter(|ad| {
            ad.namespaces
                .iter()
                .any(|ns| path_has_prefix(object_path, &ns.path))
        })
        .collect()
}

/// All namespaces exported by origins, deduplicated by path
pub fn namespaces_from_origins(ads: &[ServerAd]) -> Vec<NamespaceAd> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for ad in ads.iter().filter(|a| a.kind == ServerKind::Origin) {
        for ns in &ad.namespaces {
            if seen.insert(ns.path.clone()) {
                out.push(ns.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_core::{Capabilities, StorageKind};

    fn ad_with_ns(name: &str, kind: ServerKind, paths: &[&str]) -> ServerAd {
        ServerAd {
            name: name.to_string(),
            registry_prefix: format!("/{}/{name}", kind.registry_segment()),
            kind,
            data_url: format!("https://{name}.example.org"),
            web_url: format!("https://{name}.example.org"),
            broker_url: None,
            auth_url: None,
            storage_kind: StorageKind::Posix,
            capabilities: Capabilities::default(),
            namespaces: paths
                .iter()
                .map(|p| NamespaceAd {
                    path: p.to_string(),
                    capabilities: Capabilities::default(),
                    issuers: vec![],
                    token_generation: vec![],
                    from_topology: false,
                })
                .collect(),
            downtimes: vec![],
            disable_health_probe: false,
            from_topology: false,
            version: String::new(),
            expiration: None,
            ewma_load: 0.0,
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    #[test]
    fn test_path_has_prefix() {
        assert!(path_has_prefix("/foo/bar/baz.txt", "/foo/bar"));
        assert!(path_has_prefix("/foo/bar", "/foo/bar"));
        assert!(path_has_prefix("/foo/bar", "/foo/bar/"));
        assert!(path_has_prefix("/anything", "/"));
        assert!(!path_has_prefix("/foobar", "/foo"));
        assert!(!path_has_prefix("/foo", "/foo/bar"));
    }

    #[test]
    fn test_link_depth() {
        assert_eq!(link_depth("/foo/bar/barz.txt", "/foo/bar"), Some(1));
        assert_eq!(link_depth("/foo/bar/barz.txt", "/foo/bar/"), Some(1));
        assert_eq!(link_depth("/foo/bar/barz.txt", "/foo"), Some(2));
        assert_eq!(link_depth("/foo/bar/barz.txt", "/"), Some(3));
        assert_eq!(link_depth("/foo/bar", "/foo/bar"), Some(0));
        assert_eq!(link_depth("/foo/bar/barz.txt", "/bar"), None);
        assert_eq!(link_depth("", "/foo"), None);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let ads = vec![
            ad_with_ns("o1", ServerKind::Origin, &["/foo"]),
            ad_with_ns("o2", ServerKind::Origin, &["/foo/bar"]),
        ];
        let ns = longest_prefix_namespace(&ads, "/foo/bar/baz.txt").unwrap();
        assert_eq!(ns.path, "/foo/bar");
    }

    #[test]
    fn test_no_match() {
        let ads = vec![ad_with_ns("o1", ServerKind::Origin, &["/foo"])];
        assert!(longest_prefix_namespace(&ads, "/elsewhere/x").is_none());
    }

    #[test]
    fn test_live_preferred_over_topology_at_same_depth() {
        let mut topo = ad_with_ns("topo", ServerKind::Origin, &["/foo"]);
        topo.from_topology = true;
        topo.namespaces[0].from_topology = true;
        let live = ad_with_ns("live", ServerKind::Origin, &["/foo"]);
        let ns = longest_prefix_namespace(&[topo, live], "/foo/x").unwrap();
        assert!(!ns.from_topology);
    }

    #[test]
    fn test_servers_for_object_filters_kind() {
        let ads = vec![
            ad_with_ns("o1", ServerKind::Origin, &["/foo"]),
            ad_with_ns("c1", ServerKind::Cache, &["/foo"]),
            ad_with_ns("c2", ServerKind::Cache, &["/other"]),
        ];
        let caches = servers_for_object(&ads, "/foo/bar", ServerKind::Cache);
        assert_eq!(caches.len(), 1);
        assert_eq!(caches[0].name, "c1");
        let origins = servers_for_object(&ads, "/foo/bar", ServerKind::Origin);
        assert_eq!(origins.len(), 1);
    }

    #[test]
    fn test_namespaces_from_origins_dedup() {
        let ads = vec![
            ad_with_ns("o1", ServerKind::Origin, &["/foo", "/bar"]),
            ad_with_ns("o2", ServerKind::Origin, &["/foo"]),
            ad_with_ns("c1", ServerKind::Cache, &["/cached"]),
        ];
        let namespaces = namespaces_from_origins(&ads);
        let mut paths: Vec<_> = namespaces.iter().map(|n| n.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["/bar", "/foo"]);
    }
}
