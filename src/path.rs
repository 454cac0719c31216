use serde::{Deserialize, Serialize};
use url::Url;

/// Snapshot of the addressable parts of a location, in the shape scripts and
/// `urlchange` payloads expect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub hash: String,
    pub host: String,
    pub hostname: String,
    pub href: String,
    pub origin: String,
    pub pathname: String,
    pub protocol: String,
    pub search: String,
}

/// Derive a [`LocationInfo`] from an absolute URL. Unparseable input yields a
/// record carrying only `href`, so callers never have to handle an error for
/// a field-by-field read.
pub fn host_location(href: &str) -> LocationInfo {
    let Ok(url) = Url::parse(href) else {
        return LocationInfo {
            href: href.to_string(),
            ..LocationInfo::default()
        };
    };

    let hostname = url.host_str().unwrap_or("").to_string();
    let host = match url.port() {
        Some(port) => format!("{hostname}:{port}"),
        None => hostname.clone(),
    };

    LocationInfo {
        hash: url.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
        host,
        hostname,
        href: url.as_str().to_string(),
        origin: url.origin().ascii_serialization(),
        pathname: url.path().to_string(),
        protocol: format!("{}:", url.scheme()),
        search: url.query().map(|q| format!("?{q}")).unwrap_or_default(),
    }
}

/// True when `reference` carries an explicit scheme (`https://`, `file://`, ...).
pub fn has_scheme(reference: &str) -> bool {
    let Some(sep) = reference.find("://") else {
        return false;
    };
    if sep == 0 {
        return false;
    }
    reference[..sep]
        .bytes()
        .enumerate()
        .all(|(i, b)| b.is_ascii_lowercase() || (i > 0 && (b.is_ascii_digit() || b == b'+' || b == b'-' || b == b'.')))
}

/// Whether a reference points inside the given origin (`scheme://host[:port]`).
/// Protocol-relative references compare against the origin's host; bare paths
/// are always internal.
pub fn is_internal_link(reference: &str, origin: &str) -> bool {
    if let Some(rest) = reference.strip_prefix("//") {
        let host = origin.split_once("://").map(|(_, h)| h).unwrap_or(origin);
        return rest == host || rest.starts_with(&format!("{host}/"));
    }
    if has_scheme(reference) {
        return reference.starts_with(origin);
    }
    true
}

/// Resolve `reference` against `base`, honoring an optional deployment-root
/// prefix. Pure string manipulation, never touches the network.
pub fn resolve_path(base: &str, reference: &str, abs_root: Option<&str>) -> String {
    if reference.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return reference.to_string();
    }

    if has_scheme(reference) {
        // Fully-qualified references pass through untouched, except when they
        // point back into our own origin and a deployment root is configured:
        // those get folded under the root so the page keeps working when
        // served from a sub-path.
        if let Some(root) = abs_root {
            if let Ok(base_url) = Url::parse(base) {
                let origin = base_url.origin().ascii_serialization();
                if reference == origin {
                    return root.to_string();
                }
                if let Some(tail) = reference.strip_prefix(&format!("{origin}/")) {
                    return format!("{root}/{tail}");
                }
            }
        }
        return reference.to_string();
    }

    if reference.starts_with("//") {
        return reference.to_string();
    }

    if let Some(rest) = reference.strip_prefix('/') {
        return match abs_root {
            Some(root) => format!("{root}/{rest}"),
            None => reference.to_string(),
        };
    }

    if matches!(reference.as_bytes()[0], b'?' | b'&' | b'#') {
        return format!("{base}{reference}");
    }

    // Everything else resolves against the directory of `base`. A last
    // segment without a dot is itself treated as a directory.
    let dir = if let Some(stripped) = base.strip_suffix('/') {
        stripped.to_string()
    } else {
        let (head, tail) = base.rsplit_once('/').unwrap_or(("", base));
        if tail.contains('.') {
            head.to_string()
        } else {
            base.to_string()
        }
    };

    let mut roots: Vec<&str> = dir.split('/').collect();
    let mut blocks: Vec<&str> = reference.split('/').collect();
    while let Some(&block) = blocks.first() {
        match block {
            ".." => {
                blocks.remove(0);
                // Never pop past the first segment; excess `..` references
                // are consumed at the boundary.
                if roots.len() > 1 {
                    roots.pop();
                }
            }
            "." => {
                blocks.remove(0);
            }
            _ => break,
        }
    }

    format!("{}/{}", roots.join("/"), blocks.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_reference_returns_base() {
        assert_eq!(resolve_path("/x/y/z.html", "", None), "/x/y/z.html");
    }

    #[test]
    fn empty_base_returns_reference() {
        assert_eq!(resolve_path("", "a/b.css", None), "a/b.css");
    }

    #[test]
    fn absolute_reference_gets_root_prefix() {
        assert_eq!(
            resolve_path("/x/y/", "/assets/app.js", Some("/deploy")),
            "/deploy/assets/app.js"
        );
        assert_eq!(resolve_path("/x/y/", "/assets/app.js", None), "/assets/app.js");
    }

    #[test]
    fn protocol_relative_passes_through() {
        assert_eq!(
            resolve_path("/x/y/", "//cdn.example.com/lib.js", Some("/deploy")),
            "//cdn.example.com/lib.js"
        );
    }

    #[test]
    fn query_and_hash_append_to_base() {
        assert_eq!(resolve_path("/x/y.html", "?a=1", None), "/x/y.html?a=1");
        assert_eq!(resolve_path("/x/y.html", "#frag", None), "/x/y.html#frag");
        assert_eq!(resolve_path("/x/y.html", "&b=2", None), "/x/y.html&b=2");
    }

    #[test]
    fn relative_reference_resolves_against_directory() {
        assert_eq!(resolve_path("/x/y/", "a/b/c.html", None), "/x/y/a/b/c.html");
        assert_eq!(resolve_path("/x/y/z.html", "../d.html", None), "/x/d.html");
        assert_eq!(resolve_path("/x/y/z.html", "./d.html", None), "/x/y/d.html");
    }

    #[test]
    fn directory_like_tail_is_kept() {
        // `y` has no dot, so it is a directory, not a file to strip.
        assert_eq!(resolve_path("/x/y", "d.html", None), "/x/y/d.html");
    }

    #[test]
    fn parent_segments_never_underflow() {
        // Boundary condition: excess `..` segments are consumed without
        // popping past the first segment.
        assert_eq!(
            resolve_path("/x/y/z.html", "../../../../d.html", None),
            "/d.html"
        );
    }

    #[test]
    fn same_origin_absolute_url_is_rescoped_under_root() {
        assert_eq!(
            resolve_path(
                "https://example.com/app/index.html",
                "https://example.com/lib/a.js",
                Some("/deploy")
            ),
            "/deploy/lib/a.js"
        );
        assert_eq!(
            resolve_path(
                "https://example.com/app/index.html",
                "https://other.com/lib/a.js",
                Some("/deploy")
            ),
            "https://other.com/lib/a.js"
        );
    }

    #[test]
    fn internal_link_classification() {
        assert!(is_internal_link("/a/b.css", "https://example.com"));
        assert!(is_internal_link("a/b.css", "https://example.com"));
        assert!(is_internal_link(
            "https://example.com/a.js",
            "https://example.com"
        ));
        assert!(!is_internal_link(
            "https://cdn.other.com/a.js",
            "https://example.com"
        ));
        assert!(is_internal_link("//example.com/a.js", "https://example.com"));
        assert!(!is_internal_link("//cdn.other.com/a.js", "https://example.com"));
    }

    #[test]
    fn location_record_from_href() {
        let info = host_location("https://example.com:8080/app/page.html?q=1#top");
        assert_eq!(info.protocol, "https:");
        assert_eq!(info.host, "example.com:8080");
        assert_eq!(info.hostname, "example.com");
        assert_eq!(info.origin, "https://example.com:8080");
        assert_eq!(info.pathname, "/app/page.html");
        assert_eq!(info.search, "?q=1");
        assert_eq!(info.hash, "#top");
    }
}
