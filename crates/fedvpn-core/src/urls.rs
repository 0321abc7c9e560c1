//! Canonical server-URL rules.
//!
//! User-entered and discovery base URLs are normalized to a single shape so
//! they can serve as map keys: `https` scheme, lowercased host, cleaned
//! path with a trailing slash, no query or fragment.

use crate::error::{CoreResult, Error};
use url::Url;

/// Canonicalize a server base URL.
///
/// Inputs without a scheme get `https://` prepended; inputs with another
/// scheme are upgraded to `https://`. Explicit `http://` survives only for
/// loopback hosts (local development portals). The path keeps its
/// percent-encoding, loses empty segments, and always ends in `/`.
pub fn canonicalize_url(input: &str) -> CoreResult<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_url(input, "empty URL"));
    }

    let (explicit_http, with_scheme) = match trimmed.split_once("://") {
        Some((scheme, rest)) => (scheme == "http", format!("https://{rest}")),
        None => (false, format!("https://{trimmed}")),
    };

    let mut url = Url::parse(&with_scheme)
        .map_err(|e| Error::invalid_url(input, format!("could not parse '{trimmed}': {e}")))?;

    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(Error::invalid_url(input, "URL has no host"));
    }

    if explicit_http && is_loopback_host(&url) {
        let _ = url.set_scheme("http");
    }

    let cleaned = clean_path(url.path());
    url.set_path(&cleaned);
    url.set_query(None);
    url.set_fragment(None);

    Ok(url.to_string())
}

fn is_loopback_host(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}

/// Collapse empty segments and guarantee a trailing slash.
fn clean_path(path: &str) -> String {
    let mut cleaned = String::from("/");
    for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
        cleaned.push_str(segment);
        cleaned.push('/');
    }
    cleaned
}

/// Whether two URLs share scheme, host, and port.
pub fn same_origin(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => {
            a.scheme() == b.scheme()
                && a.host_str() == b.host_str()
                && a.port_or_known_default() == b.port_or_known_default()
        }
        _ => false,
    }
}

/// Join a path onto a canonical base URL.
pub fn join_url(base: &str, path: &str) -> CoreResult<String> {
    let base = Url::parse(base).map_err(|e| Error::invalid_url(base, e.to_string()))?;
    let joined = base
        .join(path.trim_start_matches('/'))
        .map_err(|e| Error::invalid_url(path, e.to_string()))?;
    Ok(joined.to_string())
}
