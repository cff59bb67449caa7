// Header pipeline: client-IP resolution and upstream header construction.
//
// Pure functions over HeaderMap. The trust decision is transport-based: a
// peer's forwarding headers are only believed when the peer address itself
// sits inside a trusted CIDR. Header values never influence the trust
// decision.

use std::net::IpAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::config::RelayConfig;

/// RFC 7230 hop-by-hop headers, never forwarded in either direction.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Resolve the IP attributed to the originating client.
///
/// Honors `Forwarded` (RFC 7239), then `X-Forwarded-For`, then `X-Real-IP`,
/// but only when the transport peer is inside a trusted network. A header
/// value that does not parse as an IP address falls through to the next
/// source.
pub fn resolve_client_ip(peer: IpAddr, headers: &HeaderMap, cfg: &RelayConfig) -> IpAddr {
    if !cfg.trust_proxy_headers {
        return peer;
    }
    if !cfg.is_trusted_peer(peer) {
        tracing::debug!(%peer, "peer outside trusted networks; ignoring forwarding headers");
        return peer;
    }

    if let Some(value) = header_str(headers, "forwarded") {
        if let Some(ip) = parse_forwarded(value).and_then(|s| s.parse().ok()) {
            return ip;
        }
    }
    if let Some(value) = header_str(headers, "x-forwarded-for") {
        if let Some(ip) = leftmost_forwarded_for(value).and_then(|s| s.parse().ok()) {
            return ip;
        }
    }
    if let Some(value) = header_str(headers, "x-real-ip") {
        if let Ok(ip) = value.trim().parse() {
            return ip;
        }
    }

    peer
}

/// Extract the leftmost `for=` node from an RFC 7239 `Forwarded` value,
/// stripping quoting, IPv6 brackets, and any port.
pub fn parse_forwarded(value: &str) -> Option<String> {
    for part in value.split([';', ',']) {
        let part = part.trim();
        let matches_for = part
            .get(..4)
            .is_some_and(|p| p.eq_ignore_ascii_case("for="));
        if !matches_for {
            continue;
        }
        let mut node = part[4..].trim().trim_matches('"').trim_matches('\'');
        if let Some(rest) = node.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                return Some(rest[..end].to_string());
            }
        }
        // IPv4 with port: keep only the address.
        if node.matches(':').count() == 1 {
            node = node.split(':').next().unwrap_or(node);
        }
        if node.is_empty() {
            return None;
        }
        return Some(node.to_string());
    }
    None
}

/// Leftmost (most original) entry of an `X-Forwarded-For` chain.
pub fn leftmost_forwarded_for(value: &str) -> Option<String> {
    value
        .split(',')
        .next()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Construct the header set for the upstream request.
///
/// Hop-by-hop headers, `Host`, and `Content-Length` are dropped (the HTTP
/// client re-derives the latter two). The `X-Forwarded-For` chain grows by
/// the transport peer; `Forwarded` and `X-Real-IP` carry the resolved client
/// IP. `X-Forwarded-Proto` / `-Host` / `-Port` are filled in only when the
/// inbound request did not already carry them.
pub fn build_upstream_headers(
    inbound: &HeaderMap,
    peer: IpAddr,
    client_ip: IpAddr,
    scheme: &str,
    host: &str,
) -> HeaderMap {
    let connection_named = connection_header_names(inbound);

    let mut out = HeaderMap::new();
    for (name, value) in inbound {
        let lower = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&lower)
            || lower == "host"
            || lower == "content-length"
            || connection_named.iter().any(|n| n == lower)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    let peer_str = peer.to_string();
    let client_str = client_ip.to_string();

    let xff = match header_str(&out, "x-forwarded-for").map(str::trim).filter(|s| !s.is_empty()) {
        Some(existing) => format!("{existing}, {peer_str}"),
        None => peer_str.clone(),
    };
    set_header(&mut out, "x-forwarded-for", &xff);

    let for_node = match client_ip {
        IpAddr::V4(_) => format!("\"{client_str}\""),
        IpAddr::V6(_) => format!("\"[{client_str}]\""),
    };
    let element = format!("for={for_node};proto={scheme};host={host}");
    let forwarded = match header_str(&out, "forwarded").map(str::trim).filter(|s| !s.is_empty()) {
        Some(existing) => format!("{existing}, {element}"),
        None => element,
    };
    set_header(&mut out, "forwarded", &forwarded);

    set_header(&mut out, "x-real-ip", &client_str);

    if !out.contains_key("x-forwarded-proto") {
        set_header(&mut out, "x-forwarded-proto", scheme);
    }
    if !out.contains_key("x-forwarded-host") {
        set_header(&mut out, "x-forwarded-host", host);
    }
    if !out.contains_key("x-forwarded-port") {
        set_header(&mut out, "x-forwarded-port", &port_of(host, scheme));
    }

    out
}

/// Drop hop-by-hop headers from an upstream response before relaying it.
pub fn filter_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Header names listed in the inbound `Connection` header (these are
/// hop-by-hop by declaration, per RFC 7230 §6.1).
fn connection_header_names(headers: &HeaderMap) -> Vec<String> {
    header_str(headers, "connection")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Port advertised in `X-Forwarded-Port`: taken from the host when explicit,
/// otherwise the scheme default.
fn port_of(host: &str, scheme: &str) -> String {
    if let Some(idx) = host.rfind(':') {
        let candidate = &host[idx + 1..];
        if !candidate.is_empty() && candidate.bytes().all(|b| b.is_ascii_digit()) {
            return candidate.to_string();
        }
    }
    if scheme == "https" { "443" } else { "80" }.to_string()
}
