// src/proxy/headers.rs
//! Header relay helpers shared by the request and response paths.

use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use std::net::{IpAddr, SocketAddr};

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";
pub const X_REQUEST_ID: &str = "x-request-id";

// Connection-scoped headers that must not be relayed by a proxy.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy every end-to-end header, keeping repeated values.
pub fn copy_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for (name, value) in src.iter() {
        if !is_hop_by_hop(name) {
            dst.append(name.clone(), value.clone());
        }
    }
}

/// Headers for the outbound request: everything end-to-end except `Host`,
/// which the client derives from the backend URI.
pub fn outbound_request_headers(src: &HeaderMap) -> HeaderMap {
    let mut dst = HeaderMap::with_capacity(src.len() + 2);
    copy_headers(src, &mut dst);
    dst.remove(HOST);
    dst
}

/// Add the immediate peer to `X-Forwarded-For`, extending an existing chain.
///
/// The existing value is extended as raw bytes, so a chain that is not
/// valid UTF-8 is kept rather than replaced.
pub fn append_forwarded_for(headers: &mut HeaderMap, peer: IpAddr) {
    let peer = peer.to_string();
    let mut chain = match headers.get(X_FORWARDED_FOR) {
        Some(existing) if !existing.as_bytes().iter().all(u8::is_ascii_whitespace) => {
            let mut chain = existing.as_bytes().to_vec();
            chain.extend_from_slice(b", ");
            chain
        }
        _ => Vec::with_capacity(peer.len()),
    };
    chain.extend_from_slice(peer.as_bytes());

    if let Ok(value) = HeaderValue::from_bytes(&chain) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Originating client address: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }

    let real_ip = headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return Some(ip.to_string());
    }

    peer.map(|p| p.ip().to_string())
}
