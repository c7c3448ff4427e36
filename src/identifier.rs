//! Request descriptors and rate limit identifier derivation.
//!
//! An identifier has the shape `address:path:fingerprint` where the
//! fingerprint is a truncated SHA-256 over a few client metadata headers.
//! Truncation to [`FINGERPRINT_HEX_LEN`] hex digits (32 bits) means two
//! callers behind the same address with different metadata collide with
//! probability about 2^-32 per pair. A collision only merges their quota.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

pub const UNKNOWN_CLIENT: &str = "unknown-client";
pub const UNKNOWN_PATH: &str = "unknown-path";

pub const MAX_ADDRESS_LEN: usize = 64;
pub const MAX_PATH_LEN: usize = 256;
pub const MAX_HEADER_VALUE_LEN: usize = 512;
pub const FINGERPRINT_HEX_LEN: usize = 8;

/// Headers that distinguish callers sharing an address.
pub const FINGERPRINT_HEADERS: [&str; 3] = ["user-agent", "accept-language", "accept-encoding"];

/// Normalized view of an inbound request, independent of the host protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestDescriptor {
    #[serde(default)]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub caller_address: String,
    /// Header names are expected in lower case.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl RequestDescriptor {
    pub fn new(method: &str, path: &str, caller_address: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            caller_address: caller_address.to_string(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }
}

/// Opaque per-caller, per-path bucket key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestIdentifier(String);

impl RequestIdentifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build the identifier for a caller. Never fails; unusable inputs are
/// replaced by [`UNKNOWN_CLIENT`] / [`UNKNOWN_PATH`].
pub fn derive_identifier(
    caller_address: &str,
    path: &str,
    metadata: &HashMap<String, String>,
) -> RequestIdentifier {
    let address = sanitize_address(caller_address).unwrap_or_else(|| UNKNOWN_CLIENT.to_string());
    let path = canonicalize_path(path).unwrap_or_else(|| UNKNOWN_PATH.to_string());
    let fingerprint = fingerprint(metadata);

    RequestIdentifier(format!("{}:{}:{}", address, path, fingerprint))
}

/// Strip query string and fragment, bound the length and replace characters
/// that have no business in a key. Returns `None` for anything that is not
/// an absolute path.
pub fn canonicalize_path(path: &str) -> Option<String> {
    let path = path.trim();
    let end = path.find(|c| c == '?' || c == '#').unwrap_or(path.len());
    let path = &path[..end];

    if !path.starts_with('/') {
        return None;
    }

    let canonical: String = path
        .chars()
        .take(MAX_PATH_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '~' | '%' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();

    Some(canonical)
}

/// Parse the caller address as an IP (optionally with a port) and return its
/// canonical text form.
pub fn sanitize_address(address: &str) -> Option<String> {
    let address = address.trim();
    if address.is_empty() || address.len() > MAX_ADDRESS_LEN {
        return None;
    }

    if let Ok(ip) = address.parse::<IpAddr>() {
        return Some(ip.to_string());
    }
    address
        .parse::<SocketAddr>()
        .ok()
        .map(|socket| socket.ip().to_string())
}

/// Truncated SHA-256 of the fingerprint headers. Missing headers hash as
/// empty values, so a caller sending none still gets a stable fingerprint.
pub fn fingerprint(metadata: &HashMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for name in FINGERPRINT_HEADERS {
        let value = metadata.get(name).map(String::as_str).unwrap_or("");
        let bounded: String = value.chars().take(MAX_HEADER_VALUE_LEN).collect();
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(bounded.as_bytes());
        hasher.update(b"\n");
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..FINGERPRINT_HEX_LEN].to_string()
}

/// Client IP as reported by proxies, if any.
pub fn extract_client_ip(headers: &HashMap<String, String>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|xff| xff.split(',').next().map(|ip| ip.trim().to_string()))
        .or_else(|| headers.get("x-real-ip").map(|ip| ip.trim().to_string()))
        .or_else(|| headers.get("cf-connecting-ip").map(|ip| ip.trim().to_string()))
        .filter(|ip| !ip.is_empty())
}
