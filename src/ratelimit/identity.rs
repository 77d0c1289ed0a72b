//! Client identity resolution.

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, HeaderName, Request};
use std::net::SocketAddr;

/// Header carrying the client's API credential.
pub const API_KEY_HEADER: HeaderName = HeaderName::from_static("api_key");

/// Identity used when the transport supplies no peer address.
const UNKNOWN_PEER: &str = "unknown";

/// Where a client identity was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySource {
    /// The `API_KEY` request header
    ApiKey,
    /// The connection's remote address
    RemoteAddr,
}

/// The identity a request is counted under.
///
/// Requests carrying a non-empty `API_KEY` header are grouped by that value;
/// everything else is grouped by the peer's IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub source: KeySource,
    pub value: String,
}

impl ClientKey {
    /// Derive the identity from request headers and the peer address.
    pub fn resolve(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> Self {
        if let Some(api_key) = headers.get(&API_KEY_HEADER) {
            if !api_key.is_empty() {
                return Self {
                    source: KeySource::ApiKey,
                    value: String::from_utf8_lossy(api_key.as_bytes()).into_owned(),
                };
            }
        }

        let value = remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_PEER.to_string());

        Self {
            source: KeySource::RemoteAddr,
            value,
        }
    }

    /// Derive the identity of an incoming request.
    ///
    /// The peer address is read from the [`ConnectInfo`] extension axum
    /// attaches when serving with connect info enabled.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Self::resolve(request.headers(), remote_addr)
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}
