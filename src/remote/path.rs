//! Tunnel addressing
//!
//! Clients address tunnels as `/remote/{connectionId}/{sessionId}/{subpath}`
//! and scope primary traffic to a connection with a `remoteId` cookie.

use std::sync::LazyLock;

use regex::Regex;

/// Cookie carrying the active connection id
pub const REMOTE_ID_COOKIE: &str = "remoteId";

static REMOTE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/remote/([^/]+)/([^/]+)(/.*)?$").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePath {
    pub connection_id: String,
    pub session_id: String,
    /// Remainder including the leading `/`, or `/` when absent
    pub subpath: String,
}

/// Parse a multiplexed tunnel path
pub fn parse_remote_path(path: &str) -> Option<RemotePath> {
    let captures = REMOTE_PATH.captures(path)?;
    Some(RemotePath {
        connection_id: captures.get(1)?.as_str().to_string(),
        session_id: captures.get(2)?.as_str().to_string(),
        subpath: captures
            .get(3)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
    })
}

/// Extract `remoteId` from a `Cookie` header value
pub fn remote_id_from_cookies(header: &str) -> Option<String> {
    header
        .split("; ")
        .filter_map(|cookie| cookie.split_once('='))
        .find(|(name, _)| name.trim() == REMOTE_ID_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// `Set-Cookie` value for a connection id
pub fn remote_id_cookie(connection_id: &str) -> String {
    format!("{}={}; Path=/; SameSite=Strict", REMOTE_ID_COOKIE, connection_id)
}
