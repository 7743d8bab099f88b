use url::Url;

use crate::ChannelError;

/// Derives the socket address of a chat server from its HTTP endpoint.
///
/// `https` maps to `wss`, anything else to `ws`; standard ports are elided.
pub fn websocket_endpoint(endpoint: &str) -> Result<String, ChannelError> {
    let url = Url::parse(endpoint.trim())
        .map_err(|err| ChannelError::InvalidEndpoint(format!("{endpoint}: {err}")))?;
    let secure = matches!(url.scheme(), "https" | "wss");
    let host = url
        .host_str()
        .ok_or_else(|| ChannelError::InvalidEndpoint(format!("{endpoint}: missing host")))?;
    let scheme = if secure { "wss" } else { "ws" };

    let port = url.port_or_known_default().unwrap_or(if secure { 443 } else { 80 });
    if port == 80 || port == 443 {
        Ok(format!("{scheme}://{host}/ws"))
    } else {
        Ok(format!("{scheme}://{host}:{port}/ws"))
    }
}
