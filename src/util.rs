//! Small helpers shared across modules.

/// Normalize the configured server address into an HTTP base URL.
///
/// - `"http://host:5000/"` → `"http://host:5000"`
/// - `"host:5000"` → `"https://host:5000"`
/// - Any other scheme is rejected.
pub fn http_base_url(server: &str) -> Result<String, String> {
    let server = server.trim().trim_end_matches('/');
    match split_scheme(server) {
        (Some("http" | "https"), _) => Ok(server.to_string()),
        (Some(other), _) => Err(format!("server URL has invalid scheme: {other}")),
        (None, rest) => Ok(format!("https://{rest}")),
    }
}

/// Map the configured server address onto the matching WebSocket scheme.
///
/// - `"http://host"` → `"ws://host"`
/// - `"https://host"` → `"wss://host"`
/// - `"host"` → `"wss://host"`
pub fn ws_base_url(server: &str) -> Result<String, String> {
    let server = server.trim().trim_end_matches('/');
    match split_scheme(server) {
        (Some("http"), rest) => Ok(format!("ws://{rest}")),
        (Some("https") | None, rest) => Ok(format!("wss://{rest}")),
        (Some(other), _) => Err(format!("server URL has invalid scheme: {other}")),
    }
}

fn split_scheme(url: &str) -> (Option<&str>, &str) {
    match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, url),
    }
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
