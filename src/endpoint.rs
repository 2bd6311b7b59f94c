//! Endpoint constants shared by the client and the server

/// Path the WebSocket endpoint is served on
pub const SOCKET_PATH: &str = "/ws";

/// Default address the server binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port the server listens on
pub const DEFAULT_PORT: u16 = 4000;

/// URL of the WebSocket endpoint on `host` (`host` may include a port)
pub fn socket_url(host: &str) -> String {
    format!("ws://{}{}", host, SOCKET_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_url() {
        assert_eq!(socket_url("127.0.0.1:4000"), "ws://127.0.0.1:4000/ws");
        assert_eq!(socket_url("example.com"), "ws://example.com/ws");
    }
}
