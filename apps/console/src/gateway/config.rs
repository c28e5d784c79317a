use std::time::Duration;

pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Role declared during the authorize handshake. Robot-role clients only
/// publish; operator/service clients subscribe and dispatch commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayRole {
    Robot,
    Operator,
}

impl GatewayRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayRole::Robot => "robot",
            GatewayRole::Operator => "operator",
        }
    }
}

/// Configuration for one gateway connection.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// The relay URL or bare host:port.
    pub url: String,
    /// Authorization realm presented in the handshake.
    pub realm: String,
    pub role: GatewayRole,
    /// How long to wait for the authorize response.
    pub auth_timeout: Duration,
}

impl GatewayConfig {
    pub fn new(url: impl Into<String>, realm: impl Into<String>, role: GatewayRole) -> Self {
        Self {
            url: url.into(),
            realm: realm.into(),
            role,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Build the full WebSocket URL.
    pub fn build_url(&self) -> String {
        let mut url = self.url.clone();
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            let use_tls = !url.contains("127.0.0.1") && !url.contains("localhost");
            url = if use_tls {
                format!("wss://{url}")
            } else {
                format!("ws://{url}")
            };
        }
        // Normalize localhost to avoid IPv6 issues
        if url.contains("localhost") {
            url = url.replace("localhost", "127.0.0.1");
        }
        url
    }
}
