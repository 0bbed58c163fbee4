// ── Runtime connection configuration ──
//
// Describes how to reach the controller. The binary's file loader builds
// one of these and hands it in; core never reads config files.

use secrecy::SecretString;

/// Configuration for connecting to a single controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

impl ControllerConfig {
    /// `host:port`, as dialled by both the HTTP bootstrap and the
    /// WebSocket transport.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_joins_host_and_port() {
        let config = ControllerConfig {
            host: "192.168.1.77".into(),
            port: 8080,
            username: "admin".into(),
            password: SecretString::from("pw".to_string()),
        };
        assert_eq!(config.address(), "192.168.1.77:8080");
    }
}
