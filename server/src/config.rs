//! Server options.

use serde::Deserialize;

use crate::error::ServerError;

/// Options accepted by [`TcpServer::init`](crate::TcpServer::init).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerOptions {
    /// Hard cap on simultaneously live connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Seconds of inactivity after which a connection is evicted.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connection_timeout_secs: default_connection_timeout(),
        }
    }
}

fn default_max_connections() -> u32 {
    10_000
}

fn default_connection_timeout() -> u64 {
    60
}

impl ServerOptions {
    /// Validate the options.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_connections == 0 {
            return Err(ServerError::Options(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.connection_timeout_secs == 0 {
            return Err(ServerError::Options(
                "connection_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let options: ServerOptions = toml::from_str("").unwrap();
        assert_eq!(options.max_connections, 10_000);
        assert_eq!(options.connection_timeout_secs, 60);
        options.validate().unwrap();
    }

    #[test]
    fn explicit_values_parse() {
        let options: ServerOptions = toml::from_str(
            r#"
            max_connections = 128
            connection_timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(options.max_connections, 128);
        assert_eq!(options.connection_timeout_secs, 5);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<ServerOptions, _> = toml::from_str("max_conections = 1");
        assert!(result.is_err());
    }

    #[test]
    fn zero_values_fail_validation() {
        let options = ServerOptions {
            max_connections: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = ServerOptions {
            connection_timeout_secs: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
