//! Connection and pool settings shared by every provider.

use std::time::Duration;

/// Default socket connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default timeout for a single command round trip.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// How to open and initialise a connection to one node.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// Maximum time to establish the TCP connection.
    pub connect_timeout: Duration,
    /// Maximum time to wait for a reply. `None` waits forever.
    pub response_timeout: Option<Duration>,
    /// ACL user name sent with `AUTH`.
    pub username: Option<String>,
    /// Password sent with `AUTH`.
    pub password: Option<String>,
    /// Database selected after connecting.
    pub database: Option<u8>,
    /// Name registered with `CLIENT SETNAME`.
    pub client_name: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: Some(DEFAULT_RESPONSE_TIMEOUT),
            username: None,
            password: None,
            database: None,
            client_name: None,
        }
    }
}

impl ConnectionConfig {
    /// Sets the password (and optionally the ACL user).
    pub fn with_auth(mut self, username: Option<String>, password: impl Into<String>) -> Self {
        self.username = username;
        self.password = Some(password.into());
        self
    }

    /// Sets the database to select after connecting.
    pub fn with_database(mut self, database: u8) -> Self {
        self.database = Some(database);
        self
    }

    /// Sets the client name.
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the response timeout.
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }
}

/// Bounds for one node's connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections open at once, borrowed or idle.
    pub max_size: usize,
    /// How long a borrower waits for a free slot. `None` waits indefinitely.
    pub max_wait: Option<Duration>,
    /// Ping idle connections before handing them out.
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            max_wait: None,
            test_on_borrow: false,
        }
    }
}

impl PoolConfig {
    /// Sets the maximum pool size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the maximum borrow wait.
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Enables or disables ping-on-borrow.
    pub fn with_test_on_borrow(mut self, enabled: bool) -> Self {
        self.test_on_borrow = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_size, 8);
        assert!(config.max_wait.is_none());
        assert!(!config.test_on_borrow);
    }

    #[test]
    fn test_connection_config_chaining() {
        let config = ConnectionConfig::default()
            .with_auth(Some("app".into()), "secret")
            .with_database(2)
            .with_client_name("worker-1");
        assert_eq!(config.username.as_deref(), Some("app"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.database, Some(2));
        assert_eq!(config.client_name.as_deref(), Some("worker-1"));
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }
}
