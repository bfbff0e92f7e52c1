use std::{env, net::SocketAddr};

use netconsole_protocol::ProtocolConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// SQLite URL; sessions and accounts live in memory when unset.
    pub database_url: Option<String>,
    pub admin_user: String,
    pub admin_password: Option<String>,
    pub protocol: ProtocolConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind: env::var("NETCONSOLE_BIND")
                .ok()
                .and_then(|addr| addr.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080))),
            database_url: env::var("NETCONSOLE_DATABASE_URL").ok(),
            admin_user: env::var("NETCONSOLE_ADMIN_USER").unwrap_or_else(|_| "admin".into()),
            admin_password: env::var("NETCONSOLE_ADMIN_PASSWORD")
                .ok()
                .filter(|p| !p.is_empty()),
            protocol: ProtocolConfig::from_env(),
        }
    }
}
