//! Protocol configuration.

use std::env;

/// Default minutes of inactivity before a session expires.
pub const DEFAULT_SESSION_TIMEOUT_MINUTES: i64 = 60;

/// Default label for credential dialogs.
pub const DEFAULT_SITE_NAME: &str = "NetConsole";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Sessions idle for longer than this many minutes are invalid.
    pub session_timeout_minutes: i64,
    /// Site label shown in built-in credential dialogs.
    pub site_name: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            session_timeout_minutes: DEFAULT_SESSION_TIMEOUT_MINUTES,
            site_name: DEFAULT_SITE_NAME.to_string(),
        }
    }
}

impl ProtocolConfig {
    /// Read `NETCONSOLE_SESSION_TIMEOUT` and `NETCONSOLE_SITE_NAME`, falling
    /// back to the defaults for missing or unparsable values.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let session_timeout_minutes = env::var("NETCONSOLE_SESSION_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|minutes| *minutes > 0)
            .unwrap_or(defaults.session_timeout_minutes);
        let site_name = env::var("NETCONSOLE_SITE_NAME")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.site_name);

        Self {
            session_timeout_minutes,
            site_name,
        }
    }
}
