//! Capability traits shared by the console controller and server logic.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shared handle to the display surface of one operation.
pub type Display = Arc<dyn DisplayClient>;

/// Shared handle to a pluggable server.
pub type Server = Arc<dyn ServerSession>;

/// Display capability error.
///
/// Every variant is a contract violation by the calling server: the call was
/// made outside the window in which the capability is valid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisplayError {
    #[error("operation already completed")]
    Completed,
    #[error("display is not the live instance of the current operation")]
    NotLive,
    #[error("a login dialog owns the display")]
    LoginActive,
    #[error("a login dialog is already open")]
    LoginAlreadyOpen,
}

/// User name and password entered into a login dialog.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How a login dialog was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// The user entered credentials and confirmed.
    Submitted(Credentials),
    /// The user dismissed the dialog.
    Cancelled,
}

/// Output surface handed to a server for the duration of one operation.
///
/// An instance is live from the start of its operation until its
/// [`complete`](DisplayClient::complete) call; afterwards every method fails
/// with [`DisplayError::Completed`].
#[async_trait]
pub trait DisplayClient: Send + Sync {
    /// Whether the user asked the current operation to stop.
    ///
    /// # Errors
    /// Fails unless called on the live instance outside a login dialog.
    fn check_stop(&self) -> Result<bool, DisplayError>;

    /// Replace the active server once this operation completes.
    ///
    /// The last call before [`complete`](DisplayClient::complete) wins.
    ///
    /// # Errors
    /// Fails unless called on the live instance outside a login dialog.
    fn update_server(&self, server: Server) -> Result<(), DisplayError>;

    /// Open a credential dialog labelled with `site` and wait for the user.
    ///
    /// # Errors
    /// Fails if the operation is not live or a dialog is already open.
    async fn show_login(&self, site: &str) -> Result<LoginOutcome, DisplayError>;

    /// Clear the console.
    ///
    /// # Errors
    /// Fails unless called on the live instance outside a login dialog.
    fn cls(&self) -> Result<(), DisplayError>;

    /// Print text. Line breaks in `text` render as line breaks.
    ///
    /// # Errors
    /// Fails unless called on the live instance outside a login dialog.
    fn print(&self, text: &str) -> Result<(), DisplayError>;

    /// Offer `text` as a copy-to-clipboard affordance without displaying it.
    ///
    /// # Errors
    /// Fails unless called on the live instance outside a login dialog.
    fn token(&self, text: &str) -> Result<(), DisplayError>;

    /// Finish the operation. Must be called exactly once.
    ///
    /// # Errors
    /// Fails if already completed or a login dialog is open.
    fn complete(&self) -> Result<(), DisplayError>;
}

/// Pluggable server logic driven by the console controller.
///
/// Both handlers may return before calling `display.complete()`; the
/// operation stays outstanding until they do. An `Err` is a contract
/// violation and is reported as a fault on the console.
#[async_trait]
pub trait ServerSession: Send + Sync {
    /// Run the start-up sequence for a newly activated server.
    async fn handle_init(&self, display: Display) -> Result<(), DisplayError>;

    /// Handle one line of user input.
    async fn handle_message(&self, display: Display, text: String) -> Result<(), DisplayError>;
}
