//! Client-side console session management.
//!
//! This crate provides:
//! - `DisplayClient` / `ServerSession` - capability surfaces between the
//!   console and pluggable server logic
//! - `ConsoleController` - single-flight operation state machine with server
//!   hot-swap and login interruption
//! - `ViewLog` - Broadcast + history of UI mutations for the rendering layer

pub mod controller;
pub mod traits;
pub mod view;

pub use controller::ConsoleController;
pub use traits::{
    Credentials, Display, DisplayClient, DisplayError, LoginOutcome, Server, ServerSession,
};
pub use view::{LineOrigin, ViewEvent, ViewLog};
