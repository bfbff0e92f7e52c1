//! Remote console transaction protocol.
//!
//! Provides:
//! - `Protocol` - server side: login, authenticated transactions with
//!   rotating keys, built-in `admin` commands
//! - `Transaction` - the capability surface handed to the embedding app
//! - `RemoteServer` - client side, plugs into a `ConsoleController`
//! - HTTP endpoint (feature: http) and HTTP client transport
//!   (feature: http-client)

mod admin;
pub mod auth;
pub mod client;
pub mod config;
pub mod engine;
mod state;
pub mod transaction;
pub mod wire;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http-client")]
pub use client::HttpTransport;
pub use client::{LocalTransport, RemoteServer, Transport, TransportError};
pub use config::ProtocolConfig;
pub use engine::{Clock, ConsoleApp, Protocol};
pub use transaction::{Completed, ProcType, ProtocolError, Transaction};
pub use wire::{ClientMode, DisplayCommand, Payload, Request, Response, Ticket};
