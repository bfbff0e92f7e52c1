//! Wire types for remote console transactions.

use std::fmt;

use netconsole_store::SessionCode;
use serde::{Deserialize, Serialize};

/// One buffered UI mutation, executed by the client in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DisplayCommand {
    Cls,
    Print { text: String },
    Token { text: String },
}

/// How the client behaves after applying a response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientMode {
    /// Wait for the next user message.
    #[default]
    Prompt,
    /// Open a credential dialog labelled `site`, then send its outcome.
    Ask { site: String },
    /// A long operation started; send `resume` right away.
    Begin,
    /// A long operation continues; send `resume` right away.
    Proceed,
}

/// Authenticated session state carried by the client between transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub code: SessionCode,
    /// Base64 of the serialized session state.
    pub state: String,
    /// Base64 HMAC tag over code and state.
    pub tag: String,
}

/// What the client submits in a transaction.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// First transaction after login.
    Hello,
    /// A line the user typed.
    Message { text: String },
    /// Credentials entered in response to `ask`.
    Credential { name: String, password: String },
    /// The `ask` dialog was dismissed.
    Cancel,
    /// Continue a `begin`/`proceed` operation.
    Resume {
        #[serde(default)]
        cancel: bool,
    },
    /// End the session.
    Logout,
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hello => f.write_str("Hello"),
            Self::Message { text } => f.debug_struct("Message").field("text", text).finish(),
            Self::Credential { name, .. } => f
                .debug_struct("Credential")
                .field("name", name)
                .finish_non_exhaustive(),
            Self::Cancel => f.write_str("Cancel"),
            Self::Resume { cancel } => f.debug_struct("Resume").field("cancel", cancel).finish(),
            Self::Logout => f.write_str("Logout"),
        }
    }
}

/// Message from client to server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Establish a console session.
    Login { name: String, password: String },
    /// One step of an established session.
    Transaction { ticket: Ticket, payload: Payload },
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login { name, .. } => f
                .debug_struct("Login")
                .field("name", name)
                .finish_non_exhaustive(),
            Self::Transaction { ticket, payload } => f
                .debug_struct("Transaction")
                .field("code", &ticket.code.to_string())
                .field("payload", payload)
                .finish_non_exhaustive(),
        }
    }
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Login succeeded; the next transaction is `hello`.
    Established { ticket: Ticket },
    /// Unknown user or wrong password.
    LoginFailed,
    /// Unknown, expired or tampered session. Log in again.
    Invalid,
    /// The request was refused and nothing was changed.
    Rejected { reason: String },
    /// The transaction committed.
    Done {
        /// `None` once the session has ended.
        ticket: Option<Ticket>,
        commands: Vec<DisplayCommand>,
        mode: ClientMode,
    },
}
