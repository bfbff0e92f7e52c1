//! Session state round-tripped through the client.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use netconsole_store::SessionCode;
use serde::{Deserialize, Serialize};

use crate::{
    admin::Wizard,
    auth,
    transaction::ProtocolError,
    wire::{ClientMode, Ticket},
};

/// Client mode chosen by the previous transaction, or `Fresh` before `hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Fresh,
    Prompt,
    Ask,
    Begin,
    Proceed,
}

impl From<&ClientMode> for Phase {
    fn from(mode: &ClientMode) -> Self {
        match mode {
            ClientMode::Prompt => Self::Prompt,
            ClientMode::Ask { .. } => Self::Ask,
            ClientMode::Begin => Self::Begin,
            ClientMode::Proceed => Self::Proceed,
        }
    }
}

/// Everything the server needs to remember between two transactions.
///
/// Authenticated but not encrypted: the client can read it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SessionState {
    pub phase: Phase,
    /// Cancel requests seen during the current `proceed` chain.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    /// Step of the running built-in admin dialog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wizard: Option<Wizard>,
    /// Opaque context owned by the embedding application.
    #[serde(default, with = "base64_bytes")]
    pub context: Vec<u8>,
}

impl SessionState {
    /// Serialize and tag this state for the next transaction.
    pub fn seal(&self, key: &str, code: SessionCode) -> Result<Ticket, ProtocolError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| ProtocolError::Internal(format!("failed to encode state: {e}")))?;
        Ok(Ticket {
            code,
            tag: auth::sign(key, code, &bytes)?,
            state: URL_SAFE_NO_PAD.encode(&bytes),
        })
    }

    /// Authenticate `ticket` under `key` and decode its state.
    ///
    /// Every failure is [`ProtocolError::SessionInvalid`].
    pub fn open(ticket: &Ticket, key: &str) -> Result<Self, ProtocolError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&ticket.state)
            .map_err(|_| ProtocolError::SessionInvalid)?;
        if !auth::verify(key, ticket.code, &bytes, &ticket.tag) {
            return Err(ProtocolError::SessionInvalid);
        }
        serde_json::from_slice(&bytes).map_err(|_| ProtocolError::SessionInvalid)
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
