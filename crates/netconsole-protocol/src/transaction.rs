//! Per-request transaction context handed to the embedding application.

use std::sync::Arc;

use netconsole_core::Credentials;
use netconsole_store::{CredentialError, SessionRecord, Store, StoreError, StoreTxn, User};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    admin::Wizard,
    auth,
    state::{Phase, SessionState},
    wire::{ClientMode, DisplayCommand, Response},
};

/// Protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Unknown code, expired session or authentication failure.
    #[error("session invalid")]
    SessionInvalid,
    /// The payload does not fit the session's current client mode.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Embedding logic used a capability outside its valid window.
    #[error("contract violation: {0}")]
    Contract(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("internal error: {0}")]
    Internal(String),
}

fn contract(what: &str, proc_type: ProcType) -> ProtocolError {
    ProtocolError::Contract(format!("{what} is unavailable for {proc_type:?}"))
}

/// Why a transaction reached the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcType {
    /// Handled entirely by the protocol layer; just complete.
    Nop,
    /// First transaction of a session.
    Hello,
    /// The user sent a message.
    Message,
    /// The user answered or dismissed an `ask` dialog.
    Credential,
    /// Continuation of a `begin`/`proceed` operation.
    Resume,
    /// The session is ending.
    Logout,
}

/// Transaction input, after classification.
pub(crate) enum Input {
    None,
    Message(String),
    Credential(Option<Credentials>),
    Resume,
}

/// Proof that a transaction was completed and committed.
#[derive(Debug)]
#[must_use]
pub struct Completed(Response);

impl Completed {
    /// The response to send to the client.
    pub fn into_response(self) -> Response {
        self.0
    }
}

/// One remote transaction.
///
/// Store changes, the display buffer and the rotated key are committed
/// together by [`complete`](Transaction::complete). Dropping a transaction
/// without completing it rolls everything back and leaves the session key
/// valid for a retry.
///
/// The store transaction opens at the first call that touches stored data
/// ([`var`](Transaction::var) or a built-in admin command), or at
/// `complete`, and stays open until the transaction ends. Slow work done
/// before that point does not hold up other sessions.
pub struct Transaction {
    proc_type: ProcType,
    input: Input,
    has_cancel: bool,
    user: User,
    session: SessionRecord,
    previous: Phase,
    state: SessionState,
    commands: Vec<DisplayCommand>,
    mode: Option<ClientMode>,
    store: Arc<dyn Store>,
    txn: Option<Box<dyn StoreTxn>>,
    now_minute: i64,
    site: String,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        proc_type: ProcType,
        input: Input,
        has_cancel: bool,
        user: User,
        session: SessionRecord,
        state: SessionState,
        store: Arc<dyn Store>,
        now_minute: i64,
        site: String,
    ) -> Self {
        Self {
            proc_type,
            input,
            has_cancel,
            user,
            session,
            previous: state.phase,
            state,
            commands: Vec::new(),
            mode: None,
            store,
            txn: None,
            now_minute,
            site,
        }
    }

    #[must_use]
    pub const fn proc_type(&self) -> ProcType {
        self.proc_type
    }

    /// The message text, exactly as sent.
    ///
    /// # Errors
    /// Contract violation unless the process type is `Message`.
    pub fn message_data(&self) -> Result<&str, ProtocolError> {
        match &self.input {
            Input::Message(text) if self.proc_type == ProcType::Message => Ok(text),
            _ => Err(contract("message data", self.proc_type)),
        }
    }

    /// Whether the user cancelled the dialog or the running operation.
    ///
    /// # Errors
    /// Contract violation unless the process type is `Credential` or `Resume`.
    pub fn has_cancel(&self) -> Result<bool, ProtocolError> {
        match self.proc_type {
            ProcType::Credential | ProcType::Resume => Ok(self.has_cancel),
            other => Err(contract("cancel flag", other)),
        }
    }

    fn credentials(&self, what: &str) -> Result<&Credentials, ProtocolError> {
        match &self.input {
            Input::Credential(Some(c)) if self.proc_type == ProcType::Credential => Ok(c),
            Input::Credential(None) if self.proc_type == ProcType::Credential => Err(
                ProtocolError::Contract(format!("{what} is unavailable after cancel")),
            ),
            _ => Err(contract(what, self.proc_type)),
        }
    }

    /// User name entered in the credential dialog.
    ///
    /// # Errors
    /// Contract violation unless this is a non-cancelled `Credential`.
    pub fn name_cred(&self) -> Result<&str, ProtocolError> {
        self.credentials("name credential").map(|c| c.user.as_str())
    }

    /// Password entered in the credential dialog.
    ///
    /// # Errors
    /// Contract violation unless this is a non-cancelled `Credential`.
    pub fn pass_cred(&self) -> Result<&str, ProtocolError> {
        self.credentials("password credential")
            .map(|c| c.password.as_str())
    }

    fn ensure_not_nop(&self, what: &str) -> Result<(), ProtocolError> {
        if self.proc_type == ProcType::Nop {
            return Err(contract(what, self.proc_type));
        }
        Ok(())
    }

    fn ensure_may_display(&self, what: &str) -> Result<(), ProtocolError> {
        match self.proc_type {
            ProcType::Nop | ProcType::Logout => Err(contract(what, self.proc_type)),
            _ => Ok(()),
        }
    }

    /// The logged-in user.
    ///
    /// # Errors
    /// Contract violation under `Nop`.
    pub fn current_user(&self) -> Result<&User, ProtocolError> {
        self.ensure_not_nop("current user")?;
        Ok(&self.user)
    }

    /// Whether the logged-in user is an administrator.
    ///
    /// # Errors
    /// Contract violation under `Nop`.
    pub fn is_administrator(&self) -> Result<bool, ProtocolError> {
        self.ensure_not_nop("administrator flag")?;
        Ok(self.user.is_admin)
    }

    /// Read a server variable.
    ///
    /// # Errors
    /// Contract violation under `Nop`, or a store failure.
    pub async fn var(&mut self, name: &str) -> Result<Option<String>, ProtocolError> {
        self.ensure_not_nop("var")?;
        Ok(self.store().await?.variable(name).await?)
    }

    /// The application context carried by this session.
    ///
    /// # Errors
    /// Contract violation under `Nop`.
    pub fn context(&self) -> Result<&[u8], ProtocolError> {
        self.ensure_not_nop("context")?;
        Ok(&self.state.context)
    }

    /// Replace the application context for the next transaction.
    ///
    /// # Errors
    /// Contract violation under `Nop`.
    pub fn set_context(&mut self, context: impl Into<Vec<u8>>) -> Result<(), ProtocolError> {
        self.ensure_not_nop("context")?;
        self.state.context = context.into();
        Ok(())
    }

    /// Queue a console clear.
    ///
    /// # Errors
    /// Contract violation under `Nop` and `Logout`.
    pub fn console_cls(&mut self) -> Result<(), ProtocolError> {
        self.ensure_may_display("console output")?;
        self.commands.push(DisplayCommand::Cls);
        Ok(())
    }

    /// Queue printed text.
    ///
    /// # Errors
    /// Contract violation under `Nop` and `Logout`.
    pub fn console_print(&mut self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.ensure_may_display("console output")?;
        self.commands.push(DisplayCommand::Print { text: text.into() });
        Ok(())
    }

    /// Queue a copy-to-clipboard token.
    ///
    /// # Errors
    /// Contract violation under `Nop` and `Logout`.
    pub fn console_token(&mut self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.ensure_may_display("console output")?;
        self.commands.push(DisplayCommand::Token { text: text.into() });
        Ok(())
    }

    /// Choose what the client does next. Defaults to `Prompt`.
    ///
    /// # Errors
    /// Contract violation under `Nop` and `Logout`, when called twice, for
    /// `Ask` without a site, and for `Proceed` unless the previous
    /// transaction chose `Begin` or `Proceed`.
    pub fn client_mode(&mut self, mode: ClientMode) -> Result<(), ProtocolError> {
        self.ensure_may_display("client mode")?;
        if self.mode.is_some() {
            return Err(ProtocolError::Contract(
                "client mode already chosen".to_string(),
            ));
        }
        match &mode {
            ClientMode::Ask { site } if site.trim().is_empty() => {
                return Err(ProtocolError::Contract("ask requires a site".to_string()));
            }
            ClientMode::Proceed if !matches!(self.previous, Phase::Begin | Phase::Proceed) => {
                return Err(ProtocolError::Contract(
                    "proceed must follow begin or proceed".to_string(),
                ));
            }
            _ => {}
        }
        self.mode = Some(mode);
        Ok(())
    }

    /// Commit the transaction and produce its response.
    ///
    /// # Errors
    /// Returns error if the store commit fails; nothing is changed then.
    /// `SessionInvalid` if another transaction already used this session's
    /// key.
    pub async fn complete(mut self) -> Result<Completed, ProtocolError> {
        let code = self.session.code;
        let current = std::mem::take(&mut self.session.rotating_key);

        if self.proc_type == ProcType::Logout {
            let txn = self.store().await?;
            match txn.session_by_code(code).await? {
                Some(session) if session.rotating_key == current => {}
                _ => return Err(self.superseded()),
            }
            txn.delete_session(code).await?;
            self.commit().await?;
            tracing::info!(user = %self.user.name, code = %code, "session ended");
            return Ok(Completed(Response::Done {
                ticket: None,
                commands: Vec::new(),
                mode: ClientMode::Prompt,
            }));
        }

        let mode = self.mode.take().unwrap_or_default();
        self.state.phase = Phase::from(&mode);
        self.state.cancelled = mode == ClientMode::Proceed && self.has_cancel;

        let key = auth::generate_key();
        let ticket = self.state.seal(&key, code)?;
        let minute = self.now_minute;
        let rotated = self
            .store()
            .await?
            .rotate_session(code, &current, &key, minute)
            .await?;
        if !rotated {
            return Err(self.superseded());
        }
        self.commit().await?;

        tracing::debug!(
            code = %code,
            proc_type = ?self.proc_type,
            commands = self.commands.len(),
            ?mode,
            "transaction committed"
        );
        Ok(Completed(Response::Done {
            ticket: Some(ticket),
            commands: self.commands,
            mode,
        }))
    }

    fn superseded(&self) -> ProtocolError {
        tracing::info!(code = %self.session.code, "session key used by another transaction");
        ProtocolError::SessionInvalid
    }

    async fn commit(&mut self) -> Result<(), ProtocolError> {
        if let Some(txn) = self.txn.take() {
            txn.commit().await?;
        }
        Ok(())
    }

    // Built-in command support: these bypass the process-type checks.

    pub(crate) fn user(&self) -> &User {
        &self.user
    }

    pub(crate) fn site(&self) -> &str {
        &self.site
    }

    /// The store transaction, opened on first use.
    pub(crate) async fn store(&mut self) -> Result<&mut dyn StoreTxn, ProtocolError> {
        let txn = match self.txn.take() {
            Some(txn) => txn,
            None => self.store.begin().await?,
        };
        Ok(self.txn.insert(txn).as_mut())
    }

    pub(crate) fn set_wizard(&mut self, wizard: Wizard) {
        self.state.wizard = Some(wizard);
    }

    pub(crate) fn say(&mut self, text: impl Into<String>) {
        self.commands.push(DisplayCommand::Print { text: text.into() });
    }

    pub(crate) fn clear(&mut self) {
        self.commands.push(DisplayCommand::Cls);
    }

    pub(crate) fn ask(&mut self, site: impl Into<String>) {
        self.mode = Some(ClientMode::Ask { site: site.into() });
    }
}
