//! Server side of the remote console protocol.

use std::sync::Arc;

use async_trait::async_trait;
use netconsole_core::Credentials;
use netconsole_store::{
    NewSession, SessionCode, SessionRecord, Store, StoreError, User, epoch_minute,
    verify_password,
};

use crate::{
    admin::{self, AdminCommand, StepInput, Wizard},
    auth,
    config::ProtocolConfig,
    state::{Phase, SessionState},
    transaction::{Completed, Input, ProcType, ProtocolError, Transaction},
    wire::{Payload, Request, Response, Ticket},
};

/// Attempts at drawing an unused session code before giving up.
const CODE_ATTEMPTS: usize = 16;

/// Embedding server logic.
///
/// Called once per authenticated transaction, including `Nop` ones. The
/// implementation must call [`Transaction::complete`] for the changes to
/// take effect; returning an error rolls everything back.
///
/// No store lock is held when `handle` starts. Do slow work before reading
/// variables; once the store transaction is open, other sessions may wait
/// on it until the transaction ends.
#[async_trait]
pub trait ConsoleApp: Send + Sync {
    async fn handle(&self, tx: Transaction) -> Result<Completed, ProtocolError>;
}

/// Source of the current time in epoch minutes.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Work the protocol layer does itself before the application sees the
/// transaction.
enum Builtin {
    None,
    Cls,
    Start(AdminCommand),
    Step(Wizard, StepInput),
}

struct Route {
    proc_type: ProcType,
    input: Input,
    has_cancel: bool,
    builtin: Builtin,
}

impl Route {
    fn app(proc_type: ProcType, input: Input, has_cancel: bool) -> Self {
        Self {
            proc_type,
            input,
            has_cancel,
            builtin: Builtin::None,
        }
    }

    fn builtin(builtin: Builtin) -> Self {
        Self {
            proc_type: ProcType::Nop,
            input: Input::None,
            has_cancel: false,
            builtin,
        }
    }
}

fn bad_request(what: &str, phase: Phase) -> ProtocolError {
    ProtocolError::BadRequest(format!("{what} is not expected in {phase:?} mode"))
}

/// Decide what a payload means for a session in `state`.
fn classify(
    state: &SessionState,
    wizard: Option<Wizard>,
    payload: Payload,
) -> Result<Route, ProtocolError> {
    let phase = state.phase;

    if phase == Phase::Prompt
        && matches!(&payload, Payload::Message { text } if text.trim().eq_ignore_ascii_case("logout"))
    {
        return Ok(Route::app(ProcType::Logout, Input::None, false));
    }

    match (phase, payload) {
        (_, Payload::Logout) => Ok(Route::app(ProcType::Logout, Input::None, false)),
        (Phase::Fresh, Payload::Hello) => Ok(Route::app(ProcType::Hello, Input::None, false)),
        (Phase::Fresh, _) => Err(ProtocolError::BadRequest(
            "the first transaction must be hello".to_string(),
        )),
        (_, Payload::Hello) => Err(ProtocolError::BadRequest(
            "hello was already received".to_string(),
        )),

        (Phase::Ask, Payload::Credential { name, password }) => {
            let credentials = Credentials::new(name, password);
            Ok(match wizard {
                Some(w) => Route::builtin(Builtin::Step(w, StepInput::Credential(credentials))),
                None => Route::app(ProcType::Credential, Input::Credential(Some(credentials)), false),
            })
        }
        (Phase::Ask, Payload::Cancel) => Ok(match wizard {
            Some(w) => Route::builtin(Builtin::Step(w, StepInput::Cancel)),
            None => Route::app(ProcType::Credential, Input::Credential(None), true),
        }),
        (phase @ Phase::Ask, _) => Err(bad_request("only credential or cancel", phase)),

        (Phase::Prompt, Payload::Message { text }) => Ok(match wizard {
            Some(w) => Route::builtin(Builtin::Step(w, StepInput::Message(text))),
            None if text.trim().eq_ignore_ascii_case("cls") => Route::builtin(Builtin::Cls),
            None => match admin::parse(&text) {
                Some(command) => Route::builtin(Builtin::Start(command)),
                None => Route::app(ProcType::Message, Input::Message(text), false),
            },
        }),
        (phase @ Phase::Prompt, _) => Err(bad_request("only a message", phase)),

        (phase @ (Phase::Begin | Phase::Proceed), Payload::Resume { cancel }) => {
            // A cancel seen anywhere in a proceed chain stays visible.
            let has_cancel = cancel || (phase == Phase::Proceed && state.cancelled);
            Ok(Route::app(ProcType::Resume, Input::Resume, has_cancel))
        }
        (phase @ (Phase::Begin | Phase::Proceed), _) => Err(bad_request("only resume", phase)),
    }
}

/// Remote console protocol server.
pub struct Protocol<S, A> {
    store: Arc<S>,
    app: A,
    config: ProtocolConfig,
    clock: Clock,
}

impl<S: Store + 'static, A: ConsoleApp> Protocol<S, A> {
    pub fn new(store: S, app: A, config: ProtocolConfig) -> Self {
        Self::with_clock(store, app, config, Arc::new(epoch_minute))
    }

    /// Create a protocol that reads time from `clock`.
    pub fn with_clock(store: S, app: A, config: ProtocolConfig, clock: Clock) -> Self {
        Self {
            store: Arc::new(store),
            app,
            config,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub const fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Whether `session` has been idle for longer than the timeout.
    pub fn is_stale(&self, session: &SessionRecord) -> bool {
        self.now() - session.last_activity_minute > self.config.session_timeout_minutes
    }

    /// Delete every stale session.
    ///
    /// # Errors
    /// Returns error on storage failure.
    pub async fn purge_stale(&self) -> Result<u64, ProtocolError> {
        let cutoff = self.now() - self.config.session_timeout_minutes;
        let mut txn = self.store.begin().await?;
        let purged = txn.purge_stale(cutoff).await?;
        txn.commit().await?;
        if purged > 0 {
            tracing::info!(purged, "purged stale sessions");
        }
        Ok(purged)
    }

    /// Handle one client request.
    pub async fn process(&self, request: Request) -> Response {
        tracing::debug!(?request, "processing request");
        let result = match request {
            Request::Login { name, password } => self.login(&name, &password).await,
            Request::Transaction { ticket, payload } => self.transact(ticket, payload).await,
        };

        match result {
            Ok(response) => response,
            Err(ProtocolError::SessionInvalid) => Response::Invalid,
            Err(e @ (ProtocolError::BadRequest(_) | ProtocolError::Contract(_))) => {
                tracing::warn!(error = %e, "transaction rejected");
                Response::Rejected {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "transaction failed");
                Response::Rejected {
                    reason: "internal server error".to_string(),
                }
            }
        }
    }

    async fn login(&self, name: &str, password: &str) -> Result<Response, ProtocolError> {
        let mut txn = self.store.begin().await?;
        let user = match txn.user_by_name(name).await? {
            Some(user) if verify_password(password, &user.password_hash)? => user,
            _ => {
                tracing::info!(user = %name, "login failed");
                return Ok(Response::LoginFailed);
            }
        };

        let now = self.now();
        txn.purge_stale(now - self.config.session_timeout_minutes)
            .await?;

        let key = auth::generate_key();
        let mut session = None;
        for _ in 0..CODE_ATTEMPTS {
            let code = SessionCode::random();
            if txn.session_by_code(code).await?.is_none() {
                session = Some(
                    txn.insert_session(NewSession {
                        code,
                        last_activity_minute: now,
                        rotating_key: key.clone(),
                        user_id: user.id,
                    })
                    .await?,
                );
                break;
            }
        }
        let Some(session) = session else {
            return Err(ProtocolError::Internal(
                "no free session code".to_string(),
            ));
        };

        let ticket = SessionState::default().seal(&key, session.code)?;
        txn.commit().await?;
        tracing::info!(user = %user.name, code = %session.code, "session established");
        Ok(Response::Established { ticket })
    }

    async fn transact(&self, ticket: Ticket, payload: Payload) -> Result<Response, ProtocolError> {
        let now = self.now();
        let (session, user, state) = self.authenticate(&ticket).await?;
        let code = session.code;
        let key = session.rotating_key.clone();

        let result = self.dispatch(session, user, state, payload, now).await;
        if let Err(ProtocolError::BadRequest(_) | ProtocolError::Contract(_)) = &result {
            self.record_activity(code, &key, now).await;
        }
        result
    }

    /// Look up and verify the session `ticket` names.
    ///
    /// Only reads, and the store transaction ends before this returns.
    async fn authenticate(
        &self,
        ticket: &Ticket,
    ) -> Result<(SessionRecord, User, SessionState), ProtocolError> {
        let mut txn = self.store.begin().await?;

        let Some(session) = txn.session_by_code(ticket.code).await? else {
            tracing::debug!(code = %ticket.code, "unknown session code");
            return Err(ProtocolError::SessionInvalid);
        };
        if self.is_stale(&session) {
            tracing::info!(code = %session.code, "session expired");
            return Err(ProtocolError::SessionInvalid);
        }
        let state = SessionState::open(ticket, &session.rotating_key).inspect_err(|_| {
            tracing::warn!(code = %session.code, "session state failed authentication");
        })?;
        let Some(user) = txn.user_by_id(session.user_id).await? else {
            return Err(ProtocolError::SessionInvalid);
        };
        Ok((session, user, state))
    }

    async fn dispatch(
        &self,
        session: SessionRecord,
        user: User,
        mut state: SessionState,
        payload: Payload,
        now: i64,
    ) -> Result<Response, ProtocolError> {
        let wizard = state.wizard.take();
        let route = classify(&state, wizard, payload)?;

        let store: Arc<dyn Store> = self.store.clone();
        let mut tx = Transaction::new(
            route.proc_type,
            route.input,
            route.has_cancel,
            user,
            session,
            state,
            store,
            now,
            self.config.site_name.clone(),
        );
        match route.builtin {
            Builtin::None => {}
            Builtin::Cls => tx.clear(),
            Builtin::Start(command) => admin::start(&mut tx, command).await?,
            Builtin::Step(wizard, input) => admin::step(&mut tx, wizard, input).await?,
        }

        Ok(self.app.handle(tx).await?.into_response())
    }

    /// Refresh the activity time of a session whose request was rejected.
    /// The key stays as it is, so the client can retry with the same ticket.
    async fn record_activity(&self, code: SessionCode, key: &str, now: i64) {
        let result = async {
            let mut txn = self.store.begin().await?;
            if txn.rotate_session(code, key, key, now).await? {
                txn.commit().await?;
            }
            Ok::<_, StoreError>(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(code = %code, error = %e, "failed to record activity");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted application shared by the protocol tests.

    use std::{
        sync::atomic::{AtomicBool, AtomicI64, Ordering},
        time::Duration,
    };

    use netconsole_store::{MemoryStore, StoreTxn, ensure_user};
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::wire::{ClientMode, DisplayCommand};

    /// Steps of the `count` operation before it finishes by itself.
    pub const COUNT_STEPS: u8 = 3;

    #[derive(Default)]
    pub struct ScriptApp {
        /// Fail the next transaction after doing its work.
        pub fail_next: AtomicBool,
        /// Time each `Resume` spends working before it touches the session.
        pub resume_delay: Duration,
    }

    impl ScriptApp {
        pub fn slow(resume_delay: Duration) -> Self {
            Self {
                resume_delay,
                ..Self::default()
            }
        }

        /// `restart` proceeds whatever the cancel flag says and begins again
        /// on its third resume.
        fn restart_step(tx: &mut Transaction) -> Result<(), ProtocolError> {
            let mut context = tx.context()?.to_vec();
            context.push(b'.');
            tx.console_print(format!("cancel={}", tx.has_cancel()?))?;
            match context.len() - 1 {
                3 => tx.client_mode(ClientMode::Begin)?,
                n if n < 3 => tx.client_mode(ClientMode::Proceed)?,
                _ => {}
            }
            tx.set_context(context)
        }
    }

    #[async_trait]
    impl ConsoleApp for ScriptApp {
        async fn handle(&self, mut tx: Transaction) -> Result<Completed, ProtocolError> {
            match tx.proc_type() {
                ProcType::Nop => {
                    assert_err!(tx.console_print("nop"));
                    assert_err!(tx.current_user());
                    assert_err!(tx.client_mode(ClientMode::Begin));
                }
                ProcType::Logout => {
                    assert_ok!(tx.current_user());
                    assert_err!(tx.console_cls());
                }
                ProcType::Hello => {
                    tx.console_print("Welcome")?;
                    if let Some(motd) = tx.var("motd").await? {
                        tx.console_print(motd)?;
                    }
                }
                ProcType::Message => {
                    assert_err!(tx.has_cancel());
                    assert_err!(tx.name_cred());
                    let text = tx.message_data()?.to_string();
                    let (command, arg) = text.split_once(' ').unwrap_or((text.as_str(), ""));
                    match command {
                        "ask" => tx.client_mode(ClientMode::Ask {
                            site: "Example".to_string(),
                        })?,
                        "count" => {
                            tx.set_context(vec![0])?;
                            tx.console_print("counting")?;
                            tx.client_mode(ClientMode::Begin)?;
                        }
                        "remember" => tx.set_context(arg.as_bytes())?,
                        "recall" => {
                            let context = String::from_utf8_lossy(tx.context()?).into_owned();
                            tx.console_print(context)?;
                        }
                        "token" => tx.console_token(arg)?,
                        "proceed" => tx.client_mode(ClientMode::Proceed)?,
                        "restart" => {
                            tx.set_context(b"r".to_vec())?;
                            tx.client_mode(ClientMode::Begin)?;
                        }
                        "twice" => {
                            tx.client_mode(ClientMode::Prompt)?;
                            assert_err!(tx.client_mode(ClientMode::Prompt));
                            assert_err!(tx.client_mode(ClientMode::Ask {
                                site: " ".to_string()
                            }));
                            tx.console_print("mode chosen")?;
                        }
                        _ => tx.console_print(format!("echo: {text}"))?,
                    }
                }
                ProcType::Credential => {
                    if tx.has_cancel()? {
                        assert!(matches!(tx.name_cred(), Err(ProtocolError::Contract(_))));
                        tx.console_print("dialog cancelled")?;
                    } else {
                        let line = format!("hello {}", tx.name_cred()?);
                        tx.console_print(line)?;
                    }
                }
                ProcType::Resume if tx.context()?.first() == Some(&b'r') => {
                    Self::restart_step(&mut tx)?;
                }
                ProcType::Resume => {
                    if !self.resume_delay.is_zero() {
                        tokio::time::sleep(self.resume_delay).await;
                    }
                    let step = tx.context()?.first().copied().unwrap_or(0) + 1;
                    tx.set_context(vec![step])?;
                    if tx.has_cancel()? {
                        tx.console_print(format!("stopped at {step}"))?;
                    } else if step < COUNT_STEPS {
                        tx.console_print(format!("step {step}"))?;
                        tx.client_mode(ClientMode::Proceed)?;
                    } else {
                        tx.console_print("done")?;
                    }
                }
            }

            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(ProtocolError::Internal("scripted failure".to_string()));
            }
            tx.complete().await
        }
    }

    /// Protocol with `root` (admin) and `alice`, and a clock the test can
    /// move.
    pub struct Harness<S = MemoryStore> {
        pub protocol: Protocol<S, ScriptApp>,
        pub minute: Arc<AtomicI64>,
    }

    impl Harness {
        pub async fn new() -> Self {
            Self::over(MemoryStore::new(), ScriptApp::default()).await
        }
    }

    impl<S: Store + 'static> Harness<S> {
        pub async fn over(store: S, app: ScriptApp) -> Self {
            ensure_user(&store, "root", "rootpw", true).await.unwrap();
            ensure_user(&store, "alice", "alicepw", false).await.unwrap();
            let minute = Arc::new(AtomicI64::new(1_000));
            let clock = {
                let minute = minute.clone();
                Arc::new(move || minute.load(Ordering::SeqCst))
            };
            let config = ProtocolConfig {
                session_timeout_minutes: 30,
                site_name: "Test".to_string(),
            };
            Self {
                protocol: Protocol::with_clock(store, app, config, clock),
                minute,
            }
        }

        pub async fn login(&self, name: &str, password: &str) -> Ticket {
            let response = self
                .protocol
                .process(Request::Login {
                    name: name.to_string(),
                    password: password.to_string(),
                })
                .await;
            let Response::Established { ticket } = response else {
                panic!("login failed: {response:?}");
            };
            ticket
        }

        /// Log in and send `hello`.
        pub async fn session(&self, name: &str, password: &str) -> Ticket {
            let ticket = self.login(name, password).await;
            self.done(&ticket, Payload::Hello).await.0
        }

        pub async fn send(&self, ticket: &Ticket, payload: Payload) -> Response {
            self.protocol
                .process(Request::Transaction {
                    ticket: ticket.clone(),
                    payload,
                })
                .await
        }

        pub async fn done(&self, ticket: &Ticket, payload: Payload) -> (Ticket, Vec<String>, ClientMode) {
            match self.send(ticket, payload).await {
                Response::Done {
                    ticket: Some(ticket),
                    commands,
                    mode,
                } => (ticket, printed(&commands), mode),
                other => panic!("unexpected response: {other:?}"),
            }
        }

        pub async fn say(&self, ticket: &Ticket, text: &str) -> (Ticket, Vec<String>, ClientMode) {
            self.done(
                ticket,
                Payload::Message {
                    text: text.to_string(),
                },
            )
            .await
        }

        pub async fn txn(&self) -> Box<dyn StoreTxn> {
            self.protocol.store().begin().await.unwrap()
        }
    }

    pub fn printed(commands: &[DisplayCommand]) -> Vec<String> {
        commands
            .iter()
            .filter_map(|c| match c {
                DisplayCommand::Print { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn credential(name: &str, password: &str) -> Payload {
        Payload::Credential {
            name: name.to_string(),
            password: password.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use netconsole_store::{MemoryStore, SqliteStore, StoreTxn as _};

    use super::*;
    use crate::{
        engine::testing::{Harness, ScriptApp, credential},
        wire::{ClientMode, DisplayCommand},
    };

    #[tokio::test]
    async fn login_then_hello_welcomes() {
        let h = Harness::new().await;
        let ticket = h.login("alice", "alicepw").await;
        let (_, lines, mode) = h.done(&ticket, Payload::Hello).await;
        assert_eq!(lines, ["Welcome"]);
        assert_eq!(mode, ClientMode::Prompt);
    }

    #[tokio::test]
    async fn wrong_password_fails_login() {
        let h = Harness::new().await;
        let response = h
            .protocol
            .process(Request::Login {
                name: "alice".to_string(),
                password: "nope".to_string(),
            })
            .await;
        assert_eq!(response, Response::LoginFailed);
    }

    #[tokio::test]
    async fn hello_is_required_first_and_only_once() {
        let h = Harness::new().await;
        let fresh = h.login("alice", "alicepw").await;
        let response = h
            .send(&fresh, Payload::Message { text: "hi".to_string() })
            .await;
        assert!(matches!(response, Response::Rejected { .. }));

        let (ticket, _, _) = h.done(&fresh, Payload::Hello).await;
        assert!(matches!(
            h.send(&ticket, Payload::Hello).await,
            Response::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn messages_reach_the_application_verbatim() {
        let h = Harness::new().await;
        let ticket = h.session("alice", "alicepw").await;
        let (_, lines, _) = h.say(&ticket, "  spaced  out ").await;
        assert_eq!(lines, ["echo:   spaced  out "]);
    }

    #[tokio::test]
    async fn admin_commands_are_intercepted() {
        let h = Harness::new().await;
        let ticket = h.session("root", "rootpw").await;
        let (_, lines, mode) = h.say(&ticket, "  ADMIN   var   list  ").await;
        assert_eq!(lines, ["No variables set."]);
        assert_eq!(mode, ClientMode::Prompt);
    }

    #[tokio::test]
    async fn cls_is_handled_by_the_protocol() {
        let h = Harness::new().await;
        let ticket = h.session("alice", "alicepw").await;
        let Response::Done { commands, .. } = h
            .send(&ticket, Payload::Message { text: "cls".to_string() })
            .await
        else {
            panic!("expected done");
        };
        assert_eq!(commands, [DisplayCommand::Cls]);
    }

    #[tokio::test]
    async fn ask_then_credential_or_cancel() {
        let h = Harness::new().await;
        let ticket = h.session("alice", "alicepw").await;

        let (asked, _, mode) = h.say(&ticket, "ask").await;
        assert_eq!(
            mode,
            ClientMode::Ask {
                site: "Example".to_string()
            }
        );
        let (ticket, lines, _) = h.done(&asked, credential("bob", "pw")).await;
        assert_eq!(lines, ["hello bob"]);

        let (asked, _, _) = h.say(&ticket, "ask").await;
        let (_, lines, mode) = h.done(&asked, Payload::Cancel).await;
        assert_eq!(lines, ["dialog cancelled"]);
        assert_eq!(mode, ClientMode::Prompt);
    }

    #[tokio::test]
    async fn payload_must_match_client_mode() {
        let h = Harness::new().await;
        let ticket = h.session("alice", "alicepw").await;
        assert!(matches!(
            h.send(&ticket, Payload::Resume { cancel: false }).await,
            Response::Rejected { .. }
        ));
        assert!(matches!(
            h.send(&ticket, credential("a", "b")).await,
            Response::Rejected { .. }
        ));

        // The rejected requests did not consume the key.
        let (_, lines, _) = h.say(&ticket, "hi").await;
        assert_eq!(lines, ["echo: hi"]);
    }

    #[tokio::test]
    async fn begin_proceed_runs_to_completion() {
        let h = Harness::new().await;
        let ticket = h.session("alice", "alicepw").await;
        let (mut ticket, _, mut mode) = h.say(&ticket, "count").await;
        assert_eq!(mode, ClientMode::Begin);

        let mut lines = Vec::new();
        while mode != ClientMode::Prompt {
            let step = h.done(&ticket, Payload::Resume { cancel: false }).await;
            ticket = step.0;
            lines.extend(step.1);
            mode = step.2;
        }
        assert_eq!(lines, ["step 1", "step 2", "done"]);
    }

    #[tokio::test]
    async fn cancel_is_reported_through_resume() {
        let h = Harness::new().await;
        let ticket = h.session("alice", "alicepw").await;
        let (ticket, _, _) = h.say(&ticket, "count").await;
        let (ticket, lines, mode) = h.done(&ticket, Payload::Resume { cancel: false }).await;
        assert_eq!(lines, ["step 1"]);
        assert_eq!(mode, ClientMode::Proceed);

        let (_, lines, mode) = h.done(&ticket, Payload::Resume { cancel: true }).await;
        assert_eq!(lines, ["stopped at 2"]);
        assert_eq!(mode, ClientMode::Prompt);
    }

    #[tokio::test]
    async fn proceed_keeps_cancel_until_begin() {
        let h = Harness::new().await;
        let ticket = h.session("alice", "alicepw").await;
        let (mut ticket, _, mode) = h.say(&ticket, "restart").await;
        assert_eq!(mode, ClientMode::Begin);

        let mut lines = Vec::new();
        let mut modes = Vec::new();
        for cancel in [false, true, false, false] {
            let step = h.done(&ticket, Payload::Resume { cancel }).await;
            ticket = step.0;
            lines.extend(step.1);
            modes.push(step.2);
        }
        assert_eq!(
            lines,
            ["cancel=false", "cancel=true", "cancel=true", "cancel=false"]
        );
        assert_eq!(
            modes,
            [
                ClientMode::Proceed,
                ClientMode::Proceed,
                ClientMode::Begin,
                ClientMode::Prompt
            ]
        );
    }

    #[tokio::test]
    async fn proceed_requires_begin() {
        let h = Harness::new().await;
        let ticket = h.session("alice", "alicepw").await;
        let Response::Rejected { reason } = h
            .send(&ticket, Payload::Message { text: "proceed".to_string() })
            .await
        else {
            panic!("expected rejection");
        };
        assert!(reason.contains("proceed"));
    }

    #[tokio::test]
    async fn client_mode_is_chosen_once() {
        let h = Harness::new().await;
        let ticket = h.session("alice", "alicepw").await;
        let (_, lines, mode) = h.say(&ticket, "twice").await;
        assert_eq!(lines, ["mode chosen"]);
        assert_eq!(mode, ClientMode::Prompt);
    }

    #[tokio::test]
    async fn context_survives_between_transactions() {
        let h = Harness::new().await;
        let ticket = h.session("alice", "alicepw").await;
        let (ticket, _, _) = h.say(&ticket, "remember blue").await;
        let (ticket, _, _) = h.say(&ticket, "hi").await;
        let (_, lines, _) = h.say(&ticket, "recall").await;
        assert_eq!(lines, ["blue"]);
    }

    #[tokio::test]
    async fn tampered_state_is_invalid() {
        let h = Harness::new().await;
        let mut ticket = h.session("alice", "alicepw").await;
        ticket.state = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            br#"{"phase":"prompt","context":"AAAA"}"#,
        );
        assert_eq!(
            h.send(&ticket, Payload::Message { text: "hi".to_string() }).await,
            Response::Invalid
        );
    }

    #[tokio::test]
    async fn keys_rotate_so_replays_fail() {
        let h = Harness::new().await;
        let first = h.session("alice", "alicepw").await;
        let (second, _, _) = h.say(&first, "one").await;
        assert_eq!(
            h.send(&first, Payload::Message { text: "again".to_string() }).await,
            Response::Invalid
        );
        let (_, lines, _) = h.say(&second, "two").await;
        assert_eq!(lines, ["echo: two"]);
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let h = Harness::new().await;
        let ticket = h.session("alice", "alicepw").await;
        h.minute.fetch_add(31, Ordering::SeqCst);
        assert_eq!(
            h.send(&ticket, Payload::Message { text: "hi".to_string() }).await,
            Response::Invalid
        );
        assert_eq!(h.protocol.purge_stale().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn activity_keeps_sessions_alive() {
        let h = Harness::new().await;
        let mut ticket = h.session("alice", "alicepw").await;
        for _ in 0..3 {
            h.minute.fetch_add(20, Ordering::SeqCst);
            ticket = h.say(&ticket, "hi").await.0;
        }
        assert_eq!(h.protocol.purge_stale().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_requests_count_as_activity() {
        let h = Harness::new().await;
        let ticket = h.session("alice", "alicepw").await;
        h.minute.fetch_add(20, Ordering::SeqCst);
        assert!(matches!(
            h.send(&ticket, Payload::Resume { cancel: false }).await,
            Response::Rejected { .. }
        ));
        let record = h
            .txn()
            .await
            .session_by_code(ticket.code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.last_activity_minute, 1_020);

        // Forty minutes after the last successful transaction, but only
        // twenty after the rejected one.
        h.minute.fetch_add(20, Ordering::SeqCst);
        let (_, lines, _) = h.say(&ticket, "hi").await;
        assert_eq!(lines, ["echo: hi"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_steps_do_not_block_other_sessions() {
        let delay = Duration::from_millis(500);
        let h = Harness::over(MemoryStore::new(), ScriptApp::slow(delay)).await;
        let alice = h.session("alice", "alicepw").await;
        let root = h.session("root", "rootpw").await;
        let (alice, _, _) = h.say(&alice, "count").await;
        let (root, _, _) = h.say(&root, "count").await;

        let started = tokio::time::Instant::now();
        let (a, b) = tokio::join!(
            h.done(&alice, Payload::Resume { cancel: false }),
            h.done(&root, Payload::Resume { cancel: false }),
        );
        assert!(started.elapsed() < delay * 2);
        assert_eq!(a.1, ["step 1"]);
        assert_eq!(b.1, ["step 1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn one_key_admits_one_of_two_racing_requests() {
        let h = Harness::over(
            MemoryStore::new(),
            ScriptApp::slow(Duration::from_millis(100)),
        )
        .await;
        let ticket = h.session("alice", "alicepw").await;
        let (ticket, _, _) = h.say(&ticket, "count").await;

        let (a, b) = tokio::join!(
            h.send(&ticket, Payload::Resume { cancel: false }),
            h.send(&ticket, Payload::Resume { cancel: false }),
        );
        let responses = [a, b];
        let done = responses
            .iter()
            .filter(|r| matches!(r, Response::Done { .. }))
            .count();
        assert_eq!(done, 1);
        assert!(responses.contains(&Response::Invalid));
    }

    #[tokio::test]
    async fn file_backed_sessions_run_side_by_side() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("console.db").display()
        );
        let store = SqliteStore::connect(&url).await.unwrap();
        let h = Harness::over(store, ScriptApp::slow(Duration::from_millis(200))).await;
        let alice = h.session("alice", "alicepw").await;
        let root = h.session("root", "rootpw").await;
        let (alice, _, _) = h.say(&alice, "count").await;
        let (root, _, _) = h.say(&root, "count").await;

        let (a, b) = tokio::join!(
            h.done(&alice, Payload::Resume { cancel: false }),
            h.done(&root, Payload::Resume { cancel: false }),
        );
        assert_eq!((a.1, a.2), (vec!["step 1".to_string()], ClientMode::Proceed));
        assert_eq!((b.1, b.2), (vec!["step 1".to_string()], ClientMode::Proceed));
    }

    #[tokio::test]
    async fn logout_ends_the_session() {
        let h = Harness::new().await;
        let ticket = h.session("alice", "alicepw").await;
        let response = h
            .send(&ticket, Payload::Message { text: " LOGOUT ".to_string() })
            .await;
        let Response::Done { ticket: None, .. } = response else {
            panic!("expected final response, got {response:?}");
        };
        assert!(h.txn().await.session_by_code(ticket.code).await.unwrap().is_none());
        assert_eq!(
            h.send(&ticket, Payload::Logout).await,
            Response::Invalid
        );
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back() {
        let h = Harness::new().await;
        let ticket = h.session("root", "rootpw").await;
        let (ticket, lines, _) = h.say(&ticket, "admin var set motd").await;
        assert_eq!(lines, ["Value for motd:"]);

        h.protocol.app.fail_next.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.send(&ticket, Payload::Message { text: "hi all".to_string() }).await,
            Response::Rejected { .. }
        ));
        assert_eq!(h.txn().await.variable("motd").await.unwrap(), None);

        // The key was not rotated, so the same ticket can retry.
        let (_, lines, _) = h.say(&ticket, "hi all").await;
        assert_eq!(lines, ["Variable motd set."]);
        assert_eq!(
            h.txn().await.variable("motd").await.unwrap().as_deref(),
            Some("hi all")
        );
        let (_, lines, _) = h.done(&h.login("alice", "alicepw").await, Payload::Hello).await;
        assert_eq!(lines, ["Welcome", "hi all"]);
    }
}
