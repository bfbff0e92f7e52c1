//! Console controller: single-flight operations, server hot-swap and login
//! interruption.

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::{
    traits::{Credentials, Display, DisplayClient, DisplayError, LoginOutcome, Server},
    view::{LineOrigin, ViewEvent, ViewLog},
};

/// Operation sequence number. Each operation gets a fresh one.
type OpId = u64;

struct PendingLogin {
    op: OpId,
    reply: oneshot::Sender<LoginOutcome>,
}

struct State {
    processing: bool,
    stop_requested: bool,
    login: Option<PendingLogin>,
    active: Server,
    pending: Option<Server>,
    live_op: Option<OpId>,
    next_op: OpId,
}

impl State {
    fn begin_op(&mut self) -> OpId {
        let op = self.next_op;
        self.next_op += 1;
        self.processing = true;
        self.stop_requested = false;
        self.live_op = Some(op);
        op
    }
}

struct Shared {
    state: Mutex<State>,
    view: Arc<ViewLog>,
    idle: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

enum Job {
    Init,
    Message(String),
}

/// Mediates between one console UI and an exchangeable server.
///
/// At most one server operation is outstanding at a time. Operations run as
/// Tokio tasks, so the controller must be created inside a runtime.
#[derive(Clone)]
pub struct ConsoleController {
    shared: Arc<Shared>,
}

impl ConsoleController {
    /// Create a controller and run `server`'s init sequence.
    #[must_use]
    pub fn start(server: Server) -> Self {
        Self::with_view(server, Arc::new(ViewLog::new()))
    }

    /// Create a controller publishing to an existing view log.
    #[must_use]
    pub fn with_view(server: Server, view: Arc<ViewLog>) -> Self {
        let (idle, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                processing: false,
                stop_requested: false,
                login: None,
                active: Arc::clone(&server),
                pending: None,
                live_op: None,
                next_op: 1,
            }),
            view,
            idle,
        });

        let op = {
            let mut state = shared.lock();
            let op = state.begin_op();
            shared.view.push(ViewEvent::Busy(true));
            op
        };
        dispatch(&shared, server, op, Job::Init);

        Self { shared }
    }

    /// Send a line of user input to the active server.
    ///
    /// Returns `false` without doing anything while an operation is
    /// outstanding or a login dialog is open.
    pub fn send(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        let (server, op) = {
            let mut state = self.shared.lock();
            if state.processing || state.login.is_some() {
                tracing::debug!("send ignored: console busy");
                return false;
            }
            let op = state.begin_op();
            self.shared.view.push(ViewEvent::Line {
                origin: LineOrigin::Client,
                text: text.clone(),
            });
            self.shared.view.push(ViewEvent::Busy(true));
            self.shared.idle.send_replace(false);
            (Arc::clone(&state.active), op)
        };
        tracing::debug!(op, "dispatching message");
        dispatch(&self.shared, server, op, Job::Message(text));
        true
    }

    /// Ask the running operation to stop. Purely advisory.
    ///
    /// Returns `false` if there is nothing to stop, a stop is already
    /// pending, or a login dialog is open.
    pub fn request_stop(&self) -> bool {
        let mut state = self.shared.lock();
        if !state.processing || state.stop_requested || state.login.is_some() {
            return false;
        }
        state.stop_requested = true;
        tracing::debug!(op = ?state.live_op, "stop requested");
        true
    }

    /// Confirm the open login dialog.
    ///
    /// Returns `false` if no dialog is open.
    pub fn submit_login(&self, credentials: Credentials) -> bool {
        self.close_login(LoginOutcome::Submitted(credentials))
    }

    /// Dismiss the open login dialog.
    ///
    /// Returns `false` if no dialog is open.
    pub fn cancel_login(&self) -> bool {
        self.close_login(LoginOutcome::Cancelled)
    }

    fn close_login(&self, outcome: LoginOutcome) -> bool {
        let pending = {
            let mut state = self.shared.lock();
            let Some(pending) = state.login.take() else {
                return false;
            };
            self.shared.view.push(ViewEvent::LoginClosed);
            pending
        };
        tracing::debug!(op = pending.op, "login dialog closed");
        // The server may have given up waiting; the dialog is closed regardless.
        let _ = pending.reply.send(outcome);
        true
    }

    /// Whether a server operation is outstanding.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.shared.lock().processing
    }

    /// Whether a stop was requested for the outstanding operation.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.shared.lock().stop_requested
    }

    /// Whether a login dialog owns the UI.
    #[must_use]
    pub fn is_login_active(&self) -> bool {
        self.shared.lock().login.is_some()
    }

    /// The view log this controller publishes to.
    #[must_use]
    pub fn view(&self) -> Arc<ViewLog> {
        Arc::clone(&self.shared.view)
    }

    /// Wait until no operation is outstanding.
    pub async fn idle(&self) {
        let mut rx = self.shared.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }
}

fn dispatch(shared: &Arc<Shared>, server: Server, op: OpId, job: Job) {
    let display: Display = Arc::new(OperationDisplay {
        shared: Arc::clone(shared),
        op,
        completed: AtomicBool::new(false),
    });
    let view = Arc::clone(&shared.view);

    tokio::spawn(async move {
        let result = match job {
            Job::Init => server.handle_init(display).await,
            Job::Message(text) => server.handle_message(display, text).await,
        };
        if let Err(e) = result {
            tracing::error!(op, "server broke display contract: {e}");
            view.push(ViewEvent::Fault {
                message: e.to_string(),
            });
        }
    });
}

/// Closes an operation's login dialog when the wait for it is abandoned.
struct LoginGuard<'a> {
    shared: &'a Shared,
    op: OpId,
}

impl Drop for LoginGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.login.as_ref().is_some_and(|pending| pending.op == self.op) {
            state.login = None;
            self.shared.view.push(ViewEvent::LoginClosed);
            tracing::debug!(op = self.op, "login dialog abandoned");
        }
    }
}

/// Display handed to the server for one operation.
struct OperationDisplay {
    shared: Arc<Shared>,
    op: OpId,
    completed: AtomicBool,
}

impl OperationDisplay {
    fn ensure_live(&self, state: &State) -> Result<(), DisplayError> {
        if self.completed.load(Ordering::Acquire) {
            return Err(DisplayError::Completed);
        }
        if state.live_op != Some(self.op) {
            return Err(DisplayError::NotLive);
        }
        Ok(())
    }

    fn ensure_usable(&self, state: &State) -> Result<(), DisplayError> {
        self.ensure_live(state)?;
        if state.login.is_some() {
            return Err(DisplayError::LoginActive);
        }
        Ok(())
    }

    fn emit(&self, event: ViewEvent) -> Result<(), DisplayError> {
        let state = self.shared.lock();
        self.ensure_usable(&state)?;
        self.shared.view.push(event);
        Ok(())
    }
}

#[async_trait]
impl DisplayClient for OperationDisplay {
    fn check_stop(&self) -> Result<bool, DisplayError> {
        let state = self.shared.lock();
        self.ensure_usable(&state)?;
        Ok(state.stop_requested)
    }

    fn update_server(&self, server: Server) -> Result<(), DisplayError> {
        let mut state = self.shared.lock();
        self.ensure_usable(&state)?;
        state.pending = Some(server);
        Ok(())
    }

    async fn show_login(&self, site: &str) -> Result<LoginOutcome, DisplayError> {
        let rx = {
            let mut state = self.shared.lock();
            self.ensure_live(&state)?;
            if state.login.is_some() {
                return Err(DisplayError::LoginAlreadyOpen);
            }
            let (reply, rx) = oneshot::channel();
            state.login = Some(PendingLogin { op: self.op, reply });
            self.shared.view.push(ViewEvent::LoginOpened {
                site: site.to_string(),
            });
            rx
        };
        tracing::debug!(op = self.op, site, "login dialog opened");
        let _guard = LoginGuard {
            shared: &self.shared,
            op: self.op,
        };
        Ok(rx.await.unwrap_or(LoginOutcome::Cancelled))
    }

    fn cls(&self) -> Result<(), DisplayError> {
        self.emit(ViewEvent::Cls)
    }

    fn print(&self, text: &str) -> Result<(), DisplayError> {
        self.emit(ViewEvent::Line {
            origin: LineOrigin::Server,
            text: text.to_string(),
        })
    }

    fn token(&self, text: &str) -> Result<(), DisplayError> {
        self.emit(ViewEvent::Token {
            text: text.to_string(),
        })
    }

    fn complete(&self) -> Result<(), DisplayError> {
        let (next, op) = {
            let mut state = self.shared.lock();
            self.ensure_usable(&state)?;
            self.completed.store(true, Ordering::Release);

            state.live_op = None;
            state.processing = false;
            state.stop_requested = false;
            self.shared.view.push(ViewEvent::InputCleared);

            match state.pending.take() {
                Some(next) => {
                    state.active = Arc::clone(&next);
                    (next, state.begin_op())
                }
                None => {
                    self.shared.view.push(ViewEvent::Busy(false));
                    self.shared.idle.send_replace(true);
                    tracing::debug!(op = self.op, "operation complete");
                    return Ok(());
                }
            }
        };
        tracing::info!(completed = self.op, op, "switching to replacement server");
        dispatch(&self.shared, next, op, Job::Init);
        Ok(())
    }
}
