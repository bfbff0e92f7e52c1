//! Client side: a [`ServerSession`] that drives a remote console.

use std::sync::Arc;

use async_trait::async_trait;
use netconsole_core::{Display, DisplayError, LoginOutcome, ServerSession};
use netconsole_store::Store;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    engine::{ConsoleApp, Protocol},
    wire::{ClientMode, DisplayCommand, Payload, Request, Response, Ticket},
};

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("malformed response: {0}")]
    Decode(String),
}

/// Carries one request to the protocol server and brings back its response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&self, request: Request) -> Result<Response, TransportError>;
}

/// In-process transport straight into a [`Protocol`].
pub struct LocalTransport<S, A> {
    protocol: Arc<Protocol<S, A>>,
}

impl<S, A> LocalTransport<S, A> {
    #[must_use]
    pub const fn new(protocol: Arc<Protocol<S, A>>) -> Self {
        Self { protocol }
    }
}

#[async_trait]
impl<S: Store + 'static, A: ConsoleApp + 'static> Transport for LocalTransport<S, A> {
    async fn exchange(&self, request: Request) -> Result<Response, TransportError> {
        Ok(self.protocol.process(request).await)
    }
}

/// Transport that posts each request as JSON to a console endpoint.
#[cfg(feature = "http-client")]
pub struct HttpTransport {
    http: reqwest::Client,
    url: String,
}

#[cfg(feature = "http-client")]
impl HttpTransport {
    /// `url` is the full endpoint, e.g. `http://127.0.0.1:8080/console`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[cfg(feature = "http-client")]
#[async_trait]
impl Transport for HttpTransport {
    async fn exchange(&self, request: Request) -> Result<Response, TransportError> {
        self.http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransportError::Connection(e.to_string()))?
            .json::<Response>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[derive(Default)]
struct Link {
    ticket: Option<Ticket>,
    mode: ClientMode,
    /// Whether the server has accepted `hello` for the current ticket.
    greeted: bool,
}

/// Console server backed by a remote protocol endpoint.
///
/// Asks for credentials on start-up, then forwards every message as one
/// transaction and follows the client mode the server chooses.
pub struct RemoteServer<T> {
    transport: T,
    site: String,
    link: Mutex<Link>,
}

impl<T: Transport> RemoteServer<T> {
    pub fn new(transport: T, site: impl Into<String>) -> Self {
        Self {
            transport,
            site: site.into(),
            link: Mutex::new(Link::default()),
        }
    }

    /// Whether a session is currently established.
    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.ticket.is_some()
    }

    async fn exchange(
        &self,
        display: &Display,
        request: Request,
    ) -> Result<Option<Response>, DisplayError> {
        match self.transport.exchange(request).await {
            Ok(response) => Ok(Some(response)),
            Err(e) => {
                tracing::warn!(site = %self.site, "exchange failed: {e}");
                display.print(&format!("Connection error: {e}"))?;
                Ok(None)
            }
        }
    }

    /// Log in through the credential dialog until it succeeds or is dismissed.
    async fn connect(&self, link: &mut Link, display: &Display) -> Result<(), DisplayError> {
        loop {
            let credentials = match display.show_login(&self.site).await? {
                LoginOutcome::Submitted(credentials) => credentials,
                LoginOutcome::Cancelled => {
                    display.print("Not logged in. Send any message to log in.")?;
                    return Ok(());
                }
            };
            let request = Request::Login {
                name: credentials.user,
                password: credentials.password,
            };
            match self.exchange(display, request).await? {
                Some(Response::Established { ticket }) => {
                    tracing::info!(site = %self.site, code = %ticket.code, "logged in");
                    *link = Link {
                        ticket: Some(ticket),
                        ..Link::default()
                    };
                    return self.run(link, display, Payload::Hello).await;
                }
                Some(Response::LoginFailed) => display.print("Login failed.")?,
                Some(other) => {
                    tracing::warn!(?other, "unexpected login response");
                    display.print("Login failed: unexpected server response.")?;
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    /// Send `payload`, then keep transacting while the server's client mode
    /// calls for an immediate follow-up.
    async fn run(
        &self,
        link: &mut Link,
        display: &Display,
        mut payload: Payload,
    ) -> Result<(), DisplayError> {
        loop {
            let Some(ticket) = link.ticket.clone() else {
                return Ok(());
            };
            let request = Request::Transaction { ticket, payload };
            let Some(response) = self.exchange(display, request).await? else {
                return Ok(());
            };

            match response {
                Response::Done {
                    ticket,
                    commands,
                    mode,
                } => {
                    for command in &commands {
                        apply(display, command)?;
                    }
                    let Some(ticket) = ticket else {
                        *link = Link::default();
                        display.print("Logged out.")?;
                        return Ok(());
                    };
                    link.ticket = Some(ticket);
                    link.greeted = true;
                    link.mode = mode;
                    match self.follow_up(display, &link.mode).await? {
                        Some(next) => payload = next,
                        None => return Ok(()),
                    }
                }
                Response::Invalid => {
                    *link = Link::default();
                    display.print("Session expired. Send any message to log in again.")?;
                    return Ok(());
                }
                Response::Rejected { reason } => {
                    display.print(&format!("Request rejected: {reason}"))?;
                    return Ok(());
                }
                other @ (Response::Established { .. } | Response::LoginFailed) => {
                    tracing::warn!(?other, "unexpected transaction response");
                    display.print("Unexpected server response.")?;
                    return Ok(());
                }
            }
        }
    }

    /// The payload `mode` asks for before the next message, if any.
    async fn follow_up(
        &self,
        display: &Display,
        mode: &ClientMode,
    ) -> Result<Option<Payload>, DisplayError> {
        Ok(match mode {
            ClientMode::Prompt => None,
            ClientMode::Ask { site } => Some(match display.show_login(site).await? {
                LoginOutcome::Submitted(c) => Payload::Credential {
                    name: c.user,
                    password: c.password,
                },
                LoginOutcome::Cancelled => Payload::Cancel,
            }),
            ClientMode::Begin | ClientMode::Proceed => Some(Payload::Resume {
                cancel: display.check_stop()?,
            }),
        })
    }
}

fn apply(display: &Display, command: &DisplayCommand) -> Result<(), DisplayError> {
    match command {
        DisplayCommand::Cls => display.cls(),
        DisplayCommand::Print { text } => display.print(text),
        DisplayCommand::Token { text } => display.token(text),
    }
}

#[async_trait]
impl<T: Transport + 'static> ServerSession for RemoteServer<T> {
    async fn handle_init(&self, display: Display) -> Result<(), DisplayError> {
        let mut link = self.link.lock().await;
        if link.ticket.is_none() {
            self.connect(&mut link, &display).await?;
        }
        display.complete()
    }

    async fn handle_message(&self, display: Display, text: String) -> Result<(), DisplayError> {
        let mut link = self.link.lock().await;
        if link.ticket.is_none() {
            self.connect(&mut link, &display).await?;
            return display.complete();
        }

        // Finish whatever an earlier failure left pending before sending text.
        if !link.greeted {
            self.run(&mut link, &display, Payload::Hello).await?;
        }
        if link.greeted && link.mode != ClientMode::Prompt {
            let mode = link.mode.clone();
            if let Some(payload) = self.follow_up(&display, &mode).await? {
                self.run(&mut link, &display, payload).await?;
            }
        }

        if link.ticket.is_some() && link.greeted && link.mode == ClientMode::Prompt {
            let command = text.trim();
            if command.eq_ignore_ascii_case("cls") {
                display.cls()?;
            } else if command.eq_ignore_ascii_case("logout") {
                self.run(&mut link, &display, Payload::Logout).await?;
            } else {
                self.run(&mut link, &display, Payload::Message { text }).await?;
            }
        }
        display.complete()
    }
}
