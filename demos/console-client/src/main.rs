//! Line-mode NetConsole client.
//!
//! Run with: cargo run -p console-client
//!
//! Connects to `NETCONSOLE_URL` (default `http://127.0.0.1:8080/console`).
//! Type `stop` while an operation runs to cancel it.

use std::{env, io::Write as _, sync::Arc};

use futures::StreamExt;
use netconsole_core::{ConsoleController, Credentials, LineOrigin, ViewEvent};
use netconsole_protocol::{HttpTransport, RemoteServer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_URL: &str = "http://127.0.0.1:8080/console";

/// Credential dialog collected over two input lines.
struct LoginForm {
    site: String,
    user: Option<String>,
}

fn prompt(text: &str) {
    print!("{text}");
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let url = env::var("NETCONSOLE_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    tracing::info!(url, "connecting");
    let server = Arc::new(RemoteServer::new(HttpTransport::new(url), "NetConsole"));
    let controller = ConsoleController::start(server);

    let mut events = controller.view().history_plus_stream();
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut login: Option<LoginForm> = None;

    loop {
        tokio::select! {
            Some(event) = events.next() => match event {
                ViewEvent::Cls => prompt("\x1b[2J\x1b[H"),
                ViewEvent::Line { origin: LineOrigin::Server, text } => println!("{text}"),
                ViewEvent::Line { origin: LineOrigin::Client, .. }
                | ViewEvent::Busy(_)
                | ViewEvent::InputCleared => {}
                ViewEvent::Token { text } => println!("[copy] {text}"),
                ViewEvent::LoginOpened { site } => {
                    prompt(&format!("{site} user name (empty to cancel): "));
                    login = Some(LoginForm { site, user: None });
                }
                ViewEvent::LoginClosed => login = None,
                ViewEvent::Fault { message } => eprintln!("fault: {message}"),
            },
            line = input.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if let Some(form) = login.as_mut() {
                    match form.user.take() {
                        None if line.trim().is_empty() => {
                            login = None;
                            controller.cancel_login();
                        }
                        None => {
                            form.user = Some(line.trim().to_string());
                            prompt(&format!("{} password: ", form.site));
                        }
                        Some(user) => {
                            login = None;
                            controller.submit_login(Credentials::new(user, line));
                        }
                    }
                } else if line.trim().eq_ignore_ascii_case("stop") && controller.request_stop() {
                    println!("(stopping)");
                } else if !controller.send(line) {
                    println!("(busy)");
                }
            }
        }
    }

    Ok(())
}
