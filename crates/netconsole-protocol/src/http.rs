//! HTTP endpoint for remote console transactions.

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::post};
use netconsole_store::Store;

use crate::{
    engine::{ConsoleApp, Protocol},
    wire::{Request, Response},
};

/// Path every request is posted to.
pub const CONSOLE_PATH: &str = "/console";

/// Build a router serving `POST /console`.
///
/// Each request body is one [`Request`]; the reply is its [`Response`].
pub fn router<S, A>(protocol: Arc<Protocol<S, A>>) -> Router
where
    S: Store + 'static,
    A: ConsoleApp + 'static,
{
    Router::new()
        .route(CONSOLE_PATH, post(console_handler::<S, A>))
        .with_state(protocol)
}

async fn console_handler<S, A>(
    State(protocol): State<Arc<Protocol<S, A>>>,
    Json(request): Json<Request>,
) -> Json<Response>
where
    S: Store + 'static,
    A: ConsoleApp + 'static,
{
    Json(protocol.process(request).await)
}
