use std::{net::SocketAddr, panic::AssertUnwindSafe, sync::Arc};

use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info};

use crate::{error::Error, query::{QueryEngine, subs::SubscriptionHub}};

mod error;
mod routes;
mod ws;

pub use error::ServeError;

pub static DEFAULT_SERVE_ADDRESS: &str = "0.0.0.0:8030";

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ServerConfig {
    pub address: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub query: Arc<QueryEngine>,
    pub hub: Arc<SubscriptionHub>,
}

/// Request envelope shared by the HTTP and websocket surfaces.
#[derive(Deserialize, Debug)]
pub struct RequestEnvelope {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

pub async fn run(
    query: Arc<QueryEngine>,
    hub: Arc<SubscriptionHub>,
    address: &str,
) -> Result<(), Error> {
    let state = AppState { query, hub };

    let app = Router::new()
        .route("/", get(root).post(on_message))
        .route("/ws", get(ws::upgrade))
        .with_state(state);

    let addr = address
        .parse::<SocketAddr>()
        .map_err(|e| Error::Config(format!("invalid server address '{address}': {e}")))?;

    info!("api listening on {addr}...");

    axum_server::bind(addr)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::Config(e.to_string()))?;

    Ok(())
}

async fn root() -> &'static str {
    "lodestone"
}

/// Single JSON endpoint: `{ "method": ..., "params": ... }` in, result or
/// `{ "error": { "message" } }` out. Handler panics are confined here and
/// answered as internal errors.
async fn on_message(
    State(state): State<AppState>,
    Json(envelope): Json<RequestEnvelope>,
) -> impl IntoResponse {
    let outcome = tokio::task::spawn_blocking(move || {
        std::panic::catch_unwind(AssertUnwindSafe(|| {
            routes::dispatch(&state.query, &envelope.method, &envelope.params)
        }))
    })
    .await;

    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            error!("handler panicked: {panic:?}");
            Err(ServeError::Internal)
        }
        Err(join_error) => {
            error!("handler task failed: {join_error}");
            Err(ServeError::Internal)
        }
    };

    match result {
        Ok(value) => Json(value),
        Err(e) => Json(e.to_wire()),
    }
}
