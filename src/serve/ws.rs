use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::query::subs::ClientHandle;

use super::{AppState, ServeError, routes};

/// Websocket requests reuse the envelope plus a client-chosen id echoed in
/// the reply.
#[derive(Deserialize, Debug)]
struct WsRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(state, socket))
}

async fn serve_socket(state: AppState, mut socket: WebSocket) {
    let (handle, mut messages) = state.hub.register();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = on_request(&state, handle, text.as_str()).await;
                        if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by axum
                    Some(Err(e)) => {
                        debug!("websocket receive error: {e}");
                        break;
                    }
                }
            }
            outgoing = messages.recv() => {
                let Some(message) = outgoing else {
                    // hub closed this client (slow consumer)
                    break;
                };
                let payload = json!({ "subscription": message });
                if socket.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.hub.unregister(handle);
}

async fn on_request(state: &AppState, handle: ClientHandle, text: &str) -> Value {
    let request: WsRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            return ServeError::bad_request(format!("malformed request: {e}")).to_wire();
        }
    };

    let result = match request.method.as_str() {
        "subscribeNewBlock" => {
            state.hub.subscribe_new_block(handle);
            Ok(json!({ "subscribed": true }))
        }
        "unsubscribeNewBlock" => {
            state.hub.unsubscribe_new_block(handle);
            Ok(json!({ "subscribed": false }))
        }
        "subscribeAddresses" => subscribe_addresses(state, handle, &request.params),
        "unsubscribeAddresses" => {
            state.hub.unsubscribe_addresses(handle);
            Ok(json!({ "subscribed": false }))
        }
        method => {
            let state = state.clone();
            let method = method.to_string();
            let params = request.params.clone();
            tokio::task::spawn_blocking(move || {
                routes::dispatch(&state.query, &method, &params)
            })
            .await
            .unwrap_or_else(|e| {
                warn!("websocket handler task failed: {e}");
                Err(ServeError::Internal)
            })
        }
    };

    match result {
        Ok(data) => json!({ "id": request.id, "data": data }),
        Err(e) => {
            let mut wire = e.to_wire();
            if let Some(object) = wire.as_object_mut() {
                object.insert("id".into(), request.id);
            }
            wire
        }
    }
}

fn subscribe_addresses(
    state: &AppState,
    handle: ClientHandle,
    params: &Value,
) -> Result<Value, ServeError> {
    let (addresses,): (Vec<String>,) = serde_json::from_value(params.clone())
        .map_err(|e| ServeError::bad_request(format!("malformed params: {e}")))?;

    let mut descriptors = Vec::with_capacity(addresses.len());
    for address in &addresses {
        descriptors.push(state.query.address_descriptor(address)?);
    }

    state.hub.subscribe_addresses(handle, descriptors);
    Ok(json!({ "subscribed": true }))
}
