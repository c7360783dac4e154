use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::types::{AuthenticatedData, ClientMessage, ServerMessage};
use crate::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Frames for this client arrive from the registry through this channel
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let client_id = state.registry.register(tx);
    info!("WebSocket client connected: {}", client_id);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => handle_message(&state, client_id, &text).await,
            Ok(Message::Close(_)) => {
                info!("WebSocket client disconnecting: {}", client_id);
                break;
            }
            Ok(Message::Ping(_)) => {
                debug!("Received ping from {}", client_id);
            }
            Err(e) => {
                error!("WebSocket error for {}: {}", client_id, e);
                break;
            }
            _ => {}
        }
    }

    state.registry.unregister(client_id);
    send_task.abort();
    info!("WebSocket client disconnected: {}", client_id);
}

async fn handle_message(state: &AppState, client_id: Uuid, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            send_message(state, client_id, &ServerMessage::error(&AppError::from(e)));
            return;
        }
    };

    match msg {
        ClientMessage::Auth { token } => authenticate(state, client_id, &token).await,
    }
}

/// Bind the connection to the token's tenant. A bad token gets an error
/// frame and the socket stays open.
async fn authenticate(state: &AppState, client_id: Uuid, token: &str) {
    let tenant_id = match state.verifier.verify(token).await {
        Some(tenant_id) => tenant_id,
        None => {
            debug!("Client {} sent an invalid token", client_id);
            let err = AppError::Unauthorized("Invalid or expired token".to_string());
            send_message(state, client_id, &ServerMessage::error(&err));
            return;
        }
    };

    state.registry.bind(client_id, &tenant_id);
    info!("Client {} authenticated as {}", client_id, tenant_id);
    send_message(
        state,
        client_id,
        &ServerMessage::Authenticated(AuthenticatedData {
            tenant_id: tenant_id.clone(),
        }),
    );

    // Build the context so the tenant joins the refresh cycle
    match state.contexts.get_context(&tenant_id).await {
        Ok(context) => {
            if let Some(snapshot) = context.portfolio().get_latest_snapshot() {
                send_message(state, client_id, &ServerMessage::Snapshot(snapshot.as_ref().clone()));
            }
        }
        Err(e) => {
            warn!("Could not load context for {}: {}", tenant_id, e);
            send_message(state, client_id, &ServerMessage::error(&AppError::from(e)));
        }
    }
}

fn send_message(state: &AppState, client_id: Uuid, msg: &ServerMessage) {
    if let Some(json) = msg.to_json() {
        state.registry.send(client_id, &json);
    }
}
