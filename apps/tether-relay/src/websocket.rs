//! Push delivery endpoint: a websocket that streams signal inserts for
//! one session as they land in the store. The feed is best-effort; a
//! dropped or never-opened feed is covered by the poll endpoint.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use tether_core::{SessionStore, SignalStore};
use tether_proto::Side;

use crate::auth;
use crate::handlers::{parse_sides, AppState};
use crate::metrics;

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    pub token: Option<String>,
    pub pin: Option<String>,
    pub sides: Option<String>,
}

/// GET /ws/{session_id}
pub async fn signal_feed_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<Uuid>,
    Query(query): Query<FeedQuery>,
    State(state): State<AppState>,
) -> Response {
    let session = match state.store.session(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            warn!("session lookup failed: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if let Err(status) =
        auth::authorize_session_params(query.token.as_deref(), query.pin.as_deref(), &session)
    {
        return status.into_response();
    }
    let sides = match parse_sides(query.sides.as_deref()) {
        Ok(sides) => sides,
        Err(status) => return status.into_response(),
    };

    ws.on_upgrade(move |socket| stream_signals(socket, session_id, sides, state))
}

async fn stream_signals(
    socket: WebSocket,
    session_id: Uuid,
    sides: Option<Vec<Side>>,
    state: AppState,
) {
    let mut feed = match state.store.subscribe_signals(session_id).await {
        Ok(feed) => feed,
        Err(err) => {
            // Push is allowed to fail; the client falls back to polling.
            warn!(session = %session_id, error = %err, "could not open signal feed");
            return;
        }
    };

    metrics::ACTIVE_FEEDS.inc();
    debug!(session = %session_id, "signal feed opened");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            signal = feed.recv() => {
                let Some(record) = signal else { break };
                if let Some(sides) = &sides {
                    if !sides.contains(&record.from_side) {
                        continue;
                    }
                }
                let Ok(json) = serde_json::to_string(&record) else { continue };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // The feed is one-way; pings are answered by the
                    // protocol layer and anything else is ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    metrics::ACTIVE_FEEDS.dec();
    debug!(session = %session_id, "signal feed closed");
}
