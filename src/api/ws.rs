use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use super::rest::ApiResponse;
use crate::notify::{BroadcastNotifier, ClientKind, Notification, Topic};
use crate::service::TriageService;

#[derive(Debug, Deserialize)]
struct WsQuery {
    client: Option<String>,
}

pub(super) fn route(
    service: Arc<TriageService>,
    notifier: Arc<BroadcastNotifier>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "v1" / "ws")
        .and(warp::ws())
        .and(warp::query::<WsQuery>())
        .map(move |ws: Ws, query: WsQuery| {
            let kind = match query.client.as_deref().unwrap_or("all").parse::<ClientKind>() {
                Ok(kind) => kind,
                Err(e) => {
                    let body = warp::reply::json(&ApiResponse {
                        status: "error".to_string(),
                        message: e.to_string(),
                        data: None,
                    });
                    return warp::reply::with_status(body, StatusCode::BAD_REQUEST).into_response();
                }
            };

            let service = Arc::clone(&service);
            // Subscribe before the upgrade so nothing published in between is lost.
            let events = notifier.subscribe();
            ws.on_upgrade(move |socket| session(socket, kind, service, events))
                .into_response()
        })
}

async fn session(
    socket: WebSocket,
    kind: ClientKind,
    service: Arc<TriageService>,
    mut events: tokio::sync::broadcast::Receiver<Notification>,
) {
    let (mut outbound, mut inbound) = socket.split();
    info!(client = ?kind, "websocket client connected");

    for notification in initial_state(&service, kind) {
        if send(&mut outbound, &notification).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(notification) if kind.wants(notification.topic) => {
                    if send(&mut outbound, &notification).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(client = ?kind, skipped, "websocket client lagging; events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            message = inbound.next() => match message {
                Some(Ok(message)) if message.is_close() => break,
                Some(Ok(message)) => {
                    if message.to_str() == Ok("ping") && outbound.send(Message::text("pong")).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "websocket receive failed");
                    break;
                }
                None => break,
            },
        }
    }

    info!(client = ?kind, "websocket client disconnected");
}

async fn send<S>(outbound: &mut S, notification: &Notification) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(notification).map_err(|e| warn!(error = %e, "failed to encode event"))?;
    outbound.send(Message::text(text)).await.map_err(|_| ())
}

/// What a newly connected client sees before live events arrive.
fn initial_state(service: &TriageService, kind: ClientKind) -> Vec<Notification> {
    let now = Utc::now();
    let mut initial = Vec::new();
    let mut push = |topic: Topic, event: &str, data: Result<serde_json::Value, serde_json::Error>| match data {
        Ok(data) => initial.push(Notification {
            topic,
            event: event.to_string(),
            data,
            timestamp: now,
        }),
        Err(e) => warn!(event, error = %e, "failed to encode initial state"),
    };

    if kind.wants(Topic::Dashboard) {
        push(Topic::Dashboard, "dashboard_stats", serde_json::to_value(service.dashboard_snapshot()));
    }
    if kind.wants(Topic::Queue) {
        push(Topic::Queue, "queue_update", serde_json::to_value(service.list_waiting(None, None)));
    }
    if kind.wants(Topic::Alerts) {
        push(Topic::Alerts, "alerts_update", serde_json::to_value(service.active_alerts(20)));
    }
    initial
}
