use std::time::Duration;

use axum::{
    body::Bytes,
    debug_handler,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_sessions::Session;
use tracing::{debug, warn};

use crate::{
    AppResult,
    error::{ChatError, ChatResult},
    id::{MessageId, RoomId},
    messages::Cursor,
    session,
};

use super::{ClientSession, Hub, Outgoing, Subscription};

#[derive(Debug, Deserialize)]
pub struct ResumeQuery {
    after_seq: Option<u64>,
    after_ts: Option<i64>,
}

/// Inbound frames. Any frame at all also counts as a heartbeat.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Command {
    Send(Outgoing),
    MarkRead { ids: Vec<MessageId> },
    Typing,
    StopTyping,
    Heartbeat,
}

#[debug_handler(state = crate::AppState)]
pub async fn room_ws(
    Path(room_id): Path<String>,
    Query(ResumeQuery { after_seq, after_ts }): Query<ResumeQuery>,
    State(hub): State<Hub>,
    session: Session,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let room_id = RoomId::parse(&room_id)?;
    let identity = session::require_identity(&session).await?;
    let client = hub.connect(identity);

    let cursor = Cursor {
        timestamp: after_ts.unwrap_or(0),
        seq: after_seq.unwrap_or(0),
    };
    let subscription = client.resume(room_id, cursor).await?;
    let ping_every = ping_period(hub.config().heartbeat_timeout);

    Ok(ws
        .on_upgrade(async move |socket| run(socket, client, subscription, ping_every).await)
        .into_response())
}

/// Browsers answer pings on their own, so a tab that only reads stays alive
/// as long as its connection does.
fn ping_period(heartbeat_timeout: Duration) -> Duration {
    (heartbeat_timeout / 3).max(Duration::from_secs(1))
}

enum Inbound {
    Command(Result<Command, ChatError>),
    /// Pings, pongs and binary frames: only a sign of life.
    Alive,
    Closed,
}

fn inbound(frame: WsMessage) -> Inbound {
    match frame {
        WsMessage::Text(text) => Inbound::Command(
            serde_json::from_str::<Command>(text.as_str()).map_err(|e| ChatError::InvalidMessage(e.to_string())),
        ),
        WsMessage::Close(_) => Inbound::Closed,
        _ => Inbound::Alive,
    }
}

async fn run(socket: WebSocket, client: ClientSession, mut subscription: Subscription, ping_every: Duration) {
    let room_id = subscription.room_id();
    let (mut sender, mut receiver) = socket.split();
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel::<ChatError>();
    let stop = CancellationToken::new();

    let forward_stop = stop.clone();
    let forward = tokio::spawn(async move {
        let _stop_reader = forward_stop.clone().drop_guard();
        let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let frame = tokio::select! {
                _ = forward_stop.cancelled() => break,
                event = subscription.next() => match event {
                    Some(event) => serde_json::to_string(&event).map(|text| WsMessage::Text(text.into())),
                    None => break,
                },
                Some(error) = errors_rx.recv() => Ok(WsMessage::Text(
                    json!({
                        "type": "error",
                        "message": error.to_string(),
                        "transient": error.is_transient(),
                    })
                    .to_string()
                    .into(),
                )),
                _ = ping.tick() => Ok(WsMessage::Ping(Bytes::new())),
            };
            let Ok(frame) = frame else { continue };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
        subscription
    });

    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            frame = receiver.next() => frame,
        };
        let Some(Ok(frame)) = frame else { break };
        client.heartbeat();

        let outcome = match inbound(frame) {
            Inbound::Command(Ok(command)) => handle(&client, room_id, command).await,
            Inbound::Command(Err(e)) => Err(e),
            Inbound::Alive => continue,
            Inbound::Closed => break,
        };
        if let Err(e) = outcome {
            debug!(room_id = %room_id, error = %e, "command rejected");
            let _ = errors_tx.send(e);
        }
    }

    stop.cancel();
    match forward.await {
        Ok(subscription) => {
            if let Err(e) = subscription.close().await {
                warn!(room_id = %room_id, error = %e, "leaving room after disconnect failed");
            }
        }
        Err(e) => warn!(room_id = %room_id, error = %e, "websocket forwarder panicked"),
    }
}

async fn handle(client: &ClientSession, room_id: RoomId, command: Command) -> ChatResult<()> {
    match command {
        Command::Send(outgoing) => client.send(room_id, outgoing).await.map(drop),
        Command::MarkRead { ids } => client.mark_read(room_id, &ids).await.map(drop),
        Command::Typing => client.start_typing(room_id),
        Command::StopTyping => {
            client.stop_typing(room_id);
            Ok(())
        }
        Command::Heartbeat => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse() {
        let send: Command = serde_json::from_str(r#"{"type":"send","content":"hi","destructive":true}"#).unwrap();
        assert!(matches!(send, Command::Send(Outgoing { destructive: true, .. })));

        let typing: Command = serde_json::from_str(r#"{"type":"typing"}"#).unwrap();
        assert!(matches!(typing, Command::Typing));

        let read: Command = serde_json::from_str(r#"{"type":"mark_read","ids":[]}"#).unwrap();
        assert!(matches!(read, Command::MarkRead { ids } if ids.is_empty()));
    }

    #[test]
    fn pongs_count_as_life_not_commands() {
        assert!(matches!(inbound(WsMessage::Pong(Bytes::new())), Inbound::Alive));
        assert!(matches!(inbound(WsMessage::Close(None)), Inbound::Closed));
        assert!(matches!(
            inbound(WsMessage::Text("{\"type\":\"heartbeat\"}".into())),
            Inbound::Command(Ok(Command::Heartbeat))
        ));
        assert!(matches!(
            inbound(WsMessage::Text("nonsense".into())),
            Inbound::Command(Err(ChatError::InvalidMessage(_)))
        ));
    }

    #[test]
    fn pings_go_out_well_inside_the_heartbeat_timeout() {
        assert_eq!(ping_period(Duration::from_secs(30)), Duration::from_secs(10));
        assert_eq!(ping_period(Duration::from_millis(100)), Duration::from_secs(1));
    }
}
