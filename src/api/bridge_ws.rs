// 工具桥 WebSocket：编辑器客户端按项目加入房间，接收工具调用并回传结果。
use crate::api::ws_helpers::{
    parse_payload, send_ws_error, send_ws_pong, send_ws_ready, BridgeWsQuery,
};
use crate::api::ws_log::{
    log_ws_close, log_ws_message, log_ws_open, log_ws_parse_error, log_ws_room, WsConnMeta,
};
use crate::bridge::protocol::{
    Envelope, RoomPayload, ToolResultMessage, MSG_JOIN, MSG_LEAVE, MSG_PING, MSG_TOOL_RESULT,
};
use crate::bridge::{normalize_id, now_ts, ToolBridge};
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::{routing::get, Router};
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

const BRIDGE_WS_ENDPOINT: &str = "/api/bridge/ws";

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(BRIDGE_WS_ENDPOINT, get(bridge_ws))
}

async fn bridge_ws(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BridgeWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let config = state.config_store.get().await;
    let connection_id = format!("bws_{}", Uuid::new_v4().simple());
    let project_id = normalize_id(query.project_id);
    let meta = WsConnMeta::from_headers(&headers);
    log_ws_open(
        BRIDGE_WS_ENDPOINT,
        &connection_id,
        project_id.as_deref(),
        &meta,
    );
    let max_bytes = config.bridge.max_message_bytes;
    let queue_size = config.bridge.outbound_queue_size.max(1);
    ws.max_message_size(max_bytes)
        .max_frame_size(max_bytes)
        .on_upgrade(move |socket| {
            handle_bridge_ws(socket, state, connection_id, project_id, queue_size)
        })
}

async fn handle_bridge_ws(
    socket: WebSocket,
    state: Arc<AppState>,
    connection_id: String,
    project_id: Option<String>,
    queue_size: usize,
) {
    let started = Instant::now();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(queue_size);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let bridge = state.bridge.clone();
    let evicted = bridge.rooms().register_connection(&connection_id);
    let mut joined = HashSet::new();
    if let Some(project_id) = project_id.as_deref() {
        join_room(&bridge, &connection_id, project_id, &out_tx, &mut joined);
    }
    // ready 在入房之后发送，客户端收到即可接收工具调用。
    let _ = send_ws_ready(&out_tx, &connection_id, project_id.as_deref(), now_ts()).await;

    let mut close_code = None;
    let mut close_reason = None;
    loop {
        let next = tokio::select! {
            frame = ws_receiver.next() => frame,
            _ = evicted.cancelled() => {
                close_reason = Some("evicted: outbound queue full".to_string());
                break;
            }
        };
        let Some(Ok(message)) = next else {
            break;
        };
        match message {
            Message::Text(text) => {
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(err) => {
                        let error = format!("invalid payload: {err}");
                        log_ws_parse_error(BRIDGE_WS_ENDPOINT, &connection_id, &error);
                        let _ = send_ws_error(&out_tx, "INVALID_JSON", error).await;
                        continue;
                    }
                };
                let kind = envelope.kind.trim().to_ascii_lowercase();
                match kind.as_str() {
                    MSG_TOOL_RESULT => {
                        let message: ToolResultMessage = match parse_payload(envelope.payload) {
                            Ok(value) => value,
                            Err(err) => {
                                let _ = send_ws_error(&out_tx, err.code(), err.message()).await;
                                continue;
                            }
                        };
                        log_ws_message(
                            BRIDGE_WS_ENDPOINT,
                            &connection_id,
                            MSG_TOOL_RESULT,
                            Some(&message.request_id),
                        );
                        bridge.handle_result(message, Some(&connection_id));
                    }
                    MSG_JOIN | MSG_LEAVE => {
                        let room: RoomPayload = match parse_payload(envelope.payload) {
                            Ok(value) => value,
                            Err(err) => {
                                let _ = send_ws_error(&out_tx, err.code(), err.message()).await;
                                continue;
                            }
                        };
                        let Some(room_id) = normalize_id(Some(room.project_id)) else {
                            let _ = send_ws_error(
                                &out_tx,
                                "INVALID_PAYLOAD",
                                "projectId required".to_string(),
                            )
                            .await;
                            continue;
                        };
                        if kind == MSG_JOIN {
                            join_room(&bridge, &connection_id, &room_id, &out_tx, &mut joined);
                        } else {
                            leave_room(&bridge, &connection_id, &room_id, &mut joined);
                        }
                    }
                    MSG_PING => {
                        let _ = send_ws_pong(&out_tx).await;
                    }
                    _ => {
                        let _ = send_ws_error(
                            &out_tx,
                            "UNSUPPORTED_TYPE",
                            format!("unsupported message type: {}", envelope.kind),
                        )
                        .await;
                    }
                }
            }
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    close_code = Some(u16::from(frame.code));
                    close_reason = Some(frame.reason.as_str().to_string());
                }
                break;
            }
            _ => {}
        }
    }

    bridge.rooms().forget_connection(&connection_id);
    // 成员也可能已因发送失败被房间剔除，以房间当前人数为准。
    let mut emptied = 0;
    for project_id in joined {
        if bridge.rooms().room_size(&project_id) == 0 {
            emptied += 1;
            bridge.fail_project(&project_id);
        }
    }
    log_ws_close(
        BRIDGE_WS_ENDPOINT,
        &connection_id,
        close_code,
        close_reason.as_deref(),
        emptied,
        Some(started.elapsed().as_millis()),
    );

    drop(out_tx);
    if evicted.is_cancelled() {
        // 被驱逐的连接写队列已满，不再等待排空。
        writer.abort();
    } else {
        let _ = writer.await;
    }
}

fn join_room(
    bridge: &ToolBridge,
    connection_id: &str,
    project_id: &str,
    out_tx: &mpsc::Sender<Message>,
    joined: &mut HashSet<String>,
) {
    let members = bridge
        .rooms()
        .join(project_id, connection_id, out_tx.clone());
    joined.insert(project_id.to_string());
    log_ws_room(BRIDGE_WS_ENDPOINT, connection_id, MSG_JOIN, project_id, members);
}

fn leave_room(
    bridge: &ToolBridge,
    connection_id: &str,
    project_id: &str,
    joined: &mut HashSet<String>,
) {
    joined.remove(project_id);
    let Some(remaining) = bridge.rooms().leave(project_id, connection_id) else {
        return;
    };
    log_ws_room(BRIDGE_WS_ENDPOINT, connection_id, MSG_LEAVE, project_id, remaining);
    if remaining == 0 {
        bridge.fail_project(project_id);
    }
}
