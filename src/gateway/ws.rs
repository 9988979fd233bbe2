//! WebSocket 传输
//!
//! 客户端发送 `{"type":"subscribe","projectId":"..."}` 后开始接收该项目的事件信封；
//! 中枢心跳转成 Ping 帧，任何入站帧（含 Pong）都刷新连接存活时间。

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::event::ClientMessage;
use super::hub::{HubMessage, NotificationHub, Subscription};

/// 监听并服务 WebSocket 连接，直到 shutdown 被触发
pub async fn serve(
    listener: TcpListener,
    hub: Arc<NotificationHub>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "websocket listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("websocket listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let hub = Arc::clone(&hub);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, hub, shutdown).await {
                                tracing::warn!(%addr, error = %e, "websocket connection error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "websocket accept error");
                    }
                }
            }
        }
    }
}

async fn next_hub_message(subscription: &mut Option<Subscription>) -> Option<HubMessage> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// 单个连接的读写循环
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    hub: Arc<NotificationHub>,
    shutdown: CancellationToken,
) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let connection_id = format!("ws_{}_{}", addr, uuid::Uuid::new_v4());
    let mut subscription: Option<Subscription> = None;
    tracing::info!(%addr, connection_id = %connection_id, "websocket connected");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                break;
            }
            outbound = next_hub_message(&mut subscription) => {
                let frame = match outbound {
                    Some(HubMessage::Event(event)) => WsMessage::Text(event.to_json()),
                    Some(HubMessage::Heartbeat) => WsMessage::Ping(Vec::new()),
                    None => {
                        // 订阅被中枢关闭（被替换、被回收或中枢关闭）
                        tracing::debug!(connection_id = %connection_id, "subscription closed by hub");
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                };
                if ws_tx.send(frame).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                let msg = match inbound {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::warn!(connection_id = %connection_id, error = %e, "websocket receive error");
                        break;
                    }
                    None => break,
                };
                hub.touch(&connection_id);

                match msg {
                    WsMessage::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Subscribe { project_id }) => {
                            tracing::debug!(connection_id = %connection_id, project_id = %project_id, "subscribe");
                            subscription = Some(hub.subscribe(&project_id, &connection_id));
                        }
                        Ok(ClientMessage::Unsubscribe) => {
                            hub.unsubscribe(&connection_id);
                            subscription = None;
                        }
                        Ok(ClientMessage::Ping) => {}
                        Err(e) => {
                            tracing::debug!(connection_id = %connection_id, error = %e, "ignoring malformed client message");
                        }
                    },
                    WsMessage::Ping(payload) => {
                        if ws_tx.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    hub.unsubscribe(&connection_id);
    tracing::info!(%addr, connection_id = %connection_id, "websocket disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Event, EventType};
    use std::time::Duration;

    async fn start_server(hub: Arc<NotificationHub>) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        tokio::spawn(serve(listener, hub, token.clone()));
        (addr, token)
    }

    async fn next_text<S>(rx: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), rx.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("ws error");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn wait_for_subscriber(hub: &NotificationHub, project_id: &str) {
        for _ in 0..100 {
            if hub.subscriber_count(project_id) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscriber never registered");
    }

    #[tokio::test]
    async fn test_subscribe_then_receive_project_events() {
        let hub = Arc::new(NotificationHub::with_heartbeat(Duration::from_secs(30), 16));
        let (addr, token) = start_server(hub.clone()).await;

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        let (mut tx, mut rx) = ws.split();
        tx.send(WsMessage::Text(
            r#"{"type":"subscribe","projectId":"proj_1"}"#.to_string(),
        ))
        .await
        .unwrap();

        let established = next_text(&mut rx).await;
        assert_eq!(established["type"], "connection_established");

        wait_for_subscriber(&hub, "proj_1").await;
        hub.publish(
            "proj_2",
            Event::new(EventType::ActivityAdded, "proj_2", serde_json::json!({})),
        );
        hub.publish(
            "proj_1",
            Event::new(EventType::ActivityAdded, "proj_1", serde_json::json!({"n": 1})),
        );
        let event = next_text(&mut rx).await;
        assert_eq!(event["projectId"], "proj_1");
        assert_eq!(event["payload"]["n"], 1);

        token.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_removes_subscription() {
        let hub = Arc::new(NotificationHub::with_heartbeat(Duration::from_secs(30), 16));
        let (addr, token) = start_server(hub.clone()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        ws.send(WsMessage::Text(
            r#"{"type":"subscribe","projectId":"proj_1"}"#.to_string(),
        ))
        .await
        .unwrap();
        wait_for_subscriber(&hub, "proj_1").await;

        ws.close(None).await.unwrap();
        for _ in 0..100 {
            if hub.subscriber_count("proj_1") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.subscriber_count("proj_1"), 0);
        token.cancel();
    }
}
