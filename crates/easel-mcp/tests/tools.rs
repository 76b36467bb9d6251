//! MCP tools against a live relay and sandbox.

use easel_core::ClientConfig;
use easel_mcp::{EaselConfig, EaselServer};
use easel_plugin::{handlers, ChannelTransport, PluginConfig, Registry};
use easel_relay::{serve, RelayConfig, RelayState};
use rmcp::model::CallToolResult;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

async fn start_relay() -> (u16, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let config = RelayConfig::default();
        let shutdown = async move {
            let _ = rx.await;
        };
        serve(listener, RelayState::new(), &config, shutdown)
            .await
            .unwrap();
    });
    (port, tx)
}

fn args(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn body(result: &CallToolResult) -> Value {
    let text = result
        .content
        .first()
        .and_then(|c| c.as_text())
        .map(|t| t.text.clone())
        .unwrap_or_default();
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[tokio::test]
async fn test_tools_drive_sandbox() {
    let (port, _relay) = start_relay().await;

    let registry = handlers::register_builtin(Registry::builder()).unwrap().build();
    let transport = ChannelTransport::new(PluginConfig::default(), registry);
    let channel = transport.connect(port).await.unwrap();
    transport.wait_joined().await.unwrap();

    let config = EaselConfig {
        client: ClientConfig::builder()
            .port(port)
            .request_timeout(Duration::from_secs(5))
            .build()
            .unwrap(),
        ..Default::default()
    };
    let server = EaselServer::new(config);

    let joined = server
        .run_tool("join_channel", args(json!({"channel": channel})))
        .await;
    assert_ne!(joined.is_error, Some(true), "{:?}", body(&joined));

    let status = body(&server.run_tool("connection_status", None).await);
    assert_eq!(status["connected"], json!(true));
    assert_eq!(status["channel"], json!(channel));

    let echoed = server
        .run_tool(
            "send_command",
            args(json!({"command": "echo", "params": {"v": 1}})),
        )
        .await;
    assert_eq!(body(&echoed)["result"], json!({"v": 1}));

    let scanned = server
        .run_tool(
            "send_command",
            args(json!({"command": "scan_items", "params": {"items": [1, 2, 3], "chunkSize": 1}})),
        )
        .await;
    assert_eq!(body(&scanned)["result"], json!({"processed": 3, "chunks": 3}));

    // The progress listener runs in its own task.
    let mut progress = Value::Null;
    for _ in 0..50 {
        progress = body(&server.run_tool("get_progress", None).await);
        if progress["updates"][0]["status"] == json!("completed") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(progress["updates"][0]["commandType"], json!("scan_items"));
    assert_eq!(progress["updates"][0]["status"], json!("completed"));

    let failed = server
        .run_tool("send_command", args(json!({"command": "nope"})))
        .await;
    assert_eq!(failed.is_error, Some(true));
    assert!(body(&failed)
        .as_str()
        .unwrap()
        .contains("Unknown command: nope"));

    let timed_out = server
        .run_tool(
            "send_command",
            args(json!({"command": "delay", "params": {"ms": 1000}, "timeoutMs": 100})),
        )
        .await;
    assert_eq!(timed_out.is_error, Some(true));
    assert!(body(&timed_out).as_str().unwrap().contains("timed out"));

    server.shutdown().await;
    transport.disconnect().await;
}

#[tokio::test]
async fn test_send_command_without_relay() {
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = unused.local_addr().unwrap().port();
    drop(unused);

    let config = EaselConfig {
        client: ClientConfig::builder()
            .port(port)
            .connect_timeout(Duration::from_secs(1))
            .build()
            .unwrap(),
        ..Default::default()
    };
    let server = EaselServer::new(config);

    let result = server
        .run_tool("send_command", args(json!({"command": "ping"})))
        .await;
    assert_eq!(result.is_error, Some(true));
    assert!(body(&result)
        .as_str()
        .unwrap()
        .starts_with("Failed to connect to relay"));
}

/// Relay stand-in: acks correlated joins and echoes commands back. The
/// first connection is cut right after its join.
async fn flaky_relay(listener: TcpListener) {
    use easel_core::{CommandReply, Envelope, EnvelopeKind, Inbound};
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    for connection in 0.. {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            continue;
        };
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            let envelope = Envelope::parse(&text).unwrap();
            if envelope.kind == Some(EnvelopeKind::Join) {
                let channel = envelope.channel.clone().unwrap_or_default();
                if let Some(id) = envelope.id {
                    let ack = Envelope::system(
                        Some(channel.clone()),
                        json!({"id": id, "result": format!("Connected to channel: {channel}")}),
                    );
                    ws.send(Message::Text(ack.to_text().unwrap())).await.unwrap();
                }
                if connection == 0 {
                    break;
                }
                continue;
            }
            let channel = envelope.channel.clone().unwrap_or_default();
            if let Inbound::Request(request) = envelope.classify() {
                let reply = CommandReply::success(request.id, request.params);
                let frame = Envelope::reply(channel, &reply).unwrap();
                ws.send(Message::Text(frame.to_text().unwrap())).await.unwrap();
            }
        }
    }
}

#[tokio::test]
async fn test_closed_client_is_replaced() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(flaky_relay(listener));

    let config = EaselConfig {
        client: ClientConfig::builder()
            .port(port)
            .request_timeout(Duration::from_secs(2))
            .auto_reconnect(false)
            .build()
            .unwrap(),
        ..Default::default()
    };
    let server = EaselServer::new(config);

    let joined = server
        .run_tool("join_channel", args(json!({"channel": "room"})))
        .await;
    assert_ne!(joined.is_error, Some(true), "{:?}", body(&joined));

    // The stand-in hangs up after the join; wait for the client to notice.
    let mut closed = false;
    for _ in 0..100 {
        let status = body(&server.run_tool("connection_status", None).await);
        if status["connected"] == json!(false) {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(closed, "first connection never dropped");

    let echoed = server
        .run_tool(
            "send_command",
            args(json!({"command": "echo", "params": {"v": 2}})),
        )
        .await;
    assert_ne!(echoed.is_error, Some(true), "{:?}", body(&echoed));
    assert_eq!(body(&echoed)["result"], json!({"v": 2}));

    let status = body(&server.run_tool("connection_status", None).await);
    assert_eq!(status["connected"], json!(true));
    assert_eq!(status["channel"], json!("room"));

    server.shutdown().await;
}
