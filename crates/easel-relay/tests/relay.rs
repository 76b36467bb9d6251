//! Relay behaviour over real sockets, driven with raw WebSocket peers and
//! with the automation-side `RelayClient`.

use easel_core::{
    ClientConfig, CommandReply, CommandRequest, Envelope, EnvelopeKind, Inbound, ProgressStatus,
    ProgressUpdate, RelayClient, RelayError,
};
use easel_relay::{serve, RelayConfig, RelayState};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Relay {
    addr: SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

impl Relay {
    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

async fn start_relay() -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
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
    Relay {
        addr,
        _shutdown: tx,
    }
}

async fn open(relay: &Relay) -> Socket {
    let (ws, _) = connect_async(relay.url()).await.unwrap();
    ws
}

async fn send(ws: &mut Socket, envelope: Envelope) {
    ws.send(Message::Text(envelope.to_text().unwrap()))
        .await
        .unwrap();
}

async fn recv(ws: &mut Socket) -> Envelope {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return Envelope::parse(&text).unwrap();
        }
    }
}

/// Open a socket and join `channel`, consuming the welcome and the ack.
async fn member(relay: &Relay, channel: &str) -> Socket {
    let mut ws = open(relay).await;
    assert_eq!(
        recv(&mut ws).await.classify(),
        Inbound::Notice("Please join a channel to start chatting".into())
    );
    send(&mut ws, Envelope::join(channel, None)).await;
    assert_eq!(
        recv(&mut ws).await.classify(),
        Inbound::Notice(format!("Joined channel: {channel}"))
    );
    ws
}

async fn next_request(ws: &mut Socket) -> CommandRequest {
    loop {
        if let Inbound::Request(request) = recv(ws).await.classify() {
            return request;
        }
    }
}

async fn reply(ws: &mut Socket, channel: &str, reply: CommandReply) {
    send(ws, Envelope::reply(channel, &reply).unwrap()).await;
}

async fn client(relay: &Relay, window: Duration) -> RelayClient {
    let config = ClientConfig::builder()
        .url(relay.url())
        .request_timeout(window)
        .auto_reconnect(false)
        .build()
        .unwrap();
    RelayClient::connect(config).await.unwrap()
}

#[tokio::test]
async fn test_join_is_acknowledged() {
    let relay = start_relay().await;
    let _ws = member(&relay, "abcd1234").await;
}

#[tokio::test]
async fn test_message_reaches_peer_but_not_sender() {
    let relay = start_relay().await;
    let mut sandbox = member(&relay, "room").await;
    let mut caller = member(&relay, "room").await;
    assert_eq!(
        recv(&mut sandbox).await.classify(),
        Inbound::Notice("A new user has joined the channel".into())
    );

    let request = CommandRequest::new("r1", "echo", json!({"v": 1}));
    send(&mut caller, Envelope::request("room", &request).unwrap()).await;

    let forwarded = recv(&mut sandbox).await;
    assert_eq!(forwarded.kind, Some(EnvelopeKind::Broadcast));
    assert_eq!(forwarded.classify(), Inbound::Request(request));

    // Nothing comes back to the caller.
    assert!(timeout(Duration::from_millis(200), caller.next())
        .await
        .is_err());
}

#[tokio::test]
async fn test_channels_are_isolated() {
    let relay = start_relay().await;
    let mut a = member(&relay, "one").await;
    let mut b = member(&relay, "two").await;
    let _a2 = member(&relay, "one").await;
    let _ = recv(&mut a).await; // peer joined notice

    let request = CommandRequest::new("r1", "ping", Value::Null);
    send(&mut a, Envelope::request("one", &request).unwrap()).await;
    assert!(timeout(Duration::from_millis(200), b.next()).await.is_err());
}

#[tokio::test]
async fn test_message_before_join_is_rejected() {
    let relay = start_relay().await;
    let mut ws = open(&relay).await;
    let _welcome = recv(&mut ws).await;

    let request = CommandRequest::new("r1", "ping", Value::Null);
    send(&mut ws, Envelope::request("room", &request).unwrap()).await;
    assert_eq!(
        recv(&mut ws).await.classify(),
        Inbound::RelayError("You must join a channel first".into())
    );
}

#[tokio::test]
async fn test_invalid_json_is_rejected() {
    let relay = start_relay().await;
    let mut ws = open(&relay).await;
    let _welcome = recv(&mut ws).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    assert_eq!(
        recv(&mut ws).await.classify(),
        Inbound::RelayError("Invalid message format".into())
    );
}

#[tokio::test]
async fn test_health_endpoint() {
    let relay = start_relay().await;
    let _ws = member(&relay, "room").await;

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut body = String::new();
    stream.read_to_string(&mut body).await.unwrap();

    assert!(body.starts_with("HTTP/1.1 200"));
    assert!(body.contains(r#""status":"healthy""#));
    assert!(body.contains(r#""channels":1"#));
}

#[tokio::test]
async fn test_client_round_trip() {
    let relay = start_relay().await;
    let mut sandbox = member(&relay, "room").await;

    let client = client(&relay, Duration::from_secs(5)).await;
    client.join_channel("room").await.unwrap();
    assert_eq!(client.channel().as_deref(), Some("room"));

    let responder = tokio::spawn(async move {
        let request = next_request(&mut sandbox).await;
        assert_eq!(request.command, "echo");
        reply(
            &mut sandbox,
            "room",
            CommandReply::success(request.id, request.params),
        )
        .await;
        sandbox
    });

    let result = client.send_command("echo", json!({"v": 1})).await.unwrap();
    assert_eq!(result, json!({"v": 1}));
    assert_eq!(client.pending_calls(), 0);

    responder.await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn test_client_remote_error() {
    let relay = start_relay().await;
    let mut sandbox = member(&relay, "room").await;
    let client = client(&relay, Duration::from_secs(5)).await;
    client.join_channel("room").await.unwrap();

    tokio::spawn(async move {
        let request = next_request(&mut sandbox).await;
        reply(&mut sandbox, "room", CommandReply::failure(request.id, "boom")).await;
        sandbox
    });

    let err = client.send_command("fail", Value::Null).await.unwrap_err();
    assert!(matches!(err, RelayError::Remote(ref m) if m == "boom"));
    client.close().await;
}

#[tokio::test]
async fn test_client_out_of_order_replies() {
    let relay = start_relay().await;
    let mut sandbox = member(&relay, "room").await;
    let client = client(&relay, Duration::from_secs(5)).await;
    client.join_channel("room").await.unwrap();

    tokio::spawn(async move {
        let first = next_request(&mut sandbox).await;
        let second = next_request(&mut sandbox).await;
        for request in [second, first] {
            let echoed = json!({"command": request.command});
            reply(&mut sandbox, "room", CommandReply::success(request.id, echoed)).await;
        }
        sandbox
    });

    let a = client.send_command("first", Value::Null);
    let b = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.send_command("second", Value::Null).await
    };
    let (a, b) = tokio::join!(a, b);
    assert_eq!(a.unwrap(), json!({"command": "first"}));
    assert_eq!(b.unwrap(), json!({"command": "second"}));
    client.close().await;
}

#[tokio::test]
async fn test_client_times_out_without_peer() {
    let relay = start_relay().await;
    let client = client(&relay, Duration::from_millis(200)).await;
    client.join_channel("empty").await.unwrap();

    let err = client.send_command("ping", Value::Null).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(client.pending_calls(), 0);
    client.close().await;
}

#[tokio::test]
async fn test_progress_extends_deadline() {
    let relay = start_relay().await;
    let mut sandbox = member(&relay, "room").await;
    let client = client(&relay, Duration::from_millis(500)).await;
    client.join_channel("room").await.unwrap();
    let mut progress = client.subscribe_progress();

    tokio::spawn(async move {
        let request = next_request(&mut sandbox).await;
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let update = ProgressUpdate::new(
                &request.id,
                &request.command,
                ProgressStatus::InProgress,
                "working",
            );
            send(&mut sandbox, Envelope::progress("room", &update).unwrap()).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        reply(&mut sandbox, "room", CommandReply::success(request.id, json!("done"))).await;
        sandbox
    });

    let result = client.send_command("slow", Value::Null).await.unwrap();
    assert_eq!(result, json!("done"));

    let update = progress.try_recv().unwrap();
    assert_eq!(update.status, ProgressStatus::InProgress);
    client.close().await;
}

#[tokio::test]
async fn test_close_rejects_pending_calls() {
    let relay = start_relay().await;
    let client = client(&relay, Duration::from_secs(30)).await;
    client.join_channel("room").await.unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.send_command("ping", Value::Null).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.pending_calls(), 1);

    client.close().await;
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, RelayError::Disconnected));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_send_before_join_fails() {
    let relay = start_relay().await;
    let client = client(&relay, Duration::from_secs(1)).await;
    let err = client.send_command("ping", Value::Null).await.unwrap_err();
    assert!(matches!(err, RelayError::NotConnected(_)));
    client.close().await;
}

type Accepted = WebSocketStream<TcpStream>;

/// Accept one socket on `listener` and acknowledge its correlated join.
async fn accept_and_ack(listener: &TcpListener) -> Accepted {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    loop {
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("socket closed before join");
        };
        let join = Envelope::parse(&text).unwrap();
        if join.kind != Some(EnvelopeKind::Join) {
            continue;
        }
        let channel = join.channel.unwrap_or_default();
        let ack = Envelope::system(
            Some(channel.clone()),
            json!({ "id": join.id, "result": format!("Connected to channel: {channel}") }),
        );
        ws.send(Message::Text(ack.to_text().unwrap())).await.unwrap();
        return ws;
    }
}

#[tokio::test]
async fn test_lost_socket_without_reconnect_fails_pending_calls() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut ws = accept_and_ack(&listener).await;
        // Hang up as soon as a command arrives.
        while let Some(Ok(frame)) = ws.next().await {
            if matches!(frame, Message::Text(_)) {
                break;
            }
        }
        drop(ws);
    });

    let config = ClientConfig::builder()
        .url(format!("ws://{addr}"))
        .request_timeout(Duration::from_secs(5))
        .auto_reconnect(false)
        .build()
        .unwrap();
    let client = RelayClient::connect(config).await.unwrap();
    client.join_channel("room").await.unwrap();

    let started = tokio::time::Instant::now();
    let err = client.send_command("ping", Value::Null).await.unwrap_err();
    assert!(matches!(err, RelayError::Disconnected), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(client.pending_calls(), 0);

    assert!(client.is_closed());
    assert!(!client.is_connected());
    let err = client.send_command("ping", Value::Null).await.unwrap_err();
    assert!(matches!(err, RelayError::Disconnected));
}

#[tokio::test]
async fn test_rejoin_precedes_commands_after_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (first_frame_tx, first_frame_rx) = oneshot::channel::<Envelope>();
    tokio::spawn(async move {
        let ws = accept_and_ack(&listener).await;
        drop(ws);

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Text(text) = frame {
                let _ = first_frame_tx.send(Envelope::parse(&text).unwrap());
                break;
            }
        }
        // Keep the socket open while the test inspects the frame.
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let config = ClientConfig::builder()
        .url(format!("ws://{addr}"))
        .request_timeout(Duration::from_millis(200))
        .reconnect_delay(Duration::from_millis(50), Duration::from_millis(100))
        .build()
        .unwrap();
    let client = RelayClient::connect(config).await.unwrap();
    client.join_channel("room").await.unwrap();

    // Keep commands flowing so one is ready the moment the socket reopens.
    let sender = {
        let client = client.clone();
        tokio::spawn(async move {
            loop {
                let _ = client.send_command("ping", Value::Null).await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let first = timeout(Duration::from_secs(5), first_frame_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.kind, Some(EnvelopeKind::Join));
    assert_eq!(first.channel.as_deref(), Some("room"));

    sender.abort();
    client.close().await;
}
