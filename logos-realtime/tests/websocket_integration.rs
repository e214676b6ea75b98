//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a server on a free port and talks to it with raw
//! tokio-tungstenite clients.

use futures_util::{SinkExt, StreamExt};
use logos_realtime::codec::{ControlMessage, Frame, SyncMessage};
use logos_realtime::{
    AliasLookup, Collaborators, Gateway, GatewayServer, GuestIdentity, MemoryStore, OpenAccess,
    ServerConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update, WriteTxn};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    gateway: Arc<Gateway>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        timeout(Duration::from_secs(2), self.task)
            .await
            .expect("server should stop")
            .unwrap();
    }
}

/// Start a server on a free port.
async fn start_test_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(Gateway::new(Collaborators {
        identity: Arc::new(GuestIdentity),
        lookup: Arc::new(AliasLookup::default()),
        authorization: Arc::new(OpenAccess::default()),
        persistence: store.clone(),
    }));
    let config = ServerConfig {
        bind_addr: addr.to_string(),
        outbound_capacity: 64,
        heartbeat_interval_secs: 30,
        storage_path: None,
    };
    let server = GatewayServer::new(config, gateway.clone());
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    TestServer {
        addr,
        store,
        gateway,
        shutdown: Some(tx),
        task,
    }
}

async fn connect(server: &TestServer, path: &str) -> Ws {
    let (ws, _) = connect_async(server.url(path)).await.unwrap();
    ws
}

/// Next protocol frame, skipping transport pings.
async fn next_frame(ws: &mut Ws) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Binary(data) => return Frame::decode(&data).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
}

/// Waits for the server to close the connection.
async fn expect_closed(ws: &mut Ws) {
    loop {
        match timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
            Some(Ok(Message::Binary(data))) => {
                panic!("unexpected protocol frame {:?}", Frame::decode(&data))
            }
            Some(Ok(_)) => continue,
        }
    }
}

async fn send(ws: &mut Ws, frame: Vec<u8>) {
    ws.send(Message::Binary(frame.into())).await.unwrap();
}

fn edit(doc: &Doc, content: &str) -> Vec<u8> {
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text("content");
    text.insert(&mut txn, 0, content);
    txn.encode_update_v1()
}

fn text_of(doc: &Doc) -> String {
    let txn = doc.transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

fn apply(doc: &Doc, update: &[u8]) {
    let mut txn = doc.transact_mut();
    txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
}

#[tokio::test]
async fn test_connect_receives_greeting() {
    let server = start_test_server().await;
    let mut ws = connect(&server, "/realtime/notes").await;

    match next_frame(&mut ws).await {
        Frame::Sync(payload) => {
            assert!(matches!(SyncMessage::decode(&payload).unwrap(), SyncMessage::Step1(_)));
        }
        other => panic!("expected Step1 greeting, got {other:?}"),
    }
    assert_eq!(server.gateway.registry().connection_count(), 1);
    server.stop().await;
}

#[tokio::test]
async fn test_update_reaches_other_client() {
    let server = start_test_server().await;
    let mut alice = connect(&server, "/realtime/notes").await;
    let mut bob = connect(&server, "/realtime/notes").await;
    next_frame(&mut alice).await;
    next_frame(&mut bob).await;

    let alice_doc = Doc::new();
    let update = edit(&alice_doc, "over the wire");
    send(&mut alice, Frame::sync(&SyncMessage::Update(update)).encode()).await;

    let bob_doc = Doc::new();
    match next_frame(&mut bob).await {
        Frame::Sync(payload) => match SyncMessage::decode(&payload).unwrap() {
            SyncMessage::Update(update) => apply(&bob_doc, &update),
            other => panic!("expected update, got {other:?}"),
        },
        other => panic!("expected sync frame, got {other:?}"),
    }
    assert_eq!(text_of(&bob_doc), "over the wire");
    server.stop().await;
}

#[tokio::test]
async fn test_step1_handshake_over_the_wire() {
    let server = start_test_server().await;
    let mut alice = connect(&server, "/realtime/notes").await;
    next_frame(&mut alice).await;
    let alice_doc = Doc::new();
    send(
        &mut alice,
        Frame::sync(&SyncMessage::Update(edit(&alice_doc, "history"))).encode(),
    )
    .await;

    let mut carol = connect(&server, "/realtime/notes?session=2").await;
    next_frame(&mut carol).await;
    let carol_doc = Doc::new();
    let sv = carol_doc.transact().state_vector();
    send(&mut carol, Frame::sync(&SyncMessage::step1(&sv)).encode()).await;

    match next_frame(&mut carol).await {
        Frame::Sync(payload) => match SyncMessage::decode(&payload).unwrap() {
            SyncMessage::Step2(diff) => apply(&carol_doc, &diff),
            other => panic!("expected Step2, got {other:?}"),
        },
        other => panic!("expected sync frame, got {other:?}"),
    }
    assert_eq!(text_of(&carol_doc), "history");
    server.stop().await;
}

#[tokio::test]
async fn test_invalid_path_is_closed_without_frames() {
    let server = start_test_server().await;
    let mut ws = connect(&server, "/realtime/").await;
    expect_closed(&mut ws).await;

    assert_eq!(server.gateway.registry().session_count(), 0);
    assert_eq!(server.gateway.stats().connections_rejected, 1);
    server.stop().await;
}

#[tokio::test]
async fn test_control_ping_gets_pong() {
    let server = start_test_server().await;
    let mut ws = connect(&server, "/realtime/notes").await;
    next_frame(&mut ws).await;

    send(&mut ws, Frame::control(&ControlMessage::Ping).encode()).await;
    assert_eq!(next_frame(&mut ws).await, Frame::control(&ControlMessage::Pong));
    server.stop().await;
}

#[tokio::test]
async fn test_last_client_leaving_persists_document() {
    let server = start_test_server().await;
    let mut ws = connect(&server, "/realtime/kept").await;
    next_frame(&mut ws).await;

    let doc = Doc::new();
    send(&mut ws, Frame::sync(&SyncMessage::Update(edit(&doc, "saved"))).encode()).await;
    ws.close(None).await.unwrap();

    let id = AliasLookup::id_for("kept");
    timeout(Duration::from_secs(2), async {
        while !server.store.contains(id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("document should be flushed after the last disconnect");
    assert_eq!(server.gateway.registry().session_count(), 0);
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_sends_notice_and_flushes() {
    let server = start_test_server().await;
    let mut ws = connect(&server, "/realtime/live").await;
    next_frame(&mut ws).await;

    let doc = Doc::new();
    send(&mut ws, Frame::sync(&SyncMessage::Update(edit(&doc, "in flight"))).encode()).await;
    // Ping round trip guarantees the update was handled before shutdown
    send(&mut ws, Frame::control(&ControlMessage::Ping).encode()).await;
    assert_eq!(next_frame(&mut ws).await, Frame::control(&ControlMessage::Pong));

    let store = server.store.clone();
    server.stop().await;

    assert_eq!(
        next_frame(&mut ws).await,
        Frame::control(&ControlMessage::ShutdownNotice)
    );
    expect_closed(&mut ws).await;
    assert!(store.contains(AliasLookup::id_for("live")));
}
