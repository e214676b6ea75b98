//! Persistence tests: gateway sessions backed by the RocksDB store.

use logos_realtime::codec::{Frame, SyncMessage};
use logos_realtime::connection;
use logos_realtime::{
    AliasLookup, Collaborators, ConnectionRequest, DocumentStore, Gateway, GuestIdentity,
    OpenAccess, Participant, Persistence, StoreConfig,
};
use std::path::Path;
use std::sync::Arc;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

fn gateway_on(store: Arc<DocumentStore>) -> Gateway {
    Gateway::new(Collaborators {
        identity: Arc::new(GuestIdentity),
        lookup: Arc::new(AliasLookup::default()),
        authorization: Arc::new(OpenAccess::default()),
        persistence: store,
    })
}

fn open_store(path: &Path) -> Arc<DocumentStore> {
    Arc::new(DocumentStore::open(StoreConfig::for_testing(path)).unwrap())
}

async fn join(gateway: &Gateway, locator: &str) -> (Participant, connection::ConnectionOutbox) {
    let (handle, outbox) = connection::channel(64);
    let participant = gateway
        .on_connect(handle, &ConnectionRequest::new(format!("/realtime/{locator}")))
        .await
        .unwrap();
    (participant, outbox)
}

fn edit(doc: &Doc, content: &str) -> Vec<u8> {
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text("content");
    let len = text.len(&txn);
    text.insert(&mut txn, len, content);
    txn.encode_update_v1()
}

fn update_frame(update: Vec<u8>) -> Vec<u8> {
    Frame::sync(&SyncMessage::Update(update)).encode()
}

fn text_of(doc: &Doc) -> String {
    let txn = doc.transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

/// Fetch the server's current state into a fresh document via Step1/Step2.
async fn pull(gateway: &Gateway, participant: &Participant, outbox: &mut connection::ConnectionOutbox) -> Doc {
    while outbox.try_recv().is_some() {}
    let doc = Doc::new();
    let step1 = Frame::sync(&SyncMessage::step1(&StateVector::default())).encode();
    gateway.on_message(participant, &step1).await;

    let reply = outbox.try_recv().expect("Step2 reply");
    match Frame::decode(&reply).unwrap() {
        Frame::Sync(payload) => match SyncMessage::decode(&payload).unwrap() {
            SyncMessage::Step2(update) => {
                let mut txn = doc.transact_mut();
                txn.apply_update(Update::decode_v1(&update).unwrap()).unwrap();
            }
            other => panic!("expected Step2, got {other:?}"),
        },
        other => panic!("expected sync frame, got {other:?}"),
    }
    doc
}

#[tokio::test]
async fn test_session_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let client = Doc::new();

    {
        let gateway = gateway_on(open_store(dir.path()));
        let (participant, _outbox) = join(&gateway, "journal").await;
        gateway
            .on_message(&participant, &update_frame(edit(&client, "day one")))
            .await;
        gateway
            .on_message(&participant, &update_frame(edit(&client, ", day two")))
            .await;
        gateway.on_disconnect(participant.id()).await;
    }

    let store = open_store(dir.path());
    let meta = store.load_metadata(AliasLookup::id_for("journal")).unwrap();
    assert_eq!(meta.version, 1);

    let gateway = gateway_on(store);
    let (participant, mut outbox) = join(&gateway, "journal").await;
    let restored = pull(&gateway, &participant, &mut outbox).await;
    assert_eq!(text_of(&restored), "day one, day two");
}

#[tokio::test]
async fn test_each_eviction_writes_a_new_version() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let gateway = gateway_on(store.clone());
    let client = Doc::new();
    let id = AliasLookup::id_for("versions");

    for word in ["a", "b", "c"] {
        let (participant, _outbox) = join(&gateway, "versions").await;
        gateway
            .on_message(&participant, &update_frame(edit(&client, word)))
            .await;
        gateway.on_disconnect(participant.id()).await;
    }
    assert_eq!(store.load_metadata(id).unwrap().version, 3);

    // A visit without edits does not write
    let (participant, _outbox) = join(&gateway, "versions").await;
    gateway.on_disconnect(participant.id()).await;
    assert_eq!(store.load_metadata(id).unwrap().version, 3);

    let content = store.load_latest_content(id).await.unwrap().unwrap();
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(&content).unwrap()).unwrap();
    }
    assert_eq!(text_of(&doc), "abc");
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let gateway = gateway_on(store.clone());

    let (left, _lo) = join(&gateway, "left").await;
    let (right, _ro) = join(&gateway, "right").await;
    gateway
        .on_message(&left, &update_frame(edit(&Doc::new(), "L")))
        .await;
    gateway
        .on_message(&right, &update_frame(edit(&Doc::new(), "R")))
        .await;
    gateway.on_disconnect(left.id()).await;
    gateway.on_disconnect(right.id()).await;

    let mut listed = store.list_documents().unwrap();
    listed.sort();
    let mut expected = vec![AliasLookup::id_for("left"), AliasLookup::id_for("right")];
    expected.sort();
    assert_eq!(listed, expected);

    let (again, mut outbox) = join(&gateway, "left").await;
    assert_eq!(text_of(&pull(&gateway, &again, &mut outbox).await), "L");
}

#[tokio::test]
async fn test_shutdown_flushes_live_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let gateway = gateway_on(store.clone());

    let (participant, _outbox) = join(&gateway, "open").await;
    gateway
        .on_message(&participant, &update_frame(edit(&Doc::new(), "unsaved")))
        .await;
    assert!(!store.document_exists(AliasLookup::id_for("open")).unwrap());

    assert_eq!(gateway.shutdown().await, 1);
    assert!(store.document_exists(AliasLookup::id_for("open")).unwrap());
}
