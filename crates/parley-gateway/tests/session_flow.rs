use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::extract::ws::Message;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use parley_db::queries::LogTable;
use parley_db::{ChatStore, Database};
use parley_gateway::codec::{self, FrameFormat};
use parley_gateway::connection::{ConnectRequest, GroupParams, PeerParams, run_session};
use parley_gateway::session::{ConnectionHandle, Outgoing};
use parley_gateway::{GatewayConfig, Hub};
use parley_media::{ImageSet, MediaError, MediaStore, VideoPlayback};
use parley_types::events::{ContentMessage, OutboundMessage};
use parley_types::models::{ChatLogRecord, ContentKind, GroupSnapshot, UserProfile};
use parley_types::{Code, Identity};

// ── fixtures ───────────────────────────────────────────────────────────

fn seeded_db() -> Arc<Database> {
    let db = Database::open_in_memory().unwrap();
    db.create_user("u1", "Ana", Some("ana@example.com"), Some("tok-1")).unwrap();
    db.create_user("u2", "Bo", None, None).unwrap();
    db.create_user("u3", "Cy", None, Some("tok-3")).unwrap();
    db.create_group("g1", "Friends").unwrap();
    for member in ["u1", "u2", "u3"] {
        db.add_group_member("g1", member).unwrap();
    }
    Arc::new(db)
}

#[derive(Default)]
struct FakeMedia {
    fail: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeMedia {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn record(&self, call: String) -> Result<(), MediaError> {
        self.calls.lock().unwrap().push(call);
        if self.fail {
            return Err(MediaError::Rejected {
                what: "upload",
                status: 503,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MediaStore for FakeMedia {
    async fn store_video(&self, conversation_key: &str, title: &str, content: Bytes) -> Result<VideoPlayback, MediaError> {
        self.record(format!("video {} {} {}", conversation_key, title, content.len()))?;
        Ok(VideoPlayback {
            content_id: format!("7${}", title),
            url: format!("https://cdn.test/{}/{}", conversation_key, title),
            thumbnail_url: "https://cdn.test/poster.jpg".into(),
        })
    }

    async fn store_images(&self, images: Vec<Bytes>, filenames: Vec<String>) -> Result<ImageSet, MediaError> {
        self.record(format!("images {}", images.len()))?;
        let urls: Vec<String> = filenames.iter().map(|f| format!("https://cdn.test/img/{}", f)).collect();
        Ok(ImageSet {
            content_id: "batch-1".into(),
            thumbnails: urls.iter().map(|u| format!("{}?thumb", u)).collect(),
            urls,
        })
    }

    async fn store_file(&self, content: Bytes, filename: &str) -> Result<String, MediaError> {
        self.record(format!("file {} {}", filename, content.len()))?;
        Ok(format!("https://cdn.test/files/{}", filename))
    }
}

/// Reads work, every write fails.
struct ReadOnlyStore(Arc<Database>);

impl ChatStore for ReadOnlyStore {
    fn find_user(&self, identity: &Identity) -> Result<Option<UserProfile>> {
        self.0.find_user(identity)
    }

    fn insert_peer_log(&self, _: &ChatLogRecord) -> Result<String> {
        Err(anyhow!("disk full"))
    }

    fn insert_group_log(&self, _: &ChatLogRecord) -> Result<String> {
        Err(anyhow!("disk full"))
    }

    fn get_group(&self, id: &Identity) -> Result<Option<GroupSnapshot>> {
        self.0.get_group(id)
    }
}

/// Reads themselves fail.
struct BrokenStore;

impl ChatStore for BrokenStore {
    fn find_user(&self, _: &Identity) -> Result<Option<UserProfile>> {
        Err(anyhow!("connection refused"))
    }

    fn insert_peer_log(&self, _: &ChatLogRecord) -> Result<String> {
        Err(anyhow!("connection refused"))
    }

    fn insert_group_log(&self, _: &ChatLogRecord) -> Result<String> {
        Err(anyhow!("connection refused"))
    }

    fn get_group(&self, _: &Identity) -> Result<Option<GroupSnapshot>> {
        Err(anyhow!("connection refused"))
    }
}

fn hub_with(store: Arc<dyn ChatStore>, media: Arc<dyn MediaStore>, config: GatewayConfig) -> Hub {
    Hub::new(store, media, config)
}

fn id(raw: &str) -> Identity {
    Identity::parse(raw).unwrap()
}

struct Client {
    conn_id: uuid::Uuid,
    frames: mpsc::UnboundedSender<Result<Message, Infallible>>,
    out: mpsc::UnboundedReceiver<Outgoing>,
    task: JoinHandle<()>,
}

impl Client {
    fn start(hub: &Hub, request: ConnectRequest) -> Self {
        let (conn, out) = ConnectionHandle::new();
        let conn_id = conn.id();
        let (frames, mut frame_rx) = mpsc::unbounded_channel();
        let stream = futures_util::stream::poll_fn(move |cx| frame_rx.poll_recv(cx));
        let hub = hub.clone();
        let task = tokio::spawn(async move { run_session(&hub, conn, request, stream).await });
        Self {
            conn_id,
            frames,
            out,
            task,
        }
    }

    async fn peer(hub: &Hub, author: &str, target: &str) -> Self {
        let client = Self::start(
            hub,
            ConnectRequest::Peer(PeerParams {
                author: author.into(),
                target: target.into(),
                target_push_token: None,
            }),
        );
        wait_for(|| async { hub.peer(&id(author)).await.is_some_and(|s| s.conn.id() == client.conn_id) }).await;
        client
    }

    async fn group(hub: &Hub, author: &str, group: &str) -> Self {
        let client = Self::start(
            hub,
            ConnectRequest::Group(GroupParams {
                author: author.into(),
                group: group.into(),
            }),
        );
        wait_for(|| async { hub.group(&id(author)).await.is_some_and(|s| s.conn.id() == client.conn_id) }).await;
        client
    }

    fn text(&self, json: &str) {
        self.frames.send(Ok(Message::Text(json.to_string().into()))).unwrap();
    }

    fn binary(&self, data: Vec<u8>) {
        self.frames.send(Ok(Message::Binary(data.into()))).unwrap();
    }

    async fn next(&mut self) -> Outgoing {
        tokio::time::timeout(Duration::from_secs(2), self.out.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("writer queue closed")
    }

    async fn recv(&mut self) -> OutboundMessage {
        match self.next().await {
            Outgoing::Text(json) => serde_json::from_str(&json).unwrap(),
            Outgoing::Close => panic!("expected a message, got close"),
        }
    }

    fn assert_idle(&mut self) {
        assert!(self.out.try_recv().is_err(), "unexpected outbound frame");
    }

    /// Drop the inbound stream and wait for the session to wind down.
    async fn hang_up(self) -> mpsc::UnboundedReceiver<Outgoing> {
        drop(self.frames);
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .unwrap()
            .unwrap();
        self.out
    }
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn content(kind: ContentKind, filenames: &[&str], body: &str) -> ContentMessage {
    ContentMessage {
        message_id: None,
        author_id: "u1".into(),
        target_id: None,
        group_id: None,
        content_kind: kind,
        filenames: filenames.iter().map(|f| f.to_string()).collect(),
        push_tokens: HashMap::new(),
        body: body.into(),
    }
}

// ── connect phase ──────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_author_is_refused_with_not_allowed() {
    let hub = hub_with(seeded_db(), Arc::new(FakeMedia::default()), GatewayConfig::default());
    let mut client = Client::start(
        &hub,
        ConnectRequest::Peer(PeerParams {
            author: "ghost".into(),
            target: "u2".into(),
            target_push_token: None,
        }),
    );

    let refusal = client.recv().await;
    assert!(refusal.error);
    assert_eq!(refusal.code, Code::NotAllowed);
    assert_eq!(client.next().await, Outgoing::Close);
    assert_eq!(hub.peer_count().await, 0);
}

#[tokio::test]
async fn author_lookup_failure_is_bad_request() {
    let hub = hub_with(Arc::new(BrokenStore), Arc::new(FakeMedia::default()), GatewayConfig::default());
    let mut client = Client::start(
        &hub,
        ConnectRequest::Peer(PeerParams {
            author: "u1".into(),
            target: "u2".into(),
            target_push_token: None,
        }),
    );
    assert_eq!(client.recv().await.code, Code::BadRequest);
    assert_eq!(client.next().await, Outgoing::Close);
}

#[tokio::test]
async fn group_connect_errors() {
    let hub = hub_with(seeded_db(), Arc::new(FakeMedia::default()), GatewayConfig::default());

    let mut unknown = Client::start(
        &hub,
        ConnectRequest::Group(GroupParams {
            author: "u1".into(),
            group: "g404".into(),
        }),
    );
    assert_eq!(unknown.recv().await.code, Code::BadRequest);

    let mut malformed = Client::start(
        &hub,
        ConnectRequest::Group(GroupParams {
            author: "u1".into(),
            group: "g 1".into(),
        }),
    );
    assert_eq!(malformed.recv().await.code, Code::BadField);
    assert_eq!(hub.group_count().await, 0);
}

#[tokio::test]
async fn author_may_connect_by_email() {
    let hub = hub_with(seeded_db(), Arc::new(FakeMedia::default()), GatewayConfig::default());
    let client = Client::start(
        &hub,
        ConnectRequest::Peer(PeerParams {
            author: "ana@example.com".into(),
            target: "u2".into(),
            target_push_token: None,
        }),
    );
    // registered under the canonical id, not the email
    wait_for(|| async { hub.peer(&id("u1")).await.is_some() }).await;
    drop(client);
}

// ── peer conversations ─────────────────────────────────────────────────

#[tokio::test]
async fn peer_text_reaches_both_sides_with_persisted_id() {
    let db = seeded_db();
    let hub = hub_with(db.clone(), Arc::new(FakeMedia::default()), GatewayConfig::default());
    let mut u1 = Client::peer(&hub, "u1", "u2").await;
    let mut u2 = Client::peer(&hub, "u2", "u1").await;

    u1.text(r#"{"author_id":"u1","target_id":"u2","body":"hi"}"#);

    let echo = u1.recv().await;
    let delivered = u2.recv().await;
    assert!(!echo.error);
    assert_eq!(echo.code, Code::Ok);
    assert_eq!(echo.body, "hi");
    assert_eq!(echo.author_id, "u1");
    assert_eq!(echo.author_name, "Ana");
    assert_eq!(echo.content_kind, ContentKind::Text);
    assert_eq!(echo, delivered);

    let stored = db.get_record(LogTable::Peer, &echo.record_id).unwrap().unwrap();
    assert_eq!(stored.body, "hi");
    assert_eq!(stored.target_id, id("u2"));
    assert_eq!(stored.content_id, "N/A");
}

#[tokio::test]
async fn offline_target_still_gets_persisted() {
    let db = seeded_db();
    let hub = hub_with(db.clone(), Arc::new(FakeMedia::default()), GatewayConfig::default());
    let mut u1 = Client::peer(&hub, "u1", "u2").await;

    u1.text(r#"{"body":"are you there?"}"#);
    let echo = u1.recv().await;
    assert!(!echo.error);
    assert_eq!(db.count_logs(LogTable::Peer).unwrap(), 1);
}

#[tokio::test]
async fn malformed_frames_are_reported_and_session_survives() {
    let db = seeded_db();
    let hub = hub_with(db.clone(), Arc::new(FakeMedia::default()), GatewayConfig::default());
    let mut u1 = Client::peer(&hub, "u1", "u2").await;

    u1.text("not json");
    let err = u1.recv().await;
    assert!(err.error);
    assert_eq!(err.code, Code::BadField);

    u1.text(r#"{"body":"a"}{"body":"b"}"#);
    let err = u1.recv().await;
    assert_eq!(err.code, Code::BadField);
    assert_eq!(err.message, "body must only have a single value");

    u1.binary(b"no separators at all".to_vec());
    assert_eq!(u1.recv().await.code, Code::BadField);

    u1.text(r#"{"body":"still here"}"#);
    assert_eq!(u1.recv().await.body, "still here");
    assert_eq!(db.count_logs(LogTable::Peer).unwrap(), 1);
}

#[tokio::test]
async fn malformed_target_is_bad_field_per_message() {
    let hub = hub_with(seeded_db(), Arc::new(FakeMedia::default()), GatewayConfig::default());
    let mut u1 = Client::peer(&hub, "u1", "not a valid id").await;

    u1.text(r#"{"body":"hi"}"#);
    let err = u1.recv().await;
    assert_eq!(err.code, Code::BadField);
    assert!(err.message.starts_with("invalid target"));
}

#[tokio::test]
async fn peer_persist_failure_reports_db_error_without_delivery() {
    let hub = hub_with(
        Arc::new(ReadOnlyStore(seeded_db())),
        Arc::new(FakeMedia::default()),
        GatewayConfig::default(),
    );
    let mut u1 = Client::peer(&hub, "u1", "u2").await;
    let mut u2 = Client::peer(&hub, "u2", "u1").await;

    u1.text(r#"{"body":"lost"}"#);
    let err = u1.recv().await;
    assert!(err.error);
    assert_eq!(err.code, Code::DbError);

    tokio::time::sleep(Duration::from_millis(20)).await;
    u2.assert_idle();
}

// ── content frames ─────────────────────────────────────────────────────

#[tokio::test]
async fn image_set_upload_carries_urls_and_thumbnails() {
    let db = seeded_db();
    let media = Arc::new(FakeMedia::default());
    let hub = hub_with(db.clone(), media.clone(), GatewayConfig::default());
    let mut u1 = Client::peer(&hub, "u1", "u2").await;

    let meta = content(ContentKind::ImageSet, &["a.png", "b.png"], "holiday");
    u1.binary(codec::encode_length_prefixed(&meta, &[&b"AAAA"[..], b"BBBB"]).unwrap());

    let out = u1.recv().await;
    assert!(!out.error);
    assert_eq!(out.content_kind, ContentKind::ImageSet);
    assert_eq!(out.media, vec!["https://cdn.test/img/a.png", "https://cdn.test/img/b.png"]);
    assert_eq!(out.thumbnails.len(), 2);
    assert_eq!(out.body, "holiday");

    let stored = db.get_record(LogTable::Peer, &out.record_id).unwrap().unwrap();
    assert_eq!(stored.content_id, "batch-1");
    assert_eq!(media.calls.lock().unwrap().as_slice(), ["images 2"]);
}

#[tokio::test]
async fn video_upload_uses_conversation_scoped_title() {
    let media = Arc::new(FakeMedia::default());
    let hub = hub_with(seeded_db(), media.clone(), GatewayConfig::default());
    let mut u1 = Client::peer(&hub, "u1", "u2").await;

    let meta = content(ContentKind::Video, &["clip.mp4"], "");
    u1.binary(codec::encode_length_prefixed(&meta, &[b"\x00\x00\x00\x18ftypmp42"]).unwrap());

    let out = u1.recv().await;
    assert_eq!(out.content_kind, ContentKind::Video);
    assert_eq!(out.thumbnails, vec!["https://cdn.test/poster.jpg"]);
    assert!(out.media[0].starts_with("https://cdn.test/u2/u2-"));
    assert!(out.media[0].ends_with(".mp4"));
}

#[tokio::test]
async fn delimited_envelope_when_configured() {
    let config = GatewayConfig {
        frame_format: FrameFormat::Delimited,
        ..Default::default()
    };
    let hub = hub_with(seeded_db(), Arc::new(FakeMedia::default()), config);
    let mut u1 = Client::peer(&hub, "u1", "u2").await;

    let meta = content(ContentKind::File, &["notes.txt"], "see attached");
    let frame = codec::encode_binary(hub.config().frame_format, &meta, &[b"line one\nline two"]).unwrap();
    u1.binary(frame);

    let out = u1.recv().await;
    assert!(!out.error);
    assert_eq!(out.media, vec!["https://cdn.test/files/notes.txt"]);
}

#[tokio::test]
async fn provider_failure_is_reported_and_nothing_is_stored() {
    let db = seeded_db();
    let hub = hub_with(db.clone(), Arc::new(FakeMedia::failing()), GatewayConfig::default());
    let mut u1 = Client::peer(&hub, "u1", "u2").await;

    let meta = content(ContentKind::File, &["a.pdf"], "");
    u1.binary(codec::encode_length_prefixed(&meta, &[b"%PDF"]).unwrap());

    let err = u1.recv().await;
    assert!(err.error);
    assert_eq!(err.code, Code::ProviderError);
    assert_eq!(err.content_kind, ContentKind::File);
    assert_eq!(db.count_logs(LogTable::Peer).unwrap(), 0);
}

#[tokio::test]
async fn content_frame_shape_errors_are_bad_field() {
    let media = Arc::new(FakeMedia::default());
    let hub = hub_with(seeded_db(), media.clone(), GatewayConfig::default());
    let mut u1 = Client::peer(&hub, "u1", "u2").await;

    // text is not a binary content kind
    let meta = content(ContentKind::Text, &["a"], "");
    u1.binary(codec::encode_length_prefixed(&meta, &[b"x"]).unwrap());
    assert_eq!(u1.recv().await.code, Code::BadField);

    // one filename, two blobs
    let meta = content(ContentKind::ImageSet, &["a.png"], "");
    u1.binary(codec::encode_length_prefixed(&meta, &[&b"x"[..], b"y"]).unwrap());
    assert_eq!(u1.recv().await.code, Code::BadField);

    // nothing attached
    let meta = content(ContentKind::File, &[], "");
    u1.binary(codec::encode_length_prefixed::<&[u8]>(&meta, &[]).unwrap());
    assert_eq!(u1.recv().await.code, Code::BadField);

    assert!(media.calls.lock().unwrap().is_empty());
}

// ── group conversations ────────────────────────────────────────────────

#[tokio::test]
async fn group_text_reaches_connected_members() {
    let db = seeded_db();
    let hub = hub_with(db.clone(), Arc::new(FakeMedia::default()), GatewayConfig::default());
    let mut u1 = Client::group(&hub, "u1", "g1").await;
    let mut u2 = Client::group(&hub, "u2", "g1").await;

    u1.text(r#"{"author_id":"u1","group_id":"g1","body":"hey all","push_tokens":{"u2":"ignored-live"}}"#);

    let to_u1 = u1.recv().await;
    let to_u2 = u2.recv().await;
    assert_eq!(to_u1, to_u2);
    assert_eq!(to_u1.body, "hey all");
    assert_eq!(to_u1.author_name, "Ana");

    // stored in the background
    let record_id = to_u1.record_id.clone();
    wait_for(|| {
        let db = db.clone();
        let record_id = record_id.clone();
        async move { db.get_record(LogTable::Group, &record_id).unwrap().is_some() }
    })
    .await;
    let stored = db.get_record(LogTable::Group, &record_id).unwrap().unwrap();
    assert_eq!(stored.target_id, id("g1"));
}

#[tokio::test]
async fn group_persist_failure_after_broadcast_reports_db_error() {
    let hub = hub_with(
        Arc::new(ReadOnlyStore(seeded_db())),
        Arc::new(FakeMedia::default()),
        GatewayConfig::default(),
    );
    let mut u1 = Client::group(&hub, "u1", "g1").await;
    let mut u2 = Client::group(&hub, "u2", "g1").await;

    u1.text(r#"{"body":"sent but not kept"}"#);

    // delivery is not held back by storage
    assert_eq!(u2.recv().await.body, "sent but not kept");

    let mut saw_db_error = false;
    for _ in 0..2 {
        let out = u1.recv().await;
        if out.error {
            assert_eq!(out.code, Code::DbError);
            saw_db_error = true;
        }
    }
    assert!(saw_db_error);
}

#[tokio::test]
async fn group_persist_first_blocks_broadcast_on_failure() {
    let config = GatewayConfig {
        persist_group_before_broadcast: true,
        ..Default::default()
    };
    let hub = hub_with(Arc::new(ReadOnlyStore(seeded_db())), Arc::new(FakeMedia::default()), config);
    let mut u1 = Client::group(&hub, "u1", "g1").await;
    let mut u2 = Client::group(&hub, "u2", "g1").await;

    u1.text(r#"{"body":"never delivered"}"#);
    assert_eq!(u1.recv().await.code, Code::DbError);

    tokio::time::sleep(Duration::from_millis(20)).await;
    u2.assert_idle();
}

// ── registry lifecycle ─────────────────────────────────────────────────

#[tokio::test]
async fn last_connect_wins_and_stale_close_keeps_replacement() {
    let hub = hub_with(seeded_db(), Arc::new(FakeMedia::default()), GatewayConfig::default());
    let mut first = Client::peer(&hub, "u2", "u1").await;
    let mut second = Client::peer(&hub, "u2", "u1").await;
    let mut u1 = Client::peer(&hub, "u1", "u2").await;

    // the replaced connection is told to close as soon as the new one registers
    assert_eq!(first.next().await, Outgoing::Close);

    u1.text(r#"{"body":"which one?"}"#);
    u1.recv().await;
    assert_eq!(second.recv().await.body, "which one?");

    // the displaced connection winding down must not evict the live one
    let second_id = second.conn_id;
    first.hang_up().await;
    assert_eq!(hub.peer(&id("u2")).await.map(|s| s.conn.id()), Some(second_id));
}

#[tokio::test]
async fn displaced_connection_stops_dispatching() {
    let db = seeded_db();
    let hub = hub_with(db.clone(), Arc::new(FakeMedia::default()), GatewayConfig::default());
    let mut first = Client::peer(&hub, "u1", "u2").await;
    let _second = Client::peer(&hub, "u1", "u2").await;
    assert_eq!(first.next().await, Outgoing::Close);

    // its read loop has already ended, so late frames go nowhere
    tokio::time::timeout(Duration::from_secs(2), &mut first.task)
        .await
        .unwrap()
        .unwrap();
    let _ = first.frames.send(Ok(Message::Text(r#"{"body":"too late"}"#.to_string().into())));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(db.count_logs(LogTable::Peer).unwrap(), 0);

    // shutdown has nothing of the old connection left to close
    hub.shutdown().await;
    assert_eq!(hub.peer_count().await, 0);
}

#[tokio::test]
async fn hang_up_unregisters_and_closes() {
    let hub = hub_with(seeded_db(), Arc::new(FakeMedia::default()), GatewayConfig::default());
    let u1 = Client::peer(&hub, "u1", "u2").await;
    let g = Client::group(&hub, "u1", "g1").await;
    assert_eq!(hub.peer_count().await, 1);
    assert_eq!(hub.group_count().await, 1);

    let mut out = u1.hang_up().await;
    assert_eq!(out.recv().await, Some(Outgoing::Close));
    assert_eq!(hub.peer_count().await, 0);
    assert_eq!(hub.group_count().await, 1);

    g.hang_up().await;
    assert_eq!(hub.group_count().await, 0);
}

#[tokio::test]
async fn shutdown_closes_live_sessions() {
    let hub = hub_with(seeded_db(), Arc::new(FakeMedia::default()), GatewayConfig::default());
    let mut u1 = Client::peer(&hub, "u1", "u2").await;
    let mut u2 = Client::group(&hub, "u2", "g1").await;

    hub.shutdown().await;

    assert_eq!(u1.next().await, Outgoing::Close);
    assert_eq!(u2.next().await, Outgoing::Close);
    assert_eq!(hub.peer_count().await, 0);
    assert_eq!(hub.group_count().await, 0);
}

#[tokio::test]
async fn connect_racing_shutdown_is_closed() {
    let hub = hub_with(seeded_db(), Arc::new(FakeMedia::default()), GatewayConfig::default());
    hub.shutdown().await;

    let mut late = Client::start(
        &hub,
        ConnectRequest::Peer(PeerParams {
            author: "u1".into(),
            target: "u2".into(),
            target_push_token: None,
        }),
    );
    assert_eq!(late.next().await, Outgoing::Close);
    assert_eq!(hub.peer_count().await, 0);
    late.hang_up().await;
}
