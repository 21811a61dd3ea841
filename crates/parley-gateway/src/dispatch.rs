//! Per-kind message handling: build the record, store media, persist, fan out.

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, error};

use parley_media::MediaError;
use parley_types::events::OutboundMessage;
use parley_types::identity::IdentityError;
use parley_types::models::{ChatLogRecord, ContentKind, NO_CONTENT_ID};
use parley_types::{Code, Identity};

use crate::broadcast::BroadcastReport;
use crate::codec::{DecodeError, Inbound};
use crate::hub::Hub;
use crate::session::{ConnectionHandle, Session, SessionKind};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("invalid target: {0}")]
    Target(#[from] IdentityError),

    #[error("{0}")]
    BadContent(&'static str),

    #[error("media provider failed: {0}")]
    Provider(#[from] MediaError),

    #[error("persistence failed: {0:#}")]
    Persistence(anyhow::Error),

    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DispatchError {
    pub fn code(&self) -> Code {
        match self {
            Self::Decode(_) | Self::Target(_) | Self::BadContent(_) => Code::BadField,
            Self::Provider(_) => Code::ProviderError,
            Self::Persistence(_) => Code::DbError,
            Self::Encode(_) | Self::Task(_) => Code::ServerError,
        }
    }
}

/// Result of a successfully handled frame.
#[derive(Debug)]
pub struct Dispatched {
    pub record_id: String,
    pub report: BroadcastReport,
}

/// Handle one decoded frame for `session`.
///
/// Errors are returned to the caller, which reports them to the sender. The
/// one exception is background group persistence: by the time it fails the
/// broadcast has already gone out, so it reports straight to the sender.
pub async fn dispatch(
    hub: &Hub,
    session: &Session,
    inbound: Inbound,
) -> Result<Dispatched, DispatchError> {
    let target = match session {
        Session::Peer(s) => Identity::parse(&s.target)?,
        Session::Group(s) => s.group.id.clone(),
    };

    let message_tokens = match &inbound {
        Inbound::Text(m) => m.push_tokens.clone(),
        Inbound::Content { message, .. } => message.push_tokens.clone(),
    };

    let record = build_record(hub, session, target.clone(), inbound).await?;
    let outbound = OutboundMessage::from_record(&record);
    let record_id = record.id.clone();

    let report = match session {
        Session::Peer(s) => {
            persist(hub, SessionKind::Peer, record).await?;
            hub.broadcast_peer(s, &target, &outbound).await?
        }
        Session::Group(s) => {
            if hub.config().persist_group_before_broadcast {
                persist(hub, SessionKind::Group, record).await?;
            } else {
                spawn_group_persist(hub.clone(), record, s.conn.clone());
            }
            hub.broadcast_group(&s.group, &message_tokens, &outbound).await?
        }
    };

    debug!(
        "{} {} message {} from {} to {}: {} live, {} pushed",
        session.kind().as_str(),
        outbound.content_kind.as_str(),
        record_id,
        session.author_id(),
        target,
        report.delivered.len(),
        report.pushed.len()
    );

    Ok(Dispatched { record_id, report })
}

async fn build_record(
    hub: &Hub,
    session: &Session,
    target: Identity,
    inbound: Inbound,
) -> Result<ChatLogRecord, DispatchError> {
    let author = session.author();

    let (message, mut segments) = match inbound {
        Inbound::Text(message) => return Ok(ChatLogRecord::text(target, author, message.body)),
        Inbound::Content { message, segments } => (message, segments),
    };

    let media = hub.media();
    match message.content_kind {
        ContentKind::Text => Err(DispatchError::BadContent(
            "binary frames must carry video, image_set or file content",
        )),
        ContentKind::Video => {
            require_content(&segments)?;
            let title = video_title(&target, message.filenames.first().map(String::as_str));
            let playback = media.store_video(target.as_str(), &title, segments.swap_remove(0)).await?;
            let thumbnails = if playback.thumbnail_url.is_empty() {
                Vec::new()
            } else {
                vec![playback.thumbnail_url]
            };
            Ok(ChatLogRecord::content(
                target,
                author,
                ContentKind::Video,
                message.body,
                playback.content_id,
                vec![playback.url],
                thumbnails,
            ))
        }
        ContentKind::ImageSet => {
            require_content(&segments)?;
            let set = media.store_images(segments, message.filenames).await?;
            Ok(ChatLogRecord::content(
                target,
                author,
                ContentKind::ImageSet,
                message.body,
                set.content_id,
                set.urls,
                set.thumbnails,
            ))
        }
        ContentKind::File => {
            require_content(&segments)?;
            let filename = message.filenames.first().map(String::as_str).unwrap_or("file");
            let url = media.store_file(segments.swap_remove(0), filename).await?;
            Ok(ChatLogRecord::content(
                target,
                author,
                ContentKind::File,
                message.body,
                NO_CONTENT_ID,
                vec![url],
                Vec::new(),
            ))
        }
    }
}

fn require_content(segments: &[Bytes]) -> Result<(), DispatchError> {
    if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(DispatchError::BadContent("no content attached"));
    }
    Ok(())
}

/// `{conversation}-{unix seconds}`, keeping the client's extension if it sent one.
fn video_title(conversation: &Identity, filename: Option<&str>) -> String {
    let stamp = Utc::now().timestamp();
    match filename.and_then(|f| f.rsplit_once('.')).map(|(_, ext)| ext) {
        Some(ext) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            format!("{}-{}.{}", conversation, stamp, ext)
        }
        _ => format!("{}-{}", conversation, stamp),
    }
}

async fn persist(
    hub: &Hub,
    kind: SessionKind,
    record: ChatLogRecord,
) -> Result<String, DispatchError> {
    let store = hub.store().clone();
    tokio::task::spawn_blocking(move || match kind {
        SessionKind::Peer => store.insert_peer_log(&record),
        SessionKind::Group => store.insert_group_log(&record),
    })
    .await?
    .map_err(DispatchError::Persistence)
}

fn spawn_group_persist(hub: Hub, record: ChatLogRecord, sender: ConnectionHandle) {
    let content_kind = record.content_kind;
    let record_id = record.id.clone();
    tokio::spawn(async move {
        if let Err(e) = persist(&hub, SessionKind::Group, record).await {
            error!("Group message {} was broadcast but not stored: {}", record_id, e);
            let _ = sender.send(&OutboundMessage::failure(e.code(), content_kind, &e));
        }
    });
}
