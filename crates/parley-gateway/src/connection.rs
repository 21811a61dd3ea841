use std::fmt;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use parley_types::Code;
use parley_types::events::OutboundMessage;
use parley_types::identity::IdentityError;
use parley_types::models::{ContentKind, UserProfile};
use parley_types::Identity;

use crate::codec::{self, Inbound};
use crate::dispatch::{self, DispatchError};
use crate::hub::Hub;
use crate::session::{ConnectionHandle, GroupSession, Outgoing, PeerSession, Session};

/// Query parameters of a peer connection upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerParams {
    pub author: String,
    pub target: String,
    #[serde(default)]
    pub target_push_token: Option<String>,
}

/// Query parameters of a group connection upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupParams {
    pub author: String,
    pub group: String,
}

#[derive(Debug, Clone)]
pub enum ConnectRequest {
    Peer(PeerParams),
    Group(GroupParams),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid identity: {0}")]
    BadIdentity(#[from] IdentityError),

    #[error("forbidden")]
    UnknownUser,

    #[error("user lookup failed: {0:#}")]
    UserLookup(anyhow::Error),

    #[error("group not found")]
    UnknownGroup,

    #[error("group lookup failed: {0:#}")]
    GroupLookup(anyhow::Error),

    #[error("lookup task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ConnectError {
    pub fn code(&self) -> Code {
        match self {
            Self::BadIdentity(_) => Code::BadField,
            Self::UnknownUser => Code::NotAllowed,
            Self::UserLookup(_) | Self::UnknownGroup => Code::BadRequest,
            Self::GroupLookup(_) => Code::DbError,
            Self::Task(_) => Code::ServerError,
        }
    }
}

/// Drive an upgraded WebSocket until either side closes it.
pub async fn handle_socket(socket: WebSocket, hub: Hub, request: ConnectRequest) {
    let (sink, stream) = socket.split();
    let (conn, rx) = ConnectionHandle::new();

    let writer = tokio::spawn(write_pump(sink, rx));
    run_session(&hub, conn, request, stream).await;
    // The session always queues a close, so the writer finishes on its own.
    let _ = writer.await;
}

/// Drain the connection queue onto the socket. Stops after a close frame or
/// the first failed write.
pub async fn write_pump<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<Outgoing>)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    while let Some(out) = rx.recv().await {
        match out {
            Outgoing::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!("Socket write failed: {}", e);
                    break;
                }
            }
            Outgoing::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

/// Connect, serve frames until the client goes away, then clean up.
///
/// Generic over the frame stream so tests can drive sessions without a socket.
pub async fn run_session<S, E>(
    hub: &Hub,
    conn: ConnectionHandle,
    request: ConnectRequest,
    mut frames: S,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let session = match connect(hub, conn.clone(), request).await {
        Ok(session) => session,
        Err(e) => {
            warn!("Connection {} refused: {}", conn.id(), e);
            let _ = conn.send(&OutboundMessage::failure(e.code(), ContentKind::Text, &e));
            let _ = conn.close();
            return;
        }
    };

    // Registering displaces and closes any earlier session of this author.
    hub.register(session.clone()).await;
    info!(
        "{} ({}) opened a {} session on conn {}",
        session.author().name,
        session.author_id(),
        session.kind().as_str(),
        conn.id()
    );

    read_loop(hub, &session, &mut frames).await;

    hub.unregister_connection(session.kind(), session.author_id(), conn.id())
        .await;
    let _ = conn.close();
    info!(
        "{} ({}) closed {} session on conn {}",
        session.author().name,
        session.author_id(),
        session.kind().as_str(),
        conn.id()
    );
}

async fn connect(
    hub: &Hub,
    conn: ConnectionHandle,
    request: ConnectRequest,
) -> Result<Session, ConnectError> {
    match request {
        ConnectRequest::Peer(params) => {
            let author = resolve_user(hub, Identity::parse(&params.author)?).await?;
            Ok(Session::Peer(Arc::new(PeerSession {
                conn,
                author,
                target: params.target,
                target_push_token: params.target_push_token.filter(|t| !t.is_empty()),
            })))
        }
        ConnectRequest::Group(params) => {
            let author_id = Identity::parse(&params.author)?;
            let group_id = Identity::parse(&params.group)?;
            let author = resolve_user(hub, author_id).await?;

            let store = hub.store().clone();
            let group = tokio::task::spawn_blocking(move || store.get_group(&group_id))
                .await?
                .map_err(ConnectError::GroupLookup)?
                .ok_or(ConnectError::UnknownGroup)?;

            Ok(Session::Group(Arc::new(GroupSession { conn, author, group })))
        }
    }
}

async fn resolve_user(hub: &Hub, identity: Identity) -> Result<UserProfile, ConnectError> {
    let store = hub.store().clone();
    tokio::task::spawn_blocking(move || store.find_user(&identity))
        .await?
        .map_err(ConnectError::UserLookup)?
        .ok_or(ConnectError::UnknownUser)
}

async fn read_loop<S, E>(hub: &Hub, session: &Session, frames: &mut S)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let format = hub.config().frame_format;

    loop {
        // A displaced or shut-down session stops reading right away.
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = session.conn().closing() => {
                debug!("Conn {} closed by the hub", session.conn().id());
                break;
            }
        };
        let frame = match frame {
            None => break,
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!("Read error on conn {}: {}", session.conn().id(), e);
                break;
            }
        };

        let (kind, decoded) = match frame {
            Message::Text(text) => (
                ContentKind::Text,
                codec::decode_text(text.as_str()).map(Inbound::Text).map_err(|e| {
                    warn!(
                        "{} bad text frame: {} -- raw: {}",
                        session.author_id(),
                        e,
                        truncate(text.as_str(), 200)
                    );
                    e
                }),
            ),
            Message::Binary(data) => {
                let decoded = codec::decode_binary(format, &data)
                    .map(|(message, segments)| Inbound::Content { message, segments });
                if let Err(e) = &decoded {
                    warn!(
                        "{} bad binary frame ({} bytes, {}): {}",
                        session.author_id(),
                        data.len(),
                        format,
                        e
                    );
                }
                (decoded.as_ref().map_or(ContentKind::File, Inbound::content_kind), decoded)
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {
                trace!("control frame on conn {}", session.conn().id());
                continue;
            }
        };

        let result = match decoded {
            Ok(inbound) => dispatch::dispatch(hub, session, inbound).await,
            Err(e) => Err(DispatchError::from(e)),
        };
        if let Err(e) = result {
            report(session, kind, &e);
        }
    }
}

fn report(session: &Session, kind: ContentKind, err: &DispatchError) {
    match err.code() {
        Code::BadField => debug!("{} rejected frame: {}", session.author_id(), err),
        _ => warn!("{} message failed: {}", session.author_id(), err),
    }
    let _ = session
        .conn()
        .send(&OutboundMessage::failure(err.code(), kind, err));
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
