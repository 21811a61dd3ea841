use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use parley_types::Identity;
use parley_types::events::OutboundMessage;
use parley_types::models::{GroupSnapshot, UserProfile};

use crate::codec;

/// What the writer task pushes onto the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection {0} is closed")]
    Closed(Uuid),

    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Write half of one live connection.
///
/// Every write goes through an unbounded queue drained by a single writer
/// task, so concurrent broadcasts to the same socket never interleave.
/// A client that reads slowly grows its queue instead of stalling senders.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<Outgoing>,
    closing: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closing, _) = watch::channel(false);
        let conn = Self {
            id: Uuid::new_v4(),
            tx,
            closing: Arc::new(closing),
        };
        (conn, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        self.send_text(codec::encode_outbound(message)?)
    }

    /// Queue an already encoded frame. Broadcasts encode once and call this per recipient.
    pub fn send_text(&self, text: String) -> Result<(), SendError> {
        self.tx
            .send(Outgoing::Text(text))
            .map_err(|_| SendError::Closed(self.id))
    }

    /// Ask the writer to send a close frame and stop. Also wakes anything
    /// waiting on [`ConnectionHandle::closing`].
    pub fn close(&self) -> Result<(), SendError> {
        self.closing.send_replace(true);
        self.tx.send(Outgoing::Close).map_err(|_| SendError::Closed(self.id))
    }

    /// Resolves once `close` has been called on any clone of this handle.
    pub async fn closing(&self) {
        let mut rx = self.closing.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Peer,
    Group,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Peer => "peer",
            Self::Group => "group",
        }
    }
}

/// A one-to-one conversation bound to a single counterpart.
#[derive(Debug)]
pub struct PeerSession {
    pub conn: ConnectionHandle,
    pub author: UserProfile,
    /// Raw counterpart id from the connect request; resolved per message.
    pub target: String,
    pub target_push_token: Option<String>,
}

/// A conversation bound to one group, with membership fixed at connect time.
#[derive(Debug)]
pub struct GroupSession {
    pub conn: ConnectionHandle,
    pub author: UserProfile,
    pub group: GroupSnapshot,
}

#[derive(Debug, Clone)]
pub enum Session {
    Peer(Arc<PeerSession>),
    Group(Arc<GroupSession>),
}

impl Session {
    pub fn kind(&self) -> SessionKind {
        match self {
            Self::Peer(_) => SessionKind::Peer,
            Self::Group(_) => SessionKind::Group,
        }
    }

    pub fn author(&self) -> &UserProfile {
        match self {
            Self::Peer(s) => &s.author,
            Self::Group(s) => &s.author,
        }
    }

    pub fn author_id(&self) -> &Identity {
        &self.author().id
    }

    pub fn conn(&self) -> &ConnectionHandle {
        match self {
            Self::Peer(s) => &s.conn,
            Self::Group(s) => &s.conn,
        }
    }
}
