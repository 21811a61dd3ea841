use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use parley_db::ChatStore;
use parley_media::MediaStore;
use parley_types::Identity;

use crate::codec::FrameFormat;
use crate::session::{ConnectionHandle, GroupSession, PeerSession, Session, SessionKind};

/// Gateway-level knobs, filled from the environment by the server binary.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub frame_format: FrameFormat,
    /// Persist group messages before fanning out instead of in the background.
    pub persist_group_before_broadcast: bool,
}

/// Owns every live session plus the persistence and media ports.
///
/// One peer session and one group session per identity; registering a second
/// one of the same kind displaces the first and closes its connection. Once
/// [`Hub::shutdown`] has run, new registrations are refused and closed.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    sessions: RwLock<Registry>,
    store: Arc<dyn ChatStore>,
    media: Arc<dyn MediaStore>,
    config: GatewayConfig,
}

#[derive(Default)]
struct Registry {
    peers: HashMap<Identity, Arc<PeerSession>>,
    groups: HashMap<Identity, Arc<GroupSession>>,
    closed: bool,
}

impl Hub {
    pub fn new(store: Arc<dyn ChatStore>, media: Arc<dyn MediaStore>, config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: RwLock::new(Registry::default()),
                store,
                media,
                config,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.inner.store
    }

    pub fn media(&self) -> &Arc<dyn MediaStore> {
        &self.inner.media
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Insert or replace the session for its author. Returns the displaced
    /// one, whose connection has already been told to close.
    pub async fn register(&self, session: Session) -> Option<Session> {
        let mut sessions = self.inner.sessions.write().await;
        if sessions.closed {
            info!(
                "Hub is shut down, refusing {} session of {}",
                session.kind().as_str(),
                session.author_id()
            );
            close_logged(session.conn());
            return None;
        }

        let displaced = match session {
            Session::Peer(s) => sessions
                .peers
                .insert(s.author.id.clone(), s)
                .map(Session::Peer),
            Session::Group(s) => sessions
                .groups
                .insert(s.author.id.clone(), s)
                .map(Session::Group),
        };
        if let Some(old) = &displaced {
            debug!(
                "{} session of {} replaced (old conn {})",
                old.kind().as_str(),
                old.author_id(),
                old.conn().id()
            );
            close_logged(old.conn());
        }
        displaced
    }

    /// Remove whatever session is registered for `identity`. Absent entries are a no-op.
    pub async fn unregister(&self, kind: SessionKind, identity: &Identity) -> Option<Session> {
        let mut sessions = self.inner.sessions.write().await;
        match kind {
            SessionKind::Peer => sessions.peers.remove(identity).map(Session::Peer),
            SessionKind::Group => sessions.groups.remove(identity).map(Session::Group),
        }
    }

    /// Remove the session for `identity` only if it is still the one on `conn_id`.
    ///
    /// A connection closing after it was displaced must not evict its replacement.
    pub async fn unregister_connection(
        &self,
        kind: SessionKind,
        identity: &Identity,
        conn_id: Uuid,
    ) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        match kind {
            SessionKind::Peer => {
                remove_if_current(&mut sessions.peers, identity, conn_id, |s| s.conn.id())
            }
            SessionKind::Group => {
                remove_if_current(&mut sessions.groups, identity, conn_id, |s| s.conn.id())
            }
        }
    }

    pub async fn lookup(&self, kind: SessionKind, identity: &Identity) -> Option<Session> {
        match kind {
            SessionKind::Peer => self.peer(identity).await.map(Session::Peer),
            SessionKind::Group => self.group(identity).await.map(Session::Group),
        }
    }

    pub async fn peer(&self, identity: &Identity) -> Option<Arc<PeerSession>> {
        self.inner.sessions.read().await.peers.get(identity).cloned()
    }

    pub async fn group(&self, identity: &Identity) -> Option<Arc<GroupSession>> {
        self.inner.sessions.read().await.groups.get(identity).cloned()
    }

    /// Group sessions for every identity, in order, under a single read lock.
    pub async fn group_sessions(&self, identities: &[Identity]) -> Vec<Option<Arc<GroupSession>>> {
        let sessions = self.inner.sessions.read().await;
        identities.iter().map(|id| sessions.groups.get(id).cloned()).collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.sessions.read().await.peers.len()
    }

    pub async fn group_count(&self) -> usize {
        self.inner.sessions.read().await.groups.len()
    }

    /// Close every live connection, empty both maps and refuse later registrations.
    pub async fn shutdown(&self) {
        let (peers, groups) = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.closed = true;
            (
                std::mem::take(&mut sessions.peers),
                std::mem::take(&mut sessions.groups),
            )
        };

        info!("Closing {} peer and {} group sessions", peers.len(), groups.len());
        let conns = peers.values().map(|s| &s.conn).chain(groups.values().map(|s| &s.conn));
        for conn in conns {
            close_logged(conn);
        }
    }
}

fn close_logged(conn: &ConnectionHandle) {
    if let Err(e) = conn.close() {
        debug!("Close: {}", e);
    }
}

fn remove_if_current<T>(
    map: &mut HashMap<Identity, Arc<T>>,
    identity: &Identity,
    conn_id: Uuid,
    conn_of: impl Fn(&T) -> Uuid,
) -> bool {
    if map.get(identity).is_some_and(|s| conn_of(s) == conn_id) {
        map.remove(identity);
        true
    } else {
        false
    }
}
