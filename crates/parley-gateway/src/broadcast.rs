use std::collections::HashMap;

use tracing::{debug, info, warn};

use parley_types::Identity;
use parley_types::events::OutboundMessage;
use parley_types::models::GroupSnapshot;

use crate::codec;
use crate::hub::Hub;
use crate::session::{ConnectionHandle, PeerSession, SendError};

/// Who a fan-out reached, and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients written to over a live session.
    pub delivered: Vec<Identity>,
    /// Offline recipients handed to the push notifier.
    pub pushed: Vec<Identity>,
    /// Offline recipients with no push token.
    pub unreachable: Vec<Identity>,
}

impl Hub {
    /// Echo to the sender and deliver to the counterpart's peer session.
    ///
    /// When the counterpart has no live peer session the push notifier is
    /// used instead, with the token supplied at connect time.
    pub async fn broadcast_peer(
        &self,
        sender: &PeerSession,
        target: &Identity,
        message: &OutboundMessage,
    ) -> Result<BroadcastReport, serde_json::Error> {
        let text = codec::encode_outbound(message)?;
        let mut report = BroadcastReport::default();

        if deliver(&sender.conn, text.clone(), &sender.author.id) {
            report.delivered.push(sender.author.id.clone());
        }

        match self.peer(target).await {
            // Talking to yourself: the echo above already covered it.
            Some(live) if live.conn.id() == sender.conn.id() => {}
            Some(live) => {
                if deliver(&live.conn, text, target) {
                    report.delivered.push(target.clone());
                }
            }
            None => match sender.target_push_token.as_deref() {
                Some(token) => {
                    notify_push(target, token);
                    report.pushed.push(target.clone());
                }
                None => {
                    debug!("{} is offline and has no push token", target);
                    report.unreachable.push(target.clone());
                }
            },
        }

        Ok(report)
    }

    /// Deliver to every participant of `group` that has a live session on it.
    ///
    /// Tokens stored on the snapshot are overlaid by the ones the client
    /// supplied with the message. A participant whose group session belongs
    /// to some other group counts as offline here.
    pub async fn broadcast_group(
        &self,
        group: &GroupSnapshot,
        message_tokens: &HashMap<String, String>,
        message: &OutboundMessage,
    ) -> Result<BroadcastReport, serde_json::Error> {
        let text = codec::encode_outbound(message)?;
        let mut report = BroadcastReport::default();

        let live = self.group_sessions(&group.participants).await;
        for (participant, session) in group.participants.iter().zip(live) {
            if let Some(session) = session.filter(|s| s.group.id == group.id) {
                if deliver(&session.conn, text.clone(), participant) {
                    report.delivered.push(participant.clone());
                }
                continue;
            }

            let token = message_tokens
                .get(participant.as_str())
                .or_else(|| group.push_tokens.get(participant.as_str()));
            match token {
                Some(token) => {
                    notify_push(participant, token);
                    report.pushed.push(participant.clone());
                }
                None => {
                    warn!(
                        "{} in group {} is not connected and has no push token",
                        participant, group.id
                    );
                    report.unreachable.push(participant.clone());
                }
            }
        }

        Ok(report)
    }
}

fn deliver(conn: &ConnectionHandle, text: String, recipient: &Identity) -> bool {
    match conn.send_text(text) {
        Ok(()) => true,
        Err(SendError::Closed(conn_id)) => {
            debug!("Dropped message for {}: connection {} already closed", recipient, conn_id);
            false
        }
        Err(e) => {
            warn!("Dropped message for {}: {}", recipient, e);
            false
        }
    }
}

// Push delivery is not wired to a provider yet; this marks where it plugs in.
fn notify_push(recipient: &Identity, token: &str) {
    info!("about to send push notification to {} via token {}", recipient, token);
}
