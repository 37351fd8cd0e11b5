use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use url::Url;

use crate::{
    connectivity::service::ConnectivityHandle,
    signaling::{
        client::{SignalingEvent, UrlBuilder},
        protocol::{FileEvent, ServerMessage},
    },
    storage::{MetadataStore, StatusUpdate},
};

/// Where the relay should resume this node's event stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub last_event_id: u64,
    pub last_ack_event_id: u64,
    pub pending_events: u64,
}

pub type SharedCursor = Arc<Mutex<SyncCursor>>;

pub fn acknowledge(cursor: &SharedCursor, event_id: u64) -> Result<()> {
    let mut cursor = cursor.lock().map_err(|_| anyhow!("failed to acquire lock"))?;
    cursor.last_ack_event_id = cursor.last_ack_event_id.max(event_id);
    Ok(())
}

#[derive(Clone, Debug)]
pub struct SyncUrlParams {
    pub base: Url,
    pub node_id: String,
    pub token: String,
    pub page_size: usize,
}

/// URL builder reading the cursor at call time. A missing token fails the
/// attempt so the client retries later.
pub fn sync_url_builder(params: SyncUrlParams, cursor: SharedCursor) -> UrlBuilder {
    Box::new(move || -> Result<Url> {
        if params.token.is_empty() {
            return Err(anyhow!("missing session token"));
        }

        let cursor = *cursor.lock().map_err(|_| anyhow!("failed to acquire lock"))?;
        let mut url = params.base.clone();
        url.query_pairs_mut()
            .append_pair("node_id", &params.node_id)
            .append_pair("token", &params.token)
            .append_pair("last_event_id", &cursor.last_event_id.to_string())
            .append_pair("last_ack_event_id", &cursor.last_ack_event_id.to_string())
            .append_pair("pending_events", &cursor.pending_events.to_string())
            .append_pair("events_page_size", &params.page_size.to_string());

        Ok(url)
    })
}

/// Upward notifications for the sync session orchestrator.
#[derive(Debug, PartialEq)]
pub enum SessionEvent {
    FileEvents(Vec<FileEvent>),
    RestartRequired,
    Other(ServerMessage),
}

pub struct SignalingService {
    connectivity: ConnectivityHandle,
    cursor: SharedCursor,
    session: UnboundedSender<SessionEvent>,
    metadata: Option<Arc<dyn MetadataStore>>,
    rx: UnboundedReceiver<SignalingEvent>,
}

impl SignalingService {
    pub fn new(
        connectivity: ConnectivityHandle,
        cursor: SharedCursor,
        session: UnboundedSender<SessionEvent>,
        metadata: Option<Arc<dyn MetadataStore>>,
        rx: UnboundedReceiver<SignalingEvent>,
    ) -> Self {
        Self {
            connectivity,
            cursor,
            session,
            metadata,
            rx,
        }
    }

    pub async fn start(mut self) -> Result<()> {
        while let Some(event) = self.rx.recv().await {
            self.handle(event);
        }

        Ok(())
    }

    fn handle(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => self.report(StatusUpdate::Online(true)),
            SignalingEvent::Disconnected { auth_rejected } => {
                self.report(StatusUpdate::Online(false));
                self.connectivity.on_signaling_disconnected();

                if auth_rejected {
                    info!("Authorization rejected, restarting the sync session. ");
                    if self.session.send(SessionEvent::RestartRequired).is_err() {
                        warn!("No session listening for restart. ");
                    }
                }
            },
            SignalingEvent::Frame(text) => {
                let message = match ServerMessage::decode(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Failed to decode signaling frame: {e}. ");
                        return;
                    },
                };

                if let Err(e) = self.dispatch(message.clone()) {
                    warn!("Failed to dispatch signaling message: {e}. Retrying once. ");
                    if let Err(e) = self.dispatch(message) {
                        warn!("Dropping signaling message: {e}. ");
                    }
                }
            },
        }
    }

    fn dispatch(&mut self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::PeerList(peers) => self.connectivity.set_peer_list(peers),
            ServerMessage::NodeConnect(peer) => self.connectivity.on_peer_connected(peer),
            ServerMessage::NodeDisconnect(node) => self.connectivity.on_peer_disconnected(&node.id),
            ServerMessage::Sdp(relay) => {
                self.connectivity
                    .on_signaling_payload(relay.message, &relay.node_id, &relay.conn_uuid)
            },
            ServerMessage::FileEvents(page) => {
                {
                    let mut cursor = self.cursor.lock().map_err(|_| anyhow!("failed to acquire lock"))?;
                    if let Some(last) = page.events.iter().map(|e| e.event_id).max() {
                        cursor.last_event_id = cursor.last_event_id.max(last);
                    }
                    cursor.pending_events = page.pending_events;
                }

                if !page.events.is_empty() {
                    self.session
                        .send(SessionEvent::FileEvents(page.events))
                        .map_err(|_| anyhow!("session is gone"))?;
                }
            },
            ServerMessage::Heartbeat => {},
            ServerMessage::ShareInfo(_) => debug!("Ignoring share info outside a share session. "),
            ServerMessage::Unknown(operation) => info!("Ignoring unknown signaling operation {operation}. "),
            other => self.session.send(SessionEvent::Other(other)).map_err(|_| anyhow!("session is gone"))?,
        }

        Ok(())
    }

    fn report(&self, update: StatusUpdate) {
        if let Some(metadata) = &self.metadata {
            metadata.update_status(update);
        }
    }
}
