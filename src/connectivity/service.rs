use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::sleep,
};
use uuid::Uuid;

use crate::{
    connectivity::{
        connection::{Connection, ConnectionOutput, Thresholds},
        selection::SelectionPolicy,
        transport::{
            ConnectionSpec,
            Direction,
            EventSink,
            NegotiationPayload,
            TransportFactory,
            TransportNotice,
        },
        PeerSender,
        StillWanted,
    },
    lifecycle::{used_after_stop, Lifecycle},
    speed::SpeedHandle,
    storage::{MetadataStore, StatusUpdate},
};

const LIVENESS_TIMEOUT: Duration = Duration::from_secs(20);
const REFRESH_DELAY: Duration = Duration::from_secs(1);
const OUTGOING_ANNOUNCE_DELAY: Duration = Duration::from_secs(1);
const BATCH_RETRY_INTERVAL: Duration = Duration::from_millis(250);
const OUTGOING_CAPACITY_BASE: usize = 5;
const NODE_KIND: &str = "node";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Peer {
    pub id: String,

    #[serde(rename = "type", default = "peer_kind_default")]
    pub kind: String,

    #[serde(default)]
    pub own: bool,
}

fn peer_kind_default() -> String {
    String::from(NODE_KIND)
}

impl Peer {
    pub fn is_node(&self) -> bool {
        self.kind == NODE_KIND
    }
}

/// Outgoing connections wanted per peer. Fewer peers get more parallel links.
pub fn outgoing_capacity(total_peers: usize) -> usize {
    OUTGOING_CAPACITY_BASE / total_peers.max(1) + 1
}

#[derive(Clone, Debug)]
pub struct ConnectivityConfig {
    pub max_incoming_connections: usize,
    pub thresholds: Thresholds,
    pub selection_seed: Option<u64>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Relay {
        peer_id: String,
        connection_id: String,
        payload: NegotiationPayload,
    },
    PeerConnected {
        peer_id: String,
        direction: Direction,
    },
    OutgoingPeerConnected(String),
    PeerDisconnected {
        peer_id: String,
        direction: Direction,
    },
    Message {
        peer_id: String,
        direction: Direction,
        data: Bytes,
    },
}

pub struct PendingBatch {
    peer_id: String,
    messages: VecDeque<Bytes>,
    on_sent: Option<oneshot::Sender<bool>>,
    still_wanted: StillWanted,
}

impl PendingBatch {
    fn finish(mut self, completed: bool) {
        if let Some(tx) = self.on_sent.take() {
            let _ = tx.send(completed);
        }
    }
}

pub enum Command {
    SetPeerList(Vec<Peer>),
    PeerConnected(Peer),
    PeerDisconnected(String),
    SignalingDisconnected,
    SignalingPayload {
        payload: NegotiationPayload,
        peer_id: String,
        connection_id: String,
    },
    Send {
        data: Bytes,
        peer_id: String,
        via_incoming: bool,
    },
    SendBatch(PendingBatch),
    ResumeBatch(u64),
    Reconnect(String),
    Refresh,
    LivenessCheck {
        connection_id: String,
        direction: Direction,
    },
    AnnounceOutgoing(String),
    Stop,
}

#[derive(Clone)]
pub struct ConnectivityHandle {
    tx: UnboundedSender<Command>,
}

impl ConnectivityHandle {
    pub fn set_peer_list(&self, peers: Vec<Peer>) {
        self.dispatch(Command::SetPeerList(peers));
    }

    pub fn on_peer_connected(&self, peer: Peer) {
        self.dispatch(Command::PeerConnected(peer));
    }

    pub fn on_peer_disconnected(&self, peer_id: &str) {
        self.dispatch(Command::PeerDisconnected(peer_id.to_string()));
    }

    pub fn on_signaling_disconnected(&self) {
        self.dispatch(Command::SignalingDisconnected);
    }

    pub fn on_signaling_payload(&self, payload: NegotiationPayload, peer_id: &str, connection_id: &str) {
        self.dispatch(Command::SignalingPayload {
            payload,
            peer_id: peer_id.to_string(),
            connection_id: connection_id.to_string(),
        });
    }

    pub fn reconnect(&self, peer_id: &str) {
        self.dispatch(Command::Reconnect(peer_id.to_string()));
    }

    pub fn stop(&self) {
        self.dispatch(Command::Stop);
    }

    fn dispatch(&self, command: Command) {
        if self.tx.send(command).is_err() {
            used_after_stop("connectivity service");
        }
    }
}

impl PeerSender for ConnectivityHandle {
    fn send(&self, data: Bytes, peer_id: &str, via_incoming: bool) {
        self.dispatch(Command::Send {
            data,
            peer_id: peer_id.to_string(),
            via_incoming,
        });
    }

    fn send_batch(
        &self,
        messages: Vec<Bytes>,
        peer_id: &str,
        on_sent: oneshot::Sender<bool>,
        still_wanted: StillWanted,
    ) {
        self.dispatch(Command::SendBatch(PendingBatch {
            peer_id: peer_id.to_string(),
            messages: messages.into(),
            on_sent: Some(on_sent),
            still_wanted,
        }));
    }
}

#[derive(Default)]
struct PeerPools {
    incoming: HashSet<String>,
    outgoing: HashSet<String>,
}

impl PeerPools {
    fn pool(&self, direction: Direction) -> &HashSet<String> {
        match direction {
            Direction::Incoming => &self.incoming,
            Direction::Outgoing => &self.outgoing,
        }
    }

    fn pool_mut(&mut self, direction: Direction) -> &mut HashSet<String> {
        match direction {
            Direction::Incoming => &mut self.incoming,
            Direction::Outgoing => &mut self.outgoing,
        }
    }
}

enum Input {
    Command(Command),
    Transport(TransportNotice),
}

/// Owns every peer connection. All state is touched only from the actor loop.
pub struct ConnectivityService {
    config: ConnectivityConfig,
    factory: Arc<dyn TransportFactory>,
    events: UnboundedSender<ConnectivityEvent>,
    speed: Option<SpeedHandle>,
    metadata: Option<Arc<dyn MetadataStore>>,
    peers: HashMap<String, Peer>,
    connections: HashMap<(Direction, String), Connection>,
    pools: HashMap<String, PeerPools>,
    connected_incoming: HashSet<String>,
    connected_outgoing: HashSet<String>,
    batches: HashMap<u64, PendingBatch>,
    next_batch_id: u64,
    refresh_pending: bool,
    selection: SelectionPolicy,
    lifecycle: Lifecycle,
    tx: UnboundedSender<Command>,
    rx: UnboundedReceiver<Command>,
    transport_tx: UnboundedSender<TransportNotice>,
    transport_rx: UnboundedReceiver<TransportNotice>,
}

impl ConnectivityService {
    pub fn new(
        config: ConnectivityConfig,
        factory: Arc<dyn TransportFactory>,
        events: UnboundedSender<ConnectivityEvent>,
        speed: Option<SpeedHandle>,
        metadata: Option<Arc<dyn MetadataStore>>,
    ) -> (Self, ConnectivityHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let handle = ConnectivityHandle { tx: tx.clone() };

        let service = Self {
            selection: SelectionPolicy::new(config.selection_seed),
            config,
            factory,
            events,
            speed,
            metadata,
            peers: HashMap::new(),
            connections: HashMap::new(),
            pools: HashMap::new(),
            connected_incoming: HashSet::new(),
            connected_outgoing: HashSet::new(),
            batches: HashMap::new(),
            next_batch_id: 0,
            refresh_pending: false,
            lifecycle: Lifecycle::Uninitialized,
            tx,
            rx,
            transport_tx,
            transport_rx,
        };

        (service, handle)
    }

    pub async fn start(mut self) -> Result<()> {
        self.lifecycle = Lifecycle::Running;

        while self.lifecycle.is_running() {
            let input = tokio::select! {
                command = self.rx.recv() => command.map(Input::Command),
                notice = self.transport_rx.recv() => notice.map(Input::Transport),
            };

            match input {
                Some(Input::Command(command)) => self.handle_command(command),
                Some(Input::Transport(notice)) => self.handle_notice(notice),
                None => break,
            }
        }

        self.shutdown();
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetPeerList(peers) => self.set_peer_list(peers),
            Command::PeerConnected(peer) => self.add_peer(peer),
            Command::PeerDisconnected(peer_id) => self.remove_peer(&peer_id),
            Command::SignalingDisconnected => {
                info!("Signaling lost, dropping {} peer(s). ", self.peers.len());
                let peer_ids: Vec<_> = self.peers.keys().cloned().collect();
                for peer_id in peer_ids {
                    self.remove_peer(&peer_id);
                }
            },
            Command::SignalingPayload { payload, peer_id, connection_id } => {
                self.on_signaling_payload(payload, &peer_id, &connection_id)
            },
            Command::Send { data, peer_id, via_incoming } => {
                let direction = if via_incoming { Direction::Incoming } else { Direction::Outgoing };
                if !self.send_to_peer(&data, &peer_id, direction) {
                    debug!("No {direction} connection to {peer_id} can take a message now. ");
                }
            },
            Command::SendBatch(batch) => {
                let id = self.next_batch_id;
                self.next_batch_id += 1;
                self.drain_batch(id, batch);
            },
            Command::ResumeBatch(id) => {
                if let Some(batch) = self.batches.remove(&id) {
                    self.drain_batch(id, batch);
                }
            },
            Command::Reconnect(peer_id) => {
                info!("Reconnecting to {peer_id}. ");
                self.disconnect_peer(&peer_id, &[Direction::Outgoing]);
                self.refresh();
            },
            Command::Refresh => self.refresh(),
            Command::LivenessCheck { connection_id, direction } => self.check_liveness(direction, connection_id),
            Command::AnnounceOutgoing(peer_id) => {
                if self.connected_outgoing.contains(&peer_id) {
                    self.emit(ConnectivityEvent::OutgoingPeerConnected(peer_id));
                }
            },
            Command::Stop => self.lifecycle = Lifecycle::Stopped,
        }
    }

    fn set_peer_list(&mut self, peers: Vec<Peer>) {
        let listed: HashSet<_> = peers.iter().map(|p| p.id.clone()).collect();
        let gone: Vec<_> = self.peers.keys().filter(|id| !listed.contains(*id)).cloned().collect();
        for peer_id in gone {
            self.remove_peer(&peer_id);
        }

        for peer in peers {
            self.add_peer(peer);
        }
    }

    fn add_peer(&mut self, peer: Peer) {
        if self.peers.contains_key(&peer.id) {
            debug!("Peer {} announced again, replacing it. ", peer.id);
            self.disconnect_peer(&peer.id, &[Direction::Incoming, Direction::Outgoing]);
        } else {
            info!("Peer {} ({}) is online. ", peer.id, peer.kind);
        }

        self.peers.insert(peer.id.clone(), peer);
        self.trigger_refresh();
    }

    fn remove_peer(&mut self, peer_id: &str) {
        self.disconnect_peer(peer_id, &[Direction::Incoming, Direction::Outgoing]);
        self.pools.remove(peer_id);
        if self.peers.remove(peer_id).is_some() {
            info!("Peer {peer_id} went offline. ");
        }
    }

    fn disconnect_peer(&mut self, peer_id: &str, directions: &[Direction]) {
        for &direction in directions {
            let ids: Vec<_> = match self.pools.get_mut(peer_id) {
                Some(pools) => pools.pool_mut(direction).drain().collect(),
                None => vec![],
            };

            for id in ids {
                if let Some(mut connection) = self.connections.remove(&(direction, id)) {
                    connection.disconnect();
                }
            }

            let was_connected = match direction {
                Direction::Incoming => self.connected_incoming.remove(peer_id),
                Direction::Outgoing => self.connected_outgoing.remove(peer_id),
            };

            if was_connected {
                debug!("Peer {peer_id} disconnected ({direction}). ");
                self.emit(ConnectivityEvent::PeerDisconnected {
                    peer_id: peer_id.to_string(),
                    direction,
                });

                if direction == Direction::Outgoing {
                    self.report_connected_peers();
                }
            }
        }
    }

    fn on_signaling_payload(&mut self, payload: NegotiationPayload, peer_id: &str, connection_id: &str) {
        for direction in [Direction::Outgoing, Direction::Incoming] {
            let key = (direction, connection_id.to_string());
            if let Some(connection) = self.connections.get_mut(&key) {
                if connection.peer_id() == peer_id {
                    connection.handle_payload(payload);
                } else {
                    warn!("Peer {peer_id} sent negotiation for a connection it does not own. ");
                }
                return;
            }
        }

        if !self.peers.contains_key(peer_id) {
            debug!("Dropping negotiation from unknown peer {peer_id}. ");
            return;
        }

        let incoming = self.pool_len(peer_id, Direction::Incoming);
        if incoming >= self.config.max_incoming_connections {
            debug!("Peer {peer_id} reached {incoming} incoming connections, dropping negotiation. ");
            return;
        }

        if let Some(connection) = self.create_connection(peer_id, Direction::Incoming, connection_id.to_string()) {
            connection.handle_payload(payload);
        }
    }

    fn create_connection(
        &mut self,
        peer_id: &str,
        direction: Direction,
        id: String,
    ) -> Option<&mut Connection> {
        let spec = ConnectionSpec {
            id: id.clone(),
            peer_id: peer_id.to_string(),
            direction,
        };
        let sink = EventSink::new(id.clone(), direction, self.transport_tx.clone());

        let transport = match self.factory.create(&spec, sink) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Failed to create {direction} connection to {peer_id}: {e}. ");
                return None;
            },
        };

        self.pools
            .entry(peer_id.to_string())
            .or_default()
            .pool_mut(direction)
            .insert(id.clone());

        self.schedule(LIVENESS_TIMEOUT, Command::LivenessCheck {
            connection_id: id.clone(),
            direction,
        });

        let connection = Connection::new(&spec, transport, self.config.thresholds);
        Some(self.connections.entry((direction, id)).or_insert(connection))
    }

    fn trigger_refresh(&mut self) {
        if self.refresh_pending {
            return;
        }

        self.refresh_pending = true;
        self.schedule(REFRESH_DELAY, Command::Refresh);
    }

    fn refresh(&mut self) {
        self.refresh_pending = false;

        let capacity = outgoing_capacity(self.peers.len());
        let nodes: Vec<_> = self
            .peers
            .values()
            .filter(|p| p.is_node())
            .map(|p| p.id.clone())
            .collect();

        for peer_id in nodes {
            let mut created = 0;
            while self.pool_len(&peer_id, Direction::Outgoing) < capacity {
                let id = Uuid::new_v4().to_string();
                match self.create_connection(&peer_id, Direction::Outgoing, id) {
                    Some(connection) => connection.initiate(),
                    None => break,
                }
                created += 1;
            }

            if created > 0 {
                debug!("Opening {created} outgoing connection(s) to {peer_id}. ");
            }
        }
    }

    fn check_liveness(&mut self, direction: Direction, id: String) {
        let key = (direction, id);
        let stalled = match self.connections.get(&key) {
            Some(connection) => !connection.is_open(),
            None => false,
        };

        if !stalled {
            return;
        }

        if let Some(mut connection) = self.connections.remove(&key) {
            warn!("{} connection {} to {} did not open in time. ", direction, key.1, connection.peer_id());
            connection.disconnect();
            if let Some(pools) = self.pools.get_mut(connection.peer_id()) {
                pools.pool_mut(direction).remove(&key.1);
            }
        }

        self.trigger_refresh();
    }

    fn handle_notice(&mut self, notice: TransportNotice) {
        let direction = notice.direction;
        let key = (direction, notice.connection_id);

        let (output, peer_id) = match self.connections.get_mut(&key) {
            Some(connection) => (connection.handle_event(notice.event), connection.peer_id().to_string()),
            None => return,
        };

        match output {
            None => {},
            Some(ConnectionOutput::Relay(payload)) => self.emit(ConnectivityEvent::Relay {
                peer_id,
                connection_id: key.1,
                payload,
            }),
            Some(ConnectionOutput::Opened) => self.on_connection_open(peer_id, direction),
            Some(ConnectionOutput::Closed) => self.on_connection_closed(peer_id, direction, key.1),
            Some(ConnectionOutput::Message(data)) => {
                if let Some(speed) = &self.speed {
                    speed.observe_download(data.len());
                }
                self.emit(ConnectivityEvent::Message {
                    peer_id,
                    direction,
                    data,
                });
            },
        }
    }

    fn on_connection_open(&mut self, peer_id: String, direction: Direction) {
        let first = match direction {
            Direction::Incoming => self.connected_incoming.insert(peer_id.clone()),
            Direction::Outgoing => self.connected_outgoing.insert(peer_id.clone()),
        };

        if !first {
            return;
        }

        info!("Peer {peer_id} connected ({direction}). ");
        self.emit(ConnectivityEvent::PeerConnected {
            peer_id: peer_id.clone(),
            direction,
        });

        if direction == Direction::Outgoing {
            self.report_connected_peers();
            self.schedule(OUTGOING_ANNOUNCE_DELAY, Command::AnnounceOutgoing(peer_id));
        }
    }

    fn on_connection_closed(&mut self, peer_id: String, direction: Direction, id: String) {
        if let Some(mut connection) = self.connections.remove(&(direction, id.clone())) {
            connection.disconnect();
        }

        let remaining = match self.pools.get_mut(&peer_id) {
            Some(pools) => {
                pools.pool_mut(direction).remove(&id);
                pools.pool(direction).len()
            },
            None => 0,
        };

        match direction {
            Direction::Incoming => {
                if remaining == 0 {
                    self.disconnect_peer(&peer_id, &[Direction::Incoming]);
                }
            },
            Direction::Outgoing => {
                self.disconnect_peer(&peer_id, &[Direction::Incoming, Direction::Outgoing]);
                self.trigger_refresh();
            },
        }
    }

    fn send_to_peer(&mut self, data: &Bytes, peer_id: &str, direction: Direction) -> bool {
        let ids: Vec<_> = match self.pools.get(peer_id) {
            Some(pools) => pools.pool(direction).iter().cloned().collect(),
            None => return false,
        };

        for id in self.selection.shuffled(ids) {
            let connection = match self.connections.get_mut(&(direction, id)) {
                Some(connection) => connection,
                None => continue,
            };

            if !connection.is_open() || connection.is_overflowed() {
                continue;
            }

            if connection.send(data.clone()) {
                if let Some(speed) = &self.speed {
                    speed.observe_upload(data.len());
                }
                return true;
            }
        }

        false
    }

    fn drain_batch(&mut self, id: u64, mut batch: PendingBatch) {
        loop {
            if !(batch.still_wanted)() {
                debug!("Batch for {} no longer wanted, {} message(s) skipped. ", batch.peer_id, batch.messages.len());
                batch.finish(false);
                return;
            }

            if !self.peers.contains_key(&batch.peer_id) {
                debug!("Batch target {} is gone. ", batch.peer_id);
                batch.finish(false);
                return;
            }

            let message = match batch.messages.front() {
                Some(message) => message.clone(),
                None => {
                    batch.finish(true);
                    return;
                },
            };

            if self.send_to_peer(&message, &batch.peer_id, Direction::Incoming) {
                batch.messages.pop_front();
                continue;
            }

            self.batches.insert(id, batch);
            self.schedule(BATCH_RETRY_INTERVAL, Command::ResumeBatch(id));
            return;
        }
    }

    fn pool_len(&self, peer_id: &str, direction: Direction) -> usize {
        self.pools.get(peer_id).map(|p| p.pool(direction).len()).unwrap_or(0)
    }

    fn report_connected_peers(&self) {
        if let Some(metadata) = &self.metadata {
            metadata.update_status(StatusUpdate::ConnectedPeers(self.connected_outgoing.len()));
        }
    }

    fn schedule(&self, delay: Duration, command: Command) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(command);
        });
    }

    fn emit(&self, event: ConnectivityEvent) {
        if self.events.send(event).is_err() {
            debug!("Connectivity event dropped, no listener. ");
        }
    }

    fn shutdown(&mut self) {
        for (_, mut connection) in self.connections.drain() {
            connection.disconnect();
        }
        for (_, batch) in self.batches.drain() {
            batch.finish(false);
        }
        self.pools.clear();
        self.peers.clear();
        debug!("Connectivity service stopped. ");
    }

    #[cfg(test)]
    fn pump(&mut self) {
        loop {
            if let Ok(notice) = self.transport_rx.try_recv() {
                self.handle_notice(notice);
                continue;
            }
            if let Ok(command) = self.rx.try_recv() {
                self.handle_command(command);
                continue;
            }
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::time::advance;

    use super::*;
    use crate::{
        connectivity::testing::{Call, MockFactory},
        storage::IndexMetadataStore,
    };

    struct Harness {
        service: ConnectivityService,
        handle: ConnectivityHandle,
        factory: Arc<MockFactory>,
        events: UnboundedReceiver<ConnectivityEvent>,
        metadata: Arc<IndexMetadataStore>,
    }

    impl Harness {
        fn new() -> Self {
            let factory = Arc::new(MockFactory::default());
            let metadata = Arc::new(IndexMetadataStore::default());
            let (events_tx, events) = mpsc::unbounded_channel();
            let config = ConnectivityConfig {
                max_incoming_connections: 8,
                thresholds: Thresholds {
                    send_high_water: 15,
                    overflow_threshold: 8,
                },
                selection_seed: Some(3),
            };

            let (service, handle) = ConnectivityService::new(
                config,
                factory.clone(),
                events_tx,
                None,
                Some(metadata.clone() as Arc<dyn MetadataStore>),
            );

            Self { service, handle, factory, events, metadata }
        }

        async fn settle(&mut self, elapsed: Duration) {
            advance(elapsed).await;
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
            self.service.pump();
        }

        fn drain_events(&mut self) -> Vec<ConnectivityEvent> {
            let mut events = vec![];
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        fn command(&mut self, command: Command) {
            self.service.handle_command(command);
            self.service.pump();
        }
    }

    fn node(id: &str) -> Peer {
        Peer {
            id: id.into(),
            kind: NODE_KIND.into(),
            own: true,
        }
    }

    fn offer() -> NegotiationPayload {
        NegotiationPayload::Offer { sdp: "v=0".into() }
    }

    #[test]
    fn capacity_favours_few_peers() {
        assert_eq!(outgoing_capacity(1), 6);
        assert_eq!(outgoing_capacity(3), 2);
        assert_eq!(outgoing_capacity(5), 2);
        assert_eq!(outgoing_capacity(6), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_opens_capacity_bounded_outgoing_connections() {
        let mut h = Harness::new();
        h.command(Command::SetPeerList(vec![node("a"), node("b"), node("c")]));
        assert!(h.factory.sessions().is_empty());

        h.settle(REFRESH_DELAY).await;

        for peer in ["a", "b", "c"] {
            let sessions = h.factory.sessions_for(peer, Direction::Outgoing);
            assert_eq!(sessions.len(), 2);
            assert!(sessions.iter().all(|s| s.transport.calls() == vec![Call::Offer]));
        }

        // a second sweep does not exceed capacity
        h.command(Command::Refresh);
        assert_eq!(h.factory.sessions().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_skips_non_node_peers() {
        let mut h = Harness::new();
        let web = Peer {
            id: "browser".into(),
            kind: "web".into(),
            own: false,
        };
        h.command(Command::SetPeerList(vec![node("a"), web]));
        h.settle(REFRESH_DELAY).await;

        assert_eq!(h.factory.sessions_for("a", Direction::Outgoing).len(), outgoing_capacity(2));
        assert!(h.factory.sessions_for("browser", Direction::Outgoing).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn incoming_connections_are_capped_per_peer() {
        let mut h = Harness::new();
        h.command(Command::PeerConnected(node("a")));

        for i in 0..10 {
            h.handle.on_signaling_payload(offer(), "a", &format!("remote-{i}"));
        }
        h.handle.on_signaling_payload(offer(), "stranger", "remote-x");
        h.service.pump();

        let incoming = h.factory.sessions_for("a", Direction::Incoming);
        assert_eq!(incoming.len(), 8);
        assert!(incoming.iter().all(|s| s.transport.calls() == vec![Call::Remote(offer())]));
        assert!(h.factory.sessions_for("stranger", Direction::Incoming).is_empty());

        // payloads for an existing connection reach it instead of opening another
        h.handle.on_signaling_payload(offer(), "a", "remote-0");
        h.service.pump();
        assert_eq!(h.factory.sessions_for("a", Direction::Incoming).len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connection_is_replaced_after_liveness_timeout() {
        let mut h = Harness::new();
        h.command(Command::PeerConnected(node("a")));
        h.settle(REFRESH_DELAY).await;
        assert_eq!(h.factory.sessions().len(), 6);

        // keep one connection alive
        let sessions = h.factory.sessions();
        sessions[0].open(true, 0);
        h.service.pump();

        h.settle(LIVENESS_TIMEOUT).await;
        for session in &sessions[1..] {
            assert_eq!(session.transport.calls().last(), Some(&Call::Close));
        }
        assert_ne!(sessions[0].transport.calls().last(), Some(&Call::Close));

        h.settle(REFRESH_DELAY).await;
        assert_eq!(h.factory.sessions().len(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn open_is_announced_once_with_debounce() {
        let mut h = Harness::new();
        h.command(Command::PeerConnected(node("a")));
        h.settle(REFRESH_DELAY).await;

        for session in h.factory.sessions() {
            session.open(true, 0);
        }
        h.service.pump();

        let events = h.drain_events();
        assert_eq!(
            events,
            vec![ConnectivityEvent::PeerConnected {
                peer_id: "a".into(),
                direction: Direction::Outgoing,
            }],
        );
        assert_eq!(h.metadata.status().unwrap().connected_peers, 1);

        h.settle(OUTGOING_ANNOUNCE_DELAY).await;
        assert_eq!(h.drain_events(), vec![ConnectivityEvent::OutgoingPeerConnected("a".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn relays_local_descriptions_with_connection_id() {
        let mut h = Harness::new();
        h.command(Command::PeerConnected(node("a")));
        h.handle.on_signaling_payload(offer(), "a", "remote-1");
        h.service.pump();

        let session = &h.factory.sessions_for("a", Direction::Incoming)[0];
        let answer = NegotiationPayload::Answer { sdp: "answer".into() };
        session.sink.emit(crate::connectivity::transport::TransportEvent::LocalDescription(answer.clone()));
        h.service.pump();

        assert_eq!(
            h.drain_events(),
            vec![ConnectivityEvent::Relay {
                peer_id: "a".into(),
                connection_id: "remote-1".into(),
                payload: answer,
            }],
        );
    }

    #[tokio::test(start_paused = true)]
    async fn outgoing_close_cascades_to_both_directions() {
        let mut h = Harness::new();
        h.command(Command::PeerConnected(node("a")));
        h.settle(REFRESH_DELAY).await;
        h.handle.on_signaling_payload(offer(), "a", "remote-1");
        h.service.pump();

        let incoming = h.factory.sessions_for("a", Direction::Incoming)[0].clone();
        let outgoing = h.factory.sessions_for("a", Direction::Outgoing);
        incoming.open(true, 0);
        for session in &outgoing {
            session.open(true, 0);
        }
        h.service.pump();
        h.drain_events();

        outgoing[0].close();
        h.service.pump();

        let events = h.drain_events();
        assert!(events.contains(&ConnectivityEvent::PeerDisconnected {
            peer_id: "a".into(),
            direction: Direction::Incoming,
        }));
        assert!(events.contains(&ConnectivityEvent::PeerDisconnected {
            peer_id: "a".into(),
            direction: Direction::Outgoing,
        }));
        assert_eq!(incoming.transport.calls().last(), Some(&Call::Close));
        assert_eq!(h.metadata.status().unwrap().connected_peers, 0);

        // the sweep rebuilds outgoing links
        h.settle(REFRESH_DELAY).await;
        assert_eq!(h.factory.sessions_for("a", Direction::Outgoing).len(), outgoing.len() * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn incoming_close_disconnects_incoming_side_when_pool_empties() {
        let mut h = Harness::new();
        h.command(Command::PeerConnected(node("a")));
        h.handle.on_signaling_payload(offer(), "a", "remote-1");
        h.handle.on_signaling_payload(offer(), "a", "remote-2");
        h.service.pump();

        let incoming = h.factory.sessions_for("a", Direction::Incoming);
        for session in &incoming {
            session.open(true, 0);
        }
        h.service.pump();
        h.drain_events();

        incoming[0].close();
        h.service.pump();
        assert!(h.drain_events().is_empty());

        incoming[1].close();
        h.service.pump();
        assert_eq!(
            h.drain_events(),
            vec![ConnectivityEvent::PeerDisconnected {
                peer_id: "a".into(),
                direction: Direction::Incoming,
            }],
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_skips_overflowed_and_closed_connections() {
        let mut h = Harness::new();
        h.command(Command::PeerConnected(node("a")));
        h.handle.on_signaling_payload(offer(), "a", "remote-1");
        h.handle.on_signaling_payload(offer(), "a", "remote-2");
        h.service.pump();

        let sessions = h.factory.sessions_for("a", Direction::Incoming);
        let overflowed = sessions[0].open(true, 9);
        let healthy = sessions[1].open(true, 0);
        h.service.pump();

        for _ in 0..5 {
            h.handle.send(Bytes::from_static(b"m"), "a", true);
        }
        h.service.pump();
        assert_eq!(overflowed.sent_count(), 0);
        assert_eq!(healthy.sent_count(), 5);

        healthy.set_open(false);
        h.handle.send(Bytes::from_static(b"m"), "a", true);
        h.handle.send(Bytes::from_static(b"m"), "a", false);
        h.service.pump();
        assert_eq!(overflowed.sent_count() + healthy.sent_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_waits_for_capacity_and_honours_abort() {
        let mut h = Harness::new();
        h.command(Command::PeerConnected(node("a")));
        h.handle.on_signaling_payload(offer(), "a", "remote-1");
        h.service.pump();
        let channel = h.factory.sessions_for("a", Direction::Incoming)[0].open(true, 9);
        h.service.pump();

        let (tx, mut rx) = oneshot::channel();
        let wanted = Arc::new(AtomicBool::new(true));
        let still_wanted: StillWanted = {
            let wanted = wanted.clone();
            Arc::new(move || wanted.load(Ordering::SeqCst))
        };
        let messages = vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")];
        h.handle.send_batch(messages, "a", tx, still_wanted);
        h.service.pump();
        assert_eq!(channel.sent_count(), 0);
        assert!(rx.try_recv().is_err());

        channel.set_buffered(0);
        h.settle(BATCH_RETRY_INTERVAL).await;
        assert_eq!(channel.sent(), vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]);
        assert_eq!(rx.try_recv(), Ok(true));

        let (tx, mut rx) = oneshot::channel();
        channel.set_buffered(9);
        let still_wanted: StillWanted = {
            let wanted = wanted.clone();
            Arc::new(move || wanted.load(Ordering::SeqCst))
        };
        h.handle.send_batch(vec![Bytes::from_static(b"3")], "a", tx, still_wanted);
        h.service.pump();

        wanted.store(false, Ordering::SeqCst);
        h.settle(BATCH_RETRY_INTERVAL).await;
        assert_eq!(rx.try_recv(), Ok(false));
        assert_eq!(channel.sent_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn known_peer_is_replaced_and_signaling_loss_drops_everyone() {
        let mut h = Harness::new();
        h.command(Command::SetPeerList(vec![node("a"), node("b")]));
        h.handle.on_signaling_payload(offer(), "a", "remote-1");
        h.service.pump();
        let first = h.factory.sessions_for("a", Direction::Incoming)[0].clone();

        h.command(Command::PeerConnected(node("a")));
        assert_eq!(first.transport.calls().last(), Some(&Call::Close));

        h.settle(REFRESH_DELAY).await;
        let outgoing = h.factory.sessions_for("b", Direction::Outgoing);
        assert!(!outgoing.is_empty());

        h.command(Command::SignalingDisconnected);
        assert!(outgoing.iter().all(|s| s.transport.calls().last() == Some(&Call::Close)));

        // unknown peers cannot open connections anymore
        h.handle.on_signaling_payload(offer(), "a", "remote-2");
        h.service.pump();
        assert_eq!(h.factory.sessions_for("a", Direction::Incoming).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_rebuilds_only_outgoing() {
        let mut h = Harness::new();
        h.command(Command::PeerConnected(node("a")));
        h.settle(REFRESH_DELAY).await;
        h.handle.on_signaling_payload(offer(), "a", "remote-1");
        h.service.pump();
        let incoming = h.factory.sessions_for("a", Direction::Incoming)[0].clone();
        let before = h.factory.sessions_for("a", Direction::Outgoing).len();

        h.command(Command::Reconnect("a".into()));
        assert_eq!(h.factory.sessions_for("a", Direction::Outgoing).len(), before * 2);
        assert_ne!(incoming.transport.calls().last(), Some(&Call::Close));
    }
}
