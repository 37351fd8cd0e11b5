use std::{collections::BTreeSet, sync::Arc};

use anyhow::Result;
use log::{debug, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    connectivity::PeerSender,
    lifecycle::{used_after_stop, Lifecycle},
    protocol::{encode_frames, ByteRange, ObjectRef, PeerMessage},
};

/// Ranges a peer reported for a subscribed object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvailabilityUpdate {
    pub peer_id: String,
    pub object: ObjectRef,
    pub ranges: Vec<ByteRange>,
}

pub enum Command {
    Subscribe(Vec<ObjectRef>),
    Unsubscribe(Vec<ObjectRef>),
    OutgoingPeerConnected(String),
    PeerDisconnected(String),
    Response {
        peer_id: String,
        object: ObjectRef,
        ranges: Vec<ByteRange>,
    },
    Stop,
}

#[derive(Clone)]
pub struct ConsumerHandle {
    tx: UnboundedSender<Command>,
}

impl ConsumerHandle {
    #[cfg(test)]
    pub fn detached() -> (Self, UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn subscribe(&self, objects: Vec<ObjectRef>) {
        self.dispatch(Command::Subscribe(objects));
    }

    pub fn unsubscribe(&self, objects: Vec<ObjectRef>) {
        self.dispatch(Command::Unsubscribe(objects));
    }

    pub fn on_outgoing_peer_connected(&self, peer_id: &str) {
        self.dispatch(Command::OutgoingPeerConnected(peer_id.to_string()));
    }

    pub fn on_peer_disconnected(&self, peer_id: &str) {
        self.dispatch(Command::PeerDisconnected(peer_id.to_string()));
    }

    pub fn on_response(&self, peer_id: &str, object: ObjectRef, ranges: Vec<ByteRange>) {
        self.dispatch(Command::Response {
            peer_id: peer_id.to_string(),
            object,
            ranges,
        });
    }

    pub fn stop(&self) {
        self.dispatch(Command::Stop);
    }

    fn dispatch(&self, command: Command) {
        if self.tx.send(command).is_err() {
            used_after_stop("availability consumer");
        }
    }
}

/// Asks connected peers which ranges of the subscribed objects they hold.
pub struct AvailabilityInfoConsumer {
    subscriptions: BTreeSet<ObjectRef>,
    peers: BTreeSet<String>,
    sender: Arc<dyn PeerSender>,
    updates: UnboundedSender<AvailabilityUpdate>,
    lifecycle: Lifecycle,
    rx: UnboundedReceiver<Command>,
}

impl AvailabilityInfoConsumer {
    pub fn new(sender: Arc<dyn PeerSender>, updates: UnboundedSender<AvailabilityUpdate>) -> (Self, ConsumerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        let consumer = Self {
            subscriptions: BTreeSet::new(),
            peers: BTreeSet::new(),
            sender,
            updates,
            lifecycle: Lifecycle::Uninitialized,
            rx,
        };

        (consumer, ConsumerHandle { tx })
    }

    pub async fn start(mut self) -> Result<()> {
        self.lifecycle = Lifecycle::Running;

        while let Some(command) = self.rx.recv().await {
            self.handle(command);
            if !self.lifecycle.is_running() {
                break;
            }
        }

        Ok(())
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe(objects) => {
                let added: Vec<_> = objects
                    .into_iter()
                    .filter(|object| self.subscriptions.insert(object.clone()))
                    .collect();

                let requests = requests_for(added.iter());
                for peer_id in &self.peers {
                    self.send(&requests, peer_id);
                }
            },
            Command::Unsubscribe(objects) => {
                let aborts: Vec<_> = objects
                    .into_iter()
                    .filter(|object| self.subscriptions.remove(object))
                    .map(|object| PeerMessage::Abort { object, offset: None })
                    .collect();

                for peer_id in &self.peers {
                    self.send(&aborts, peer_id);
                }
            },
            Command::OutgoingPeerConnected(peer_id) => {
                let requests = requests_for(self.subscriptions.iter());
                self.send(&requests, &peer_id);
                self.peers.insert(peer_id);
            },
            Command::PeerDisconnected(peer_id) => {
                self.peers.remove(&peer_id);
            },
            Command::Response { peer_id, object, ranges } => {
                if !self.subscriptions.contains(&object) {
                    debug!("Availability of unsubscribed {object} from {peer_id} ignored. ");
                    return;
                }

                let update = AvailabilityUpdate { peer_id, object, ranges };
                if self.updates.send(update).is_err() {
                    debug!("Availability update dropped, no listener. ");
                }
            },
            Command::Stop => self.lifecycle = Lifecycle::Stopped,
        }
    }

    #[cfg(test)]
    pub fn pump(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            self.handle(command);
        }
    }

    #[cfg(test)]
    pub fn subscriptions(&self) -> Vec<ObjectRef> {
        self.subscriptions.iter().cloned().collect()
    }

    fn send(&self, messages: &[PeerMessage], peer_id: &str) {
        if messages.is_empty() {
            return;
        }

        match encode_frames(messages) {
            Ok(frames) => {
                for frame in frames {
                    self.sender.send(frame, peer_id, false);
                }
            },
            Err(e) => warn!("Failed to encode availability frames: {e}. "),
        }
    }
}

fn requests_for<'a>(objects: impl Iterator<Item = &'a ObjectRef>) -> Vec<PeerMessage> {
    objects
        .map(|object| PeerMessage::AvailabilityRequest { object: object.clone() })
        .collect()
}
