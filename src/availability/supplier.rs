use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use anyhow::Result;
use log::{debug, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    connectivity::PeerSender,
    lifecycle::{used_after_stop, Lifecycle},
    protocol::{encode_frames, ByteRange, ObjectRef, PeerMessage},
    storage::{AssetResolver, LocalStore, MetadataStore},
};

pub enum Command {
    Request {
        peer_id: String,
        object: ObjectRef,
    },
    Abort {
        peer_id: String,
        object: ObjectRef,
    },
    NodeDisconnected(String),
    NewDataDownloaded {
        object: ObjectRef,
        range: ByteRange,
    },
    Stop,
}

#[derive(Clone)]
pub struct SupplierHandle {
    tx: UnboundedSender<Command>,
}

impl SupplierHandle {
    #[cfg(test)]
    pub fn detached() -> (Self, UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn on_request(&self, peer_id: &str, object: ObjectRef) {
        self.dispatch(Command::Request {
            peer_id: peer_id.to_string(),
            object,
        });
    }

    pub fn on_abort(&self, peer_id: &str, object: ObjectRef) {
        self.dispatch(Command::Abort {
            peer_id: peer_id.to_string(),
            object,
        });
    }

    pub fn on_node_disconnected(&self, peer_id: &str) {
        self.dispatch(Command::NodeDisconnected(peer_id.to_string()));
    }

    pub fn on_new_data_downloaded(&self, object: ObjectRef, range: ByteRange) {
        self.dispatch(Command::NewDataDownloaded { object, range });
    }

    pub fn stop(&self) {
        self.dispatch(Command::Stop);
    }

    fn dispatch(&self, command: Command) {
        if self.tx.send(command).is_err() {
            used_after_stop("availability supplier");
        }
    }
}

/// Answers availability queries from local state, remembering peers that
/// asked about objects we cannot serve yet.
pub struct AvailabilityInfoSupplier {
    subscriptions: HashMap<ObjectRef, BTreeSet<String>>,
    metadata: Arc<dyn MetadataStore>,
    local: Arc<dyn LocalStore>,
    resolver: Arc<dyn AssetResolver>,
    sender: Arc<dyn PeerSender>,
    lifecycle: Lifecycle,
    rx: UnboundedReceiver<Command>,
}

impl AvailabilityInfoSupplier {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        local: Arc<dyn LocalStore>,
        resolver: Arc<dyn AssetResolver>,
        sender: Arc<dyn PeerSender>,
    ) -> (Self, SupplierHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        let supplier = Self {
            subscriptions: HashMap::new(),
            metadata,
            local,
            resolver,
            sender,
            lifecycle: Lifecycle::Uninitialized,
            rx,
        };

        (supplier, SupplierHandle { tx })
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
            Command::Request { peer_id, object } => match self.available_ranges(&object) {
                Some(ranges) => self.respond(&peer_id, object, ranges),
                None => {
                    debug!("{object} not available yet, subscribing {peer_id}. ");
                    self.subscriptions.entry(object).or_default().insert(peer_id);
                },
            },
            Command::Abort { peer_id, object } => {
                if let Some(peers) = self.subscriptions.get_mut(&object) {
                    peers.remove(&peer_id);
                    if peers.is_empty() {
                        self.subscriptions.remove(&object);
                    }
                }
            },
            Command::NodeDisconnected(peer_id) => {
                self.subscriptions.retain(|_, peers| {
                    peers.remove(&peer_id);
                    !peers.is_empty()
                });
            },
            Command::NewDataDownloaded { object, range } => {
                let peers: Vec<_> = match self.subscriptions.get(&object) {
                    Some(peers) => peers.iter().cloned().collect(),
                    None => return,
                };

                for peer_id in peers {
                    self.respond(&peer_id, object.clone(), vec![range]);
                }
            },
            Command::Stop => self.lifecycle = Lifecycle::Stopped,
        }
    }

    /// Full copy, then partial download, then the external asset source.
    fn available_ranges(&self, object: &ObjectRef) -> Option<Vec<ByteRange>> {
        let info = self.metadata.object_info(&object.id)?;
        let full = vec![ByteRange::new(0, info.size)];

        if self.local.full_copy(&info.hash).is_some() {
            return Some(full);
        }

        if let Some(partial) = self.local.partial_download(&info.hash) {
            return Some(partial.ranges);
        }

        let locator = self.metadata.file_meta(&object.id)?.asset_locator?;
        self.resolver.can_resolve(&locator).then_some(full)
    }

    fn respond(&self, peer_id: &str, object: ObjectRef, ranges: Vec<ByteRange>) {
        let response = PeerMessage::AvailabilityResponse { object, ranges };
        match encode_frames(&[response]) {
            Ok(frames) => {
                for frame in frames {
                    self.sender.send(frame, peer_id, true);
                }
            },
            Err(e) => warn!("Failed to encode availability response: {e}. "),
        }
    }
}
