use std::{
    fmt::{Display, Formatter},
    result,
    sync::Arc,
};

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter) -> result::Result<(), std::fmt::Error> {
        match self {
            Direction::Incoming => write!(f, "incoming"),
            Direction::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// NAT-traversal negotiation message relayed through the signaling server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NegotiationPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,

        #[serde(default)]
        sdp_mid: Option<String>,

        #[serde(default)]
        sdp_mline_index: Option<u16>,
    },
}

pub trait DataChannel: Send + Sync {
    fn is_open(&self) -> bool;
    /// Bytes handed to the channel but not yet sent.
    fn buffered_amount(&self) -> usize;
    fn send(&self, data: Bytes);
}

pub enum TransportEvent {
    /// A local offer or answer was created and applied.
    LocalDescription(NegotiationPayload),
    RemoteDescriptionSet,
    LocalCandidate(NegotiationPayload),
    ChannelAdded {
        index: usize,
        channel: Arc<dyn DataChannel>,
    },
    ChannelOpen(usize),
    ChannelClosed(usize),
    Message(Bytes),
    Failed(String),
}

/// One peer session. Every call returns immediately; results come back as
/// [`TransportEvent`]s through the session's [`EventSink`].
pub trait Transport: Send {
    fn create_offer(&mut self);
    fn create_answer(&mut self);
    fn set_remote_description(&mut self, description: NegotiationPayload);
    fn add_ice_candidate(&mut self, candidate: NegotiationPayload);
    fn close(&mut self);
}

#[derive(Clone, Debug)]
pub struct ConnectionSpec {
    pub id: String,
    pub peer_id: String,
    pub direction: Direction,
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, spec: &ConnectionSpec, sink: EventSink) -> Result<Box<dyn Transport>>;
}

pub struct TransportNotice {
    pub connection_id: String,
    pub direction: Direction,
    pub event: TransportEvent,
}

/// Upward path from a transport session to the service owning its connection.
#[derive(Clone)]
pub struct EventSink {
    connection_id: String,
    direction: Direction,
    tx: UnboundedSender<TransportNotice>,
}

impl EventSink {
    pub fn new(connection_id: String, direction: Direction, tx: UnboundedSender<TransportNotice>) -> Self {
        Self {
            connection_id,
            direction,
            tx,
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        // transports may outlive the service during teardown
        let _ = self.tx.send(TransportNotice {
            connection_id: self.connection_id.clone(),
            direction: self.direction,
            event,
        });
    }
}
