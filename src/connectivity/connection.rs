use std::{collections::HashSet, sync::Arc};

use bytes::Bytes;
use log::{debug, warn};

use crate::connectivity::transport::{
    ConnectionSpec,
    DataChannel,
    Direction,
    NegotiationPayload,
    Transport,
    TransportEvent,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Thresholds {
    /// A channel accepts a send only below this many buffered bytes.
    pub send_high_water: usize,
    /// A connection is overflowed once every channel buffers more than this.
    pub overflow_threshold: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Negotiating,
    Open,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionOutput {
    Relay(NegotiationPayload),
    Opened,
    Closed,
    Message(Bytes),
}

pub struct Connection {
    id: String,
    peer_id: String,
    direction: Direction,
    state: ConnectionState,
    transport: Box<dyn Transport>,
    channels: Vec<(usize, Arc<dyn DataChannel>)>,
    open_channels: HashSet<usize>,
    closed_channels: HashSet<usize>,
    cursor: usize,
    thresholds: Thresholds,
    local_description_set: bool,
    remote_description_set: bool,
    // None once both descriptions are set, candidates are applied directly from then on
    pending_candidates: Option<Vec<NegotiationPayload>>,
}

impl Connection {
    pub fn new(spec: &ConnectionSpec, transport: Box<dyn Transport>, thresholds: Thresholds) -> Self {
        Self {
            id: spec.id.clone(),
            peer_id: spec.peer_id.clone(),
            direction: spec.direction,
            state: ConnectionState::Negotiating,
            transport,
            channels: vec![],
            open_channels: HashSet::new(),
            closed_channels: HashSet::new(),
            cursor: 0,
            thresholds,
            local_description_set: false,
            remote_description_set: false,
            pending_candidates: Some(vec![]),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn initiate(&mut self) {
        debug!("Offering {} connection {} to {}. ", self.direction, self.id, self.peer_id);
        self.transport.create_offer();
    }

    pub fn handle_payload(&mut self, payload: NegotiationPayload) {
        if self.state == ConnectionState::Closed {
            return;
        }

        match payload {
            NegotiationPayload::Offer { .. } | NegotiationPayload::Answer { .. } => {
                self.transport.set_remote_description(payload);
            },
            NegotiationPayload::Candidate { .. } => match &mut self.pending_candidates {
                Some(pending) => pending.push(payload),
                None => self.transport.add_ice_candidate(payload),
            },
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) -> Option<ConnectionOutput> {
        if self.state == ConnectionState::Closed {
            return None;
        }

        match event {
            TransportEvent::LocalDescription(description) => {
                self.local_description_set = true;
                self.flush_candidates();
                Some(ConnectionOutput::Relay(description))
            },
            TransportEvent::RemoteDescriptionSet => {
                self.remote_description_set = true;
                if self.direction == Direction::Incoming && !self.local_description_set {
                    self.transport.create_answer();
                }
                self.flush_candidates();
                None
            },
            TransportEvent::LocalCandidate(candidate) => Some(ConnectionOutput::Relay(candidate)),
            TransportEvent::ChannelAdded { index, channel } => {
                self.channels.push((index, channel));
                None
            },
            TransportEvent::ChannelOpen(index) => {
                if !self.channels.iter().any(|(i, _)| *i == index) {
                    warn!("Connection {} reported unknown channel {index} open. ", self.id);
                    return None;
                }

                self.open_channels.insert(index);
                if self.state == ConnectionState::Negotiating {
                    self.state = ConnectionState::Open;
                    return Some(ConnectionOutput::Opened);
                }

                None
            },
            TransportEvent::ChannelClosed(index) => {
                self.open_channels.remove(&index);
                self.closed_channels.insert(index);

                let all_closed = !self.channels.is_empty()
                    && self.channels.iter().all(|(i, _)| self.closed_channels.contains(i));
                if all_closed {
                    self.state = ConnectionState::Closed;
                    return Some(ConnectionOutput::Closed);
                }

                None
            },
            TransportEvent::Message(data) => Some(ConnectionOutput::Message(data)),
            TransportEvent::Failed(reason) => {
                warn!("Connection {} to {} failed: {reason}. ", self.id, self.peer_id);
                self.state = ConnectionState::Closed;
                Some(ConnectionOutput::Closed)
            },
        }
    }

    fn flush_candidates(&mut self) {
        if !(self.local_description_set && self.remote_description_set) {
            return;
        }

        if let Some(pending) = self.pending_candidates.take() {
            if !pending.is_empty() {
                debug!("Applying {} buffered candidate(s) on {}. ", pending.len(), self.id);
            }
            for candidate in pending {
                self.transport.add_ice_candidate(candidate);
            }
        }
    }

    /// True only when every channel is buffering above the overflow threshold.
    pub fn is_overflowed(&self) -> bool {
        !self.channels.is_empty()
            && self
                .channels
                .iter()
                .all(|(_, c)| c.buffered_amount() > self.thresholds.overflow_threshold)
    }

    /// Sends on the next channel in rotation that is open and below the high
    /// water mark. Returns false, writing nothing, when no channel qualifies.
    pub fn send(&mut self, data: Bytes) -> bool {
        if self.state != ConnectionState::Open || self.channels.is_empty() {
            return false;
        }

        let count = self.channels.len();
        for _ in 0..=count {
            let (_, channel) = &self.channels[self.cursor % count];
            self.cursor = (self.cursor + 1) % count;

            if channel.is_open() && channel.buffered_amount() < self.thresholds.send_high_water {
                channel.send(data);
                return true;
            }
        }

        false
    }

    pub fn disconnect(&mut self) {
        if self.state != ConnectionState::Closed {
            debug!("Closing {} connection {} to {}. ", self.direction, self.id, self.peer_id);
        }
        self.state = ConnectionState::Closed;
        self.transport.close();
    }
}
