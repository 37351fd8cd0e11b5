use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
    Mutex,
};

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{
    connectivity::{
        transport::{
            ConnectionSpec,
            DataChannel,
            Direction,
            EventSink,
            NegotiationPayload,
            Transport,
            TransportEvent,
            TransportFactory,
        },
        PeerSender,
        StillWanted,
    },
    protocol::{decode_frame, PeerMessage},
};

pub struct MockChannel {
    open: AtomicBool,
    buffered: AtomicUsize,
    sent: Mutex<Vec<Bytes>>,
}

impl MockChannel {
    pub fn new(open: bool, buffered: usize) -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(open),
            buffered: AtomicUsize::new(buffered),
            sent: Mutex::new(vec![]),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn set_buffered(&self, buffered: usize) {
        self.buffered.store(buffered, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl DataChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn send(&self, data: Bytes) {
        self.sent.lock().unwrap().push(data);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Offer,
    Answer,
    Remote(NegotiationPayload),
    Candidate(NegotiationPayload),
    Close,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl MockTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Transport for MockTransport {
    fn create_offer(&mut self) {
        self.record(Call::Offer);
    }

    fn create_answer(&mut self) {
        self.record(Call::Answer);
    }

    fn set_remote_description(&mut self, description: NegotiationPayload) {
        self.record(Call::Remote(description));
    }

    fn add_ice_candidate(&mut self, candidate: NegotiationPayload) {
        self.record(Call::Candidate(candidate));
    }

    fn close(&mut self) {
        self.record(Call::Close);
    }
}

pub struct MockSession {
    pub spec: ConnectionSpec,
    pub sink: EventSink,
    pub transport: MockTransport,
}

impl MockSession {
    /// Adds one channel and reports it open.
    pub fn open(&self, open: bool, buffered: usize) -> Arc<MockChannel> {
        let channel = MockChannel::new(open, buffered);
        let shared: Arc<dyn DataChannel> = channel.clone();
        self.sink.emit(TransportEvent::ChannelAdded { index: 0, channel: shared });
        self.sink.emit(TransportEvent::ChannelOpen(0));
        channel
    }

    pub fn close(&self) {
        self.sink.emit(TransportEvent::ChannelClosed(0));
    }
}

#[derive(Default)]
pub struct MockFactory {
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockFactory {
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn sessions_for(&self, peer_id: &str, direction: Direction) -> Vec<Arc<MockSession>> {
        self.sessions()
            .into_iter()
            .filter(|s| s.spec.peer_id == peer_id && s.spec.direction == direction)
            .collect()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, spec: &ConnectionSpec, sink: EventSink) -> Result<Box<dyn Transport>> {
        let transport = MockTransport::default();
        self.sessions.lock().unwrap().push(Arc::new(MockSession {
            spec: spec.clone(),
            sink,
            transport: transport.clone(),
        }));
        Ok(Box::new(transport))
    }
}

pub struct RecordedBatch {
    pub peer_id: String,
    pub messages: Vec<Bytes>,
    pub on_sent: oneshot::Sender<bool>,
    pub still_wanted: StillWanted,
}

impl RecordedBatch {
    pub fn decoded(&self) -> Vec<PeerMessage> {
        self.messages.iter().flat_map(|m| decode_frame(m).unwrap()).collect()
    }
}

/// Peer sender that keeps everything it is given.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(String, bool, Bytes)>>,
    batches: Mutex<Vec<RecordedBatch>>,
}

impl RecordingSender {
    pub fn frames_to(&self, peer_id: &str) -> Vec<Vec<PeerMessage>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(peer, _, _)| peer == peer_id)
            .map(|(_, _, frame)| decode_frame(frame).unwrap())
            .collect()
    }

    pub fn messages_to(&self, peer_id: &str) -> Vec<PeerMessage> {
        self.frames_to(peer_id).into_iter().flatten().collect()
    }

    pub fn directions(&self) -> Vec<bool> {
        self.sent.lock().unwrap().iter().map(|(_, via_incoming, _)| *via_incoming).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn take_batches(&self) -> Vec<RecordedBatch> {
        std::mem::take(&mut *self.batches.lock().unwrap())
    }
}

impl PeerSender for RecordingSender {
    fn send(&self, data: Bytes, peer_id: &str, via_incoming: bool) {
        self.sent.lock().unwrap().push((peer_id.to_string(), via_incoming, data));
    }

    fn send_batch(
        &self,
        messages: Vec<Bytes>,
        peer_id: &str,
        on_sent: oneshot::Sender<bool>,
        still_wanted: StillWanted,
    ) {
        self.batches.lock().unwrap().push(RecordedBatch {
            peer_id: peer_id.to_string(),
            messages,
            on_sent,
            still_wanted,
        });
    }
}
