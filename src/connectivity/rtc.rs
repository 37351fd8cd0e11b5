use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use webrtc::{
    api::{interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder, API},
    data_channel::{
        data_channel_init::RTCDataChannelInit,
        data_channel_message::DataChannelMessage,
        data_channel_state::RTCDataChannelState,
        RTCDataChannel,
    },
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_server::RTCIceServer},
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
        RTCPeerConnection,
    },
};

use crate::{
    config::IceServer,
    connectivity::transport::{
        ConnectionSpec,
        DataChannel,
        Direction,
        EventSink,
        NegotiationPayload,
        Transport,
        TransportEvent,
        TransportFactory,
    },
};

#[derive(Clone, Debug)]
pub struct RtcSettings {
    pub ice_servers: Vec<IceServer>,
    pub channels: usize,
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

pub struct RtcFactory {
    api: Arc<API>,
    settings: RtcSettings,
}

impl RtcFactory {
    pub fn new(settings: RtcSettings) -> Result<Self> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api: Arc::new(api),
            settings,
        })
    }
}

impl TransportFactory for RtcFactory {
    fn create(&self, spec: &ConnectionSpec, sink: EventSink) -> Result<Box<dyn Transport>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            api: self.api.clone(),
            settings: self.settings.clone(),
            spec: spec.clone(),
            sink,
            channel_count: Arc::new(AtomicUsize::new(0)),
        };

        tokio::spawn(session.drive(rx));
        Ok(Box::new(RtcTransport { tx }))
    }
}

enum RtcCommand {
    CreateOffer,
    CreateAnswer,
    SetRemote(NegotiationPayload),
    AddCandidate(NegotiationPayload),
    Close,
}

/// Front for a session task. Calls are queued in order and never block.
struct RtcTransport {
    tx: UnboundedSender<RtcCommand>,
}

impl RtcTransport {
    fn dispatch(&self, command: RtcCommand) {
        if self.tx.send(command).is_err() {
            debug!("WebRTC session already finished. ");
        }
    }
}

impl Transport for RtcTransport {
    fn create_offer(&mut self) {
        self.dispatch(RtcCommand::CreateOffer);
    }

    fn create_answer(&mut self) {
        self.dispatch(RtcCommand::CreateAnswer);
    }

    fn set_remote_description(&mut self, description: NegotiationPayload) {
        self.dispatch(RtcCommand::SetRemote(description));
    }

    fn add_ice_candidate(&mut self, candidate: NegotiationPayload) {
        self.dispatch(RtcCommand::AddCandidate(candidate));
    }

    fn close(&mut self) {
        self.dispatch(RtcCommand::Close);
    }
}

struct Session {
    api: Arc<API>,
    settings: RtcSettings,
    spec: ConnectionSpec,
    sink: EventSink,
    channel_count: Arc<AtomicUsize>,
}

impl Session {
    async fn drive(self, mut rx: UnboundedReceiver<RtcCommand>) {
        let pc = match self.open().await {
            Ok(pc) => pc,
            Err(e) => {
                self.sink.emit(TransportEvent::Failed(format!("peer connection setup failed: {e}")));
                return;
            },
        };

        while let Some(command) = rx.recv().await {
            let result = match command {
                RtcCommand::CreateOffer => self.create_offer(&pc).await,
                RtcCommand::CreateAnswer => self.create_answer(&pc).await,
                RtcCommand::SetRemote(description) => self.set_remote(&pc, description).await,
                RtcCommand::AddCandidate(candidate) => add_candidate(&pc, candidate).await,
                RtcCommand::Close => break,
            };

            if let Err(e) = result {
                warn!("WebRTC negotiation with {} failed: {e}. ", self.spec.peer_id);
                self.sink.emit(TransportEvent::Failed(e.to_string()));
                break;
            }
        }

        if let Err(e) = pc.close().await {
            debug!("Failed to close peer connection {}: {e}. ", self.spec.id);
        }
    }

    async fn open(&self) -> Result<Arc<RTCPeerConnection>> {
        let ice_servers = self
            .settings
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
                ..Default::default()
            })
            .collect();

        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers,
                    ..Default::default()
                })
                .await?,
        );

        let sink = self.sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => sink.emit(TransportEvent::LocalCandidate(candidate_payload(init))),
                    Err(e) => warn!("Failed to serialize local candidate: {e}. "),
                }
            })
        }));

        let sink = self.sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let sink = sink.clone();
            Box::pin(async move {
                if matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed) {
                    sink.emit(TransportEvent::Failed(format!("peer connection {state}")));
                }
            })
        }));

        match self.spec.direction {
            Direction::Outgoing => {
                let init = RTCDataChannelInit {
                    ordered: Some(self.settings.ordered),
                    max_retransmits: self.settings.max_retransmits,
                    ..Default::default()
                };
                for i in 0..self.settings.channels {
                    let label = format!("data-{i}");
                    let dc = pc.create_data_channel(&label, Some(init.clone())).await?;
                    register_channel(dc, &self.channel_count, &self.sink);
                }
            },
            Direction::Incoming => {
                let sink = self.sink.clone();
                let count = self.channel_count.clone();
                pc.on_data_channel(Box::new(move |dc| {
                    register_channel(dc, &count, &sink);
                    Box::pin(async {})
                }));
            },
        }

        Ok(pc)
    }

    async fn create_offer(&self, pc: &RTCPeerConnection) -> Result<()> {
        let offer = pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer).await?;
        self.sink.emit(TransportEvent::LocalDescription(NegotiationPayload::Offer { sdp }));
        Ok(())
    }

    async fn create_answer(&self, pc: &RTCPeerConnection) -> Result<()> {
        let answer = pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        pc.set_local_description(answer).await?;
        self.sink.emit(TransportEvent::LocalDescription(NegotiationPayload::Answer { sdp }));
        Ok(())
    }

    async fn set_remote(&self, pc: &RTCPeerConnection, description: NegotiationPayload) -> Result<()> {
        let description = match description {
            NegotiationPayload::Offer { sdp } => RTCSessionDescription::offer(sdp)?,
            NegotiationPayload::Answer { sdp } => RTCSessionDescription::answer(sdp)?,
            NegotiationPayload::Candidate { .. } => return Err(anyhow!("candidate is not a session description")),
        };

        pc.set_remote_description(description).await?;
        self.sink.emit(TransportEvent::RemoteDescriptionSet);
        Ok(())
    }
}

async fn add_candidate(pc: &RTCPeerConnection, candidate: NegotiationPayload) -> Result<()> {
    let init = candidate_init(candidate).ok_or_else(|| anyhow!("description is not a candidate"))?;
    pc.add_ice_candidate(init).await?;
    Ok(())
}

fn candidate_payload(init: RTCIceCandidateInit) -> NegotiationPayload {
    NegotiationPayload::Candidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    }
}

fn candidate_init(payload: NegotiationPayload) -> Option<RTCIceCandidateInit> {
    match payload {
        NegotiationPayload::Candidate { candidate, sdp_mid, sdp_mline_index } => Some(RTCIceCandidateInit {
            candidate,
            sdp_mid,
            sdp_mline_index,
            username_fragment: None,
        }),
        _ => None,
    }
}

fn register_channel(dc: Arc<RTCDataChannel>, count: &AtomicUsize, sink: &EventSink) {
    let index = count.fetch_add(1, Ordering::SeqCst);
    let channel = RtcChannel::new(dc.clone());
    sink.emit(TransportEvent::ChannelAdded { index, channel });

    let open_sink = sink.clone();
    dc.on_open(Box::new(move || {
        open_sink.emit(TransportEvent::ChannelOpen(index));
        Box::pin(async {})
    }));

    let close_sink = sink.clone();
    dc.on_close(Box::new(move || {
        close_sink.emit(TransportEvent::ChannelClosed(index));
        Box::pin(async {})
    }));

    let message_sink = sink.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        message_sink.emit(TransportEvent::Message(message.data));
        Box::pin(async {})
    }));

    if dc.ready_state() == RTCDataChannelState::Open {
        sink.emit(TransportEvent::ChannelOpen(index));
    }
}

/// Data channel with a writer task. `buffered_amount` counts bytes queued
/// locally plus what SCTP reported after the last write.
struct RtcChannel {
    dc: Arc<RTCDataChannel>,
    queued: Arc<AtomicUsize>,
    sctp_buffered: Arc<AtomicUsize>,
    tx: UnboundedSender<Bytes>,
}

impl RtcChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let queued = Arc::new(AtomicUsize::new(0));
        let sctp_buffered = Arc::new(AtomicUsize::new(0));

        let writer = dc.clone();
        let writer_queued = queued.clone();
        let writer_buffered = sctp_buffered.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                let len = data.len();
                if let Err(e) = writer.send(&data).await {
                    debug!("Data channel {} write failed: {e}. ", writer.label());
                }
                writer_queued.fetch_sub(len, Ordering::SeqCst);
                writer_buffered.store(writer.buffered_amount().await, Ordering::SeqCst);
            }
        });

        Arc::new(Self {
            dc,
            queued,
            sctp_buffered,
            tx,
        })
    }
}

impl DataChannel for RtcChannel {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    fn buffered_amount(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + self.sctp_buffered.load(Ordering::SeqCst)
    }

    fn send(&self, data: Bytes) {
        let len = data.len();
        self.queued.fetch_add(len, Ordering::SeqCst);
        if self.tx.send(data).is_err() {
            self.queued.fetch_sub(len, Ordering::SeqCst);
        }
    }
}
