use itertools::Itertools;
use log::{debug, warn};

use crate::{
    availability::{consumer::ConsumerHandle, supplier::SupplierHandle},
    connectivity::{service::ConnectivityEvent, transport::Direction},
    data_supplier::DataSupplierHandle,
    download::DownloadHandle,
    protocol::{decode_frame, PeerMessage},
    signaling::{
        client::SignalingHandle,
        protocol::{encode, SdpRelay, OPERATION_SDP},
    },
};

/// Fans connectivity events out to the signaling relay and the availability
/// and data layers. Missing layers are skipped.
pub struct Router {
    relay: SignalingHandle,
    consumer: Option<ConsumerHandle>,
    supplier: Option<SupplierHandle>,
    data_supplier: Option<DataSupplierHandle>,
    downloads: Option<DownloadHandle>,
}

impl Router {
    pub fn new(relay: SignalingHandle) -> Self {
        Self {
            relay,
            consumer: None,
            supplier: None,
            data_supplier: None,
            downloads: None,
        }
    }

    pub fn with_consumer(mut self, consumer: ConsumerHandle) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn with_supplier(mut self, supplier: SupplierHandle) -> Self {
        self.supplier = Some(supplier);
        self
    }

    pub fn with_data_supplier(mut self, data_supplier: DataSupplierHandle) -> Self {
        self.data_supplier = Some(data_supplier);
        self
    }

    pub fn with_downloads(mut self, downloads: DownloadHandle) -> Self {
        self.downloads = Some(downloads);
        self
    }

    pub fn route(&self, event: ConnectivityEvent) {
        match event {
            ConnectivityEvent::Relay {
                peer_id,
                connection_id,
                payload,
            } => {
                let relay = SdpRelay {
                    node_id: peer_id,
                    conn_uuid: connection_id,
                    message: payload,
                };
                match encode(OPERATION_SDP, relay) {
                    Ok(text) => self.relay.send(text),
                    Err(e) => warn!("Failed to encode negotiation payload: {e}. "),
                }
            },
            ConnectivityEvent::PeerConnected { peer_id, direction } => {
                debug!("Peer {peer_id} reachable over {direction} connections. ");
            },
            ConnectivityEvent::OutgoingPeerConnected(peer_id) => {
                if let Some(consumer) = &self.consumer {
                    consumer.on_outgoing_peer_connected(&peer_id);
                }
            },
            ConnectivityEvent::PeerDisconnected { peer_id, direction } => match direction {
                Direction::Outgoing => {
                    if let Some(consumer) = &self.consumer {
                        consumer.on_peer_disconnected(&peer_id);
                    }
                    if let Some(downloads) = &self.downloads {
                        downloads.on_peer_disconnected(&peer_id);
                    }
                },
                Direction::Incoming => {
                    if let Some(supplier) = &self.supplier {
                        supplier.on_node_disconnected(&peer_id);
                    }
                    if let Some(data_supplier) = &self.data_supplier {
                        data_supplier.on_peer_disconnected(&peer_id);
                    }
                },
            },
            ConnectivityEvent::Message { peer_id, data, .. } => match decode_frame(&data) {
                Ok(messages) => self.dispatch(&peer_id, messages),
                Err(e) => warn!("Dropping undecodable frame from {peer_id}: {e}. "),
            },
        }
    }

    fn dispatch(&self, peer_id: &str, messages: Vec<PeerMessage>) {
        // a frame may repeat the same request
        for message in messages.into_iter().unique() {
            if !message.is_well_formed() {
                warn!("Dropping malformed message for {} from {peer_id}. ", message.object());
                continue;
            }

            match message {
                PeerMessage::AvailabilityRequest { object } => {
                    if let Some(supplier) = &self.supplier {
                        supplier.on_request(peer_id, object);
                    }
                },
                PeerMessage::AvailabilityResponse { object, ranges } => {
                    if let Some(consumer) = &self.consumer {
                        consumer.on_response(peer_id, object, ranges);
                    }
                },
                PeerMessage::DataRequest { object, range } => {
                    if let Some(data_supplier) = &self.data_supplier {
                        data_supplier.on_request(peer_id, object, range);
                    }
                },
                PeerMessage::DataResponse { object, range, data } => {
                    if let Some(downloads) = &self.downloads {
                        downloads.on_data(peer_id, object, range, data);
                    }
                },
                PeerMessage::Abort { object, offset } => {
                    if let Some(supplier) = &self.supplier {
                        supplier.on_abort(peer_id, object.clone());
                    }
                    if let Some(data_supplier) = &self.data_supplier {
                        data_supplier.on_abort(peer_id, object, offset);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::{
        availability::{consumer, supplier},
        connectivity::transport::NegotiationPayload,
        data_supplier, download,
        protocol::{encode_frame, ByteRange, ObjectRef},
        signaling::{client, protocol::ServerMessage},
    };

    struct Fixture {
        router: Router,
        relay: UnboundedReceiver<client::Command>,
        consumer: UnboundedReceiver<consumer::Command>,
        supplier: UnboundedReceiver<supplier::Command>,
        data_supplier: UnboundedReceiver<data_supplier::Command>,
        downloads: UnboundedReceiver<download::Command>,
    }

    fn fixture() -> Fixture {
        let (relay, relay_rx) = SignalingHandle::detached();
        let (consumer, consumer_rx) = ConsumerHandle::detached();
        let (supplier, supplier_rx) = SupplierHandle::detached();
        let (data_supplier, data_supplier_rx) = DataSupplierHandle::detached();
        let (downloads, downloads_rx) = DownloadHandle::detached();

        let router = Router::new(relay)
            .with_consumer(consumer)
            .with_supplier(supplier)
            .with_data_supplier(data_supplier)
            .with_downloads(downloads);

        Fixture {
            router,
            relay: relay_rx,
            consumer: consumer_rx,
            supplier: supplier_rx,
            data_supplier: data_supplier_rx,
            downloads: downloads_rx,
        }
    }

    fn message(peer: &str, messages: &[PeerMessage]) -> ConnectivityEvent {
        ConnectivityEvent::Message {
            peer_id: peer.into(),
            direction: Direction::Incoming,
            data: encode_frame(messages).unwrap(),
        }
    }

    #[test]
    fn negotiation_payloads_are_relayed_upstream() {
        let mut f = fixture();
        f.router.route(ConnectivityEvent::Relay {
            peer_id: "a".into(),
            connection_id: "c1".into(),
            payload: NegotiationPayload::Offer { sdp: "v=0".into() },
        });

        let text = match f.relay.try_recv().unwrap() {
            client::Command::Send(text) => text,
            _ => panic!("expected an outbound frame"),
        };
        match ServerMessage::decode(&text).unwrap() {
            ServerMessage::Sdp(relay) => {
                assert_eq!(relay.node_id, "a");
                assert_eq!(relay.conn_uuid, "c1");
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn messages_reach_their_layer() {
        let mut f = fixture();
        let object = ObjectRef::file("doc");
        let range = ByteRange::new(0, 4);
        f.router.route(message("a", &[
            PeerMessage::AvailabilityRequest { object: object.clone() },
            PeerMessage::AvailabilityRequest { object: object.clone() },
            PeerMessage::AvailabilityResponse {
                object: object.clone(),
                ranges: vec![range],
            },
            PeerMessage::DataRequest {
                object: object.clone(),
                range,
            },
            PeerMessage::DataResponse {
                object: object.clone(),
                range,
                data: Bytes::from_static(b"abcd"),
            },
            PeerMessage::Abort {
                object: object.clone(),
                offset: Some(0),
            },
        ]));

        assert!(matches!(f.supplier.try_recv(), Ok(supplier::Command::Request { .. })));
        assert!(matches!(f.supplier.try_recv(), Ok(supplier::Command::Abort { .. })));
        assert!(f.supplier.try_recv().is_err());

        assert!(matches!(f.consumer.try_recv(), Ok(consumer::Command::Response { .. })));
        assert!(matches!(f.data_supplier.try_recv(), Ok(data_supplier::Command::Request(_))));
        assert!(matches!(
            f.data_supplier.try_recv(),
            Ok(data_supplier::Command::Abort { offset: Some(0), .. })
        ));
        assert!(matches!(f.downloads.try_recv(), Ok(download::Command::Data { .. })));
    }

    #[test]
    fn disconnects_are_routed_by_direction() {
        let mut f = fixture();
        f.router.route(ConnectivityEvent::PeerDisconnected {
            peer_id: "a".into(),
            direction: Direction::Outgoing,
        });
        assert!(matches!(f.consumer.try_recv(), Ok(consumer::Command::PeerDisconnected(_))));
        assert!(matches!(f.downloads.try_recv(), Ok(download::Command::PeerDisconnected(_))));
        assert!(f.supplier.try_recv().is_err());

        f.router.route(ConnectivityEvent::PeerDisconnected {
            peer_id: "a".into(),
            direction: Direction::Incoming,
        });
        assert!(matches!(f.supplier.try_recv(), Ok(supplier::Command::NodeDisconnected(_))));
        assert!(matches!(f.data_supplier.try_recv(), Ok(data_supplier::Command::PeerDisconnected(_))));
        assert!(f.consumer.try_recv().is_err());
    }

    #[test]
    fn overflowing_ranges_are_dropped() {
        let mut f = fixture();
        let object = ObjectRef::file("Y");
        f.router.route(message("evil", &[
            PeerMessage::DataRequest {
                object: object.clone(),
                range: ByteRange::new(u64::MAX - 1, 2),
            },
            PeerMessage::DataResponse {
                object: object.clone(),
                range: ByteRange::new(u64::MAX, 1),
                data: Bytes::from_static(b"x"),
            },
            PeerMessage::DataRequest {
                object,
                range: ByteRange::new(0, 256),
            },
        ]));

        match f.data_supplier.try_recv() {
            Ok(data_supplier::Command::Request(key)) => assert_eq!(key.range, ByteRange::new(0, 256)),
            _ => panic!("expected the well formed request"),
        }
        assert!(f.data_supplier.try_recv().is_err());
        assert!(f.downloads.try_recv().is_err());
    }

    #[test]
    fn garbage_frames_are_dropped() {
        let mut f = fixture();
        f.router.route(ConnectivityEvent::Message {
            peer_id: "a".into(),
            direction: Direction::Outgoing,
            data: Bytes::from_static(b"nope"),
        });
        assert!(f.supplier.try_recv().is_err());
        assert!(f.consumer.try_recv().is_err());
    }
}
