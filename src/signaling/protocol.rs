use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::connectivity::{service::Peer, transport::NegotiationPayload};

pub const OPERATION_SDP: &str = "sdp";
pub const OPERATION_SHARE_DOWNLOADED: &str = "share_downloaded";

#[derive(Deserialize)]
struct RawFrame {
    operation: String,

    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct OutboundFrame<'a, T: Serialize> {
    operation: &'a str,
    data: T,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct NodeRef {
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SdpRelay {
    pub node_id: String,
    pub conn_uuid: String,
    pub message: NegotiationPayload,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct FileEvent {
    pub event_id: u64,

    #[serde(flatten)]
    pub body: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct FileEventsPage {
    #[serde(default)]
    pub events: Vec<FileEvent>,

    #[serde(default)]
    pub pending_events: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShareItem {
    Folder {
        name: String,

        #[serde(default)]
        children: Vec<ShareItem>,
    },
    File {
        name: String,
        object_id: String,
        hash: String,
        size: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ShareInfo {
    pub share_hash: String,

    #[serde(default)]
    pub items: Vec<ShareItem>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    PeerList(Vec<Peer>),
    NodeConnect(Peer),
    NodeDisconnect(NodeRef),
    NodeStatus(Value),
    Sdp(SdpRelay),
    FileEvents(FileEventsPage),
    Sharing(Value),
    Collaboration(Value),
    RemoteAction(Value),
    LicenseType(Value),
    NewNotificationsCount(u64),
    ShareInfo(ShareInfo),
    Heartbeat,
    Unknown(String),
}

impl ServerMessage {
    /// Decodes a control frame. The operation name picks the payload type, an
    /// unknown operation is returned as [`ServerMessage::Unknown`].
    pub fn decode(text: &str) -> Result<Self> {
        let frame: RawFrame = serde_json::from_str(text)?;
        let data = frame.data;

        let message = match frame.operation.as_str() {
            "peer_list" => ServerMessage::PeerList(serde_json::from_value(data)?),
            "node_connect" => ServerMessage::NodeConnect(serde_json::from_value(data)?),
            "node_disconnect" => ServerMessage::NodeDisconnect(serde_json::from_value(data)?),
            "node_status" => ServerMessage::NodeStatus(data),
            OPERATION_SDP => ServerMessage::Sdp(serde_json::from_value(data)?),
            "file_events" => ServerMessage::FileEvents(serde_json::from_value(data)?),
            "sharing" => ServerMessage::Sharing(data),
            "collaboration" => ServerMessage::Collaboration(data),
            "remote_action" => ServerMessage::RemoteAction(data),
            "license_type" => ServerMessage::LicenseType(data),
            "new_notifications_count" => ServerMessage::NewNotificationsCount(serde_json::from_value(data)?),
            "share_info" => ServerMessage::ShareInfo(serde_json::from_value(data)?),
            "heartbeat" => ServerMessage::Heartbeat,
            _ => ServerMessage::Unknown(frame.operation),
        };

        Ok(message)
    }
}

pub fn encode<T: Serialize>(operation: &str, data: T) -> Result<String> {
    Ok(serde_json::to_string(&OutboundFrame { operation, data })?)
}
