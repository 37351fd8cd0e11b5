use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

pub mod connection;
pub mod rtc;
pub mod selection;
pub mod service;
pub mod transport;

#[cfg(test)]
pub mod testing;

/// Polled before each batch message goes out. Returning false abandons the rest.
pub type StillWanted = Arc<dyn Fn() -> bool + Send + Sync>;

/// Outbound path to peers used by the availability and data layers.
pub trait PeerSender: Send + Sync {
    /// Best effort. The message is dropped when no connection in the chosen
    /// direction can take it right now.
    fn send(&self, data: Bytes, peer_id: &str, via_incoming: bool);

    /// Sends `messages` in order over incoming connections, waiting for
    /// capacity as needed. `on_sent` receives true once everything was handed
    /// to a channel, false if the batch was abandoned.
    fn send_batch(
        &self,
        messages: Vec<Bytes>,
        peer_id: &str,
        on_sent: oneshot::Sender<bool>,
        still_wanted: StillWanted,
    );
}
