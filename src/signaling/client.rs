use std::{sync::Arc, time::Duration};

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{interval, sleep, timeout, Instant},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, http::StatusCode, Message},
};
use url::Url;

use crate::{
    lifecycle::{used_after_stop, Lifecycle},
    signaling::protocol::ServerMessage,
};

const RETRY_DELAY: Duration = Duration::from_secs(2);
const OPEN_GUARD: Duration = Duration::from_secs(10);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(50);
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Builds the connection URL from the latest session state. Called on every
/// (re)connect.
pub type UrlBuilder = Box<dyn Fn() -> Result<Url> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalingEvent {
    Connected,
    Frame(String),
    Disconnected { auth_rejected: bool },
}

pub enum Command {
    Attempt,
    Send(String),
    Opened {
        generation: u64,
        outbound: UnboundedSender<String>,
    },
    Frame {
        generation: u64,
        text: String,
    },
    Heartbeat(u64),
    Closed {
        generation: u64,
        auth_rejected: bool,
    },
    OpenGuard(u64),
    Watchdog(u64),
    Stop,
}

/// Callbacks from one socket attempt back into the client. Reports from a
/// superseded attempt are ignored.
#[derive(Clone)]
pub struct Link {
    generation: u64,
    tx: UnboundedSender<Command>,
}

impl Link {
    pub fn opened(&self, outbound: UnboundedSender<String>) {
        let _ = self.tx.send(Command::Opened {
            generation: self.generation,
            outbound,
        });
    }

    pub fn frame(&self, text: String) {
        let _ = self.tx.send(Command::Frame {
            generation: self.generation,
            text,
        });
    }

    pub fn heartbeat(&self) {
        let _ = self.tx.send(Command::Heartbeat(self.generation));
    }

    pub fn closed(&self, auth_rejected: bool) {
        let _ = self.tx.send(Command::Closed {
            generation: self.generation,
            auth_rejected,
        });
    }
}

pub trait Dialer: Send + Sync {
    fn dial(&self, url: Url, link: Link);
}

/// WebSocket dialer. Text frames are forwarded and server pings count as a
/// heartbeat. Pongs answering our own pings do not.
pub struct WsDialer;

impl Dialer for WsDialer {
    fn dial(&self, url: Url, link: Link) {
        tokio::spawn(run_socket(url, link));
    }
}

async fn run_socket(url: Url, link: Link) {
    let connected = match timeout(OPEN_GUARD, connect_async(url.as_str())).await {
        Ok(connected) => connected,
        Err(_) => {
            debug!("Signaling handshake timed out. ");
            link.closed(false);
            return;
        },
    };

    let socket = match connected {
        Ok((socket, _)) => socket,
        Err(tungstenite::Error::Http(response)) => {
            let status = response.status();
            let auth_rejected = status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN;
            warn!("Signaling server refused the connection with {status}. ");
            link.closed(auth_rejected);
            return;
        },
        Err(e) => {
            warn!("Failed to connect to signaling server: {e}. ");
            link.closed(false);
            return;
        },
    };

    let (mut write, mut read) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    link.opened(tx);

    let mut ping = interval(PING_INTERVAL);
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!("Failed to write to signaling socket: {e}. ");
                        break;
                    }
                },
                None => {
                    let _ = write.close().await;
                    break;
                },
            },
            _ = ping.tick() => {
                if write.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            },
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => link.frame(text),
                Some(Ok(Message::Ping(_))) => link.heartbeat(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    debug!("Signaling socket error: {e}. ");
                    break;
                },
            },
        }
    }

    link.closed(false);
}

fn is_heartbeat(text: &str) -> bool {
    matches!(ServerMessage::decode(text), Ok(ServerMessage::Heartbeat))
}

#[derive(Clone)]
pub struct SignalingHandle {
    tx: UnboundedSender<Command>,
}

impl SignalingHandle {
    #[cfg(test)]
    pub fn detached() -> (Self, UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues a text frame. Frames sent while disconnected are dropped.
    pub fn send(&self, text: String) {
        self.dispatch(Command::Send(text));
    }

    pub fn stop(&self) {
        self.dispatch(Command::Stop);
    }

    fn dispatch(&self, command: Command) {
        if self.tx.send(command).is_err() {
            used_after_stop("signaling client");
        }
    }
}

pub struct SignalingClient {
    url_builder: UrlBuilder,
    dialer: Arc<dyn Dialer>,
    events: UnboundedSender<SignalingEvent>,
    state: SignalingState,
    enabled: bool,
    generation: u64,
    outbound: Option<UnboundedSender<String>>,
    last_heartbeat: Instant,
    lifecycle: Lifecycle,
    tx: UnboundedSender<Command>,
    rx: UnboundedReceiver<Command>,
}

impl SignalingClient {
    pub fn new(
        url_builder: UrlBuilder,
        dialer: Arc<dyn Dialer>,
        events: UnboundedSender<SignalingEvent>,
    ) -> (Self, SignalingHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SignalingHandle { tx: tx.clone() };

        let client = Self {
            url_builder,
            dialer,
            events,
            state: SignalingState::Disconnected,
            enabled: true,
            generation: 0,
            outbound: None,
            last_heartbeat: Instant::now(),
            lifecycle: Lifecycle::Uninitialized,
            tx,
            rx,
        };

        (client, handle)
    }

    pub async fn start(mut self) -> Result<()> {
        self.lifecycle = Lifecycle::Running;
        self.connect();

        while let Some(command) = self.rx.recv().await {
            self.handle(command);
            if !self.lifecycle.is_running() {
                break;
            }
        }

        debug!("Signaling client stopped. ");
        Ok(())
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Attempt => {
                if self.enabled && self.state == SignalingState::Disconnected {
                    self.connect();
                }
            },
            Command::Send(text) => match &self.outbound {
                Some(outbound) if self.state == SignalingState::Connected => {
                    let _ = outbound.send(text);
                },
                _ => debug!("Signaling not connected, dropping outbound frame. "),
            },
            Command::Opened { generation, outbound } => {
                if generation != self.generation || self.state != SignalingState::Connecting {
                    return;
                }

                info!("Connected to signaling server. ");
                self.state = SignalingState::Connected;
                self.outbound = Some(outbound);
                self.last_heartbeat = Instant::now();
                self.schedule(HEARTBEAT_TIMEOUT, Command::Watchdog(generation));
                self.emit(SignalingEvent::Connected);
            },
            Command::Frame { generation, text } => {
                if generation == self.generation && self.state == SignalingState::Connected {
                    if is_heartbeat(&text) {
                        self.last_heartbeat = Instant::now();
                    }
                    self.emit(SignalingEvent::Frame(text));
                }
            },
            Command::Heartbeat(generation) => {
                if generation == self.generation {
                    self.last_heartbeat = Instant::now();
                }
            },
            Command::Closed { generation, auth_rejected } => {
                if generation == self.generation && self.state != SignalingState::Disconnected {
                    self.on_closed(auth_rejected);
                }
            },
            Command::OpenGuard(generation) => {
                if generation == self.generation && self.state == SignalingState::Connecting {
                    warn!("Signaling connection did not open in time, reconnecting. ");
                    self.force_reconnect();
                }
            },
            Command::Watchdog(generation) => {
                if generation != self.generation || self.state != SignalingState::Connected {
                    return;
                }

                let silent = self.last_heartbeat.elapsed();
                if silent >= HEARTBEAT_TIMEOUT {
                    warn!("No heartbeat from signaling server for {}s, reconnecting. ", silent.as_secs());
                    self.force_reconnect();
                } else {
                    self.schedule(HEARTBEAT_TIMEOUT - silent, Command::Watchdog(generation));
                }
            },
            Command::Stop => {
                self.enabled = false;
                self.drop_link();
                self.lifecycle = Lifecycle::Stopped;
            },
        }
    }

    fn connect(&mut self) {
        self.generation += 1;

        let url = match (self.url_builder)() {
            Ok(url) => url,
            Err(e) => {
                warn!("Failed to build signaling URL: {e}. ");
                self.state = SignalingState::Disconnected;
                self.schedule(RETRY_DELAY, Command::Attempt);
                return;
            },
        };

        debug!("Connecting to signaling server at {}. ", url.host_str().unwrap_or("?"));
        self.state = SignalingState::Connecting;
        self.dialer.dial(url, Link {
            generation: self.generation,
            tx: self.tx.clone(),
        });
        self.schedule(OPEN_GUARD, Command::OpenGuard(self.generation));
    }

    fn on_closed(&mut self, auth_rejected: bool) {
        let was_connected = self.state == SignalingState::Connected;
        self.drop_link();

        if was_connected || auth_rejected {
            self.emit(SignalingEvent::Disconnected { auth_rejected });
        }

        if auth_rejected {
            warn!("Signaling server rejected authorization. ");
            self.enabled = false;
            return;
        }

        if self.enabled {
            debug!("Signaling disconnected, retrying in {}s. ", RETRY_DELAY.as_secs());
            self.schedule(RETRY_DELAY, Command::Attempt);
        }
    }

    fn force_reconnect(&mut self) {
        let was_connected = self.state == SignalingState::Connected;
        self.drop_link();
        if was_connected {
            self.emit(SignalingEvent::Disconnected { auth_rejected: false });
        }
        self.connect();
    }

    fn drop_link(&mut self) {
        // dropping the outbound sender closes the socket task
        self.outbound = None;
        self.state = SignalingState::Disconnected;
        self.generation += 1;
    }

    fn schedule(&self, delay: Duration, command: Command) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(command);
        });
    }

    fn emit(&self, event: SignalingEvent) {
        if self.events.send(event).is_err() {
            debug!("Signaling event dropped, no listener. ");
        }
    }

    #[cfg(test)]
    fn pump(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            self.handle(command);
        }
    }
}
