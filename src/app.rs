use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use futures::future::select_all;
use log::{debug, info, warn};
use reqwest::Client;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, sleep},
};

use crate::{
    availability::{
        consumer::{AvailabilityInfoConsumer, AvailabilityUpdate, ConsumerHandle},
        supplier::{AvailabilityInfoSupplier, SupplierHandle},
    },
    config::Config,
    connectivity::{
        rtc::{RtcFactory, RtcSettings},
        service::{ConnectivityConfig, ConnectivityEvent, ConnectivityHandle, ConnectivityService},
        PeerSender,
    },
    data_supplier::{DataSupplier, DataSupplierHandle},
    router::Router,
    signaling::{
        client::{SignalingClient, SignalingHandle, WsDialer},
        service::{acknowledge, sync_url_builder, SessionEvent, SignalingService, SyncCursor, SyncUrlParams},
        share::{ShareSettings, ShareSignalingService},
    },
    speed::{SpeedCalculator, SpeedHandle},
    storage::{disk_usage, DirectoryStore, FileAssetResolver, IndexMetadataStore, MetadataStore, StatusUpdate},
};

const ASSET_FETCH_TIMEOUT: Duration = Duration::from_secs(300);
const DISK_USAGE_INTERVAL: Duration = Duration::from_secs(60);
const RESTART_DELAY: Duration = Duration::from_secs(10);

pub enum Mode {
    Sync,
    Share {
        share_hash: String,
        download_directory: PathBuf,
    },
}

pub struct App {
    config_path: String,
    config: Config,
    mode: Mode,
}

enum Input {
    Session(SessionEvent),
    Connectivity(ConnectivityEvent),
    Availability(AvailabilityUpdate),
    Exited(usize, Result<Result<()>, tokio::task::JoinError>),
}

/// Handles of one running sync session, stopped top-down.
struct Handles {
    signaling: SignalingHandle,
    data_supplier: DataSupplierHandle,
    supplier: SupplierHandle,
    consumer: ConsumerHandle,
    connectivity: ConnectivityHandle,
    speed: SpeedHandle,
}

impl Handles {
    fn stop(&self) {
        self.signaling.stop();
        self.data_supplier.stop();
        self.supplier.stop();
        self.consumer.stop();
        self.connectivity.stop();
        self.speed.stop();
    }
}

impl App {
    pub fn new(config_path: &str, config: Config, mode: Mode) -> Result<Self> {
        Ok(Self {
            config_path: config_path.to_string(),
            config,
            mode,
        })
    }

    pub async fn start(mut self) -> Result<()> {
        if let Mode::Share { share_hash, download_directory } = &self.mode {
            return self.run_share(share_hash.clone(), download_directory.clone()).await;
        }

        loop {
            self.run_session().await?;

            warn!("Sync session ended, restarting in {}s. ", RESTART_DELAY.as_secs());
            sleep(RESTART_DELAY).await;

            // a refreshed token may have been written in the meantime
            match Config::new(&self.config_path) {
                Ok(config) => self.config = config,
                Err(e) => warn!("Failed to reload configuration: {e}. Keeping the previous one. "),
            }
        }
    }

    fn connectivity_config(&self) -> ConnectivityConfig {
        ConnectivityConfig {
            max_incoming_connections: self.config.max_incoming_connections,
            thresholds: self.config.thresholds(),
            selection_seed: self.config.selection_seed,
        }
    }

    fn rtc_factory(&self) -> Result<Arc<RtcFactory>> {
        let settings = RtcSettings {
            ice_servers: self.config.ice_servers.clone(),
            channels: self.config.channels_per_connection,
            ordered: self.config.ordered_channels,
            max_retransmits: self.config.max_retransmits,
        };

        Ok(Arc::new(RtcFactory::new(settings)?))
    }

    async fn run_share(&self, share_hash: String, download_directory: PathBuf) -> Result<()> {
        let settings = ShareSettings {
            signaling_url: self.config.signaling_url()?,
            share_hash,
            node_id: self.config.node_id.clone(),
            download_directory,
            chunk_size: self.config.chunk_size,
            connectivity: self.connectivity_config(),
        };

        ShareSignalingService::new(settings, self.rtc_factory()?, Arc::new(WsDialer))
            .run()
            .await
    }

    /// Runs one sync session until the server rejects our authorization.
    async fn run_session(&self) -> Result<()> {
        let data_directory = PathBuf::from(&self.config.data_directory);

        let metadata = Arc::new(IndexMetadataStore::load(&self.config.index_path())?);
        let shared_metadata: Arc<dyn MetadataStore> = metadata.clone();
        let local = Arc::new(DirectoryStore::new(data_directory.clone(), self.config.temp_copy_ttl())?);
        let client = Client::builder().timeout(ASSET_FETCH_TIMEOUT).build()?;
        let resolver = Arc::new(FileAssetResolver::new(client));

        let (speed, speed_handle) = SpeedCalculator::new(Some(shared_metadata.clone()));

        let (connectivity_tx, mut connectivity_rx) = mpsc::unbounded_channel();
        let (connectivity, connectivity_handle) = ConnectivityService::new(
            self.connectivity_config(),
            self.rtc_factory()?,
            connectivity_tx,
            Some(speed_handle.clone()),
            Some(shared_metadata.clone()),
        );
        let sender: Arc<dyn PeerSender> = Arc::new(connectivity_handle.clone());

        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let (consumer, consumer_handle) = AvailabilityInfoConsumer::new(sender.clone(), updates_tx);
        let (supplier, supplier_handle) =
            AvailabilityInfoSupplier::new(shared_metadata.clone(), local.clone(), resolver.clone(), sender.clone());
        let (data_supplier, data_supplier_handle) = DataSupplier::new(
            shared_metadata.clone(),
            local,
            resolver,
            sender,
            self.config.chunk_size,
            self.config.data_supplier_concurrency,
        );

        let cursor = Arc::new(Mutex::new(SyncCursor::default()));
        let params = SyncUrlParams {
            base: self.config.signaling_url()?,
            node_id: self.config.node_id.clone(),
            token: self.config.token.clone(),
            page_size: self.config.events_page_size,
        };
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let (client, signaling_handle) =
            SignalingClient::new(sync_url_builder(params, cursor.clone()), Arc::new(WsDialer), signaling_tx);

        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let service = SignalingService::new(
            connectivity_handle.clone(),
            cursor.clone(),
            session_tx,
            Some(shared_metadata.clone()),
            signaling_rx,
        );

        let router = Router::new(signaling_handle.clone())
            .with_consumer(consumer_handle.clone())
            .with_supplier(supplier_handle.clone())
            .with_data_supplier(data_supplier_handle.clone());

        let handles = Handles {
            signaling: signaling_handle,
            data_supplier: data_supplier_handle,
            supplier: supplier_handle,
            consumer: consumer_handle,
            connectivity: connectivity_handle,
            speed: speed_handle,
        };

        let names = [
            "speed calculator",
            "connectivity service",
            "availability consumer",
            "availability supplier",
            "data supplier",
            "signaling client",
            "signaling service",
        ];
        let tasks: Vec<JoinHandle<Result<()>>> = vec![
            tokio::spawn(speed.start()),
            tokio::spawn(connectivity.start()),
            tokio::spawn(consumer.start()),
            tokio::spawn(supplier.start()),
            tokio::spawn(data_supplier.start()),
            tokio::spawn(client.start()),
            tokio::spawn(service.start()),
        ];
        let mut supervisor = select_all(tasks);

        let reporter = tokio::spawn(report_disk_usage(data_directory, shared_metadata));

        info!("Sync session started for node {}. ", self.config.node_id);

        let outcome = loop {
            let input = tokio::select! {
                event = session_rx.recv() => match event {
                    Some(event) => Input::Session(event),
                    None => break Err(anyhow!("signaling service exited unexpectedly")),
                },
                event = connectivity_rx.recv() => match event {
                    Some(event) => Input::Connectivity(event),
                    None => break Err(anyhow!("connectivity service exited unexpectedly")),
                },
                update = updates_rx.recv() => match update {
                    Some(update) => Input::Availability(update),
                    None => break Err(anyhow!("availability consumer exited unexpectedly")),
                },
                (result, index, _) = &mut supervisor => Input::Exited(index, result),
            };

            match input {
                Input::Session(SessionEvent::RestartRequired) => break Ok(()),
                Input::Session(SessionEvent::FileEvents(events)) => {
                    for event in &events {
                        debug!("File event {}: {:?}. ", event.event_id, event.body);
                    }
                    if let Some(last) = events.iter().map(|e| e.event_id).max() {
                        acknowledge(&cursor, last)?;
                    }
                },
                Input::Session(SessionEvent::Other(message)) => debug!("Unhandled session message {message:?}. "),
                Input::Connectivity(event) => router.route(event),
                Input::Availability(update) => {
                    debug!("{} holds {} range(s) of {}. ", update.peer_id, update.ranges.len(), update.object);
                },
                Input::Exited(index, result) => {
                    let name = names.get(index).copied().unwrap_or("component");
                    break match result {
                        Ok(Ok(())) => Err(anyhow!("{name} exited unexpectedly")),
                        Ok(Err(e)) => Err(anyhow!("{name} failed: {e}")),
                        Err(e) => Err(anyhow!("{name} panicked: {e}")),
                    };
                },
            }
        };

        reporter.abort();
        handles.stop();
        outcome
    }
}

async fn report_disk_usage(directory: PathBuf, metadata: Arc<dyn MetadataStore>) {
    let mut ticker = interval(DISK_USAGE_INTERVAL);
    loop {
        ticker.tick().await;
        match disk_usage(&directory) {
            Ok(used) => metadata.update_status(StatusUpdate::DiskUsage(used)),
            Err(e) => warn!("Failed to read disk usage of {}: {e}. ", directory.display()),
        }
    }
}
