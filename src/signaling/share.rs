use std::{
    collections::HashSet,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use data_encoding::HEXLOWER;
use log::{debug, error, info, warn};
use ring::digest::{Context, SHA256};
use serde::Serialize;
use tokio::{
    fs::{self, File},
    io::AsyncReadExt,
    sync::mpsc,
    task::JoinHandle,
};
use url::Url;

use crate::{
    availability::consumer::{AvailabilityInfoConsumer, AvailabilityUpdate, ConsumerHandle},
    connectivity::{
        service::{ConnectivityConfig, ConnectivityEvent, ConnectivityHandle, ConnectivityService},
        transport::TransportFactory,
        PeerSender,
    },
    download::{DownloadCoordinator, DownloadEvent, DownloadHandle, FileTarget},
    router::Router,
    signaling::{
        client::{Dialer, SignalingClient, SignalingEvent, SignalingHandle, UrlBuilder},
        protocol::{encode, ServerMessage, ShareInfo, ShareItem, OPERATION_SHARE_DOWNLOADED},
    },
};

const VERIFY_BUFFER_SIZE: usize = 64 * 1024;

pub struct ShareSettings {
    pub signaling_url: Url,
    pub share_hash: String,
    pub node_id: String,
    pub download_directory: PathBuf,
    pub chunk_size: u64,
    pub connectivity: ConnectivityConfig,
}

#[derive(Serialize)]
struct ShareDownloaded<'a> {
    share_hash: &'a str,
}

/// Anonymous share sessions authenticate with the share hash alone.
pub fn share_url_builder(base: Url, share_hash: String, node_id: String) -> UrlBuilder {
    Box::new(move || -> Result<Url> {
        let mut url = base.clone();
        url.query_pairs_mut()
            .append_pair("share_hash", &share_hash)
            .append_pair("node_id", &node_id);
        Ok(url)
    })
}

/// Files and folders of a share tree rooted at `root`. Names that would
/// escape the root are skipped.
pub fn plan_share(root: &Path, items: &[ShareItem]) -> (Vec<PathBuf>, Vec<FileTarget>) {
    let mut folders = vec![];
    let mut files = vec![];
    plan_items(root, items, &mut folders, &mut files);
    (folders, files)
}

fn plan_items(parent: &Path, items: &[ShareItem], folders: &mut Vec<PathBuf>, files: &mut Vec<FileTarget>) {
    for item in items {
        let name = match item {
            ShareItem::Folder { name, .. } | ShareItem::File { name, .. } => name,
        };

        if !is_plain_name(name) {
            warn!("Skipping share item with unsafe name {name:?}. ");
            continue;
        }

        let path = parent.join(name);
        match item {
            ShareItem::Folder { children, .. } => {
                folders.push(path.clone());
                plan_items(&path, children, folders, files);
            },
            ShareItem::File { object_id, hash, size, .. } => files.push(FileTarget {
                object_id: object_id.clone(),
                hash: hash.clone(),
                size: *size,
                destination: path,
            }),
        }
    }
}

fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!((components.next(), components.next()), (Some(Component::Normal(_)), None))
}

/// Compares the SHA-256 of the file with the expected hex digest.
pub async fn verify_hash(path: &Path, expected: &str) -> Result<bool> {
    let mut file = File::open(path).await?;
    let mut context = Context::new(&SHA256);
    let mut buffer = vec![0u8; VERIFY_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        context.update(&buffer[..read]);
    }

    Ok(HEXLOWER.encode(context.finish().as_ref()) == expected.to_ascii_lowercase())
}

enum Input {
    Signaling(SignalingEvent),
    Connectivity(ConnectivityEvent),
    Availability(AvailabilityUpdate),
    Download(DownloadEvent),
}

/// One-shot download of a shared tree. Owns its own connectivity service and
/// download pipeline, and tears everything down once the tree is on disk.
pub struct ShareSignalingService {
    settings: ShareSettings,
    factory: Arc<dyn TransportFactory>,
    dialer: Arc<dyn Dialer>,
}

struct Session {
    signaling: SignalingHandle,
    connectivity: ConnectivityHandle,
    consumer: ConsumerHandle,
    downloads: DownloadHandle,
    router: Router,
    tasks: Vec<JoinHandle<Result<()>>>,
}

#[derive(Default)]
struct Progress {
    walked: bool,
    pending: HashSet<PathBuf>,
    failed: Vec<PathBuf>,
}

impl Progress {
    fn is_done(&self) -> bool {
        self.walked && self.pending.is_empty()
    }
}

impl ShareSignalingService {
    pub fn new(settings: ShareSettings, factory: Arc<dyn TransportFactory>, dialer: Arc<dyn Dialer>) -> Self {
        Self { settings, factory, dialer }
    }

    pub async fn run(self) -> Result<()> {
        let (connectivity_tx, mut connectivity_rx) = mpsc::unbounded_channel();
        let (signaling_tx, mut signaling_rx) = mpsc::unbounded_channel();
        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let (downloads_tx, mut downloads_rx) = mpsc::unbounded_channel();

        let (connectivity, connectivity_handle) = ConnectivityService::new(
            self.settings.connectivity.clone(),
            self.factory.clone(),
            connectivity_tx,
            None,
            None,
        );
        let sender: Arc<dyn PeerSender> = Arc::new(connectivity_handle.clone());

        let (consumer, consumer_handle) = AvailabilityInfoConsumer::new(sender.clone(), updates_tx);
        let (coordinator, download_handle) = DownloadCoordinator::new(
            consumer_handle.clone(),
            sender,
            downloads_tx,
            self.settings.chunk_size,
            self.settings.connectivity.selection_seed,
        );

        let url_builder = share_url_builder(
            self.settings.signaling_url.clone(),
            self.settings.share_hash.clone(),
            self.settings.node_id.clone(),
        );
        let (client, signaling_handle) = SignalingClient::new(url_builder, self.dialer.clone(), signaling_tx);

        let router = Router::new(signaling_handle.clone())
            .with_consumer(consumer_handle.clone())
            .with_downloads(download_handle.clone());

        let session = Session {
            signaling: signaling_handle,
            connectivity: connectivity_handle,
            consumer: consumer_handle,
            downloads: download_handle,
            router,
            tasks: vec![
                tokio::spawn(connectivity.start()),
                tokio::spawn(consumer.start()),
                tokio::spawn(coordinator.start()),
                tokio::spawn(client.start()),
            ],
        };

        info!("Joining share {}. ", self.settings.share_hash);
        let mut progress = Progress::default();

        let outcome = loop {
            let input = tokio::select! {
                event = signaling_rx.recv() => event.map(Input::Signaling),
                event = connectivity_rx.recv() => event.map(Input::Connectivity),
                update = updates_rx.recv() => update.map(Input::Availability),
                event = downloads_rx.recv() => event.map(Input::Download),
            };

            let step = match input {
                Some(Input::Signaling(event)) => self.on_signaling(event, &session, &mut progress).await,
                Some(Input::Connectivity(event)) => {
                    session.router.route(event);
                    Ok(())
                },
                Some(Input::Availability(update)) => {
                    session.downloads.on_availability(update);
                    Ok(())
                },
                Some(Input::Download(event)) => on_download(event, &mut progress).await,
                None => Err(anyhow!("share session component exited")),
            };

            if let Err(e) = step {
                break Err(e);
            }

            if progress.is_done() {
                break self.finish(&session, &progress);
            }
        };

        session.teardown().await;
        outcome
    }

    async fn on_signaling(&self, event: SignalingEvent, session: &Session, progress: &mut Progress) -> Result<()> {
        let text = match event {
            SignalingEvent::Connected => return Ok(()),
            SignalingEvent::Disconnected { auth_rejected: true } => {
                return Err(anyhow!("share {} was rejected", self.settings.share_hash));
            },
            SignalingEvent::Disconnected { auth_rejected: false } => {
                session.connectivity.on_signaling_disconnected();
                return Ok(());
            },
            SignalingEvent::Frame(text) => text,
        };

        let message = match ServerMessage::decode(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to decode share signaling frame: {e}. ");
                return Ok(());
            },
        };

        match message {
            ServerMessage::PeerList(peers) => session.connectivity.set_peer_list(peers),
            ServerMessage::NodeConnect(peer) => session.connectivity.on_peer_connected(peer),
            ServerMessage::NodeDisconnect(node) => session.connectivity.on_peer_disconnected(&node.id),
            ServerMessage::Sdp(relay) => {
                session
                    .connectivity
                    .on_signaling_payload(relay.message, &relay.node_id, &relay.conn_uuid)
            },
            ServerMessage::ShareInfo(info) => self.walk(info, session, progress).await?,
            other => debug!("Ignoring {other:?} in share session. "),
        }

        Ok(())
    }

    async fn walk(&self, info: ShareInfo, session: &Session, progress: &mut Progress) -> Result<()> {
        if progress.walked {
            debug!("Share tree already received. ");
            return Ok(());
        }

        let root = &self.settings.download_directory;
        let (folders, files) = plan_share(root, &info.items);
        fs::create_dir_all(root).await?;
        for folder in &folders {
            fs::create_dir_all(folder).await?;
        }

        info!("Share {} holds {} folder(s) and {} file(s). ", info.share_hash, folders.len(), files.len());
        for file in files {
            if progress.pending.insert(file.destination.clone()) {
                session.downloads.enqueue(file);
            }
        }

        progress.walked = true;
        Ok(())
    }

    fn finish(&self, session: &Session, progress: &Progress) -> Result<()> {
        if !progress.failed.is_empty() {
            for path in &progress.failed {
                error!("{} failed verification. ", path.display());
            }
            return Err(anyhow!("{} file(s) of the share are corrupt", progress.failed.len()));
        }

        let notice = ShareDownloaded {
            share_hash: &self.settings.share_hash,
        };
        session.signaling.send(encode(OPERATION_SHARE_DOWNLOADED, notice)?);
        info!("Share {} downloaded to {}. ", self.settings.share_hash, self.settings.download_directory.display());
        Ok(())
    }
}

async fn on_download(event: DownloadEvent, progress: &mut Progress) -> Result<()> {
    let target = match event {
        DownloadEvent::Completed(target) => target,
        DownloadEvent::QueueEmpty => {
            debug!("Download queue drained. ");
            return Ok(());
        },
    };

    if !verify_hash(&target.destination, &target.hash).await? {
        warn!("Hash mismatch for {}, discarding. ", target.destination.display());
        fs::remove_file(&target.destination).await?;
        progress.failed.push(target.destination.clone());
    }

    progress.pending.remove(&target.destination);
    Ok(())
}

impl Session {
    /// Downloads stop before the connections they use, signaling goes last.
    async fn teardown(self) {
        self.downloads.stop();
        self.consumer.stop();
        self.connectivity.stop();
        self.signaling.stop();

        for task in self.tasks {
            match task.await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!("Share session component failed: {e}. "),
                Err(e) => warn!("Share session component panicked: {e}. "),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use tempfile::TempDir;
    use tokio::{
        sync::mpsc::{UnboundedReceiver, UnboundedSender},
        time::timeout,
    };

    use super::*;
    use crate::{
        connectivity::{connection::Thresholds, testing::MockFactory},
        signaling::client::Link,
    };

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn file(name: &str, id: &str, hash: &str, size: u64) -> ShareItem {
        ShareItem::File {
            name: name.into(),
            object_id: id.into(),
            hash: hash.into(),
            size,
        }
    }

    fn folder(name: &str, children: Vec<ShareItem>) -> ShareItem {
        ShareItem::Folder {
            name: name.into(),
            children,
        }
    }

    #[test]
    fn share_tree_is_planned_under_the_root() {
        let root = Path::new("/downloads");
        let items = vec![
            folder("photos", vec![file("a.jpg", "o1", "h1", 10), folder("empty", vec![])]),
            file("notes.txt", "o2", "h2", 5),
            file("../escape", "o3", "h3", 5),
            folder("/abs", vec![file("x", "o4", "h4", 1)]),
        ];

        let (folders, files) = plan_share(root, &items);
        assert_eq!(folders, vec![
            PathBuf::from("/downloads/photos"),
            PathBuf::from("/downloads/photos/empty"),
        ]);
        let destinations: Vec<_> = files.iter().map(|f| f.destination.clone()).collect();
        assert_eq!(destinations, vec![
            PathBuf::from("/downloads/photos/a.jpg"),
            PathBuf::from("/downloads/notes.txt"),
        ]);
    }

    #[test]
    fn share_url_carries_hash_and_node() {
        let build = share_url_builder(Url::parse("wss://relay.example/ws").unwrap(), "abc".into(), "me".into());
        assert_eq!(build().unwrap().as_str(), "wss://relay.example/ws?share_hash=abc&node_id=me");
    }

    #[tokio::test]
    async fn hash_verification() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        std::fs::write(&path, b"").unwrap();
        assert!(verify_hash(&path, EMPTY_SHA256).await.unwrap());
        assert!(verify_hash(&path, &EMPTY_SHA256.to_uppercase()).await.unwrap());

        std::fs::write(&path, b"x").unwrap();
        assert!(!verify_hash(&path, EMPTY_SHA256).await.unwrap());
    }

    /// Opens every dial immediately and replays scripted server frames.
    struct ScriptedDialer {
        frames: Vec<String>,
        outbound: Mutex<Vec<UnboundedReceiver<String>>>,
        keep: Mutex<Vec<UnboundedSender<String>>>,
    }

    impl Dialer for ScriptedDialer {
        fn dial(&self, _url: Url, link: Link) {
            let (tx, rx) = mpsc::unbounded_channel();
            link.opened(tx.clone());
            for frame in &self.frames {
                link.frame(frame.clone());
            }
            self.outbound.lock().unwrap().push(rx);
            self.keep.lock().unwrap().push(tx);
        }
    }

    fn settings(temp: &TempDir) -> ShareSettings {
        ShareSettings {
            signaling_url: Url::parse("wss://relay.example/ws").unwrap(),
            share_hash: "abc".into(),
            node_id: "me".into(),
            download_directory: temp.path().join("share"),
            chunk_size: 1024,
            connectivity: ConnectivityConfig {
                max_incoming_connections: 8,
                thresholds: Thresholds {
                    send_high_water: 15,
                    overflow_threshold: 8,
                },
                selection_seed: Some(1),
            },
        }
    }

    #[tokio::test]
    async fn tree_without_remote_data_completes_and_reports() {
        let temp = TempDir::new().unwrap();
        let info = r#"{"operation":"share_info","data":{"share_hash":"abc","items":[
            {"type":"folder","name":"docs","children":[
                {"type":"file","name":"empty.txt","object_id":"o1","hash":"HASH","size":0}
            ]}
        ]}}"#
            .replace("HASH", EMPTY_SHA256);

        let dialer = Arc::new(ScriptedDialer {
            frames: vec![info],
            outbound: Mutex::new(vec![]),
            keep: Mutex::new(vec![]),
        });
        let service = ShareSignalingService::new(settings(&temp), Arc::new(MockFactory::default()), dialer.clone());

        timeout(Duration::from_secs(5), service.run()).await.unwrap().unwrap();

        assert!(temp.path().join("share/docs/empty.txt").is_file());
        let mut outbound = dialer.outbound.lock().unwrap().remove(0);
        let sent = outbound.try_recv().unwrap();
        assert!(sent.contains(OPERATION_SHARE_DOWNLOADED));
        assert!(sent.contains("\"share_hash\":\"abc\""));
    }

    #[tokio::test]
    async fn corrupt_file_fails_the_session() {
        let temp = TempDir::new().unwrap();
        let info = r#"{"operation":"share_info","data":{"share_hash":"abc","items":[
            {"type":"file","name":"bad.bin","object_id":"o1","hash":"00","size":0}
        ]}}"#;

        let dialer = Arc::new(ScriptedDialer {
            frames: vec![info.to_string()],
            outbound: Mutex::new(vec![]),
            keep: Mutex::new(vec![]),
        });
        let service = ShareSignalingService::new(settings(&temp), Arc::new(MockFactory::default()), dialer);

        let outcome = timeout(Duration::from_secs(5), service.run()).await.unwrap();
        assert!(outcome.is_err());
        assert!(!temp.path().join("share/bad.bin").exists());
    }
}
