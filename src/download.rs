use std::{
    collections::HashMap,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{interval, Instant},
};

use crate::{
    availability::consumer::{AvailabilityUpdate, ConsumerHandle},
    connectivity::{selection::SelectionPolicy, PeerSender},
    lifecycle::{used_after_stop, Lifecycle},
    protocol::{encode_frame, merge_ranges, missing_ranges, ByteRange, ObjectRef, PeerMessage},
};

const MAX_IN_FLIGHT_PER_FILE: usize = 8;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileTarget {
    pub object_id: String,
    pub hash: String,
    pub size: u64,
    pub destination: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadEvent {
    Completed(FileTarget),
    QueueEmpty,
}

pub enum Command {
    Enqueue(FileTarget),
    Availability(AvailabilityUpdate),
    Data {
        peer_id: String,
        object: ObjectRef,
        range: ByteRange,
        data: Bytes,
    },
    PeerDisconnected(String),
    Tick,
    Stop,
}

#[derive(Clone)]
pub struct DownloadHandle {
    tx: UnboundedSender<Command>,
}

impl DownloadHandle {
    #[cfg(test)]
    pub fn detached() -> (Self, UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, target: FileTarget) {
        self.dispatch(Command::Enqueue(target));
    }

    pub fn on_availability(&self, update: AvailabilityUpdate) {
        self.dispatch(Command::Availability(update));
    }

    pub fn on_data(&self, peer_id: &str, object: ObjectRef, range: ByteRange, data: Bytes) {
        self.dispatch(Command::Data {
            peer_id: peer_id.to_string(),
            object,
            range,
            data,
        });
    }

    pub fn on_peer_disconnected(&self, peer_id: &str) {
        self.dispatch(Command::PeerDisconnected(peer_id.to_string()));
    }

    pub fn stop(&self) {
        self.dispatch(Command::Stop);
    }

    fn dispatch(&self, command: Command) {
        if self.tx.send(command).is_err() {
            used_after_stop("download coordinator");
        }
    }
}

struct InFlight {
    peer_id: String,
    requested_at: Instant,
}

struct FileDownload {
    target: FileTarget,
    object: ObjectRef,
    staging: PathBuf,
    received: Vec<ByteRange>,
    holders: HashMap<String, Vec<ByteRange>>,
    in_flight: HashMap<ByteRange, InFlight>,
}

impl FileDownload {
    fn is_complete(&self) -> bool {
        missing_ranges(&ByteRange::new(0, self.target.size), &self.received).is_empty()
    }

    /// Requests chunks nobody has delivered or been asked for yet, from a
    /// random peer advertising the chunk.
    fn request_more(&mut self, selection: &mut SelectionPolicy, sender: &dyn PeerSender, chunk_size: u64) {
        let mut claimed = self.received.clone();
        claimed.extend(self.in_flight.keys().copied());
        let gaps = missing_ranges(&ByteRange::new(0, self.target.size), &merge_ranges(claimed));

        for chunk in gaps.iter().flat_map(|gap| gap.chunks(chunk_size)) {
            if self.in_flight.len() >= MAX_IN_FLIGHT_PER_FILE {
                break;
            }

            let holders: Vec<_> = self
                .holders
                .iter()
                .filter(|(_, ranges)| ranges.iter().any(|r| r.contains(&chunk)))
                .map(|(peer_id, _)| peer_id.clone())
                .collect();

            let peer_id = match selection.shuffled(holders).into_iter().next() {
                Some(peer_id) => peer_id,
                None => continue,
            };

            let request = PeerMessage::DataRequest {
                object: self.object.clone(),
                range: chunk,
            };
            match encode_frame(&[request]) {
                Ok(frame) => sender.send(frame, &peer_id, false),
                Err(e) => {
                    warn!("Failed to encode data request: {e}. ");
                    return;
                },
            }

            self.in_flight.insert(chunk, InFlight {
                peer_id,
                requested_at: Instant::now(),
            });
        }
    }
}

/// Downloads whole files from peers that advertise their ranges.
pub struct DownloadCoordinator {
    files: HashMap<ObjectRef, FileDownload>,
    consumer: ConsumerHandle,
    sender: Arc<dyn PeerSender>,
    events: UnboundedSender<DownloadEvent>,
    chunk_size: u64,
    selection: SelectionPolicy,
    lifecycle: Lifecycle,
    tx: UnboundedSender<Command>,
    rx: UnboundedReceiver<Command>,
}

impl DownloadCoordinator {
    pub fn new(
        consumer: ConsumerHandle,
        sender: Arc<dyn PeerSender>,
        events: UnboundedSender<DownloadEvent>,
        chunk_size: u64,
        selection_seed: Option<u64>,
    ) -> (Self, DownloadHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = DownloadHandle { tx: tx.clone() };

        let coordinator = Self {
            files: HashMap::new(),
            consumer,
            sender,
            events,
            chunk_size,
            selection: SelectionPolicy::new(selection_seed),
            lifecycle: Lifecycle::Uninitialized,
            tx,
            rx,
        };

        (coordinator, handle)
    }

    pub async fn start(mut self) -> Result<()> {
        self.lifecycle = Lifecycle::Running;

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(TICK_INTERVAL);
            loop {
                ticker.tick().await;
                if tx.send(Command::Tick).is_err() {
                    break;
                }
            }
        });

        while let Some(command) = self.rx.recv().await {
            self.handle(command).await;
            if !self.lifecycle.is_running() {
                break;
            }
        }

        Ok(())
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue(target) => {
                if let Err(e) = self.enqueue(target).await {
                    warn!("Failed to start download: {e}. ");
                }
            },
            Command::Availability(update) => {
                if let Some(file) = self.files.get_mut(&update.object) {
                    let ranges = file.holders.entry(update.peer_id).or_default();
                    ranges.extend(update.ranges);
                    *ranges = merge_ranges(std::mem::take(ranges));
                    file.request_more(&mut self.selection, self.sender.as_ref(), self.chunk_size);
                }
            },
            Command::Data { peer_id, object, range, data } => {
                if let Err(e) = self.on_data(&peer_id, &object, range, data).await {
                    warn!("Failed to store {range} of {object} from {peer_id}: {e}. ");
                }
            },
            Command::PeerDisconnected(peer_id) => {
                for file in self.files.values_mut() {
                    file.holders.remove(&peer_id);
                    file.in_flight.retain(|_, request| request.peer_id != peer_id);
                    file.request_more(&mut self.selection, self.sender.as_ref(), self.chunk_size);
                }
            },
            Command::Tick => {
                for file in self.files.values_mut() {
                    let before = file.in_flight.len();
                    file.in_flight.retain(|_, request| request.requested_at.elapsed() < REQUEST_TIMEOUT);
                    if file.in_flight.len() < before {
                        debug!("{} chunk request(s) of {} timed out. ", before - file.in_flight.len(), file.object);
                    }
                    file.request_more(&mut self.selection, self.sender.as_ref(), self.chunk_size);
                }
            },
            Command::Stop => self.lifecycle = Lifecycle::Stopped,
        }
    }

    async fn enqueue(&mut self, target: FileTarget) -> Result<()> {
        let object = ObjectRef::file(target.object_id.clone());
        if self.files.contains_key(&object) {
            return Ok(());
        }

        if let Some(parent) = target.destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        if target.size == 0 {
            File::create(&target.destination).await?;
            self.emit(DownloadEvent::Completed(target));
            self.check_empty();
            return Ok(());
        }

        let staging = staging_path(&target.destination);
        File::create(&staging).await?.set_len(target.size).await?;

        debug!("Downloading {object} ({} bytes). ", target.size);
        self.consumer.subscribe(vec![object.clone()]);
        self.files.insert(object.clone(), FileDownload {
            target,
            object,
            staging,
            received: vec![],
            holders: HashMap::new(),
            in_flight: HashMap::new(),
        });

        Ok(())
    }

    async fn on_data(&mut self, peer_id: &str, object: &ObjectRef, range: ByteRange, data: Bytes) -> Result<()> {
        let file = match self.files.get_mut(object) {
            Some(file) => file,
            None => return Ok(()),
        };

        if data.len() as u64 != range.length || !range.fits_within(file.target.size) {
            warn!("Malformed data response for {object} from {peer_id}. ");
            return Ok(());
        }

        let mut staging = OpenOptions::new().write(true).open(&file.staging).await?;
        staging.seek(SeekFrom::Start(range.offset)).await?;
        staging.write_all(&data).await?;
        staging.flush().await?;

        file.received.push(range);
        file.received = merge_ranges(std::mem::take(&mut file.received));
        let received = &file.received;
        file.in_flight
            .retain(|requested, _| !missing_ranges(requested, received).is_empty());

        if file.is_complete() {
            self.finish(object).await?;
        } else {
            file.request_more(&mut self.selection, self.sender.as_ref(), self.chunk_size);
        }

        Ok(())
    }

    async fn finish(&mut self, object: &ObjectRef) -> Result<()> {
        let file = match self.files.remove(object) {
            Some(file) => file,
            None => return Ok(()),
        };

        fs::rename(&file.staging, &file.target.destination).await?;
        self.consumer.unsubscribe(vec![file.object.clone()]);
        info!("Downloaded {} to {}. ", file.object, file.target.destination.display());

        self.emit(DownloadEvent::Completed(file.target));
        self.check_empty();
        Ok(())
    }

    fn check_empty(&self) {
        if self.files.is_empty() {
            self.emit(DownloadEvent::QueueEmpty);
        }
    }

    fn emit(&self, event: DownloadEvent) {
        if self.events.send(event).is_err() {
            debug!("Download event dropped, no listener. ");
        }
    }
}

fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        availability::consumer::AvailabilityInfoConsumer,
        connectivity::testing::RecordingSender,
    };

    struct Fixture {
        coordinator: DownloadCoordinator,
        consumer: AvailabilityInfoConsumer,
        sender: Arc<RecordingSender>,
        events: UnboundedReceiver<DownloadEvent>,
        temp: TempDir,
    }

    fn fixture(chunk_size: u64) -> Fixture {
        let sender = Arc::new(RecordingSender::default());
        let (updates_tx, _updates) = mpsc::unbounded_channel();
        let (consumer, consumer_handle) = AvailabilityInfoConsumer::new(sender.clone(), updates_tx);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (coordinator, _) = DownloadCoordinator::new(consumer_handle, sender.clone(), events_tx, chunk_size, Some(5));

        Fixture {
            coordinator,
            consumer,
            sender,
            events,
            temp: TempDir::new().unwrap(),
        }
    }

    fn target(f: &Fixture, id: &str, size: u64) -> FileTarget {
        FileTarget {
            object_id: id.into(),
            hash: format!("hash-{id}"),
            size,
            destination: f.temp.path().join("out").join(id),
        }
    }

    fn advertise(peer: &str, id: &str, ranges: Vec<ByteRange>) -> Command {
        Command::Availability(AvailabilityUpdate {
            peer_id: peer.into(),
            object: ObjectRef::file(id),
            ranges,
        })
    }

    fn requested(sender: &RecordingSender, peer: &str) -> Vec<ByteRange> {
        sender
            .messages_to(peer)
            .into_iter()
            .filter_map(|m| match m {
                PeerMessage::DataRequest { range, .. } => Some(range),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn downloads_a_file_and_reports_completion() {
        let mut f = fixture(4);
        let target = target(&f, "doc", 10);
        f.coordinator.handle(Command::Enqueue(target.clone())).await;
        f.consumer.pump();
        assert_eq!(f.consumer.subscriptions(), vec![ObjectRef::file("doc")]);

        f.coordinator.handle(advertise("a", "doc", vec![ByteRange::new(0, 10)])).await;
        let ranges = requested(&f.sender, "a");
        assert_eq!(ranges, vec![ByteRange::new(0, 4), ByteRange::new(4, 4), ByteRange::new(8, 2)]);

        // responses may arrive in any order
        for range in ranges.into_iter().rev() {
            let data = Bytes::from(vec![b'x' + range.offset as u8; range.length as usize]);
            f.coordinator
                .handle(Command::Data {
                    peer_id: "a".into(),
                    object: ObjectRef::file("doc"),
                    range,
                    data,
                })
                .await;
        }

        assert_eq!(f.events.try_recv().unwrap(), DownloadEvent::Completed(target.clone()));
        assert_eq!(f.events.try_recv().unwrap(), DownloadEvent::QueueEmpty);
        assert_eq!(std::fs::read(&target.destination).unwrap(), b"xxxx||||\x80\x80".to_vec());

        f.consumer.pump();
        assert!(f.consumer.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn in_flight_requests_are_capped() {
        let mut f = fixture(1);
        f.coordinator.handle(Command::Enqueue(target(&f, "big", 100))).await;
        f.coordinator.handle(advertise("a", "big", vec![ByteRange::new(0, 100)])).await;
        assert_eq!(requested(&f.sender, "a").len(), MAX_IN_FLIGHT_PER_FILE);
    }

    #[tokio::test]
    async fn only_holders_of_a_chunk_are_asked() {
        let mut f = fixture(5);
        f.coordinator.handle(Command::Enqueue(target(&f, "doc", 10))).await;
        f.coordinator.handle(advertise("a", "doc", vec![ByteRange::new(0, 5)])).await;
        f.coordinator.handle(advertise("b", "doc", vec![ByteRange::new(5, 5)])).await;

        assert_eq!(requested(&f.sender, "a"), vec![ByteRange::new(0, 5)]);
        assert_eq!(requested(&f.sender, "b"), vec![ByteRange::new(5, 5)]);
    }

    #[tokio::test]
    async fn lost_requests_are_retried_elsewhere() {
        let mut f = fixture(10);
        f.coordinator.handle(Command::Enqueue(target(&f, "doc", 10))).await;
        f.coordinator.handle(advertise("a", "doc", vec![ByteRange::new(0, 10)])).await;
        assert_eq!(requested(&f.sender, "a").len(), 1);

        // a tick before the timeout keeps the request in flight
        tokio::time::pause();
        f.coordinator.handle(Command::Tick).await;
        assert_eq!(requested(&f.sender, "a").len(), 1);

        tokio::time::advance(REQUEST_TIMEOUT).await;
        f.coordinator.handle(Command::Tick).await;
        assert_eq!(requested(&f.sender, "a").len(), 2);

        f.coordinator.handle(advertise("b", "doc", vec![ByteRange::new(0, 10)])).await;
        f.coordinator.handle(Command::PeerDisconnected("a".into())).await;
        assert_eq!(requested(&f.sender, "b"), vec![ByteRange::new(0, 10)]);
    }

    #[tokio::test]
    async fn out_of_bounds_responses_are_ignored() {
        let mut f = fixture(10);
        let target = target(&f, "doc", 10);
        f.coordinator.handle(Command::Enqueue(target.clone())).await;

        for range in [ByteRange::new(u64::MAX, 1), ByteRange::new(8, 4)] {
            f.coordinator
                .handle(Command::Data {
                    peer_id: "evil".into(),
                    object: ObjectRef::file("doc"),
                    range,
                    data: Bytes::from(vec![0u8; range.length as usize]),
                })
                .await;
        }
        assert!(f.events.try_recv().is_err());

        f.coordinator
            .handle(Command::Data {
                peer_id: "a".into(),
                object: ObjectRef::file("doc"),
                range: ByteRange::new(0, 10),
                data: Bytes::from_static(b"0123456789"),
            })
            .await;
        assert_eq!(f.events.try_recv().unwrap(), DownloadEvent::Completed(target.clone()));
        assert_eq!(std::fs::read(&target.destination).unwrap(), b"0123456789".to_vec());
    }

    #[tokio::test]
    async fn empty_file_completes_immediately() {
        let mut f = fixture(4);
        let target = target(&f, "empty", 0);
        f.coordinator.handle(Command::Enqueue(target.clone())).await;

        assert_eq!(f.events.try_recv().unwrap(), DownloadEvent::Completed(target.clone()));
        assert_eq!(f.events.try_recv().unwrap(), DownloadEvent::QueueEmpty);
        assert!(target.destination.is_file());
    }
}
