use std::{
    collections::{HashMap, VecDeque},
    io::SeekFrom,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, Mutex as AsyncMutex,
    },
};

use crate::{
    connectivity::{PeerSender, StillWanted},
    lifecycle::{used_after_stop, Lifecycle},
    protocol::{encode_frame, ByteRange, ObjectRef, PeerMessage},
    storage::{AssetResolver, LocalStore, MetadataStore},
};

// bounds the frames held in memory for one response
const MAX_REQUEST_LENGTH: u64 = 16 * 1_048_576;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub peer_id: String,
    pub object: ObjectRef,
    pub range: ByteRange,
}

impl RequestKey {
    fn matches(&self, peer_id: &str, object: &ObjectRef, offset: Option<u64>) -> bool {
        self.peer_id == peer_id && self.object == *object && offset.map_or(true, |o| o == self.range.offset)
    }
}

pub enum Command {
    Request(RequestKey),
    Abort {
        peer_id: String,
        object: ObjectRef,
        offset: Option<u64>,
    },
    PeerDisconnected(String),
    Finished(u64),
    Stop,
}

#[derive(Clone)]
pub struct DataSupplierHandle {
    tx: UnboundedSender<Command>,
}

impl DataSupplierHandle {
    #[cfg(test)]
    pub fn detached() -> (Self, UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn on_request(&self, peer_id: &str, object: ObjectRef, range: ByteRange) {
        self.dispatch(Command::Request(RequestKey {
            peer_id: peer_id.to_string(),
            object,
            range,
        }));
    }

    pub fn on_abort(&self, peer_id: &str, object: ObjectRef, offset: Option<u64>) {
        self.dispatch(Command::Abort {
            peer_id: peer_id.to_string(),
            object,
            offset,
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
            used_after_stop("data supplier");
        }
    }
}

#[derive(Clone)]
struct Sources {
    metadata: Arc<dyn MetadataStore>,
    local: Arc<dyn LocalStore>,
    resolver: Arc<dyn AssetResolver>,
    fetches: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl Sources {
    /// Full copy, then a partial download covering the range, then a fresh
    /// temp copy, and only then the external asset source.
    async fn resolve(&self, object: &ObjectRef, range: &ByteRange) -> Result<PathBuf> {
        let info = self
            .metadata
            .object_info(&object.id)
            .ok_or_else(|| anyhow!("unknown object"))?;

        if !range.fits_within(info.size) {
            return Err(anyhow!("range {range} beyond object size {}", info.size));
        }

        if let Some(path) = self.local.full_copy(&info.hash) {
            return Ok(path);
        }

        if let Some(partial) = self.local.partial_download(&info.hash) {
            if partial.ranges.iter().any(|r| r.contains(range)) {
                return Ok(partial.path);
            }
        }

        if let Some(path) = self.local.temp_copy(&object.id) {
            return Ok(path);
        }

        let locator = self
            .metadata
            .file_meta(&object.id)
            .and_then(|meta| meta.asset_locator)
            .ok_or_else(|| anyhow!("no local copy and no asset source"))?;

        if !self.resolver.can_resolve(&locator) {
            return Err(anyhow!("asset source cannot resolve {locator}"));
        }

        // one fetch per object, later requests wait for it and reuse the copy
        let gate = self.fetch_gate(&object.id)?;
        let _fetching = gate.lock().await;
        if let Some(path) = self.local.temp_copy(&object.id) {
            return Ok(path);
        }

        let destination = self.local.temp_path(&object.id);
        let fetched = self.resolver.fetch(&locator, destination.clone()).await;
        self.release_gate(&object.id, &gate)?;
        fetched?;

        Ok(destination)
    }

    fn fetch_gate(&self, object_id: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut fetches = self.fetches.lock().map_err(|_| anyhow!("failed to acquire lock"))?;
        Ok(fetches.entry(object_id.to_string()).or_default().clone())
    }

    fn release_gate(&self, object_id: &str, gate: &Arc<AsyncMutex<()>>) -> Result<()> {
        let mut fetches = self.fetches.lock().map_err(|_| anyhow!("failed to acquire lock"))?;
        if fetches.get(object_id).is_some_and(|current| Arc::ptr_eq(current, gate)) {
            fetches.remove(object_id);
        }
        Ok(())
    }
}

async fn read_chunk(file: &mut File, length: u64) -> Result<Bytes> {
    let mut buf = BytesMut::zeroed(usize::try_from(length)?);
    file.read_exact(&mut buf).await?;
    Ok(buf.freeze())
}

struct Slot {
    key: RequestKey,
    wanted: Arc<AtomicBool>,
}

/// Frees a processing slot when its serving task ends, however it ends.
struct Release {
    slot: u64,
    tx: UnboundedSender<Command>,
}

impl Drop for Release {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Finished(self.slot));
    }
}

/// Serves byte-range requests, at most `concurrency` at a time, in arrival
/// order.
pub struct DataSupplier {
    sources: Sources,
    sender: Arc<dyn PeerSender>,
    chunk_size: u64,
    concurrency: usize,
    queue: VecDeque<RequestKey>,
    processing: HashMap<u64, Slot>,
    next_slot: u64,
    lifecycle: Lifecycle,
    tx: UnboundedSender<Command>,
    rx: UnboundedReceiver<Command>,
}

impl DataSupplier {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        local: Arc<dyn LocalStore>,
        resolver: Arc<dyn AssetResolver>,
        sender: Arc<dyn PeerSender>,
        chunk_size: u64,
        concurrency: usize,
    ) -> (Self, DataSupplierHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = DataSupplierHandle { tx: tx.clone() };

        let supplier = Self {
            sources: Sources {
                metadata,
                local,
                resolver,
                fetches: Arc::new(Mutex::new(HashMap::new())),
            },
            sender,
            chunk_size,
            concurrency,
            queue: VecDeque::new(),
            processing: HashMap::new(),
            next_slot: 0,
            lifecycle: Lifecycle::Uninitialized,
            tx,
            rx,
        };

        (supplier, handle)
    }

    pub async fn start(mut self) -> Result<()> {
        self.lifecycle = Lifecycle::Running;

        while let Some(command) = self.rx.recv().await {
            self.handle(command);
            if !self.lifecycle.is_running() {
                break;
            }
        }

        for (_, slot) in self.processing.drain() {
            slot.wanted.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Request(key) => {
                let range = key.range;
                if range.is_empty() || range.checked_end().is_none() || range.length > MAX_REQUEST_LENGTH {
                    warn!("Rejecting request for {} {} from {}. ", key.object, range, key.peer_id);
                    return;
                }
                if self.is_pending(&key) {
                    debug!("Duplicate request for {} {} from {}. ", key.object, range, key.peer_id);
                    return;
                }
                self.queue.push_back(key);
            },
            Command::Abort { peer_id, object, offset } => {
                self.cancel(|key| key.matches(&peer_id, &object, offset));
            },
            Command::PeerDisconnected(peer_id) => {
                self.cancel(|key| key.peer_id == peer_id);
            },
            Command::Finished(slot) => {
                self.processing.remove(&slot);
            },
            Command::Stop => {
                self.lifecycle = Lifecycle::Stopped;
                return;
            },
        }

        self.pump_queue();
    }

    /// Cancelled slots keep counting against the cap until their task ends,
    /// but no longer block a fresh request for the same range.
    fn is_pending(&self, key: &RequestKey) -> bool {
        self.queue.contains(key)
            || self
                .processing
                .values()
                .any(|slot| slot.key == *key && slot.wanted.load(Ordering::SeqCst))
    }

    /// Queued matches are dropped, processing ones stop after the chunk in
    /// flight and free their slot when the batch reports back.
    fn cancel(&mut self, matches: impl Fn(&RequestKey) -> bool) {
        self.queue.retain(|key| !matches(key));
        for slot in self.processing.values() {
            if matches(&slot.key) {
                debug!("Cancelling {} {} for {}. ", slot.key.object, slot.key.range, slot.key.peer_id);
                slot.wanted.store(false, Ordering::SeqCst);
            }
        }
    }

    fn pump_queue(&mut self) {
        while self.processing.len() < self.concurrency {
            let key = match self.queue.pop_front() {
                Some(key) => key,
                None => break,
            };

            let slot = self.next_slot;
            self.next_slot += 1;

            let wanted = Arc::new(AtomicBool::new(true));
            self.processing.insert(slot, Slot {
                key: key.clone(),
                wanted: wanted.clone(),
            });

            let release = Release {
                slot,
                tx: self.tx.clone(),
            };
            tokio::spawn(serve(
                key,
                self.sources.clone(),
                self.sender.clone(),
                self.chunk_size,
                wanted,
                release,
            ));
        }
    }

    #[cfg(test)]
    fn pump(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            self.handle(command);
        }
    }
}

async fn serve(
    key: RequestKey,
    sources: Sources,
    sender: Arc<dyn PeerSender>,
    chunk_size: u64,
    wanted: Arc<AtomicBool>,
    _release: Release,
) {
    match prepare(&key, &sources, chunk_size, &wanted).await {
        Ok(frames) if wanted.load(Ordering::SeqCst) => {
            let (on_sent, sent) = oneshot::channel();
            let still_wanted: StillWanted = {
                let wanted = wanted.clone();
                Arc::new(move || wanted.load(Ordering::SeqCst))
            };

            sender.send_batch(frames, &key.peer_id, on_sent, still_wanted);
            match sent.await {
                Ok(true) => debug!("Served {} {} to {}. ", key.object, key.range, key.peer_id),
                _ => debug!("Response {} {} to {} abandoned. ", key.object, key.range, key.peer_id),
            }
        },
        Ok(_) => {},
        Err(e) => warn!("Dropping request for {} {} from {}: {e}. ", key.object, key.range, key.peer_id),
    }
}

/// One data response frame per chunk, each chunk with its own range. Reading
/// stops early once the request is no longer wanted.
async fn prepare(key: &RequestKey, sources: &Sources, chunk_size: u64, wanted: &AtomicBool) -> Result<Vec<Bytes>> {
    let path = sources.resolve(&key.object, &key.range).await?;
    let mut file = File::open(&path).await?;
    file.seek(SeekFrom::Start(key.range.offset)).await?;

    let mut frames = vec![];
    for chunk in key.range.chunks(chunk_size) {
        if !wanted.load(Ordering::SeqCst) {
            break;
        }

        let message = PeerMessage::DataResponse {
            object: key.object.clone(),
            range: chunk,
            data: read_chunk(&mut file, chunk.length).await?,
        };
        frames.push(encode_frame(&[message])?);
    }

    Ok(frames)
}
