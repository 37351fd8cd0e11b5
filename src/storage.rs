use std::{
    collections::HashMap,
    ffi::CString,
    fs,
    io::Error as IOError,
    mem::zeroed,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, SystemTime},
};

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use libc::{c_char, statvfs};
use log::{debug, warn};
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use tokio::{fs::File, io::AsyncWriteExt};
use url::Url;
use uuid::Uuid;

use crate::protocol::{merge_ranges, ByteRange};

const MAX_REDIRECTION: u64 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ObjectInfo {
    pub hash: String,
    pub size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileMeta {
    pub asset_locator: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatusUpdate {
    Online(bool),
    ConnectedPeers(usize),
    Throughput {
        upload: f64,
        download: f64,
        total_upload: u64,
        total_download: u64,
    },
    DiskUsage(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialDownload {
    pub path: PathBuf,
    pub ranges: Vec<ByteRange>,
}

pub trait MetadataStore: Send + Sync {
    fn object_info(&self, object_id: &str) -> Option<ObjectInfo>;
    fn file_meta(&self, object_id: &str) -> Option<FileMeta>;
    fn update_status(&self, update: StatusUpdate);
}

pub trait LocalStore: Send + Sync {
    fn full_copy(&self, hash: &str) -> Option<PathBuf>;
    fn partial_download(&self, hash: &str) -> Option<PartialDownload>;
    /// Returns a staged temp copy of the object, refreshing its timestamp, if
    /// one exists and has not gone stale.
    fn temp_copy(&self, object_id: &str) -> Option<PathBuf>;
    fn temp_path(&self, object_id: &str) -> PathBuf;
}

pub trait AssetResolver: Send + Sync {
    fn can_resolve(&self, locator: &str) -> bool;
    /// Stages the asset at `destination`. Readers never observe a partially
    /// written destination.
    fn fetch(&self, locator: &str, destination: PathBuf) -> BoxFuture<'static, Result<()>>;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OwnStatus {
    pub online: bool,
    pub connected_peers: usize,
    pub upload_speed: f64,
    pub download_speed: f64,
    pub total_upload: u64,
    pub total_download: u64,
    pub disk_usage: u64,
}

#[derive(Deserialize)]
struct IndexEntry {
    hash: String,
    size: u64,

    #[serde(default)]
    asset_locator: Option<String>,
}

#[derive(Default, Deserialize)]
struct Index {
    #[serde(default)]
    objects: HashMap<String, IndexEntry>,
}

/// Metadata store backed by a JSON index of object id to hash, size and asset
/// locator. Own status is kept in memory.
#[derive(Default)]
pub struct IndexMetadataStore {
    index: Index,
    status: Mutex<OwnStatus>,
}

impl IndexMetadataStore {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Metadata index {} does not exist, starting empty. ", path.display());
            return Ok(Self::default());
        }

        let index = fs::read_to_string(path)?;
        let index: Index = serde_json::from_str(&index)?;
        debug!("Loaded {} object(s) from {}. ", index.objects.len(), path.display());

        Ok(Self {
            index,
            status: Mutex::new(OwnStatus::default()),
        })
    }

    pub fn status(&self) -> Result<OwnStatus> {
        Ok(self.status.lock().map_err(|_| anyhow!("failed to acquire lock"))?.clone())
    }

    #[cfg(test)]
    pub fn insert(&mut self, object_id: &str, hash: &str, size: u64, asset_locator: Option<&str>) {
        let entry = IndexEntry {
            hash: hash.to_string(),
            size,
            asset_locator: asset_locator.map(String::from),
        };
        self.index.objects.insert(object_id.to_string(), entry);
    }
}

impl MetadataStore for IndexMetadataStore {
    fn object_info(&self, object_id: &str) -> Option<ObjectInfo> {
        self.index.objects.get(object_id).map(|entry| ObjectInfo {
            hash: entry.hash.clone(),
            size: entry.size,
        })
    }

    fn file_meta(&self, object_id: &str) -> Option<FileMeta> {
        self.index.objects.get(object_id).map(|entry| FileMeta {
            asset_locator: entry.asset_locator.clone(),
        })
    }

    fn update_status(&self, update: StatusUpdate) {
        let mut status = match self.status.lock() {
            Ok(status) => status,
            Err(e) => {
                warn!("Own status in bad state: {e}. ");
                return;
            },
        };

        match update {
            StatusUpdate::Online(online) => status.online = online,
            StatusUpdate::ConnectedPeers(count) => status.connected_peers = count,
            StatusUpdate::Throughput { upload, download, total_upload, total_download } => {
                status.upload_speed = upload;
                status.download_speed = download;
                status.total_upload = total_upload;
                status.total_download = total_download;
            },
            StatusUpdate::DiskUsage(usage) => status.disk_usage = usage,
        }
    }
}

/// Local object store on disk:
/// `copies/<hash>` full artifacts, `partial/<hash>` with a `partial/<hash>.ranges`
/// JSON list of downloaded ranges, `temp/<object id>` staged copies.
pub struct DirectoryStore {
    root: PathBuf,
    temp_ttl: Duration,
}

impl DirectoryStore {
    pub fn new(root: PathBuf, temp_ttl: Duration) -> Result<Self> {
        for dir in ["copies", "partial", "temp"] {
            fs::create_dir_all(root.join(dir))?;
        }

        Ok(Self { root, temp_ttl })
    }

    pub fn copy_path(&self, hash: &str) -> PathBuf {
        self.root.join("copies").join(file_name(hash))
    }

    pub fn partial_path(&self, hash: &str) -> PathBuf {
        self.root.join("partial").join(file_name(hash))
    }

    fn ranges_path(&self, hash: &str) -> PathBuf {
        self.root.join("partial").join(format!("{}.ranges", file_name(hash)))
    }

    #[cfg(test)]
    pub fn record_partial_ranges(&self, hash: &str, ranges: Vec<ByteRange>) -> Result<()> {
        let ranges = merge_ranges(ranges);
        fs::write(self.ranges_path(hash), serde_json::to_vec(&ranges)?)?;
        Ok(())
    }
}

impl LocalStore for DirectoryStore {
    fn full_copy(&self, hash: &str) -> Option<PathBuf> {
        let path = self.copy_path(hash);
        path.is_file().then_some(path)
    }

    fn partial_download(&self, hash: &str) -> Option<PartialDownload> {
        let path = self.partial_path(hash);
        if !path.is_file() {
            return None;
        }

        let ranges = match fs::read(self.ranges_path(hash)) {
            Ok(ranges) => ranges,
            Err(_) => return None,
        };

        let ranges: Vec<ByteRange> = match serde_json::from_slice(&ranges) {
            Ok(ranges) => ranges,
            Err(e) => {
                warn!("Failed to parse downloaded ranges of {hash}: {e}. ");
                return None;
            },
        };

        if ranges.is_empty() {
            return None;
        }

        Some(PartialDownload { path, ranges: merge_ranges(ranges) })
    }

    fn temp_copy(&self, object_id: &str) -> Option<PathBuf> {
        let path = self.temp_path(object_id);
        let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;

        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age > self.temp_ttl {
            debug!("Temp copy of {object_id} is stale. ");
            return None;
        }

        let touched = fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(e) = touched {
            warn!("Failed to touch temp copy of {object_id}: {e}. ");
        }

        Some(path)
    }

    fn temp_path(&self, object_id: &str) -> PathBuf {
        self.root.join("temp").join(file_name(object_id))
    }
}

fn file_name(id: &str) -> String {
    id.replace(['/', '\\'], "_")
}

/// Resolves `file://` and `http(s)://` asset locators.
pub struct FileAssetResolver {
    client: Client,
}

impl FileAssetResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl AssetResolver for FileAssetResolver {
    fn can_resolve(&self, locator: &str) -> bool {
        let url = match Url::parse(locator) {
            Ok(url) => url,
            Err(_) => return false,
        };

        match url.scheme() {
            "file" => url.to_file_path().map(|p| p.is_file()).unwrap_or(false),
            "http" | "https" => true,
            _ => false,
        }
    }

    fn fetch(&self, locator: &str, destination: PathBuf) -> BoxFuture<'static, Result<()>> {
        let client = self.client.clone();
        let locator = locator.to_string();

        Box::pin(async move {
            let url = Url::parse(&locator)?;
            let staging = staging_path(&destination);

            let staged = match url.scheme() {
                "file" => match url.to_file_path() {
                    Ok(source) => tokio::fs::copy(&source, &staging)
                        .await
                        .map(|_| ())
                        .map_err(anyhow::Error::from),
                    Err(_) => Err(anyhow!("invalid file locator {locator}")),
                },
                "http" | "https" => fetch_http(client, url, &staging).await,
                scheme => Err(anyhow!("unsupported asset scheme {scheme}")),
            };

            if let Err(e) = staged {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e);
            }

            tokio::fs::rename(&staging, &destination).await?;
            debug!("Staged asset {locator} at {}. ", destination.display());

            Ok(())
        })
    }
}

/// A staging file of its own for every fetch, next to `destination`.
fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(format!(".{}.staging", Uuid::new_v4().simple()));
    PathBuf::from(name)
}

async fn fetch_http(client: Client, url: Url, staging: &Path) -> Result<()> {
    let mut url = url;

    let mut iter = 0;
    let mut response = loop {
        if iter == MAX_REDIRECTION {
            return Err(anyhow!("max redirection reached"));
        }

        let response = client.get(url.clone()).send().await?;

        if response.status().is_redirection() {
            let location = response
                .headers()
                .get(header::LOCATION)
                .ok_or(anyhow!("invalid redirect response"))?
                .to_str()?;
            url = url.join(location)?;
        } else {
            break response;
        }

        iter += 1;
    };

    if !response.status().is_success() {
        return Err(anyhow!("asset source returned status {}", response.status().as_u16()));
    }

    let mut file = File::create(staging).await?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(())
}

/// Bytes in use on the filesystem holding `path`.
pub fn disk_usage(path: &Path) -> Result<u64> {
    let path = path.to_str().ok_or(anyhow!("invalid path"))?;
    let c_path = CString::new(path)?;

    let stat = unsafe {
        let mut stat: statvfs = zeroed();
        if statvfs(c_path.as_ptr() as *const c_char, &mut stat) != 0 {
            return Err(IOError::last_os_error().into());
        }
        stat
    };

    let total = stat.f_blocks as u64 * stat.f_frsize as u64;
    let free = stat.f_bfree as u64 * stat.f_frsize as u64;
    Ok(total.saturating_sub(free))
}
