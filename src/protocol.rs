use std::{
    cmp::{max, min},
    fmt::{Display, Formatter},
    result,
};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const MAGIC_COOKIE: u32 = 0x7a52_fa73;

// keeps a full frame of availability messages inside one data channel message
pub const MAX_MESSAGES_PER_FRAME: usize = 99;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Saturates at `u64::MAX`. Ranges received from peers are checked with
    /// [`ByteRange::checked_end`] first.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub fn checked_end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    /// True when the range lies inside an object of `size` bytes.
    pub fn fits_within(&self, size: u64) -> bool {
        self.checked_end().map_or(false, |end| end <= size)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn contains(&self, other: &ByteRange) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }

    pub fn intersection(&self, other: &ByteRange) -> Option<ByteRange> {
        let start = max(self.offset, other.offset);
        let end = min(self.end(), other.end());
        if start < end {
            Some(ByteRange::new(start, end - start))
        } else {
            None
        }
    }

    /// Splits the range into consecutive pieces of at most `chunk_size` bytes.
    pub fn chunks(&self, chunk_size: u64) -> Vec<ByteRange> {
        let mut res = vec![];
        if chunk_size == 0 {
            return res;
        }

        let mut offset = self.offset;
        while offset < self.end() {
            let length = min(chunk_size, self.end() - offset);
            res.push(ByteRange::new(offset, length));
            offset += length;
        }

        res
    }
}

impl Display for ByteRange {
    fn fmt(&self, f: &mut Formatter) -> result::Result<(), std::fmt::Error> {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// Sorts and coalesces overlapping or adjacent ranges.
pub fn merge_ranges(mut ranges: Vec<ByteRange>) -> Vec<ByteRange> {
    ranges.retain(|r| !r.is_empty());
    ranges.sort();

    let mut res: Vec<ByteRange> = vec![];
    for range in ranges {
        match res.last_mut() {
            Some(last) if range.offset <= last.end() => {
                let end = max(last.end(), range.end());
                last.length = end - last.offset;
            },
            _ => res.push(range),
        }
    }

    res
}

/// Parts of `range` not covered by any of `have`, which must be merged.
pub fn missing_ranges(range: &ByteRange, have: &[ByteRange]) -> Vec<ByteRange> {
    let mut res = vec![];
    let mut cursor = range.offset;

    for r in have {
        if r.end() <= cursor {
            continue;
        }
        if r.offset >= range.end() {
            break;
        }
        if r.offset > cursor {
            res.push(ByteRange::new(cursor, r.offset - cursor));
        }
        cursor = max(cursor, r.end());
    }

    if cursor < range.end() {
        res.push(ByteRange::new(cursor, range.end() - cursor));
    }

    res
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    File,
    Patch,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectType,
    pub id: String,
}

impl ObjectRef {
    pub fn file(id: impl Into<String>) -> Self {
        Self {
            kind: ObjectType::File,
            id: id.into(),
        }
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut Formatter) -> result::Result<(), std::fmt::Error> {
        match self.kind {
            ObjectType::File => write!(f, "file {}", self.id),
            ObjectType::Patch => write!(f, "patch {}", self.id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerMessage {
    AvailabilityRequest {
        object: ObjectRef,
    },
    AvailabilityResponse {
        object: ObjectRef,
        ranges: Vec<ByteRange>,
    },
    DataRequest {
        object: ObjectRef,
        range: ByteRange,
    },
    DataResponse {
        object: ObjectRef,
        range: ByteRange,
        data: Bytes,
    },
    Abort {
        object: ObjectRef,
        offset: Option<u64>,
    },
}

impl PeerMessage {
    /// Rejects ranges whose end does not fit in a `u64`.
    pub fn is_well_formed(&self) -> bool {
        match self {
            PeerMessage::AvailabilityResponse { ranges, .. } => ranges.iter().all(|r| r.checked_end().is_some()),
            PeerMessage::DataRequest { range, .. } | PeerMessage::DataResponse { range, .. } => {
                range.checked_end().is_some()
            },
            PeerMessage::AvailabilityRequest { .. } | PeerMessage::Abort { .. } => true,
        }
    }

    pub fn object(&self) -> &ObjectRef {
        match self {
            PeerMessage::AvailabilityRequest { object }
            | PeerMessage::AvailabilityResponse { object, .. }
            | PeerMessage::DataRequest { object, .. }
            | PeerMessage::DataResponse { object, .. }
            | PeerMessage::Abort { object, .. } => object,
        }
    }
}

#[derive(Serialize)]
struct FrameRef<'a> {
    magic_cookie: u32,
    messages: &'a [PeerMessage],
}

#[derive(Deserialize)]
struct Frame {
    magic_cookie: u32,
    messages: Vec<PeerMessage>,
}

pub fn encode_frame(messages: &[PeerMessage]) -> Result<Bytes> {
    let frame = FrameRef {
        magic_cookie: MAGIC_COOKIE,
        messages,
    };

    Ok(Bytes::from(bincode::serialize(&frame)?))
}

/// Encodes `messages` into as many frames as needed, each carrying at most
/// [`MAX_MESSAGES_PER_FRAME`] messages.
pub fn encode_frames(messages: &[PeerMessage]) -> Result<Vec<Bytes>> {
    messages
        .chunks(MAX_MESSAGES_PER_FRAME)
        .map(encode_frame)
        .collect()
}

pub fn decode_frame(data: &[u8]) -> Result<Vec<PeerMessage>> {
    let frame: Frame = bincode::deserialize(data)?;

    if frame.magic_cookie != MAGIC_COOKIE {
        return Err(anyhow!("bad magic cookie {:#x}", frame.magic_cookie));
    }

    Ok(frame.messages)
}
