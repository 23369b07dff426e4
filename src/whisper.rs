//! Legacy whisper file reader
//!
//! A whisper file is a fixed header followed by one ring buffer per archive.
//! All integers and floats are big-endian.
//!
//! ```text
//! header:   aggregation u32 | max_retention u32 | x_files_factor f32 | archive_count u32
//! archives: offset u32 | seconds_per_point u32 | points u32        (archive_count times)
//! data:     timestamp u32 | value f64                              (per ring slot)
//! ```
//!
//! Unwritten slots read back as `(0, 0)`, the gap sentinel.

use crate::conversion::{ArchiveInfo, Method, Point};
use crate::import::ArchiveSource;
use crate::storage::error::{StorageError, StorageResult};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

const HEADER_SIZE: usize = 16;
const ARCHIVE_INFO_SIZE: usize = 12;
const POINT_SIZE: usize = 12;

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(map) => &map[..],
            Backing::Owned(bytes) => &bytes[..],
        }
    }
}

/// A parsed whisper file
pub struct WhisperFile {
    backing: Backing,
    method: Method,
    pub max_retention: u32,
    pub x_files_factor: f32,
    archives: Vec<ArchiveInfo>,
}

impl std::fmt::Debug for WhisperFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperFile")
            .field("method", &self.method)
            .field("max_retention", &self.max_retention)
            .field("x_files_factor", &self.x_files_factor)
            .field("archives", &self.archives)
            .finish()
    }
}

impl WhisperFile {
    /// Memory-map and parse the file at `path`
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: the map is read-only and migrations run against files that are no longer written to.
        let map = unsafe { Mmap::map(&file)? };
        Self::parse(Backing::Mapped(map))
    }

    /// Parse an in-memory whisper image
    pub fn from_bytes(bytes: Vec<u8>) -> StorageResult<Self> {
        Self::parse(Backing::Owned(bytes))
    }

    fn parse(backing: Backing) -> StorageResult<Self> {
        let bytes = backing.bytes();
        if bytes.len() < HEADER_SIZE {
            return Err(StorageError::Whisper(format!(
                "file is {} bytes, shorter than the header",
                bytes.len()
            )));
        }

        let method = method_from_code(be_u32(bytes, 0)?)?;
        let max_retention = be_u32(bytes, 4)?;
        let x_files_factor = f32::from_bits(be_u32(bytes, 8)?);
        let archive_count = be_u32(bytes, 12)? as usize;

        if archive_count == 0 {
            return Err(StorageError::Whisper("file has no archives".into()));
        }
        if HEADER_SIZE + archive_count * ARCHIVE_INFO_SIZE > bytes.len() {
            return Err(StorageError::Whisper(format!(
                "{} archive descriptors do not fit in {} bytes",
                archive_count,
                bytes.len()
            )));
        }

        let mut archives = Vec::with_capacity(archive_count);
        for idx in 0..archive_count {
            let at = HEADER_SIZE + idx * ARCHIVE_INFO_SIZE;
            let info = ArchiveInfo::new(be_u32(bytes, at)?, be_u32(bytes, at + 4)?, be_u32(bytes, at + 8)?);

            let end = info.offset as usize + info.points as usize * POINT_SIZE;
            if end > bytes.len() {
                return Err(StorageError::Whisper(format!(
                    "archive {} ends at byte {} but file is {} bytes",
                    idx,
                    end,
                    bytes.len()
                )));
            }
            archives.push(info);
        }

        Ok(Self {
            backing,
            method,
            max_retention,
            x_files_factor,
            archives,
        })
    }
}

impl ArchiveSource for WhisperFile {
    fn aggregation_method(&self) -> Method {
        self.method
    }

    fn archives(&self) -> &[ArchiveInfo] {
        &self.archives
    }

    fn read_archive(&self, index: usize) -> StorageResult<Vec<Point>> {
        let info = self.archives.get(index).ok_or_else(|| {
            StorageError::Whisper(format!("archive index {} out of range", index))
        })?;
        let bytes = self.backing.bytes();

        (0..info.points as usize)
            .map(|slot| {
                let at = info.offset as usize + slot * POINT_SIZE;
                Ok(Point::new(
                    be_u32(bytes, at)?,
                    f64::from_bits(be_u64(bytes, at + 4)?),
                ))
            })
            .collect()
    }
}

fn method_from_code(code: u32) -> StorageResult<Method> {
    match code {
        1 => Ok(Method::Average),
        2 => Ok(Method::Sum),
        3 => Ok(Method::Last),
        4 => Ok(Method::Max),
        5 => Ok(Method::Min),
        other => Err(StorageError::Whisper(format!(
            "unsupported aggregation type {}",
            other
        ))),
    }
}

fn method_code(method: Method) -> u32 {
    match method {
        Method::Average => 1,
        Method::Sum => 2,
        Method::Last => 3,
        Method::Max => 4,
        Method::Min => 5,
        // whisper has no count rollup; a count series is summed
        Method::Count => 2,
    }
}

fn be_u32(buf: &[u8], at: usize) -> StorageResult<u32> {
    buf.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| StorageError::Whisper(format!("truncated at byte {}", at)))
}

fn be_u64(buf: &[u8], at: usize) -> StorageResult<u64> {
    buf.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| StorageError::Whisper(format!("truncated at byte {}", at)))
}

/// Builds whisper images, placing points in ring slots the way whisper does
#[derive(Debug, Clone)]
pub struct WhisperBuilder {
    method: Method,
    x_files_factor: f32,
    archives: Vec<(u32, u32, Vec<Point>)>,
}

impl WhisperBuilder {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            x_files_factor: 0.5,
            archives: Vec::new(),
        }
    }

    /// Add an archive of `points` slots at `seconds_per_point`, holding `data`
    pub fn archive(mut self, seconds_per_point: u32, points: u32, data: &[Point]) -> Self {
        self.archives.push((seconds_per_point, points, data.to_vec()));
        self
    }

    /// Serialize to the on-disk layout
    pub fn build(&self) -> Vec<u8> {
        let data_start = HEADER_SIZE + self.archives.len() * ARCHIVE_INFO_SIZE;
        let data_len: usize = self
            .archives
            .iter()
            .map(|(_, points, _)| *points as usize * POINT_SIZE)
            .sum();
        let max_retention = self
            .archives
            .iter()
            .map(|(spp, points, _)| spp * points)
            .max()
            .unwrap_or(0);

        let mut buf = Vec::with_capacity(data_start + data_len);
        buf.extend_from_slice(&method_code(self.method).to_be_bytes());
        buf.extend_from_slice(&max_retention.to_be_bytes());
        buf.extend_from_slice(&self.x_files_factor.to_bits().to_be_bytes());
        buf.extend_from_slice(&(self.archives.len() as u32).to_be_bytes());

        let mut offset = data_start as u32;
        for (spp, points, _) in &self.archives {
            buf.extend_from_slice(&offset.to_be_bytes());
            buf.extend_from_slice(&spp.to_be_bytes());
            buf.extend_from_slice(&points.to_be_bytes());
            offset += points * POINT_SIZE as u32;
        }

        for (spp, points, data) in &self.archives {
            let mut ring = vec![Point::new(0, 0.0); *points as usize];
            for point in data {
                let ts = point.timestamp - point.timestamp % spp;
                ring[((ts / spp) % points) as usize] = Point::new(ts, point.value);
            }
            for point in ring {
                buf.extend_from_slice(&point.timestamp.to_be_bytes());
                buf.extend_from_slice(&point.value.to_bits().to_be_bytes());
            }
        }

        buf
    }
}
