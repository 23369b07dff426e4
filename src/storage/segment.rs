//! Segment file format for imported chunks
//!
//! One import run writes one segment file holding every `(row key, chunk)`
//! pair it produced.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (64 bytes)                       │
//! │   magic: [u8; 4] = "TSMC"               │
//! │   version: u16                          │
//! │   record_count: u32                     │
//! │   min_t0: u32                           │
//! │   max_t0: u32                           │
//! │   reserved: [u8; 42]                    │
//! │   checksum: u32                         │
//! ├─────────────────────────────────────────┤
//! │ RECORDS (variable)                      │
//! │   For each chunk:                       │
//! │     body_size: u32                      │
//! │     body:                               │
//! │       key_len: u16, key: [u8]           │
//! │       t0, span, interval, count: u32    │
//! │       finished: u8                      │
//! │       payload: [u8]                     │
//! │     body_checksum: u32                  │
//! ├─────────────────────────────────────────┤
//! │ FOOTER                                  │
//! │   per record: offset u64, size u32,     │
//! │               t0 u32, key_len u16, key  │
//! │   footer_size: u32                      │
//! │   footer_checksum: u32                  │
//! └─────────────────────────────────────────┘
//! ```

use crate::storage::chunk::Chunk;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::store::ChunkStore;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for segment file identification
const SEGMENT_MAGIC: [u8; 4] = *b"TSMC";

/// Current segment format version
const SEGMENT_VERSION: u16 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 64;

/// Fixed part of a record body after the key
const RECORD_FIXED_SIZE: usize = 4 * 4 + 1;

/// Segment file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version: u16,
    pub record_count: u32,
    /// Smallest chunk boundary in the file
    pub min_t0: u32,
    /// Largest chunk boundary in the file
    pub max_t0: u32,
}

impl SegmentHeader {
    fn new() -> Self {
        Self {
            version: SEGMENT_VERSION,
            record_count: 0,
            min_t0: u32::MAX,
            max_t0: 0,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..10].copy_from_slice(&self.record_count.to_le_bytes());
        buf[10..14].copy_from_slice(&self.min_t0.to_le_bytes());
        buf[14..18].copy_from_slice(&self.max_t0.to_le_bytes());
        // bytes 18-59 reserved

        let checksum = crc32fast::hash(&buf[0..60]);
        buf[60..64].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> StorageResult<Self> {
        let stored_checksum = le_u32(buf, 60)?;
        let computed_checksum = crc32fast::hash(&buf[0..60]);

        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption(format!(
                "Header checksum mismatch: stored={}, computed={}",
                stored_checksum, computed_checksum
            )));
        }

        if buf[0..4] != SEGMENT_MAGIC {
            return Err(StorageError::InvalidSegment(format!(
                "Invalid magic: {:?}",
                &buf[0..4]
            )));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > SEGMENT_VERSION {
            return Err(StorageError::InvalidSegment(format!(
                "Unsupported version: {}",
                version
            )));
        }

        Ok(Self {
            version,
            record_count: le_u32(buf, 6)?,
            min_t0: le_u32(buf, 10)?,
            max_t0: le_u32(buf, 14)?,
        })
    }
}

/// Location of one record, as stored in the footer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    /// Offset from start of file
    pub offset: u64,
    /// Size of the record body
    pub size: u32,
    pub t0: u32,
    pub row_key: String,
}

/// Appends chunks to a new segment file
pub struct SegmentWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    header: SegmentHeader,
    records: Vec<RecordMeta>,
    position: u64,
    finished: bool,
}

impl SegmentWriter {
    /// Create a new segment file at `path`
    pub fn create(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut writer = BufWriter::new(File::create(&path)?);
        let header = SegmentHeader::new();
        writer.write_all(&header.to_bytes())?;

        Ok(Self {
            path,
            writer,
            header,
            records: Vec::new(),
            position: HEADER_SIZE as u64,
            finished: false,
        })
    }

    /// Create the next `segment_NNNNNN.dat` file in `dir`
    pub fn create_next(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let mut max_id = 0u32;
        for entry in std::fs::read_dir(dir)? {
            if let Some(id) = segment_id(&entry?.path()) {
                max_id = max_id.max(id);
            }
        }

        Self::create(dir.join(format!("segment_{:06}.dat", max_id + 1)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Write footer and final header; no more records can be appended afterwards
    fn write_footer(&mut self) -> StorageResult<()> {
        let mut footer_data = Vec::with_capacity(self.records.len() * 32);

        for record in &self.records {
            footer_data.extend_from_slice(&record.offset.to_le_bytes());
            footer_data.extend_from_slice(&record.size.to_le_bytes());
            footer_data.extend_from_slice(&record.t0.to_le_bytes());
            footer_data.extend_from_slice(&(record.row_key.len() as u16).to_le_bytes());
            footer_data.extend_from_slice(record.row_key.as_bytes());
        }

        let checksum = crc32fast::hash(&footer_data);

        self.writer.write_all(&footer_data)?;
        self.writer.write_all(&(footer_data.len() as u32).to_le_bytes())?;
        self.writer.write_all(&checksum.to_le_bytes())?;

        // Rewrite header with updated counts
        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&self.header.to_bytes())?;
        self.writer.flush()?;

        Ok(())
    }
}

impl ChunkStore for SegmentWriter {
    fn put(&mut self, row_key: &str, chunk: &Chunk) -> StorageResult<()> {
        if self.finished {
            return Err(StorageError::InvalidSegment(format!(
                "{:?} is already finished",
                self.path
            )));
        }
        let key_len = u16::try_from(row_key.len()).map_err(|_| {
            StorageError::InvalidSegment(format!("row key too long: {} bytes", row_key.len()))
        })?;

        let mut body = Vec::with_capacity(2 + row_key.len() + RECORD_FIXED_SIZE + chunk.data().len());
        body.extend_from_slice(&key_len.to_le_bytes());
        body.extend_from_slice(row_key.as_bytes());
        body.extend_from_slice(&chunk.t0.to_le_bytes());
        body.extend_from_slice(&chunk.span.to_le_bytes());
        body.extend_from_slice(&chunk.interval.to_le_bytes());
        body.extend_from_slice(&chunk.point_count.to_le_bytes());
        body.push(u8::from(chunk.finished));
        body.extend_from_slice(chunk.data());

        // Write record: size (4) + body (N) + checksum (4)
        let checksum = crc32fast::hash(&body);
        self.writer.write_all(&(body.len() as u32).to_le_bytes())?;
        self.writer.write_all(&body)?;
        self.writer.write_all(&checksum.to_le_bytes())?;

        self.records.push(RecordMeta {
            offset: self.position,
            size: body.len() as u32,
            t0: chunk.t0,
            row_key: row_key.to_string(),
        });
        self.position += body.len() as u64 + 8;

        self.header.record_count = self.records.len() as u32;
        self.header.min_t0 = self.header.min_t0.min(chunk.t0);
        self.header.max_t0 = self.header.max_t0.max(chunk.t0);

        Ok(())
    }

    fn finish(&mut self) -> StorageResult<()> {
        if self.finished {
            return Ok(());
        }
        self.write_footer()?;
        self.finished = true;
        tracing::debug!(path = ?self.path, records = self.records.len(), "Finished segment");
        Ok(())
    }
}

/// Read access to a finished segment file
pub struct SegmentReader {
    pub path: PathBuf,
    pub header: SegmentHeader,
    pub records: Vec<RecordMeta>,
    reader: BufReader<File>,
}

impl SegmentReader {
    /// Open an existing segment file
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);

        let mut header_buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_buf)?;
        let header = SegmentHeader::from_bytes(&header_buf)?;

        let records = Self::read_footer(&mut reader, &header)?;

        Ok(Self {
            path,
            header,
            records,
            reader,
        })
    }

    fn read_footer(reader: &mut BufReader<File>, header: &SegmentHeader) -> StorageResult<Vec<RecordMeta>> {
        reader.seek(SeekFrom::End(-8))?;

        let mut trailer = [0u8; 8];
        reader.read_exact(&mut trailer)?;
        let footer_size = le_u32(&trailer, 0)?;
        let stored_checksum = le_u32(&trailer, 4)?;

        reader.seek(SeekFrom::End(-(i64::from(footer_size)) - 8))?;
        let mut footer_data = vec![0u8; footer_size as usize];
        reader.read_exact(&mut footer_data)?;

        if crc32fast::hash(&footer_data) != stored_checksum {
            return Err(StorageError::Corruption("Footer checksum mismatch".into()));
        }

        let mut records = Vec::with_capacity(header.record_count as usize);
        let mut at = 0;
        for _ in 0..header.record_count {
            let offset = le_u64(&footer_data, at)?;
            let size = le_u32(&footer_data, at + 8)?;
            let t0 = le_u32(&footer_data, at + 12)?;
            let key_len = usize::from(le_u16(&footer_data, at + 16)?);
            let key = footer_data
                .get(at + 18..at + 18 + key_len)
                .ok_or_else(|| StorageError::Corruption("Footer truncated".into()))?;
            let row_key = String::from_utf8(key.to_vec())
                .map_err(|e| StorageError::Corruption(format!("Row key is not UTF-8: {}", e)))?;

            records.push(RecordMeta {
                offset,
                size,
                t0,
                row_key,
            });
            at += 18 + key_len;
        }

        Ok(records)
    }

    /// Read and decode a specific record
    pub fn read_record(&mut self, idx: usize) -> StorageResult<(String, Chunk)> {
        let meta = self.records.get(idx).ok_or_else(|| {
            StorageError::InvalidSegment(format!("Record index out of range: {}", idx))
        })?;
        let (offset, size) = (meta.offset, meta.size);

        self.reader.seek(SeekFrom::Start(offset))?;

        let mut size_buf = [0u8; 4];
        self.reader.read_exact(&mut size_buf)?;
        if u32::from_le_bytes(size_buf) != size {
            return Err(StorageError::Corruption(format!("Record {} size mismatch", idx)));
        }

        let mut body = vec![0u8; size as usize];
        self.reader.read_exact(&mut body)?;

        let mut checksum_buf = [0u8; 4];
        self.reader.read_exact(&mut checksum_buf)?;
        if u32::from_le_bytes(checksum_buf) != crc32fast::hash(&body) {
            return Err(StorageError::Corruption(format!(
                "Record {} checksum mismatch",
                idx
            )));
        }

        decode_record(&body)
    }

    /// All chunks stored under `row_key`, in file order
    pub fn read_row(&mut self, row_key: &str) -> StorageResult<Vec<Chunk>> {
        let indexes: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.row_key == row_key)
            .map(|(idx, _)| idx)
            .collect();

        indexes
            .into_iter()
            .map(|idx| self.read_record(idx).map(|(_, chunk)| chunk))
            .collect()
    }

    /// Distinct row keys, in first-seen order
    pub fn row_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for record in &self.records {
            if !keys.contains(&record.row_key.as_str()) {
                keys.push(&record.row_key);
            }
        }
        keys
    }
}

fn decode_record(body: &[u8]) -> StorageResult<(String, Chunk)> {
    let key_len = usize::from(le_u16(body, 0)?);
    let key = body
        .get(2..2 + key_len)
        .ok_or_else(|| StorageError::Corruption("Record truncated".into()))?;
    let row_key = String::from_utf8(key.to_vec())
        .map_err(|e| StorageError::Corruption(format!("Row key is not UTF-8: {}", e)))?;

    let at = 2 + key_len;
    let t0 = le_u32(body, at)?;
    let span = le_u32(body, at + 4)?;
    let interval = le_u32(body, at + 8)?;
    let point_count = le_u32(body, at + 12)?;
    let finished = *body
        .get(at + 16)
        .ok_or_else(|| StorageError::Corruption("Record truncated".into()))?
        != 0;
    let payload = body[at + RECORD_FIXED_SIZE..].to_vec();

    Ok((
        row_key,
        Chunk::from_parts(t0, span, interval, point_count, finished, payload),
    ))
}

/// Segment id from a `segment_NNNNNN.dat` file name
pub fn segment_id(path: &Path) -> Option<u32> {
    if path.extension().map(|e| e != "dat").unwrap_or(true) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix("segment_"))
        .and_then(|s| s.parse().ok())
}

fn field<const N: usize>(buf: &[u8], at: usize) -> StorageResult<[u8; N]> {
    buf.get(at..at + N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StorageError::Corruption(format!("Truncated field at byte {}", at)))
}

fn le_u16(buf: &[u8], at: usize) -> StorageResult<u16> {
    field(buf, at).map(u16::from_le_bytes)
}

fn le_u32(buf: &[u8], at: usize) -> StorageResult<u32> {
    field(buf, at).map(u32::from_le_bytes)
}

fn le_u64(buf: &[u8], at: usize) -> StorageResult<u64> {
    field(buf, at).map(u64::from_le_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::Point;
    use crate::storage::chunk::chunks_from_points;
    use tempfile::tempdir;

    fn sample_chunks() -> Vec<Chunk> {
        let points: Vec<Point> = (0..720).map(|i| Point::new(3600 + i * 10, i as f64)).collect();
        chunks_from_points(&points, 10, 1800, true).unwrap()
    }

    #[test]
    fn test_segment_header_roundtrip() {
        let mut header = SegmentHeader::new();
        header.record_count = 5;
        header.min_t0 = 1800;
        header.max_t0 = 9000;

        let restored = SegmentHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(restored, header);
    }

    #[test]
    fn test_corrupt_header_detected() {
        let mut bytes = SegmentHeader::new().to_bytes();
        bytes[7] ^= 0xff;
        assert!(matches!(
            SegmentHeader::from_bytes(&bytes),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment_000001.dat");
        let chunks = sample_chunks();

        {
            let mut writer = SegmentWriter::create(&path).unwrap();
            for chunk in &chunks {
                writer.put("1.a.b", chunk).unwrap();
            }
            writer.put("1.a.b_sum_600", &chunks[0]).unwrap();
            writer.finish().unwrap();
            assert!(writer.put("1.a.b", &chunks[0]).is_err());
        }

        let mut reader = SegmentReader::open(&path).unwrap();
        assert_eq!(reader.header.record_count as usize, chunks.len() + 1);
        assert_eq!(reader.header.min_t0, chunks[0].t0);
        assert_eq!(reader.header.max_t0, chunks.last().unwrap().t0);
        assert_eq!(reader.row_keys(), vec!["1.a.b", "1.a.b_sum_600"]);

        let row = reader.read_row("1.a.b").unwrap();
        assert_eq!(row, chunks);
        assert_eq!(row[0].points().unwrap(), chunks[0].points().unwrap());

        let (key, chunk) = reader.read_record(chunks.len()).unwrap();
        assert_eq!(key, "1.a.b_sum_600");
        assert_eq!(chunk, chunks[0]);
    }

    #[test]
    fn test_empty_segment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment_000001.dat");

        let mut writer = SegmentWriter::create(&path).unwrap();
        writer.finish().unwrap();

        let reader = SegmentReader::open(&path).unwrap();
        assert_eq!(reader.header.record_count, 0);
        assert!(reader.records.is_empty());
    }

    #[test]
    fn test_create_next_numbers_files() {
        let dir = tempdir().unwrap();

        let mut first = SegmentWriter::create_next(dir.path()).unwrap();
        first.finish().unwrap();
        let second = SegmentWriter::create_next(dir.path()).unwrap();

        assert_eq!(segment_id(first.path()), Some(1));
        assert_eq!(segment_id(second.path()), Some(2));
        assert_eq!(segment_id(Path::new("notes.txt")), None);
    }

    #[test]
    fn test_corrupt_record_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment_000001.dat");
        let chunks = sample_chunks();

        let mut writer = SegmentWriter::create(&path).unwrap();
        writer.put("m", &chunks[0]).unwrap();
        writer.finish().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 10] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let mut reader = SegmentReader::open(&path).unwrap();
        assert!(matches!(
            reader.read_record(0),
            Err(StorageError::Corruption(_))
        ));
    }
}
