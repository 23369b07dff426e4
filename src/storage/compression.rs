//! Chunk payload codec
//!
//! Implements delta encoding + LZ4 compression for chunk payloads.
//!
//! Strategy:
//! 1. Store the first timestamp verbatim
//! 2. Store every later timestamp as its delta minus the expected interval,
//!    so a regularly spaced series becomes a run of zeros
//! 3. Store values as-is
//! 4. Serialize to compact binary format
//! 5. LZ4 compress the result

use crate::conversion::Point;
use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};

/// Intermediate format for delta-encoded chunk points
#[derive(Debug, Serialize, Deserialize)]
struct EncodedPoints {
    /// First point's timestamp
    base_timestamp: u32,
    /// Expected spacing between samples
    interval: u32,
    /// For each later point: (ts - previous ts) - interval
    timestamp_jitter: Vec<i64>,
    values: Vec<f64>,
}

/// Encode points, which must already be sorted by timestamp.
///
/// `interval` is the expected sample spacing; any spacing decodes correctly,
/// it only affects how well the payload compresses.
pub fn encode_points(points: &[Point], interval: u32) -> StorageResult<Vec<u8>> {
    let Some(first) = points.first() else {
        return Ok(Vec::new());
    };

    let mut timestamp_jitter = Vec::with_capacity(points.len().saturating_sub(1));
    for pair in points.windows(2) {
        let delta = i64::from(pair[1].timestamp) - i64::from(pair[0].timestamp);
        if delta <= 0 {
            return Err(StorageError::Serialization(format!(
                "points not strictly ascending at timestamp {}",
                pair[1].timestamp
            )));
        }
        timestamp_jitter.push(delta - i64::from(interval));
    }

    let encoded = EncodedPoints {
        base_timestamp: first.timestamp,
        interval,
        timestamp_jitter,
        values: points.iter().map(|p| p.value).collect(),
    };

    let serialized = bincode::serialize(&encoded)?;

    Ok(lz4_flex::compress_prepend_size(&serialized))
}

/// Decode a payload produced by [`encode_points`]
pub fn decode_points(data: &[u8]) -> StorageResult<Vec<Point>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| StorageError::Compression(format!("LZ4 decompression failed: {}", e)))?;

    let encoded: EncodedPoints = bincode::deserialize(&decompressed)?;

    if encoded.values.len() != encoded.timestamp_jitter.len() + 1 {
        return Err(StorageError::Corruption(format!(
            "{} values for {} timestamps",
            encoded.values.len(),
            encoded.timestamp_jitter.len() + 1
        )));
    }

    let mut points = Vec::with_capacity(encoded.values.len());
    let mut timestamp = i64::from(encoded.base_timestamp);

    for (i, value) in encoded.values.into_iter().enumerate() {
        if i > 0 {
            timestamp += encoded.timestamp_jitter[i - 1] + i64::from(encoded.interval);
        }
        let ts = u32::try_from(timestamp)
            .map_err(|_| StorageError::Corruption(format!("timestamp {} out of range", timestamp)))?;
        points.push(Point::new(ts, value));
    }

    Ok(points)
}
