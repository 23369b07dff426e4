//! Chunk packing and row addressing
//!
//! A chunk holds every point with a timestamp in `(t0 - span, t0]`, where
//! `t0` is a multiple of `span`. Chunks are cut from a sorted point stream;
//! the last chunk the stream touches may still grow on a later import and is
//! therefore "unfinished".

use crate::conversion::Point;
use crate::storage::compression::{decode_points, encode_points};
use crate::storage::error::{StorageError, StorageResult};

/// An encoded, epoch-aligned block of points
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Closing boundary of the chunk, a multiple of `span`
    pub t0: u32,
    /// Duration covered by the chunk, in seconds
    pub span: u32,
    /// Expected sample spacing the payload was encoded with
    pub interval: u32,
    /// Number of encoded points
    pub point_count: u32,
    /// Whether no later point can fall into this chunk's range
    pub finished: bool,
    data: Vec<u8>,
}

impl Chunk {
    /// Encode `points` (sorted, all inside the chunk's range) into a chunk
    pub fn encode(
        t0: u32,
        span: u32,
        interval: u32,
        points: &[Point],
        finished: bool,
    ) -> StorageResult<Self> {
        for point in points {
            if chunk_t0(point.timestamp, span)? != t0 {
                return Err(StorageError::InvalidChunk(format!(
                    "timestamp {} outside chunk {} (span {})",
                    point.timestamp, t0, span
                )));
            }
        }

        Ok(Self {
            t0,
            span,
            interval,
            point_count: points.len() as u32,
            finished,
            data: encode_points(points, interval)?,
        })
    }

    /// Rebuild a chunk from its stored parts
    pub fn from_parts(
        t0: u32,
        span: u32,
        interval: u32,
        point_count: u32,
        finished: bool,
        data: Vec<u8>,
    ) -> Self {
        Self {
            t0,
            span,
            interval,
            point_count,
            finished,
            data,
        }
    }

    /// Encoded payload
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Decode the chunk's points
    pub fn points(&self) -> StorageResult<Vec<Point>> {
        let points = decode_points(&self.data)?;
        if points.len() != self.point_count as usize {
            return Err(StorageError::Corruption(format!(
                "chunk {} holds {} points, header says {}",
                self.t0,
                points.len(),
                self.point_count
            )));
        }
        Ok(points)
    }
}

/// Chunk boundary holding `timestamp`: `ceil(timestamp / span) * span`.
///
/// Fails when `span` is zero or the boundary lies past the last `u32` second.
pub fn chunk_t0(timestamp: u32, span: u32) -> StorageResult<u32> {
    if span == 0 {
        return Err(StorageError::InvalidChunk("span must be positive".into()));
    }
    let span = u64::from(span);
    let t0 = u64::from(timestamp).div_ceil(span) * span;
    u32::try_from(t0).map_err(|_| {
        StorageError::InvalidChunk(format!(
            "chunk boundary {} for timestamp {} does not fit in u32",
            t0, timestamp
        ))
    })
}

/// Cut a sorted, gap-free point stream into chunks of `span` seconds.
///
/// Every chunk but the last is finished. The last one is kept only if
/// `include_unfinished` is set.
pub fn chunks_from_points(
    points: &[Point],
    interval: u32,
    span: u32,
    include_unfinished: bool,
) -> StorageResult<Vec<Chunk>> {
    if span == 0 {
        return Err(StorageError::InvalidChunk("span must be positive".into()));
    }

    let boundaries = points
        .iter()
        .map(|p| chunk_t0(p.timestamp, span))
        .collect::<StorageResult<Vec<u32>>>()?;

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < points.len() {
        let t0 = boundaries[start];
        let len = boundaries[start..].iter().take_while(|&&b| b == t0).count();
        let end = start + len;
        let finished = end < points.len();

        if finished || include_unfinished {
            chunks.push(Chunk::encode(t0, span, interval, &points[start..end], finished)?);
        }
        start = end;
    }

    Ok(chunks)
}

/// Storage row key for one series of a metric.
///
/// The raw series (aggregation index 0) is stored under the metric id itself;
/// rollups get `<metric-id>_<method>_<spp>`.
pub fn row_key(aggregation_index: usize, metric_id: &str, method: &str, spp: u32) -> String {
    if aggregation_index == 0 {
        metric_id.to_string()
    } else {
        format!("{}_{}_{}", metric_id, method, spp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn series(start: u32, interval: u32, count: u32) -> Vec<Point> {
        (0..count)
            .map(|i| Point::new(start + i * interval, 10.0 + f64::from(i)))
            .collect()
    }

    fn decoded(chunks: &[Chunk]) -> Vec<Point> {
        chunks.iter().flat_map(|c| c.points().unwrap()).collect()
    }

    #[test]
    fn test_row_key_raw_series() {
        assert_eq!(row_key(0, "aaa", "", 0), "aaa");
    }

    #[test]
    fn test_row_key_rollup() {
        assert_eq!(row_key(1, "aaa", "sum", 60), "aaa_sum_60");
    }

    #[test]
    fn test_row_keys_are_distinct() {
        let mut keys = HashSet::new();
        for idx in 1..3 {
            for method in ["sum", "cnt", "min", "max", "lst"] {
                for spp in [60, 600, 3600] {
                    keys.insert(row_key(idx, "1.some.metric", method, spp));
                }
            }
        }
        keys.insert(row_key(0, "1.some.metric", "sum", 60));
        // indexes 1 and 2 at the same method/spp address the same series
        assert_eq!(keys.len(), 5 * 3 + 1);
    }

    #[test]
    fn test_chunks_without_unfinished() {
        let points = series(25_200, 10, 8640);
        let chunks = chunks_from_points(&points, 10, 21_600, false).unwrap();

        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.finished));
        assert_eq!(
            chunks.iter().map(|c| c.t0).collect::<Vec<_>>(),
            vec![43_200, 64_800, 86_400, 108_000]
        );

        let restored = decoded(&chunks);
        assert_eq!(restored[..], points[..restored.len()]);
    }

    #[test]
    fn test_chunks_with_unfinished() {
        let points = series(25_200, 10, 8640);
        let chunks = chunks_from_points(&points, 10, 21_600, true).unwrap();

        assert_eq!(chunks.len(), 5);
        assert!(!chunks.last().unwrap().finished);
        assert_eq!(chunks.last().unwrap().t0, 129_600);
        assert_eq!(decoded(&chunks), points);
    }

    #[test]
    fn test_chunk_boundary_is_inclusive_at_t0() {
        let points = vec![Point::new(100, 1.0), Point::new(200, 2.0), Point::new(201, 3.0)];
        let chunks = chunks_from_points(&points, 1, 100, true).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].t0, 100);
        assert_eq!(chunks[1].t0, 200);
        assert_eq!(chunks[2].t0, 300);
        assert_eq!(chunk_t0(200, 100).unwrap(), 200);
        assert_eq!(chunk_t0(101, 100).unwrap(), 200);
        assert_eq!(chunk_t0(100, 100).unwrap(), 100);
    }

    #[test]
    fn test_interval_hint_does_not_change_bucketing() {
        let points = series(1000, 7, 500);
        let a = chunks_from_points(&points, 7, 600, true).unwrap();
        let b = chunks_from_points(&points, 60, 600, true).unwrap();

        assert_eq!(
            a.iter().map(|c| (c.t0, c.point_count)).collect::<Vec<_>>(),
            b.iter().map(|c| (c.t0, c.point_count)).collect::<Vec<_>>()
        );
        assert_eq!(decoded(&a), decoded(&b));
    }

    #[test]
    fn test_boundary_past_u32_range_is_an_error() {
        assert_eq!(chunk_t0(u32::MAX - 5, 1).unwrap(), u32::MAX - 5);
        assert!(matches!(
            chunk_t0(u32::MAX - 5, 21_600),
            Err(StorageError::InvalidChunk(_))
        ));
        assert!(matches!(
            chunks_from_points(&[Point::new(u32::MAX - 5, 1.0)], 10, 21_600, true),
            Err(StorageError::InvalidChunk(_))
        ));
    }

    #[test]
    fn test_empty_and_invalid_input() {
        assert!(chunks_from_points(&[], 10, 600, true).unwrap().is_empty());
        assert!(matches!(
            chunks_from_points(&series(10, 10, 3), 10, 0, true),
            Err(StorageError::InvalidChunk(_))
        ));
        assert!(Chunk::encode(600, 600, 10, &[Point::new(601, 1.0)], true).is_err());
    }
}
