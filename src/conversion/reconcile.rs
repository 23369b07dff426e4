//! Aggregation reconciler
//!
//! Turns the points of one source archive into one aligned series per
//! aggregation method that the destination retention stores.
//!
//! Phase is handled by the absolute grid: a sample's place inside a
//! destination period is `timestamp mod spp`, and every sample lands on the
//! closing boundary `ceil(timestamp / spp) * spp` of the period holding it.
//! The archive's byte offset and the rotation of its ring therefore never
//! influence the result.

use crate::conversion::error::{ConversionError, ConversionResult};
use crate::conversion::resample::{inc_resolution, reduce, windows};
use crate::conversion::types::{ArchiveInfo, Method, Point, Retention};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Per-method output of [`adjust_aggregation`]
pub type MethodSeries = BTreeMap<Method, Vec<Point>>;

/// Produce the aligned series for one archive feeding one retention level.
///
/// * Upsampling holds values flat and only yields `primary`; fabricated
///   samples cannot be split into honest sums and counts.
/// * Downsampling and direct copies yield `primary` for the raw level
///   (`retention_index == 0`). Rollup levels additionally get `sum` and `cnt`
///   reduced from the same windows.
pub fn adjust_aggregation(
    retention: &Retention,
    retention_index: usize,
    archive: &ArchiveInfo,
    primary: Method,
    points: &[Point],
) -> ConversionResult<MethodSeries> {
    let in_res = archive.seconds_per_point;
    let out_res = retention.seconds_per_point;
    if in_res == 0 || out_res == 0 {
        return Err(ConversionError::invalid(format!(
            "resolutions must be positive, got archive {}s and retention {}s",
            in_res, out_res
        )));
    }

    let mut series = MethodSeries::new();

    let buckets = match in_res.cmp(&out_res) {
        Ordering::Greater => {
            series.insert(primary, inc_resolution(points, in_res, out_res)?);
            return Ok(series);
        }
        Ordering::Less => windows(points, out_res, false)?,
        // Same resolution: every sample is its own window, so nothing is left incomplete.
        Ordering::Equal => windows(points, out_res, true)?,
    };

    let methods: &[Method] = if retention_index == 0 {
        &[primary]
    } else {
        &[primary, Method::Sum, Method::Count]
    };
    for &method in methods {
        series.insert(method, reduce(&buckets, method));
    }

    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Points as a legacy ring stores them: consecutive samples rotated by `offset` slots
    fn ring_points(
        ts: u32,
        interval: u32,
        value: f64,
        offset: usize,
        count: usize,
        inc: impl Fn(f64) -> f64,
    ) -> Vec<Point> {
        let mut out = vec![Point::new(0, 0.0); count];
        let (mut ts, mut value) = (ts, value);
        for i in 0..count {
            out[(i + offset) % count] = Point::new(ts, value);
            ts += interval;
            value = inc(value);
        }
        out
    }

    fn pts(raw: &[(u32, f64)]) -> Vec<Point> {
        raw.iter().map(|&(ts, v)| Point::new(ts, v)).collect()
    }

    #[test]
    fn test_upsampled_archive_broadcasts_primary() {
        let retention = Retention::new(10, 15);
        let archive = ArchiveInfo::new(5, 30, 5);
        let points = ring_points(3600, 30, 10.0, 3, 5, |v| v + 100.0);

        let expected: Vec<Point> = (0..15)
            .map(|i| Point::new(3600 + i * 10, 10.0 + 100.0 * f64::from(i / 3)))
            .collect();

        for retention_index in [0, 3] {
            let res =
                adjust_aggregation(&retention, retention_index, &archive, Method::Last, &points)
                    .unwrap();
            assert_eq!(res.len(), 1);
            assert_eq!(res[&Method::Last], expected);
        }
    }

    #[test]
    fn test_raw_level_keeps_primary_only() {
        let retention = Retention::new(30, 30);
        let archive = ArchiveInfo::new(3, 10, 14);
        let points = ring_points(3600, 10, 10.0, 3, 14, |v| v + 1.0);

        let res = adjust_aggregation(&retention, 0, &archive, Method::Average, &points).unwrap();

        assert_eq!(res.keys().copied().collect::<Vec<_>>(), vec![Method::Average]);
        assert_eq!(
            res[&Method::Average],
            pts(&[(3600, 10.0), (3630, 12.0), (3660, 15.0), (3690, 18.0), (3720, 21.0)])
        );
    }

    #[test]
    fn test_rollup_level_derives_sum_and_count() {
        let retention = Retention::new(30, 30);
        let archive = ArchiveInfo::new(3, 10, 12);
        let points = ring_points(3600, 10, 10.0, 3, 14, |v| v + 1.0);

        let res = adjust_aggregation(&retention, 1, &archive, Method::Average, &points).unwrap();

        assert_eq!(
            res[&Method::Sum],
            pts(&[(3600, 10.0), (3630, 36.0), (3660, 45.0), (3690, 54.0), (3720, 63.0)])
        );
        assert_eq!(
            res[&Method::Count],
            pts(&[(3600, 1.0), (3630, 3.0), (3660, 3.0), (3690, 3.0), (3720, 3.0)])
        );
        assert_eq!(
            res[&Method::Average],
            pts(&[(3600, 10.0), (3630, 12.0), (3660, 15.0), (3690, 18.0), (3720, 21.0)])
        );
    }

    #[test]
    fn test_rollup_with_sum_primary_collapses_keys() {
        let retention = Retention::new(20, 10);
        let archive = ArchiveInfo::new(0, 10, 10);
        let points = pts(&[(10, 1.0), (20, 2.0), (30, 3.0), (40, 4.0)]);

        let res = adjust_aggregation(&retention, 2, &archive, Method::Sum, &points).unwrap();
        assert_eq!(
            res.keys().copied().collect::<Vec<_>>(),
            vec![Method::Sum, Method::Count]
        );
        assert_eq!(res[&Method::Sum], pts(&[(20, 3.0), (40, 7.0)]));
    }

    #[test]
    fn test_direct_copy_realigns_phase() {
        let retention = Retention::new(60, 10);
        let archive = ArchiveInfo::new(0, 60, 10);
        // Written with a 15s phase shift against the destination grid
        let points = pts(&[(135, 1.0), (195, 2.0), (0, 0.0), (255, 3.0)]);

        let res = adjust_aggregation(&retention, 0, &archive, Method::Max, &points).unwrap();
        assert_eq!(res[&Method::Max], pts(&[(180, 1.0), (240, 2.0), (300, 3.0)]));

        let rollup = adjust_aggregation(&retention, 1, &archive, Method::Max, &points).unwrap();
        assert_eq!(rollup[&Method::Count], pts(&[(180, 1.0), (240, 1.0), (300, 1.0)]));
        assert_eq!(rollup[&Method::Sum], pts(&[(180, 1.0), (240, 2.0), (300, 3.0)]));
    }

    #[test]
    fn test_rejects_zero_resolution() {
        let res = adjust_aggregation(
            &Retention::new(0, 10),
            0,
            &ArchiveInfo::new(0, 10, 10),
            Method::Sum,
            &[],
        );
        assert!(matches!(res, Err(ConversionError::InvalidInput(_))));
    }
}
