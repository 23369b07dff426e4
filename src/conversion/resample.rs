//! Resampling between fixed resolutions
//!
//! Strategy:
//! 1. Drop gap sentinels and sort by timestamp (input order is not trusted)
//! 2. Upsampling holds each sample flat over the interval it represents
//! 3. Downsampling buckets samples into absolute windows `(k*res - res, k*res]`
//!    and reduces each window to one point stamped with its closing boundary
//!
//! Window boundaries depend only on absolute timestamps and the output
//! resolution, so archives whose resolution does not divide the target
//! resolution still bucket consistently.

use crate::conversion::error::{ConversionError, ConversionResult};
use crate::conversion::types::{Method, Point};

/// Samples that fall into one output window
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Window {
    /// Closing boundary, a multiple of the output resolution
    pub boundary: u32,
    /// Values in timestamp order
    pub values: Vec<f64>,
}

/// Smallest multiple of `res` not less than `ts`
pub(crate) fn ceil_to(ts: u64, res: u32) -> u64 {
    let res = u64::from(res);
    ts.div_ceil(res) * res
}

/// Drop gaps, sort by timestamp and collapse duplicate timestamps (newest input wins)
pub(crate) fn normalize(points: &[Point]) -> Vec<Point> {
    let mut sorted: Vec<Point> = points.iter().copied().filter(|p| !p.is_gap()).collect();
    sorted.sort_by_key(|p| p.timestamp);

    let mut out: Vec<Point> = Vec::with_capacity(sorted.len());
    for point in sorted {
        match out.last_mut() {
            Some(last) if last.timestamp == point.timestamp => *last = point,
            _ => out.push(point),
        }
    }
    out
}

/// Group points into `(k*res - res, k*res]` windows.
///
/// A window is complete once its boundary sample was seen or a later sample
/// opened the next window. With `keep_trailing` unset the last window is
/// dropped unless it is complete.
pub(crate) fn windows(
    points: &[Point],
    res: u32,
    keep_trailing: bool,
) -> ConversionResult<Vec<Window>> {
    let mut out = Vec::new();
    let mut current: Option<Window> = None;

    for point in normalize(points) {
        let boundary = u32::try_from(ceil_to(u64::from(point.timestamp), res)).map_err(|_| {
            ConversionError::invalid(format!(
                "window boundary for timestamp {} at {}s does not fit in u32",
                point.timestamp, res
            ))
        })?;

        match current.as_mut() {
            Some(window) if window.boundary == boundary => window.values.push(point.value),
            _ => {
                out.extend(current.take());
                current = Some(Window {
                    boundary,
                    values: vec![point.value],
                });
            }
        }

        if point.timestamp == boundary {
            out.extend(current.take());
        }
    }

    if keep_trailing {
        out.extend(current);
    }
    Ok(out)
}

/// Reduce each window with `method`
pub(crate) fn reduce(windows: &[Window], method: Method) -> Vec<Point> {
    windows
        .iter()
        .filter_map(|w| method.aggregate(&w.values).map(|v| Point::new(w.boundary, v)))
        .collect()
}

fn check_resolutions(in_res: u32, out_res: u32) -> ConversionResult<()> {
    if in_res == 0 || out_res == 0 {
        return Err(ConversionError::invalid(format!(
            "resolutions must be positive, got {}s -> {}s",
            in_res, out_res
        )));
    }
    if in_res == out_res {
        return Err(ConversionError::invalid(format!(
            "input and output resolution are both {}s",
            in_res
        )));
    }
    Ok(())
}

/// Upsample `points` from `in_res` to the finer `out_res`.
///
/// Every sample is held constant over `[ts, ts + in_res)` and emitted on each
/// multiple of `out_res` inside it, stopping early if the next sample starts
/// sooner. When `out_res` does not divide `in_res` the number of points per
/// sample varies, but because the grid is absolute the long-run rate is exactly
/// `in_res / out_res`.
pub fn inc_resolution(points: &[Point], in_res: u32, out_res: u32) -> ConversionResult<Vec<Point>> {
    check_resolutions(in_res, out_res)?;
    if out_res > in_res {
        return Err(ConversionError::invalid(format!(
            "cannot upsample from {}s to coarser {}s",
            in_res, out_res
        )));
    }

    let sorted = normalize(points);
    let per_sample = (in_res / out_res + 1) as usize;
    let mut out = Vec::with_capacity(sorted.len() * per_sample);

    for (idx, point) in sorted.iter().enumerate() {
        let start = u64::from(point.timestamp);
        let mut end = (start + u64::from(in_res)).min(u64::from(u32::MAX) + 1);
        if let Some(next) = sorted.get(idx + 1) {
            end = end.min(u64::from(next.timestamp));
        }

        let mut ts = ceil_to(start, out_res);
        while ts < end {
            out.push(Point::new(ts as u32, point.value));
            ts += u64::from(out_res);
        }
    }

    Ok(out)
}

/// Downsample `points` from `in_res` to the coarser `out_res` using `method`.
///
/// Only complete windows are emitted; see [`windows`].
pub fn dec_resolution(
    points: &[Point],
    method: Method,
    in_res: u32,
    out_res: u32,
) -> ConversionResult<Vec<Point>> {
    check_resolutions(in_res, out_res)?;
    if out_res < in_res {
        return Err(ConversionError::invalid(format!(
            "cannot downsample from {}s to finer {}s",
            in_res, out_res
        )));
    }

    Ok(reduce(&windows(points, out_res, false)?, method))
}
