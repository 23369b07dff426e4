//! Retention planner
//!
//! Decides which archive of a legacy file feeds which slice of a destination
//! retention's history. Genuine samples are always preferred: finer archives
//! are downsampled (or copied) for the recent history they hold, and only the
//! remainder that no fine archive reaches is filled by upsampling the first
//! archive long enough to cover the request.

use crate::conversion::error::{ConversionError, ConversionResult};
use crate::conversion::types::ArchiveInfo;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Resampling direction for one plan segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Conversion {
    /// Source is finer than the target; aggregate
    Downsample,
    /// Same resolution; copy
    Direct,
    /// Source is coarser than the target; hold values flat
    Upsample,
}

impl Conversion {
    fn between(source_spp: u32, target_spp: u32) -> Self {
        match source_spp.cmp(&target_spp) {
            Ordering::Less => Conversion::Downsample,
            Ordering::Equal => Conversion::Direct,
            Ordering::Greater => Conversion::Upsample,
        }
    }

    /// Signed form: -1 downsample, 0 direct, +1 upsample
    pub fn as_i8(&self) -> i8 {
        match self {
            Conversion::Downsample => -1,
            Conversion::Direct => 0,
            Conversion::Upsample => 1,
        }
    }
}

impl fmt::Display for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+}", self.as_i8())
    }
}

/// One step of a conversion plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanSegment {
    /// Index of the source archive
    pub archive: usize,
    /// History covered by this segment and all segments before it, in seconds back from now
    pub time_range: u64,
    pub conversion: Conversion,
}

impl PlanSegment {
    fn new(archive: usize, time_range: u64, conversion: Conversion) -> Self {
        Self {
            archive,
            time_range,
            conversion,
        }
    }
}

/// Build the conversion plan for one destination retention.
///
/// `archives` must be ordered finest to coarsest. The returned segments are
/// ordered most recent history first.
pub fn plan(
    target_spp: u32,
    target_points: u32,
    archives: &[ArchiveInfo],
) -> ConversionResult<Vec<PlanSegment>> {
    validate(target_spp, target_points, archives)?;

    let total = u64::from(target_spp) * u64::from(target_points);

    // No archive reaching back far enough means we import less than asked for.
    let anchor = archives
        .iter()
        .position(|a| a.native_range() >= total)
        .unwrap_or(archives.len() - 1);
    let covered = |idx: usize| archives[idx].native_range().min(total);

    match Conversion::between(archives[anchor].seconds_per_point, target_spp) {
        Conversion::Direct => Ok(vec![PlanSegment::new(
            anchor,
            covered(anchor),
            Conversion::Direct,
        )]),
        Conversion::Downsample => {
            // The anchor already covers everything without fabricating data,
            // but an exact-resolution archive behind it is an even better source.
            let source = archives[anchor..]
                .iter()
                .position(|a| a.seconds_per_point == target_spp && a.native_range() >= total)
                .map(|offset| anchor + offset)
                .unwrap_or(anchor);
            Ok(vec![PlanSegment::new(
                source,
                covered(source),
                Conversion::between(archives[source].seconds_per_point, target_spp),
            )])
        }
        Conversion::Upsample => {
            let mut segments: Vec<PlanSegment> = (0..anchor)
                .map(|idx| {
                    PlanSegment::new(
                        idx,
                        covered(idx),
                        Conversion::between(archives[idx].seconds_per_point, target_spp),
                    )
                })
                .collect();
            segments.push(PlanSegment::new(anchor, covered(anchor), Conversion::Upsample));
            Ok(segments)
        }
    }
}

fn validate(target_spp: u32, target_points: u32, archives: &[ArchiveInfo]) -> ConversionResult<()> {
    if target_spp == 0 || target_points == 0 {
        return Err(ConversionError::invalid(format!(
            "retention must be positive, got {}s x {}",
            target_spp, target_points
        )));
    }
    if archives.is_empty() {
        return Err(ConversionError::invalid("no source archives"));
    }
    if let Some(idx) = archives
        .iter()
        .position(|a| a.seconds_per_point == 0 || a.points == 0)
    {
        return Err(ConversionError::invalid(format!(
            "archive {} has an empty resolution or capacity",
            idx
        )));
    }
    if let Some(idx) = archives
        .windows(2)
        .position(|pair| pair[0].seconds_per_point > pair[1].seconds_per_point)
    {
        return Err(ConversionError::invalid(format!(
            "archives must be ordered finest to coarsest (archive {} is coarser than archive {})",
            idx,
            idx + 1
        )));
    }
    Ok(())
}
