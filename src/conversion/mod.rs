//! Conversion core
//!
//! Pure, synchronous transforms that turn legacy archive points into
//! destination-resolution series:
//!
//! - **planner**: which archive feeds which slice of a retention's history
//! - **resample**: flat upsampling and windowed downsampling
//! - **reconcile**: per-method series aligned to the destination grid
//! - **types**: points, archive descriptors, retentions, methods
//! - **error**: error types
//!
//! # Data flow
//!
//! ```text
//!   archives ─▶ plan ─▶ per segment: adjust_aggregation ─▶ {method: points}
//!                                     ├─ inc_resolution (coarser source)
//!                                     └─ windows + reduce (finer / equal source)
//! ```

pub mod error;
pub mod planner;
pub mod reconcile;
pub mod resample;
pub mod types;

pub use error::{ConversionError, ConversionResult};
pub use planner::{plan, Conversion, PlanSegment};
pub use reconcile::{adjust_aggregation, MethodSeries};
pub use resample::{dec_resolution, inc_resolution};
pub use types::{ArchiveInfo, Method, Point, Retention};
