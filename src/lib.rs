//! # tsmigrate
//!
//! Migrates metrics out of legacy fixed-ring multi-archive files (whisper)
//! into chunked rollup storage.
//!
//! ## Modules
//!
//! - [`conversion`]: planner, resampler and aggregation reconciler
//! - [`storage`]: chunk packing, payload codec, segment files
//! - [`whisper`]: memory-mapped legacy file reader
//! - [`import`]: per-metric pipeline and the concurrent directory import
//! - [`index_rules`]: prefix rules deciding index pruning
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tsmigrate::config::RetentionConfig;
//! use tsmigrate::import::Importer;
//! use tsmigrate::storage::{ChunkStore, SegmentWriter};
//! use tsmigrate::whisper::WhisperFile;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let importer = Importer::new(
//!         vec![
//!             RetentionConfig::new(10, 8640, 3600),
//!             RetentionConfig::new(600, 4320, 86_400),
//!         ],
//!         1_700_000_000,
//!     );
//!
//!     let source = WhisperFile::open("/var/lib/graphite/whisper/servers/web1/load.wsp")?;
//!     let mut store = SegmentWriter::create_next("./tsmigrate_data")?;
//!
//!     let stats = importer.import_metric("servers.web1.load", &source, &mut store)?;
//!     store.finish()?;
//!
//!     println!("{}", stats);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod conversion;
pub mod import;
pub mod index_rules;
pub mod storage;
pub mod whisper;

pub use config::{Config, ConfigError, RetentionConfig};

pub use conversion::{
    adjust_aggregation, dec_resolution, inc_resolution, plan, ArchiveInfo, Conversion,
    ConversionError, ConversionResult, Method, MethodSeries, PlanSegment, Point, Retention,
};

pub use storage::{
    chunks_from_points, row_key, Chunk, ChunkStore, MemoryStore, SegmentReader, SegmentWriter,
    StorageError, StorageResult,
};

pub use import::{run_import, ArchiveSource, ImportStats, Importer};

pub use index_rules::{IndexCheck, IndexRule, IndexRules, IndexRulesError};

pub use whisper::{WhisperBuilder, WhisperFile};
