//! Import pipeline
//!
//! Drives one legacy file at a time through the conversion core:
//!
//! ```text
//! ArchiveSource ─▶ plan (per retention) ─▶ adjust_aggregation (per segment)
//!              ─▶ window filter ─▶ sort ─▶ chunks_from_points ─▶ ChunkStore
//! ```
//!
//! Metrics are independent, so [`run_import`] converts many files in parallel
//! and only serialises on the store.

use crate::config::{Config, ConfigError, RetentionConfig};
use crate::conversion::{adjust_aggregation, plan, ArchiveInfo, Method, MethodSeries, Point};
use crate::storage::{chunks_from_points, row_key, Chunk, ChunkStore, StorageResult};
use crate::whisper::WhisperFile;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

const WHISPER_EXTENSION: &str = "wsp";

/// A legacy multi-archive file, or anything shaped like one
pub trait ArchiveSource {
    /// Aggregation the file's rollup archives were built with
    fn aggregation_method(&self) -> Method;

    /// Archive descriptors, finest to coarsest
    fn archives(&self) -> &[ArchiveInfo];

    /// Raw ring contents of one archive, gaps included
    fn read_archive(&self, index: usize) -> StorageResult<Vec<Point>>;
}

/// Counters for one or many imported metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub metrics: usize,
    pub rows: usize,
    pub chunks: usize,
    pub points: usize,
    /// Retentions the source could not fill back to their full range
    pub truncated_retentions: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ImportStats {
    pub fn merge(&mut self, other: &ImportStats) {
        self.metrics += other.metrics;
        self.rows += other.rows;
        self.chunks += other.chunks;
        self.points += other.points;
        self.truncated_retentions += other.truncated_retentions;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

impl fmt::Display for ImportStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} metrics, {} rows, {} chunks, {} points ({} truncated retentions, {} skipped, {} failed)",
            self.metrics,
            self.rows,
            self.chunks,
            self.points,
            self.truncated_retentions,
            self.skipped,
            self.failed
        )
    }
}

/// Every chunk produced for one metric, ready to store
#[derive(Debug, Clone)]
pub struct MetricChunks {
    pub metric_id: String,
    pub rows: Vec<(String, Chunk)>,
    pub stats: ImportStats,
}

/// Converts legacy archives into chunks for a fixed set of retentions
#[derive(Debug, Clone)]
pub struct Importer {
    retentions: Vec<RetentionConfig>,
    write_unfinished_chunks: bool,
    org_id: u32,
    now: u32,
    name_prefix: String,
    name_filter: Option<Regex>,
}

impl Importer {
    /// Importer for `retentions` (finest first) anchored at `now`
    pub fn new(retentions: Vec<RetentionConfig>, now: u32) -> Self {
        Self {
            retentions,
            write_unfinished_chunks: false,
            org_id: 1,
            now,
            name_prefix: String::new(),
            name_filter: None,
        }
    }

    /// Build from a validated configuration; `now` defaults to the wall clock
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let now = config
            .import
            .now
            .unwrap_or_else(|| u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX));

        let mut importer = Self::new(config.retentions.clone(), now)
            .write_unfinished_chunks(config.import.write_unfinished_chunks)
            .org_id(config.import.org_id)
            .name_prefix(config.import.name_prefix.clone());

        if !config.import.name_filter.is_empty() {
            let filter = Regex::new(&config.import.name_filter)
                .map_err(|e| ConfigError::Invalid(format!("name filter: {}", e)))?;
            importer = importer.name_filter(filter);
        }

        Ok(importer)
    }

    pub fn write_unfinished_chunks(mut self, write: bool) -> Self {
        self.write_unfinished_chunks = write;
        self
    }

    pub fn org_id(mut self, org_id: u32) -> Self {
        self.org_id = org_id;
        self
    }

    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn name_filter(mut self, filter: Regex) -> Self {
        self.name_filter = Some(filter);
        self
    }

    pub fn now(&self) -> u32 {
        self.now
    }

    pub fn retentions(&self) -> &[RetentionConfig] {
        &self.retentions
    }

    /// Storage id of a metric: `<org>.<name>`
    pub fn metric_id(&self, name: &str) -> String {
        format!("{}.{}", self.org_id, name)
    }

    /// Whether `name` passes the name filter
    pub fn accepts(&self, name: &str) -> bool {
        self.name_filter
            .as_ref()
            .map_or(true, |filter| filter.is_match(name))
    }

    /// Convert one metric into stored rows without writing them anywhere
    pub fn convert_metric(
        &self,
        name: &str,
        source: &dyn ArchiveSource,
    ) -> StorageResult<MetricChunks> {
        let metric_id = self.metric_id(name);
        let primary = source.aggregation_method();
        let archives = source.archives();
        let now = u64::from(self.now);

        let mut stats = ImportStats {
            metrics: 1,
            ..Default::default()
        };
        let mut rows = Vec::new();
        let mut cache: Vec<Option<Vec<Point>>> = vec![None; archives.len()];

        for (ret_idx, ret_cfg) in self.retentions.iter().enumerate() {
            let retention = ret_cfg.retention();
            let segments = plan(
                retention.seconds_per_point,
                retention.number_of_points,
                archives,
            )?;

            let mut series = MethodSeries::new();
            let mut newer_than: u64 = 0;

            for segment in &segments {
                if segment.time_range <= newer_than {
                    continue;
                }
                let archive = &archives[segment.archive];
                if cache[segment.archive].is_none() {
                    cache[segment.archive] = Some(source.read_archive(segment.archive)?);
                }
                let raw = cache[segment.archive].as_deref().unwrap_or_default();

                let oldest = now.saturating_sub(segment.time_range);
                let newest = now.saturating_sub(newer_than);

                let reconciled = adjust_aggregation(&retention, ret_idx, archive, primary, raw)?;
                for (method, points) in reconciled {
                    series.entry(method).or_default().extend(
                        points.into_iter().filter(|p| {
                            let ts = u64::from(p.timestamp);
                            ts > oldest && ts <= newest
                        }),
                    );
                }

                tracing::trace!(
                    metric = %metric_id,
                    retention = ret_idx,
                    archive = segment.archive,
                    conversion = %segment.conversion,
                    oldest,
                    newest,
                    "applied plan segment"
                );
                newer_than = segment.time_range;
            }

            if newer_than < retention.total_range() {
                stats.truncated_retentions += 1;
                tracing::debug!(
                    "{}: archives cover {}s of the {}s retention {}",
                    metric_id,
                    newer_than,
                    retention.total_range(),
                    ret_idx
                );
            }

            for (method, mut points) in series {
                points.sort_by_key(|p| p.timestamp);
                points.dedup_by_key(|p| p.timestamp);

                let chunks = chunks_from_points(
                    &points,
                    ret_cfg.seconds_per_point,
                    ret_cfg.chunk_span,
                    self.write_unfinished_chunks,
                )?;
                if chunks.is_empty() {
                    continue;
                }

                let key = row_key(
                    ret_idx,
                    &metric_id,
                    method.as_str(),
                    ret_cfg.seconds_per_point,
                );
                stats.rows += 1;
                stats.chunks += chunks.len();
                stats.points += chunks.iter().map(|c| c.point_count as usize).sum::<usize>();
                rows.extend(chunks.into_iter().map(|chunk| (key.clone(), chunk)));
            }
        }

        Ok(MetricChunks {
            metric_id,
            rows,
            stats,
        })
    }

    /// Convert one metric and hand every chunk to `store`
    pub fn import_metric<S: ChunkStore + ?Sized>(
        &self,
        name: &str,
        source: &dyn ArchiveSource,
        store: &mut S,
    ) -> StorageResult<ImportStats> {
        let converted = self.convert_metric(name, source)?;
        for (key, chunk) in &converted.rows {
            store.put(key, chunk)?;
        }

        tracing::debug!(
            "Imported {} as {} ({} chunks)",
            name,
            converted.metric_id,
            converted.stats.chunks
        );
        Ok(converted.stats)
    }
}

/// Metric name for a file below `root`: `a/b/c.wsp` becomes `<prefix>a.b.c`
pub fn metric_name_for(path: &Path, root: &Path, prefix: &str) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let relative = if relative.extension().and_then(|e| e.to_str()) == Some(WHISPER_EXTENSION) {
        relative.with_extension("")
    } else {
        relative.to_path_buf()
    };

    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        return None;
    }

    Some(format!("{}{}", prefix, parts.join(".")))
}

/// All whisper files below `root`, sorted
pub fn find_whisper_files(root: &Path) -> StorageResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some(WHISPER_EXTENSION) {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Import every whisper file below `root` into `store`.
///
/// Files are converted on the blocking pool, at most `concurrency` at a time.
/// A file that fails to parse or convert is logged and counted, not fatal.
pub async fn run_import<S>(
    importer: Arc<Importer>,
    root: &Path,
    store: Arc<Mutex<S>>,
    concurrency: usize,
) -> StorageResult<ImportStats>
where
    S: ChunkStore + 'static,
{
    let result = import_files(importer, root, store.clone(), concurrency).await;
    // An unfinished segment has no footer and cannot be read back.
    let finished = store.lock().await.finish();

    let stats = result?;
    finished?;

    tracing::info!("Import complete: {}", stats);
    Ok(stats)
}

async fn import_files<S>(
    importer: Arc<Importer>,
    root: &Path,
    store: Arc<Mutex<S>>,
    concurrency: usize,
) -> StorageResult<ImportStats>
where
    S: ChunkStore + 'static,
{
    let files = find_whisper_files(root)?;
    tracing::info!("Found {} whisper files under {:?}", files.len(), root);

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut stats = ImportStats::default();

    for path in files {
        let Some(name) = metric_name_for(&path, root, &importer.name_prefix) else {
            tracing::warn!("Skipping {:?}: not a valid metric path", path);
            stats.skipped += 1;
            continue;
        };
        if !importer.accepts(&name) {
            stats.skipped += 1;
            continue;
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::error!("Stopping import before {:?}: {}", path, e);
                break;
            }
        };
        let importer = importer.clone();
        let store = store.clone();

        tasks.spawn_blocking(move || {
            let _permit = permit;
            let result = WhisperFile::open(&path).and_then(|file| {
                let converted = importer.convert_metric(&name, &file)?;
                let mut store = store.blocking_lock();
                for (key, chunk) in &converted.rows {
                    store.put(key, chunk)?;
                }
                Ok(converted.stats)
            });
            (path, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(metric_stats))) => stats.merge(&metric_stats),
            Ok((path, Err(e))) => {
                tracing::error!("Failed to import {:?}: {}", path, e);
                stats.failed += 1;
            }
            Err(e) => {
                tracing::error!("Import task did not complete: {}", e);
                stats.failed += 1;
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, SegmentReader, SegmentWriter};
    use crate::whisper::WhisperBuilder;
    use tempfile::tempdir;

    const DAY: u32 = 86_400;
    const NOW: u32 = 10 * DAY;

    struct FixedSource {
        method: Method,
        archives: Vec<ArchiveInfo>,
        data: Vec<Vec<Point>>,
    }

    impl ArchiveSource for FixedSource {
        fn aggregation_method(&self) -> Method {
            self.method
        }

        fn archives(&self) -> &[ArchiveInfo] {
            &self.archives
        }

        fn read_archive(&self, index: usize) -> StorageResult<Vec<Point>> {
            Ok(self.data[index].clone())
        }
    }

    /// One day of minutely samples ending at `NOW`, valued 0, 1, 2, ...
    fn minutely_day() -> FixedSource {
        let points = (0..1440u32)
            .map(|i| Point::new(NOW - DAY + 60 * (i + 1), f64::from(i)))
            .collect();
        FixedSource {
            method: Method::Average,
            archives: vec![ArchiveInfo::new(0, 60, 1440)],
            data: vec![points],
        }
    }

    fn decode_row(store: &MemoryStore, key: &str) -> Vec<Point> {
        store
            .row(key)
            .iter()
            .flat_map(|chunk| chunk.points().unwrap())
            .collect()
    }

    #[test]
    fn test_import_raw_and_rollup_rows() {
        let importer = Importer::new(
            vec![
                RetentionConfig::new(60, 1440, 21_600),
                RetentionConfig::new(600, 144, 21_600),
            ],
            NOW,
        );
        let mut store = MemoryStore::new();
        let stats = importer
            .import_metric("web.hits", &minutely_day(), &mut store)
            .unwrap();

        assert_eq!(
            store.row_keys().collect::<Vec<_>>(),
            vec![
                "1.web.hits",
                "1.web.hits_avg_600",
                "1.web.hits_cnt_600",
                "1.web.hits_sum_600"
            ]
        );

        // Four 6h chunks per row, the newest one unfinished and left out.
        assert_eq!(store.row("1.web.hits").len(), 3);
        let raw = decode_row(&store, "1.web.hits");
        assert_eq!(raw.len(), 1080);
        assert_eq!(raw[0], Point::new(NOW - DAY + 60, 0.0));

        let avg = decode_row(&store, "1.web.hits_avg_600");
        let sum = decode_row(&store, "1.web.hits_sum_600");
        let cnt = decode_row(&store, "1.web.hits_cnt_600");
        assert_eq!(avg.len(), 108);
        assert_eq!(avg[0], Point::new(NOW - DAY + 600, 4.5));
        assert_eq!(sum[0], Point::new(NOW - DAY + 600, 45.0));
        assert!(cnt.iter().all(|p| p.value == 10.0));

        assert_eq!(stats.metrics, 1);
        assert_eq!(stats.rows, 4);
        assert_eq!(stats.chunks, 12);
        assert_eq!(stats.points, 1080 + 3 * 108);
        assert_eq!(stats.truncated_retentions, 0);
    }

    #[test]
    fn test_unfinished_chunks_and_org_id() {
        let importer = Importer::new(vec![RetentionConfig::new(60, 1440, 21_600)], NOW)
            .write_unfinished_chunks(true)
            .org_id(7);
        let mut store = MemoryStore::new();
        importer
            .import_metric("web.hits", &minutely_day(), &mut store)
            .unwrap();

        let chunks = store.row("7.web.hits");
        assert_eq!(chunks.len(), 4);
        assert!(!chunks[3].finished);
        assert_eq!(chunks[3].t0, NOW);
        assert_eq!(decode_row(&store, "7.web.hits").len(), 1440);
    }

    #[test]
    fn test_short_source_truncates_retention() {
        let importer = Importer::new(vec![RetentionConfig::new(60, 2880, 21_600)], NOW)
            .write_unfinished_chunks(true);
        let converted = importer.convert_metric("m", &minutely_day()).unwrap();

        assert_eq!(converted.stats.truncated_retentions, 1);
        assert_eq!(converted.stats.points, 1440);
    }

    #[test]
    fn test_points_outside_the_retention_window_are_dropped() {
        // Half a day of retention over a full day of data.
        let importer = Importer::new(vec![RetentionConfig::new(60, 720, 21_600)], NOW)
            .write_unfinished_chunks(true);
        let converted = importer.convert_metric("m", &minutely_day()).unwrap();

        let points: Vec<Point> = converted
            .rows
            .iter()
            .flat_map(|(_, chunk)| chunk.points().unwrap())
            .collect();
        assert_eq!(points.len(), 720);
        assert!(points.iter().all(|p| p.timestamp > NOW - DAY / 2));
    }

    #[test]
    fn test_fine_archive_preferred_over_upsampled_history() {
        let fine: Vec<Point> = (0..360u32).map(|i| Point::new(NOW - 3590 + 10 * i, 1.0)).collect();
        let coarse: Vec<Point> = (0..1440u32)
            .map(|i| Point::new(NOW - DAY + 60 * (i + 1), 100.0))
            .collect();
        let image = WhisperBuilder::new(Method::Last)
            .archive(10, 360, &fine)
            .archive(60, 1440, &coarse)
            .build();
        let file = WhisperFile::from_bytes(image).unwrap();

        let importer = Importer::new(vec![RetentionConfig::new(10, 8640, 21_600)], NOW)
            .write_unfinished_chunks(true);
        let mut store = MemoryStore::new();
        importer.import_metric("disk.used", &file, &mut store).unwrap();

        let points = decode_row(&store, "1.disk.used");
        assert!(points.windows(2).all(|w| w[1].timestamp - w[0].timestamp == 10));
        assert_eq!(points.first().map(|p| p.timestamp), Some(NOW - DAY + 60));
        assert_eq!(points.last().map(|p| p.timestamp), Some(NOW));
        for p in &points {
            let expected = if p.timestamp > NOW - 3600 { 1.0 } else { 100.0 };
            assert_eq!(p.value, expected, "at {}", p.timestamp);
        }
    }

    #[test]
    fn test_metric_names_from_paths() {
        let root = Path::new("/data/whisper");
        assert_eq!(
            metric_name_for(Path::new("/data/whisper/a/b/c.wsp"), root, ""),
            Some("a.b.c".to_string())
        );
        assert_eq!(
            metric_name_for(Path::new("/data/whisper/cpu.wsp"), root, "legacy."),
            Some("legacy.cpu".to_string())
        );
        assert_eq!(metric_name_for(Path::new("/elsewhere/x.wsp"), root, ""), None);
        assert_eq!(metric_name_for(root, root, ""), None);
    }

    #[test]
    fn test_name_filter() {
        let importer = Importer::new(vec![RetentionConfig::new(60, 60, 3600)], NOW)
            .name_filter(Regex::new(r"^servers\.").unwrap());
        assert!(importer.accepts("servers.web1.load"));
        assert!(!importer.accepts("apps.web1.load"));
        assert!(Importer::new(Vec::new(), NOW).accepts("anything"));
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.import.now = Some(NOW);
        config.import.org_id = 3;
        config.import.name_filter = "^keep".to_string();
        let importer = Importer::from_config(&config).unwrap();

        assert_eq!(importer.now(), NOW);
        assert_eq!(importer.metric_id("keep.me"), "3.keep.me");
        assert!(!importer.accepts("drop.me"));
        assert_eq!(importer.retentions().len(), 3);

        config.retentions.clear();
        assert!(Importer::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_run_import_directory() {
        let dir = tempdir().unwrap();
        let points: Vec<Point> = (0..60u32).map(|i| Point::new(NOW - 3600 + 60 * (i + 1), 2.0)).collect();
        let image = WhisperBuilder::new(Method::Sum).archive(60, 60, &points).build();

        std::fs::create_dir_all(dir.path().join("servers/web1")).unwrap();
        std::fs::write(dir.path().join("servers/web1/load.wsp"), &image).unwrap();
        std::fs::write(dir.path().join("servers/web1/mem.wsp"), &image).unwrap();
        std::fs::write(dir.path().join("servers/broken.wsp"), b"nope").unwrap();
        std::fs::write(dir.path().join("apps.wsp"), &image).unwrap();
        std::fs::write(dir.path().join("README"), b"not a metric").unwrap();

        assert_eq!(find_whisper_files(dir.path()).unwrap().len(), 4);

        let importer = Importer::new(vec![RetentionConfig::new(60, 60, 600)], NOW)
            .name_filter(Regex::new(r"^servers\.").unwrap());
        let store = Arc::new(Mutex::new(MemoryStore::new()));
        let stats = run_import(Arc::new(importer), dir.path(), store.clone(), 2)
            .await
            .unwrap();

        assert_eq!(stats.metrics, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 1);

        let store = store.lock().await;
        assert_eq!(
            store.row_keys().collect::<Vec<_>>(),
            vec!["1.servers.web1.load", "1.servers.web1.mem"]
        );
        // Six 10-minute chunks, the last one unfinished.
        assert_eq!(store.row("1.servers.web1.load").len(), 5);
    }

    /// Segment store whose writes for one metric blow up
    struct FaultyStore {
        writer: SegmentWriter,
        poisoned: &'static str,
    }

    impl ChunkStore for FaultyStore {
        fn put(&mut self, row_key: &str, chunk: &Chunk) -> StorageResult<()> {
            if row_key.contains(self.poisoned) {
                panic!("write to {} failed hard", row_key);
            }
            self.writer.put(row_key, chunk)
        }

        fn finish(&mut self) -> StorageResult<()> {
            self.writer.finish()
        }
    }

    #[tokio::test]
    async fn test_panicking_task_still_finishes_segment() {
        let dir = tempdir().unwrap();
        let whisper_dir = dir.path().join("whisper");
        let points: Vec<Point> = (0..60u32).map(|i| Point::new(NOW - 3600 + 60 * (i + 1), 1.0)).collect();
        let image = WhisperBuilder::new(Method::Average).archive(60, 60, &points).build();

        std::fs::create_dir_all(&whisper_dir).unwrap();
        std::fs::write(whisper_dir.join("good.wsp"), &image).unwrap();
        std::fs::write(whisper_dir.join("bad.wsp"), &image).unwrap();

        let writer = SegmentWriter::create_next(dir.path().join("out")).unwrap();
        let segment_path = writer.path().to_path_buf();
        let store = Arc::new(Mutex::new(FaultyStore {
            writer,
            poisoned: "bad",
        }));

        let importer = Importer::new(vec![RetentionConfig::new(60, 60, 600)], NOW);
        let stats = run_import(Arc::new(importer), &whisper_dir, store.clone(), 2)
            .await
            .unwrap();

        assert_eq!(stats.metrics, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(store.lock().await.writer.record_count(), 5);

        let mut reader = SegmentReader::open(&segment_path).unwrap();
        assert_eq!(reader.row_keys(), vec!["1.good"]);
        assert_eq!(reader.read_row("1.good").unwrap().len(), 5);
    }
}
