//! tsmigrate CLI
//!
//! Command-line interface for migrating whisper files:
//! - Import a directory tree into segment files
//! - Show the conversion plan of a single file
//! - Inspect a written segment
//! - Evaluate index pruning rules

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tsmigrate::config::{Config, LoggingConfig, RetentionConfig};
use tsmigrate::conversion::plan;
use tsmigrate::import::{run_import, ArchiveSource, Importer};
use tsmigrate::index_rules::IndexRules;
use tsmigrate::storage::{MemoryStore, SegmentReader, SegmentWriter};
use tsmigrate::whisper::WhisperFile;

#[derive(Parser)]
#[command(name = "tsmigrate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Migrate whisper archives into chunked rollup storage")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the usual locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format override (pretty, json)
    #[arg(long, global = true)]
    pub log_format: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import every .wsp file below a directory
    Import {
        /// Root of the whisper tree
        dir: PathBuf,
        /// Retentions as spp:points:span,... (overrides the config)
        #[arg(short, long)]
        retentions: Option<String>,
        /// Output directory for segment files
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
        /// Also write the newest, still-growing chunk of every series
        #[arg(long)]
        write_unfinished: bool,
        /// Reference time in unix seconds
        #[arg(long)]
        now: Option<u32>,
        /// Parallel conversions
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
        /// Convert everything but keep the chunks in memory
        #[arg(long)]
        dry_run: bool,
    },

    /// Show which archive feeds which part of a retention
    Plan {
        /// Whisper file
        file: PathBuf,
        /// Destination seconds per point
        #[arg(long)]
        spp: u32,
        /// Destination number of points
        #[arg(long)]
        points: u32,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List the rows and chunks of a segment file
    Inspect {
        /// Segment file
        segment: PathBuf,
        /// Also print decoded points
        #[arg(long)]
        points: bool,
    },

    /// Show which index rule applies to a metric
    IndexRules {
        /// Rules file (TOML)
        file: PathBuf,
        /// Metric name
        metric: String,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config {:?}", path))?,
        None => Config::load_default(),
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }
    init_logging(&config.logging);

    match cli.command {
        Commands::Import {
            dir,
            retentions,
            data_dir,
            write_unfinished,
            now,
            concurrency,
            dry_run,
        } => {
            if let Some(list) = retentions {
                config.retentions = RetentionConfig::parse_list(&list)?;
            }
            if let Some(data_dir) = data_dir {
                config.output.data_dir = data_dir.to_string_lossy().to_string();
            }
            if write_unfinished {
                config.import.write_unfinished_chunks = true;
            }
            if now.is_some() {
                config.import.now = now;
            }
            if let Some(n) = concurrency {
                config.import.concurrency = n;
            }

            import(&config, &dir, dry_run).await?;
        }

        Commands::Plan {
            file,
            spp,
            points,
            json,
        } => {
            let source =
                WhisperFile::open(&file).with_context(|| format!("opening {:?}", file))?;
            let archives = source.archives();
            let segments = plan(spp, points, archives)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&segments)?);
            } else {
                println!(
                    "{:>7} {:>8} {:>10} {:>12} {:>10}",
                    "ARCHIVE", "SPP", "POINTS", "RANGE (s)", "CONVERSION"
                );
                for segment in &segments {
                    let archive = &archives[segment.archive];
                    println!(
                        "{:>7} {:>8} {:>10} {:>12} {:>10}",
                        segment.archive,
                        archive.seconds_per_point,
                        archive.points,
                        segment.time_range,
                        segment.conversion
                    );
                }
                let requested = u64::from(spp) * u64::from(points);
                if segments.last().map(|s| s.time_range) < Some(requested) {
                    println!("note: archives cover less than the requested {}s", requested);
                }
            }
        }

        Commands::Inspect { segment, points } => inspect(&segment, points)?,

        Commands::IndexRules { file, metric } => {
            let rules =
                IndexRules::load(&file).with_context(|| format!("loading rules {:?}", file))?;
            let (idx, rule) = rules.matches(&metric);
            let check = rules.checks(chrono::Utc::now())[idx];

            println!("Rule:      #{} {}", idx, rule.name);
            println!("Prefix:    {:?}", rule.prefix);
            if check.keep {
                println!("Max stale: never pruned");
            } else {
                println!("Max stale: {}s", rule.max_stale.num_seconds());
                let cutoff = chrono::DateTime::from_timestamp(check.cutoff, 0)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| check.cutoff.to_string());
                println!("Cutoff:    {}", cutoff);
            }
        }

        Commands::Config { output } => {
            let config = tsmigrate::config::generate_default_config();

            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &config)?;
                    println!("Config written to {:?}", path);
                }
                None => {
                    print!("{}", config);
                }
            }
        }
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tsmigrate={}", logging.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn import(config: &Config, dir: &Path, dry_run: bool) -> Result<()> {
    if !dir.is_dir() {
        bail!("{:?} is not a directory", dir);
    }

    let importer = Arc::new(Importer::from_config(config)?);
    tracing::info!(
        "tsmigrate v{} importing {:?} at now={}",
        env!("CARGO_PKG_VERSION"),
        dir,
        importer.now()
    );

    let stats = if dry_run {
        let store = Arc::new(Mutex::new(MemoryStore::new()));
        run_import(importer, dir, store, config.import.concurrency).await?
    } else {
        let writer = SegmentWriter::create_next(&config.output.data_dir)
            .with_context(|| format!("creating segment in {}", config.output.data_dir))?;
        tracing::info!("Writing to {:?}", writer.path());
        let store = Arc::new(Mutex::new(writer));
        let stats = run_import(importer, dir, store.clone(), config.import.concurrency).await?;

        let writer = store.lock().await;
        println!("Wrote {} chunks to {:?}", writer.record_count(), writer.path());
        stats
    };

    println!("{}", stats);
    if stats.failed > 0 {
        bail!("{} files failed to import", stats.failed);
    }
    Ok(())
}

fn inspect(path: &Path, show_points: bool) -> Result<()> {
    let mut reader =
        SegmentReader::open(path).with_context(|| format!("opening segment {:?}", path))?;

    println!("Segment:  {:?}", reader.path);
    println!("Version:  {}", reader.header.version);
    println!("Records:  {}", reader.header.record_count);
    println!("t0 range: {} .. {}", reader.header.min_t0, reader.header.max_t0);

    let keys: Vec<String> = reader.row_keys().into_iter().map(String::from).collect();
    for key in keys {
        let chunks = reader.read_row(&key)?;
        let total: u32 = chunks.iter().map(|c| c.point_count).sum();
        println!("\n{} ({} chunks, {} points)", key, chunks.len(), total);

        for chunk in &chunks {
            println!(
                "  t0={} span={} points={}{}",
                chunk.t0,
                chunk.span,
                chunk.point_count,
                if chunk.finished { "" } else { " unfinished" }
            );
            if show_points {
                for point in chunk.points()? {
                    println!("    {} {}", point.timestamp, point.value);
                }
            }
        }
    }

    Ok(())
}
