//! txjournal admin tool
//!
//! Formats, inspects and replays the journal of a file-backed device image.

use std::path::PathBuf;
use std::process;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use txjournal::journal::format::{self, LogGeometry};
use txjournal::journal::recovery::{self, LogReader};
use txjournal::{FileBlockDevice, JournalConfig, JournalEngine, Result};

/// txjournal admin tool
#[derive(Parser, Debug)]
#[command(name = "txjournal")]
#[command(about = "Format, inspect and replay a block journal")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

/// Journal placement shared by every subcommand
#[derive(ClapArgs, Debug)]
struct Layout {
    /// Device image
    image: PathBuf,

    /// Bytes per block
    #[arg(long, default_value = "4096")]
    block_size: u32,

    /// First block of the log region
    #[arg(long, default_value = "18")]
    log_start: u64,

    /// Log region length in blocks
    #[arg(long, default_value = "8192")]
    log_blocks: u32,
}

impl Layout {
    /// Defaults, with the transaction limits shrunk to fit small blocks
    /// and small logs
    fn config(&self) -> JournalConfig {
        let defaults = JournalConfig::default();
        let by_records = 2 * format::inline_capacity(self.block_size) as u32;
        let by_log = (self.log_blocks / 2).saturating_sub(2);
        let trans_max = defaults.trans_max.min(by_records).min(by_log).max(1);
        let max_batch = (trans_max * 9 / 10).max(1);

        JournalConfig::builder()
            .block_size(self.block_size)
            .log_start(self.log_start)
            .log_blocks(self.log_blocks)
            .trans_max(trans_max)
            .max_batch(max_batch)
            .commit_worker(false)
            .build()
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create (if needed) and format a device image
    Format {
        #[command(flatten)]
        layout: Layout,

        /// Device size in blocks when creating the image
        #[arg(long)]
        blocks: Option<u64>,
    },

    /// Print the header and every intact transaction in the log
    Inspect {
        #[command(flatten)]
        layout: Layout,
    },

    /// Replay committed transactions to their home locations
    Replay {
        #[command(flatten)]
        layout: Layout,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,txjournal=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("txjournal v{}", txjournal::VERSION);

    let result = match args.command {
        Commands::Format { layout, blocks } => format_image(&layout, blocks),
        Commands::Inspect { layout } => inspect(&layout),
        Commands::Replay { layout } => replay(&layout),
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn format_image(layout: &Layout, blocks: Option<u64>) -> Result<()> {
    let config = layout.config();
    let device = match blocks {
        Some(count) => FileBlockDevice::create(&layout.image, layout.block_size, count)?,
        None => FileBlockDevice::open(&layout.image, layout.block_size)?,
    };
    let header = JournalEngine::format(&device, &config)?;
    println!(
        "formatted {}: log {}..{}, header at block {}",
        layout.image.display(),
        header.params.log_start,
        header.params.log_start + u64::from(header.params.log_blocks),
        config.log_start + u64::from(config.log_blocks)
    );
    Ok(())
}

fn inspect(layout: &Layout) -> Result<()> {
    let config = layout.config();
    config.validate()?;
    let device = FileBlockDevice::open(&layout.image, layout.block_size)?;
    let reader = LogReader::new(&device, LogGeometry::from_config(&config));

    match reader.read_header()? {
        Some(h) => println!(
            "header: last_flush={} offset={} mount={} block_size={} log_start={} log_blocks={}",
            h.last_flush_trans_id,
            h.first_unflushed_offset,
            h.mount_id,
            h.params.block_size,
            h.params.log_start,
            h.params.log_blocks
        ),
        None => println!("header: none"),
    }

    let found = reader.scan()?;
    for t in &found {
        println!(
            "offset {:>6}  trans {:>8}  mount {:>4}  len {:>4}",
            t.offset,
            t.trans_id,
            t.mount_id,
            t.len()
        );
    }
    println!("{} intact transaction(s)", found.len());
    Ok(())
}

fn replay(layout: &Layout) -> Result<()> {
    let config = layout.config();
    config.validate()?;
    let device = FileBlockDevice::open(&layout.image, layout.block_size)?;
    let (_, report) = recovery::recover(&device, &config)?;
    println!(
        "replayed {} transaction(s), {} block(s); next start offset {}, mount {}",
        report.transactions_replayed, report.blocks_replayed, report.start_offset, report.mount_id
    );
    Ok(())
}
