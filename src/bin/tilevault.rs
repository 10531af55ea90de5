//! TileVault command line
//!
//! Exercises tiled storage and swapping outside of a host application.
//!
//! # Examples
//!
//! ```bash
//! # Paint a 2048x2048 device, swap every tile out and back, verify pixels
//! tilevault stress --width 2048 --height 2048
//!
//! # Show the effective configuration (defaults, file, TILEVAULT_* env)
//! tilevault --config tilevault.toml config
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tilevault::device::Rect;
use tilevault::{
    ConversionFlags, ImageConfig, PaintDevice, PixelFormat, RenderingIntent, SwappedDataStore,
};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// TileVault - tiled paint device storage with swapping
#[derive(Parser, Debug)]
#[command(name = "tilevault")]
#[command(version = tilevault::VERSION)]
#[command(about = "Tiled paint device storage with disk swapping", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, global = true, env = "TILEVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true, env = "TILEVAULT_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fill a device, swap all tiles out and back, verify content
    Stress(StressArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug)]
struct StressArgs {
    /// Device width in pixels
    #[arg(long, default_value = "1024")]
    width: i32,

    /// Device height in pixels
    #[arg(long, default_value = "1024")]
    height: i32,

    /// Edge of the solid colour blocks painted into the device
    #[arg(long, default_value = "8")]
    block: i32,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli)?;

    let config = ImageConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Stress(args) => stress_command(&config, args),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    let file_layer = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "tilevault.log");
            Some(fmt::layer().with_writer(file_appender).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn block_color(bx: i32, by: i32) -> [u8; 4] {
    [
        (bx.wrapping_mul(37)) as u8,
        (by.wrapping_mul(59)) as u8,
        ((bx ^ by).wrapping_mul(13)) as u8,
        255,
    ]
}

fn stress_command(config: &ImageConfig, args: StressArgs) -> anyhow::Result<()> {
    if args.width <= 0 || args.height <= 0 || args.block <= 0 {
        bail!("width, height and block must be positive");
    }

    info!(version = %tilevault::VERSION, "TileVault stress run");
    let store = Arc::new(SwappedDataStore::new(config)?);
    let device = PaintDevice::with_swap(config, PixelFormat::Rgba8, &[0, 0, 0, 0], store.clone())?;

    let started = Instant::now();
    let blocks_x = (args.width + args.block - 1) / args.block;
    let blocks_y = (args.height + args.block - 1) / args.block;
    for by in 0..blocks_y {
        for bx in 0..blocks_x {
            let rect = Rect::new(bx * args.block, by * args.block, args.block, args.block)
                .intersected(&Rect::new(0, 0, args.width, args.height));
            device.fill(rect, &block_color(bx, by))?;
        }
    }

    let data = device.data_manager();
    let resident = data.resident_bytes();
    info!(
        tiles = data.tile_count(),
        resident,
        bounds = ?device.exact_bounds(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Painted device"
    );

    let started = Instant::now();
    let mut swapped = 0usize;
    for index in data.tile_indices() {
        match data.swap_out_tile(index) {
            Ok(true) => swapped += 1,
            Ok(false) => {}
            Err(e) => warn!(error = %e, ?index, "Tile stays resident"),
        }
    }
    info!(
        swapped,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Swapped out tiles"
    );

    let stats = store.stats();
    println!("{:#?}", stats);
    println!("compression: {}", stats.compression(data.tile_bytes()));
    store.debug_statistics()?;

    let started = Instant::now();
    let mut mismatches = 0usize;
    for by in 0..blocks_y {
        for bx in 0..blocks_x {
            let pixel = device.pixel(bx * args.block, by * args.block)?;
            if pixel != block_color(bx, by) {
                mismatches += 1;
            }
        }
    }
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        swapped_left = data.swapped_tile_count(),
        "Verified content"
    );

    let thumbnail = device.create_thumbnail(
        64,
        64,
        2.0,
        RenderingIntent::default(),
        ConversionFlags::BLACKPOINT_COMPENSATION,
    );
    info!(dimensions = ?thumbnail.dimensions(), "Rendered thumbnail");

    if mismatches > 0 {
        bail!("{} blocks changed after swapping", mismatches);
    }
    if store.num_tiles() != data.swapped_tile_count() as u64 {
        bail!("swap store and tile grid disagree on swapped tiles");
    }
    println!("verified {} blocks", blocks_x * blocks_y);
    Ok(())
}
