// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Host Producer CLI entry point.
//!
//! Runs on the hypervisor host, mapping the SHM region and driving the
//! capture to frame-ring/cursor-pipe pipeline once per tick. The concrete
//! capture backend, SHM provider, and session watcher are all external
//! collaborators; this binary wires up the portable stand-ins the library
//! ships (`StubCapture`, `MmapShmProvider`, `StaticSessionWatcher`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;

use lg_host_producer::capture::StubCapture;
use lg_host_producer::config::ProducerConfig;
use lg_host_producer::session::{SessionId, StaticSessionWatcher};
use lg_host_producer::shm::MmapShmProvider;
use lg_host_producer::Service;

#[derive(Parser, Debug)]
#[command(name = "lg-host-producer", version, about = "Host-side frame producer for lg-capture")]
struct Args {
    /// Path to the shared-memory-backed file the SHM provider maps.
    #[arg(short, long, default_value = "/dev/shm/lg-capture")]
    shm_path: String,

    /// Total size in bytes of the SHM region.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    shm_size: usize,

    /// Number of frame ring slots.
    #[arg(long, default_value_t = 2)]
    max_frames: u32,

    /// Target ticks per second for the capture loop.
    #[arg(short, long, default_value_t = 60)]
    fps: u32,

    /// Synthetic frame width, used by the stand-in capture backend.
    #[arg(long, default_value_t = 1920)]
    width: u32,

    /// Synthetic frame height, used by the stand-in capture backend.
    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Load configuration overrides from a JSON file.
    #[arg(long)]
    config: Option<String>,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    SimpleLogger::new().with_level(log_level).init()?;

    let mut config = match &args.config {
        Some(path) => ProducerConfig::load(std::path::Path::new(path))?,
        None => ProducerConfig::default(),
    };
    config.shm_path = args.shm_path;
    config.shm_size = args.shm_size;
    config.max_frames = args.max_frames;
    config.target_fps = args.fps;

    info!("starting lg-host-producer: {:?}", config);

    let provider = MmapShmProvider::new(&config.shm_path);
    let capture = StubCapture::new(args.width, args.height);
    let session_watcher = StaticSessionWatcher::new(SessionId(0));

    let mut service = Service::new(config.clone(), provider, capture, session_watcher);
    service.initialize()?;

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })?;

    let tick_interval = Duration::from_micros(1_000_000 / config.target_fps.max(1) as u64);
    info!("host producer running, press Ctrl+C to stop");

    while running.load(Ordering::SeqCst) {
        let tick_start = std::time::Instant::now();
        if let Err(e) = service.process() {
            error!("tick failed: {}", e);
            break;
        }

        let elapsed = tick_start.elapsed();
        if elapsed < tick_interval {
            std::thread::sleep(tick_interval - elapsed);
        }
    }

    info!("stopping host producer");
    if let Err(e) = service.deinitialize() {
        warn!("deinitialize failed during shutdown: {}", e);
    }
    info!("host producer stopped");
    Ok(())
}
