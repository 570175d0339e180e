//! WSI Engine - open a slide and exercise its tile pipeline.
//!
//! The binary opens the given slide, reports the pyramid geometry, and
//! reads a small region through the concurrent loader as a smoke test.
//! Exit code 0 means the slide opened (and, when applicable, decoded)
//! successfully.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wsi_engine::{Cli, Engine, PixelFormat};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let engine = Engine::new(cli.engine_config());
    let image = match engine.open_image(&cli.path) {
        Ok(image) => image,
        Err(e) => {
            error!("Failed to open {}: {}", cli.path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let (mpp_x, mpp_y, mpp_known) = image.mpp();
    info!("Opened {}", cli.path.display());
    info!("  Backend: {}", image.backend.name());
    info!(
        "  Dimensions: {} x {} pixels ({} levels)",
        image.width_in_pixels,
        image.height_in_pixels,
        image.level_count()
    );
    info!("  Tile size: {} x {}", image.tile_width, image.tile_height);
    if mpp_known {
        info!("  Resolution: {:.4} x {:.4} um/pixel", mpp_x, mpp_y);
    } else {
        info!("  Resolution: unknown (assuming {:.2} um/pixel)", mpp_x);
    }
    if image.macro_image.is_some() {
        info!("  Has macro image");
    }
    if image.label_image.is_some() {
        info!("  Has label image");
    }

    // Smoke-read a small region from the coarsest indexed level so the
    // work queue, decoder, and reconstruction path all run once.
    let smoke_level = coarsest_ready_level(&image);
    match smoke_level {
        Some(level) => {
            let w = image.width_in_pixels.min(256).max(1);
            let h = image.height_in_pixels.min(256).max(1);
            let mut pixels = vec![0u8; w as usize * h as usize * 4];
            match engine.read_region(&image, level, 0, 0, w, h, &mut pixels, PixelFormat::Bgra8) {
                Ok(()) => info!("  Smoke read: {}x{} at level {} ok", w, h, level),
                Err(e) => {
                    error!("  Smoke read failed: {}", e);
                    engine.destroy_image(&image);
                    return ExitCode::FAILURE;
                }
            }
        }
        None => info!("  Smoke read skipped: no indexed level yet"),
    }

    engine.destroy_image(&image);
    ExitCode::SUCCESS
}

/// Pick the highest existing, indexed level (the cheapest to decode).
fn coarsest_ready_level(image: &wsi_engine::Image) -> Option<u32> {
    let state = image.lock();
    state
        .levels
        .iter()
        .enumerate()
        .rev()
        .find(|(_, level)| level.exists && !level.needs_indexing)
        .map(|(i, _)| i as u32)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "wsi_engine=debug"
    } else {
        "wsi_engine=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
