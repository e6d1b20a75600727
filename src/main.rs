// =============================================================================
// FRAME PIPELINE DEMO - Headless offscreen rendering with readback
// =============================================================================
//
// Drives an offscreen RenderTargetRing for a fixed number of frames. Each
// frame clears its target to a different color through dynamic rendering;
// finished frames come back out of the ring in production order and are
// summarized in the log.
//
// FRAME FLOW:
// 1. begin_phase (waits if the slot is still in flight)
// 2. Record a cleared rendering scope
// 3. end_phase (submit + readback copy)
// 4. read(false) once the ring is full, read(true) to drain at the end
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use frame_pipeline::backend::RenderingInfo;
use frame_pipeline::config::Config;
use frame_pipeline::{PixelView, RenderTargetRing, SyncPoints, VulkanDevice};
use std::fs::OpenOptions;
use std::io::Write;
use std::time::Instant;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting frame pipeline demo");
    log::info!(
        "Ring: depth {}, {}x{} {}, readback {}",
        config.ring.depth,
        config.ring.width,
        config.ring.height,
        config.ring.color_format,
        config.ring.readback
    );

    // ─────────────────────────────────────────────────────────────────────
    // STEP 1: Device and capabilities
    // ─────────────────────────────────────────────────────────────────────
    let device =
        VulkanDevice::new(&config.device_desc()).context("Failed to create Vulkan device")?;
    let ctx = device.context().context("Failed to set up device capabilities")?;

    // ─────────────────────────────────────────────────────────────────────
    // STEP 2: Offscreen ring
    // ─────────────────────────────────────────────────────────────────────
    let desc = config.ring.to_desc()?;
    let mut ring = RenderTargetRing::offscreen(&ctx, &desc)
        .context("Failed to create render target ring")?;

    // ─────────────────────────────────────────────────────────────────────
    // STEP 3: Produce and consume frames
    // ─────────────────────────────────────────────────────────────────────
    let started = Instant::now();
    let mut consumed = 0u32;
    for frame in 0..config.demo.frames {
        let color = frame_color(config.present.clear_color, frame);
        {
            let phase = ring
                .begin_phase(None, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                .with_context(|| format!("Failed to begin frame {}", frame))?;
            phase.commands.begin_rendering(&RenderingInfo {
                color_view: phase.target_view,
                depth_view: phase.depth_view,
                area: phase.rect,
                clear_color: Some(color),
                clear_depth: phase.depth_view.map(|_| 1.0),
            });
            phase.commands.end_rendering();
        }
        ring.end_phase(&SyncPoints::default())
            .with_context(|| format!("Failed to submit frame {}", frame))?;

        if desc.readback {
            if let Some(view) = ring.read(false)? {
                report(consumed, &view);
                consumed += 1;
            }
        }
    }

    if desc.readback && config.demo.flush_at_end {
        while let Some(view) = ring.read(true)? {
            report(consumed, &view);
            consumed += 1;
        }
    }

    ring.wait_idle().context("Failed waiting for the ring to drain")?;

    let elapsed = started.elapsed();
    log::info!(
        "Produced {} frames, read back {} in {:.2?} ({:.1} frames/s)",
        config.demo.frames,
        consumed,
        elapsed,
        config.demo.frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}

/// Initialize logging with optional file output
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let level = config.debug.log_level.parse().unwrap_or(LevelFilter::Info);
    let mut builder = Builder::from_default_env();
    builder.filter_level(level);
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Frame Pipeline Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

/// Base color with the red channel stepped per frame, so consecutive
/// readbacks are distinguishable.
fn frame_color(base: [f32; 4], frame: u32) -> [f32; 4] {
    let [_, g, b, a] = base;
    [(frame % 8) as f32 / 7.0, g, b, a]
}

fn report(index: u32, view: &PixelView<'_>) {
    let center = view.pixel(view.width() / 2, view.height() / 2);
    let checksum = view
        .rows()
        .flat_map(|row| row.iter())
        .fold(0u32, |sum, &byte| sum.wrapping_mul(31).wrapping_add(byte as u32));
    log::info!(
        "Frame {}: {}x{} (pitch {}), center {:?}, checksum {:08x}",
        index,
        view.width(),
        view.height(),
        view.row_pitch(),
        center,
        checksum
    );
}
