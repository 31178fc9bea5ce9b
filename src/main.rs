//! trajcast CLI - follows the realtime vehicle feed of a map extent.
//!
//! This is the main binary entry point. See the `trajcast` library for the
//! channel client, protocol API and trajectory engine.

use anyhow::{bail, Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use trajcast::api::{RealtimeApi, RealtimeMode};
use trajcast::engine::view::resolution_for_zoom;
use trajcast::engine::{Frame, RealtimeEngine, TrajectoryFilter, ViewState};
use trajcast::Config;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Canvas size of the rendered frames, in CSS pixels.
const CANVAS_SIZE: [u32; 2] = [1024, 768];

/// Interval between fleet size log lines.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

// CLI
#[derive(Parser, Debug)]
#[command(name = "trajcast")]
#[command(version)]
#[command(about = "Follow realtime vehicle trajectories inside a map extent")]
struct Cli {
    /// Realtime WebSocket endpoint (overrides config and TRAJCAST_URL)
    #[arg(long)]
    url: Option<String>,

    /// API key appended to the endpoint as `key=`
    #[arg(long)]
    api_key: Option<String>,

    /// Extent in map units: minx,miny,maxx,maxy
    #[arg(long, value_parser = parse_bbox)]
    bbox: [f64; 4],

    /// Map zoom. Derived from the extent when omitted.
    #[arg(long)]
    zoom: Option<f64>,

    /// Channel flavour: topographic or schematic
    #[arg(long)]
    mode: Option<RealtimeMode>,

    /// Modes of transport to keep, comma separated (e.g. bus,tram)
    #[arg(long, value_delimiter = ',')]
    mot: Vec<String>,

    /// Restrict vehicles to one tenant
    #[arg(long)]
    tenant: Option<String>,

    /// Generalization level of the selected vehicle's route (5, 10, 30, 100)
    #[arg(long)]
    generalization: Option<u8>,

    /// Directory rendered frames are written to as PNG
    #[arg(long)]
    frames_dir: Option<PathBuf>,

    /// Write every Nth frame
    #[arg(long, default_value_t = 60)]
    frame_every: u64,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    duration_secs: Option<u64>,
}

fn parse_bbox(value: &str) -> Result<[f64; 4], String> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid coordinate: {e}"))?;
    match parts.as_slice() {
        [min_x, min_y, max_x, max_y] if min_x < max_x && min_y < max_y => {
            Ok([*min_x, *min_y, *max_x, *max_y])
        }
        [_, _, _, _] => Err("expected minx < maxx and miny < maxy".to_string()),
        _ => Err(format!("expected 4 comma separated numbers, got {}", parts.len())),
    }
}

fn build_view(bbox: [f64; 4], zoom: Option<f64>) -> ViewState {
    match zoom {
        Some(zoom) => {
            let center = [(bbox[0] + bbox[2]) / 2.0, (bbox[1] + bbox[3]) / 2.0];
            ViewState::new(center, resolution_for_zoom(zoom), CANVAS_SIZE)
        }
        None => ViewState::fit(bbox, CANVAS_SIZE),
    }
}

/// Frame callback writing every `every`th frame into `dir`.
///
/// Encoding happens on the blocking pool so the animation task is not held up.
fn frame_writer(dir: PathBuf, every: u64) -> impl Fn(&Frame) + Send + Sync {
    let counter = AtomicU64::new(0);
    move |frame: &Frame| {
        let n = counter.fetch_add(1, Ordering::Relaxed);
        if n % every != 0 {
            return;
        }
        let image = frame.image.clone();
        let path = dir.join(format!("frame-{:06}.png", n / every));
        tokio::task::spawn_blocking(move || {
            if let Err(e) = image
                .save(&path)
                .with_context(|| format!("Failed to write {}", path.display()))
            {
                log::warn!("[Frames] {:#}", e);
            } else {
                log::debug!("[Frames] Wrote {}", path.display());
            }
        });
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(url) = cli.url {
        config.url = url;
    }
    if let Some(api_key) = cli.api_key {
        config.api_key = api_key;
    }
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if cli.tenant.is_some() {
        config.tenant = cli.tenant;
    }
    if cli.generalization.is_some() {
        config.generalization = cli.generalization;
    }
    if config.url.is_empty() {
        bail!("No realtime URL configured (use --url or TRAJCAST_URL)");
    }

    let api = RealtimeApi::new(config.endpoint(), config.client_options());
    api.set_mode(config.mode);
    api.set_projection(config.projection.clone());

    let view = build_view(cli.bbox, cli.zoom);
    log::info!(
        "[Main] Following {:?} at zoom {:.1} in {} mode",
        view.extent,
        view.zoom,
        config.mode
    );

    let engine = RealtimeEngine::new(
        api.clone(),
        move || Some(view.clone()),
        config.engine_options(),
    );
    if !cli.mot.is_empty() {
        engine.set_filter(TrajectoryFilter::default().with_mots(cli.mot));
    }

    if let Some(dir) = cli.frames_dir {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        engine.set_on_frame(frame_writer(dir, cli.frame_every.max(1)));
    }

    engine.start()?;

    let deadline = async {
        match cli.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                log::info!("[Main] Interrupted");
                break;
            }
            () = &mut deadline => {
                log::info!("[Main] Duration elapsed");
                break;
            }
            _ = status.tick() => {
                log::info!(
                    "[Main] {} vehicles, connection {:?}",
                    engine.trajectory_count(),
                    api.state()
                );
            }
        }
    }

    engine.stop();
    api.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    run(Cli::parse()).await
}
