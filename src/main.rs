//! Dhyana acquisition demo against the simulated camera driver

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dhyana::capture::{AcquisitionController, AcquisitionOptions, StopReport};
use dhyana::sdk::sim::FramePattern;
use dhyana::sdk::{NativeSdk, SimulatedSdk};
use dhyana::{utils, Config};

const STREAM_FOR: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime());
    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        subscriber
            .finish()
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling"))]
    subscriber.init();

    info!("Dhyana Launching...");

    let sdk = Arc::new(SimulatedSdk::new(1).with_pattern(FramePattern {
        width: 512,
        height: 512,
        ..FramePattern::default()
    }));
    let cameras = sdk.initialize()?;
    info!("Driver reports {} camera(s)", cameras);

    let session = Arc::new(utils::open_device(sdk.clone(), config.capture.device_index)?);
    let device = session.info()?;
    info!(
        "Using camera: {} (serial {}, firmware {:#x}, {:?})",
        device.model, device.serial_number, device.firmware_version, device.bus
    );

    let controller = Arc::new(AcquisitionController::new(
        session.clone(),
        AcquisitionOptions::from(&config.capture),
    ));
    let events = controller.events();
    let (_subscription, frames) = controller.frame_channel(8);

    controller.start_capture()?;
    let deadline = Instant::now() + STREAM_FOR;
    let mut received = 0u64;
    loop {
        tokio::select! {
            frame = frames.recv_async() => match frame {
                Ok(frame) => {
                    received += 1;
                    tracing::debug!(
                        "frame {} {}x{} ({:?})",
                        frame.index(),
                        frame.width(),
                        frame.height(),
                        frame.meta.source_depth
                    );
                }
                Err(_) => break,
            },
            _ = tokio::time::sleep_until(deadline.into()) => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    match controller.stop_capture()? {
        StopReport::Clean => info!("Capture stopped successfully"),
        StopReport::Degraded(warnings) => {
            for warning in warnings {
                warn!("Stop warning: {}", warning);
            }
        }
    }
    for event in events.drain() {
        info!("Acquisition event: {:?}", event);
    }

    let stats = controller.stats();
    info!(
        "Streamed {} frames ({} received here), {} timeouts, {} failures",
        stats.frames_delivered, received, stats.timeouts, stats.native_failures
    );

    let timeout = Duration::from_millis(config.capture.single_shot_timeout_ms);
    let snapshot = controller.capture_once_async(timeout).await?;
    info!("Single-shot frame {}", snapshot.index());
    if let Some(path) = &config.capture.snapshot_path {
        snapshot.save(path)?;
        info!("Snapshot written to {}", path.display());
    }

    drop(controller);
    session.close()?;
    if let Err(code) = sdk.uninitialize() {
        warn!("Driver uninitialize failed: {}", code);
    }

    info!("Dhyana shutting down");
    Ok(())
}
