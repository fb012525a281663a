//! Argus triggered-capture demo
//!
//! Opens a grabber (mock by default, V4L2 with --device), arms the trigger
//! and records for a fixed duration, then prints the per-frame history stats.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::info;

use argus::grabber::{FrameGrabber, MockGrabber, MockTrigger, V4l2Grabber};
use argus::{CameraSession, Config, SinkFactory};

#[cfg(not(feature = "gstreamer-sink"))]
use argus::MemorySinkFactory;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("argus=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Argus launching...");

    let mut config = Config::default();
    let mut output = PathBuf::from("capture.avi");
    let mut seconds = 5u64;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().ok_or_else(|| eyre!("--config needs a path"))?;
                config = Config::from_file(Path::new(&path))?;
            }
            "--device" => {
                config.camera.device = args.next().ok_or_else(|| eyre!("--device needs a path"))?;
            }
            "--out" => {
                output = args.next().ok_or_else(|| eyre!("--out needs a path"))?.into();
            }
            "--seconds" => {
                seconds = args
                    .next()
                    .ok_or_else(|| eyre!("--seconds needs a value"))?
                    .parse()?;
            }
            other => return Err(eyre!("unknown argument {other}")),
        }
    }

    let (grabber, trigger): (Box<dyn FrameGrabber>, Option<MockTrigger>) =
        if config.camera.device == "mock" {
            let mock = MockGrabber::y800();
            let trigger = mock.trigger_line();
            (Box::new(mock), Some(trigger))
        } else {
            let v4l2 = V4l2Grabber::open_path(&config.camera.device, config.camera.pixel_format)?;
            (Box::new(v4l2), None)
        };

    #[cfg(feature = "gstreamer-sink")]
    let sinks: Arc<dyn SinkFactory> = Arc::new(argus::record::GstSinkFactory);
    #[cfg(not(feature = "gstreamer-sink"))]
    let memory = MemorySinkFactory::new();
    #[cfg(not(feature = "gstreamer-sink"))]
    let sinks: Arc<dyn SinkFactory> = Arc::new(memory.clone());

    let pulse_period = Duration::from_secs_f64(1.0 / config.camera.fps.max(1.0));

    let mut session = CameraSession::new(grabber, config, sinks)?;
    session.start_live(false)?;
    session.arm_trigger(&output)?;
    session.start_recording()?;
    info!(output = %output.display(), seconds, "recording");

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            () = &mut deadline => break,
            _ = &mut interrupt => {
                info!("interrupted");
                break;
            }
            () = tokio::time::sleep(pulse_period), if trigger.is_some() => {
                if let Some(trigger) = trigger.as_ref() {
                    trigger.pulse();
                }
            }
        }
    }

    let (times, numbers) = session.stop_recording()?;
    let span = match (times.first(), times.last()) {
        (Some(first), Some(last)) => last - first,
        _ => 0.0,
    };
    info!(
        frames = times.len(),
        span_secs = span,
        first_seq = numbers.first().copied().unwrap_or(0),
        last_seq = numbers.last().copied().unwrap_or(0),
        "capture finished"
    );

    let (written, dropped, faults) = session.bridge_stats();
    info!(written, dropped, faults, "bridge stats");

    #[cfg(not(feature = "gstreamer-sink"))]
    if let Some(video) = memory.video(&output.display().to_string()) {
        info!(
            frames = video.frame_lens.len(),
            closed = video.closed,
            "memory sink contents (build with --features gstreamer-sink to write a real file)"
        );
    }

    session.disarm_trigger()?;
    session.close();

    info!("Argus shutting down");
    Ok(())
}
