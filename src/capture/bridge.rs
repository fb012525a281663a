//! Bridges driver frame-ready notifications into the active recording session.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use tracing::{debug, error, warn};

use super::frame::FrameView;
use crate::grabber::{FrameGeometry, FrameReadyCallback};
use crate::record::RecordingSession;
use crate::CaptureError;

/// Currently armed recording target
struct ActiveTarget {
    session: Arc<RecordingSession>,
    geometry: FrameGeometry,
}

/// The frame-ready handler invoked on the driver's capture thread.
///
/// Registered with the grabber exactly once; the controlling thread swaps the
/// active recording target in and out while callbacks are in flight. Nothing
/// is allowed to escape [`CallbackBridge::on_frame_ready`] back into driver
/// code: encode failures are logged and the frame dropped, panics are caught
/// at the boundary.
pub struct CallbackBridge {
    active: ArcSwapOption<ActiveTarget>,
    /// Monotonic epoch; per-frame timestamps are seconds since this instant.
    epoch: Instant,
    stats: CachePadded<BridgeStats>,
}

#[derive(Default)]
struct BridgeStats {
    frames_written: AtomicU64,
    frames_dropped: AtomicU64,
    faults: AtomicU64,
}

impl CallbackBridge {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: ArcSwapOption::from(None),
            epoch: Instant::now(),
            stats: CachePadded::new(BridgeStats::default()),
        }
    }

    /// Install `session` as the recording target for subsequent frames.
    /// Replaces any previous target atomically; in-flight callbacks finish
    /// against whichever target they loaded.
    pub fn install(&self, session: Arc<RecordingSession>, geometry: FrameGeometry) {
        let previous = self
            .active
            .swap(Some(Arc::new(ActiveTarget { session, geometry })));
        if let Some(old) = previous {
            if old.session.is_configured() {
                warn!("replaced a recording target that still had an open sink");
            }
        }
    }

    /// Remove the active target, returning its session for release.
    pub fn clear(&self) -> Option<Arc<RecordingSession>> {
        self.active.swap(None).map(|target| {
            Arc::clone(&target.session)
        })
    }

    /// Session currently receiving frames, if any.
    pub fn active_session(&self) -> Option<Arc<RecordingSession>> {
        self.active
            .load_full()
            .map(|target| Arc::clone(&target.session))
    }

    /// Build the closure handed to [`FrameGrabber::register_frame_ready`].
    ///
    /// [`FrameGrabber::register_frame_ready`]: crate::grabber::FrameGrabber::register_frame_ready
    pub fn frame_ready_callback(self: &Arc<Self>) -> FrameReadyCallback {
        let bridge = Arc::clone(self);
        Arc::new(move |data, sequence| bridge.on_frame_ready(data, sequence))
    }

    /// Handle one frame-ready notification.
    ///
    /// `data` is the driver-owned buffer, valid only for this call; it is
    /// copied out before the function returns. `sequence` is the
    /// driver-assigned frame number.
    pub fn on_frame_ready(&self, data: &[u8], sequence: u64) {
        let Some(target) = self.active.load_full() else {
            return;
        };
        // Cheap gate: no allocation, no lock, before touching the buffer.
        if !target.session.is_recording() {
            return;
        }

        // Timestamp before any buffer interpretation to minimize skew.
        let timestamp = self.epoch.elapsed().as_secs_f64();
        let started = Instant::now();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let view = FrameView::new(data, target.geometry)?;
            let frame = view.to_frame(sequence);
            target.session.write(&frame, timestamp, sequence)
        }));

        match outcome {
            Ok(Ok(())) => {
                self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_written").increment(1);
                metrics::histogram!("frame_write_us").record(started.elapsed().as_micros() as f64);
            }
            Ok(Err(CaptureError::NotRecording | CaptureError::NotConfigured)) => {
                // Recording was disabled or released while this frame was in
                // flight; dropping it is the contract.
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_dropped").increment(1);
                debug!(sequence, "frame dropped: recording stopped mid-flight");
            }
            Ok(Err(e)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_dropped").increment(1);
                warn!(error = %e, sequence, "frame dropped");
            }
            Err(panic) => {
                self.stats.faults.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("callback_faults").increment(1);
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                error!(sequence, fault = %message, "panic caught at frame-ready boundary");
            }
        }
    }

    /// Seconds elapsed since the bridge's timestamp epoch.
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// (frames written, frames dropped, faults) since creation.
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.frames_written.load(Ordering::Relaxed),
            self.stats.frames_dropped.load(Ordering::Relaxed),
            self.stats.faults.load(Ordering::Relaxed),
        )
    }
}

impl Default for CallbackBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::capture::Frame;
    use crate::record::sink::{FourCc, MemorySinkFactory, RecordConfig, SinkFactory, VideoSink};
    use crate::Result;

    fn geometry() -> FrameGeometry {
        FrameGeometry {
            buffer_size: 16,
            width: 4,
            height: 4,
            bytes_per_pixel: 1,
        }
    }

    fn record_config() -> RecordConfig {
        RecordConfig {
            fourcc: FourCc::MJPG,
            fps: 30.0,
            width: 4,
            height: 4,
        }
    }

    fn armed_session(factory: &MemorySinkFactory) -> Arc<RecordingSession> {
        let session = Arc::new(RecordingSession::new());
        session
            .configure(factory, Path::new("bridge.avi"), &record_config())
            .expect("configure");
        session.set_recording(true).expect("enable");
        session
    }

    #[test]
    fn no_target_is_a_noop() {
        let bridge = CallbackBridge::new();
        bridge.on_frame_ready(&[0u8; 16], 1);
        assert_eq!(bridge.stats(), (0, 0, 0));
    }

    #[test]
    fn disabled_session_short_circuits() {
        let factory = MemorySinkFactory::new();
        let bridge = CallbackBridge::new();
        let session = Arc::new(RecordingSession::new());
        session
            .configure(&factory, Path::new("bridge.avi"), &record_config())
            .expect("configure");
        bridge.install(session, geometry());

        bridge.on_frame_ready(&[0u8; 16], 1);
        // Early return: not even counted as a drop.
        assert_eq!(bridge.stats(), (0, 0, 0));
    }

    #[test]
    fn recording_frame_is_written_with_timestamp() {
        let factory = MemorySinkFactory::new();
        let bridge = CallbackBridge::new();
        let session = armed_session(&factory);
        bridge.install(Arc::clone(&session), geometry());

        bridge.on_frame_ready(&[7u8; 16], 42);
        assert_eq!(bridge.stats().0, 1);

        let (times, numbers) = session.release();
        assert_eq!(numbers, vec![42]);
        assert_eq!(times.len(), 1);
        assert!(times[0] >= 0.0);
    }

    #[test]
    fn geometry_mismatch_drops_frame_and_continues() {
        let factory = MemorySinkFactory::new();
        let bridge = CallbackBridge::new();
        let session = armed_session(&factory);
        bridge.install(Arc::clone(&session), geometry());

        bridge.on_frame_ready(&[0u8; 7], 1); // wrong length
        bridge.on_frame_ready(&[0u8; 16], 2);

        let (written, dropped, faults) = bridge.stats();
        assert_eq!((written, dropped, faults), (1, 1, 0));
        let (_, numbers) = session.release();
        assert_eq!(numbers, vec![2]);
    }

    #[test]
    fn timestamps_are_monotonic() {
        let factory = MemorySinkFactory::new();
        let bridge = CallbackBridge::new();
        let session = armed_session(&factory);
        bridge.install(Arc::clone(&session), geometry());

        bridge.on_frame_ready(&[0u8; 16], 1);
        bridge.on_frame_ready(&[0u8; 16], 2);

        let (times, _) = session.release();
        assert_eq!(times.len(), 2);
        assert!(times[1] >= times[0]);
    }

    #[derive(Debug)]
    struct PanickingSink;

    impl VideoSink for PanickingSink {
        fn write_frame(&mut self, _frame: &Frame) -> Result<()> {
            panic!("encoder blew up");
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct PanickingSinkFactory;

    impl SinkFactory for PanickingSinkFactory {
        fn open(&self, _path: &Path, _config: &RecordConfig) -> Result<Box<dyn VideoSink>> {
            Ok(Box::new(PanickingSink))
        }
    }

    #[test]
    fn panic_is_contained_at_the_boundary() {
        let bridge = CallbackBridge::new();
        let session = Arc::new(RecordingSession::new());
        session
            .configure(&PanickingSinkFactory, Path::new("bad.avi"), &record_config())
            .expect("configure");
        session.set_recording(true).expect("enable");
        bridge.install(Arc::clone(&session), geometry());

        bridge.on_frame_ready(&[0u8; 16], 1);
        assert_eq!(bridge.stats().2, 1);

        // The session stays consistent: no orphaned history entry.
        let (times, numbers) = session.release();
        assert!(times.is_empty());
        assert!(numbers.is_empty());
    }

    #[test]
    fn clear_removes_the_target() {
        let factory = MemorySinkFactory::new();
        let bridge = CallbackBridge::new();
        let session = armed_session(&factory);
        bridge.install(Arc::clone(&session), geometry());

        let removed = bridge.clear().expect("target was installed");
        assert!(Arc::ptr_eq(&removed, &session));
        bridge.on_frame_ready(&[0u8; 16], 9);
        assert_eq!(bridge.stats().0, 0);
    }
}
