//! Recording session: sink ownership and per-frame bookkeeping.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info, warn};

use super::sink::{RecordConfig, SinkFactory, VideoSink};
use crate::capture::Frame;
use crate::{CaptureError, Result};

/// One triggered-recording target: an open video sink plus the per-frame
/// timestamp/sequence history saved alongside the file.
///
/// Shared between the controlling thread and the driver's capture thread.
/// Every operation serializes on the internal mutex, so `release` can never
/// close the sink under an in-flight `write`; a write that loses the race is
/// dropped, not an error in the stream.
pub struct RecordingSession {
    /// Fast-path gate for the callback bridge; authoritative state is
    /// re-checked under the lock.
    recording: AtomicBool,
    inner: Mutex<Inner>,
}

/// Invariant: `frame_times.len() == frame_numbers.len()` at all times.
#[derive(Default)]
struct Inner {
    sink: Option<Box<dyn VideoSink>>,
    frame_times: Vec<f64>,
    frame_numbers: Vec<u64>,
}

impl RecordingSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            recording: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Open a fresh sink at `path`, closing any previous one and clearing the
    /// frame history. Recording starts disabled.
    pub fn configure(
        &self,
        factory: &dyn SinkFactory,
        path: &Path,
        config: &RecordConfig,
    ) -> Result<()> {
        self.recording.store(false, Ordering::Release);
        let mut inner = self.lock();

        if let Some(mut old) = inner.sink.take() {
            if let Err(e) = old.close() {
                warn!(error = %e, "failed to close previous sink");
            }
        }

        inner.sink = Some(factory.open(path, config)?);
        inner.frame_times.clear();
        inner.frame_numbers.clear();
        info!(path = %path.display(), fourcc = %config.fourcc, fps = config.fps,
              "recording session configured");
        Ok(())
    }

    /// Toggle whether writes are accepted. Fails with `NotConfigured` when no
    /// sink is open.
    pub fn set_recording(&self, enabled: bool) -> Result<()> {
        let inner = self.lock();
        if inner.sink.is_none() {
            return Err(CaptureError::NotConfigured);
        }
        self.recording.store(enabled, Ordering::Release);
        info!(enabled, "recording toggled");
        Ok(())
    }

    /// Lock-free view of the enabled flag, for the bridge's cheap gate.
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Whether a sink is currently open.
    pub fn is_configured(&self) -> bool {
        self.lock().sink.is_some()
    }

    /// Encode `frame` and append its timestamp and sequence number.
    ///
    /// The sink-open and recording-enabled checks and the encode happen under
    /// one lock acquisition, so a concurrent `release` either completes
    /// before (the write is rejected) or waits until the write finishes.
    /// The history entry is appended only after a successful encode; a failed
    /// encode leaves no orphaned timestamp.
    pub fn write(&self, frame: &Frame, timestamp: f64, sequence: u64) -> Result<()> {
        let mut inner = self.lock();

        let Some(sink) = inner.sink.as_mut() else {
            return Err(CaptureError::NotConfigured);
        };
        if !self.recording.load(Ordering::Acquire) {
            return Err(CaptureError::NotRecording);
        }

        sink.write_frame(frame)?;
        inner.frame_times.push(timestamp);
        inner.frame_numbers.push(sequence);
        Ok(())
    }

    /// Close the sink and hand back the accumulated `(timestamps,
    /// sequence_numbers)` history, clearing internal state for reuse.
    /// Idempotent: an unconfigured session yields an empty pair.
    pub fn release(&self) -> (Vec<f64>, Vec<u64>) {
        self.recording.store(false, Ordering::Release);
        let mut inner = self.lock();

        if let Some(mut sink) = inner.sink.take() {
            if let Err(e) = sink.close() {
                warn!(error = %e, "failed to close sink on release");
            }
        }

        let times = std::mem::take(&mut inner.frame_times);
        let numbers = std::mem::take(&mut inner.frame_numbers);
        debug!(frames = times.len(), "recording session released");
        (times, numbers)
    }

    /// Number of frames recorded so far.
    pub fn frame_count(&self) -> usize {
        self.lock().frame_times.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicking sink must not wedge the session; the inner state is
        // still consistent because history is only pushed after the encode.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RecordingSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::capture::frame::FrameMetadata;
    use crate::record::sink::{FourCc, MemorySinkFactory};

    fn test_frame(sequence: u64) -> Frame {
        Frame {
            data: Bytes::from(vec![1u8; 64]),
            meta: Arc::new(FrameMetadata {
                sequence,
                width: 8,
                height: 8,
                bytes_per_pixel: 1,
            }),
        }
    }

    fn record_config() -> RecordConfig {
        RecordConfig {
            fourcc: FourCc::MJPG,
            fps: 30.0,
            width: 8,
            height: 8,
        }
    }

    #[derive(Debug)]
    struct FailingSink;

    impl VideoSink for FailingSink {
        fn write_frame(&mut self, _frame: &Frame) -> Result<()> {
            Err(CaptureError::Device("encoder rejected frame".into()))
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct FailingSinkFactory;

    impl SinkFactory for FailingSinkFactory {
        fn open(&self, _path: &Path, _config: &RecordConfig) -> Result<Box<dyn VideoSink>> {
            Ok(Box::new(FailingSink))
        }
    }

    #[test]
    fn write_before_configure_is_not_configured() {
        let session = RecordingSession::new();
        let err = session.write(&test_frame(1), 0.0, 1).unwrap_err();
        assert!(matches!(err, CaptureError::NotConfigured));
        assert_eq!(session.frame_count(), 0);
    }

    #[test]
    fn set_recording_without_sink_is_not_configured() {
        let session = RecordingSession::new();
        let err = session.set_recording(true).unwrap_err();
        assert!(matches!(err, CaptureError::NotConfigured));
    }

    #[test]
    fn disabled_writes_leave_history_empty() {
        let factory = MemorySinkFactory::new();
        let session = RecordingSession::new();
        session
            .configure(&factory, Path::new("out.avi"), &record_config())
            .expect("configure");

        for i in 0..5 {
            let err = session.write(&test_frame(i), f64::from(i as u32), i).unwrap_err();
            assert!(matches!(err, CaptureError::NotRecording));
        }

        let (times, numbers) = session.release();
        assert!(times.is_empty());
        assert!(numbers.is_empty());
        let video = factory.video("out.avi").expect("stored");
        assert!(video.frame_lens.is_empty());
    }

    #[test]
    fn histories_stay_paired_after_every_write() {
        let factory = MemorySinkFactory::new();
        let session = RecordingSession::new();
        session
            .configure(&factory, Path::new("out.avi"), &record_config())
            .expect("configure");
        session.set_recording(true).expect("enable");

        for i in 1..=10u64 {
            session
                .write(&test_frame(i), i as f64 / 30.0, i)
                .expect("write");
            assert_eq!(session.frame_count(), i as usize);
        }

        let (times, numbers) = session.release();
        assert_eq!(times.len(), numbers.len());
        assert_eq!(times.len(), 10);
    }

    #[test]
    fn release_returns_recorded_history_and_sink_frames() {
        let factory = MemorySinkFactory::new();
        let session = RecordingSession::new();
        session
            .configure(&factory, Path::new("a.avi"), &record_config())
            .expect("configure");
        session.set_recording(true).expect("enable");

        session.write(&test_frame(1), 1.0, 1).expect("write");
        session.write(&test_frame(2), 1.033, 2).expect("write");

        let (times, numbers) = session.release();
        assert_eq!(times, vec![1.0, 1.033]);
        assert_eq!(numbers, vec![1, 2]);

        let video = factory.video("a.avi").expect("stored");
        assert_eq!(video.frame_lens.len(), 2);
        assert!(video.closed);
    }

    #[test]
    fn release_is_idempotent() {
        let session = RecordingSession::new();
        let (times, numbers) = session.release();
        assert!(times.is_empty() && numbers.is_empty());
        let (times, numbers) = session.release();
        assert!(times.is_empty() && numbers.is_empty());
    }

    #[test]
    fn reuse_after_release_has_no_residue() {
        let factory = MemorySinkFactory::new();
        let session = RecordingSession::new();

        session
            .configure(&factory, Path::new("first.avi"), &record_config())
            .expect("configure");
        session.set_recording(true).expect("enable");
        session.write(&test_frame(1), 0.1, 1).expect("write");
        let _ = session.release();

        session
            .configure(&factory, Path::new("second.avi"), &record_config())
            .expect("reconfigure");
        session.set_recording(true).expect("enable");
        session.write(&test_frame(9), 9.0, 9).expect("write");

        let (times, numbers) = session.release();
        assert_eq!(times, vec![9.0]);
        assert_eq!(numbers, vec![9]);
    }

    #[test]
    fn failed_encode_leaves_no_orphaned_timestamp() {
        let session = RecordingSession::new();
        session
            .configure(&FailingSinkFactory, Path::new("bad.avi"), &record_config())
            .expect("configure");
        session.set_recording(true).expect("enable");

        let err = session.write(&test_frame(1), 0.5, 1).unwrap_err();
        assert!(matches!(err, CaptureError::Device(_)));

        let (times, numbers) = session.release();
        assert!(times.is_empty());
        assert!(numbers.is_empty());
    }

    #[test]
    fn writes_rejected_after_recording_disabled() {
        let factory = MemorySinkFactory::new();
        let session = RecordingSession::new();
        session
            .configure(&factory, Path::new("out.avi"), &record_config())
            .expect("configure");
        session.set_recording(true).expect("enable");
        session.write(&test_frame(1), 0.0, 1).expect("write");
        session.set_recording(false).expect("disable");

        let err = session.write(&test_frame(2), 0.1, 2).unwrap_err();
        assert!(matches!(err, CaptureError::NotRecording));
        assert_eq!(session.frame_count(), 1);
    }
}
