//! Video sink collaborator: the external encoder behind a trait seam.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::capture::Frame;
use crate::{CaptureError, Result};

/// Four-character codec code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Motion JPEG.
    pub const MJPG: Self = Self::new(b"MJPG");

    /// Parse a 4-character ASCII code such as "MJPG".
    pub fn parse(code: &str) -> Result<Self> {
        let bytes = code.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(u8::is_ascii_graphic) {
            return Err(CaptureError::Config(format!(
                "fourcc must be 4 printable ASCII characters, got {code:?}"
            )));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", byte as char)?;
        }
        Ok(())
    }
}

/// Parameters a sink is opened with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordConfig {
    pub fourcc: FourCc,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

/// An open video writer.
///
/// Implementations do not need to be thread-safe; the recording session
/// serializes all access.
pub trait VideoSink: Send + std::fmt::Debug {
    /// Encode one frame into the container.
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Finalize the container. Called exactly once by the session.
    fn close(&mut self) -> Result<()>;
}

/// Opens video writers; the seam a real encoder plugs into.
pub trait SinkFactory: Send + Sync {
    fn open(&self, path: &Path, config: &RecordConfig) -> Result<Box<dyn VideoSink>>;
}

/// In-memory record of one "file" written through a [`MemorySink`]
#[derive(Debug, Clone)]
pub struct StoredVideo {
    pub path: String,
    pub config: RecordConfig,
    /// Byte length of each frame written, in write order.
    pub frame_lens: Vec<usize>,
    pub closed: bool,
    /// Writes that arrived after close. Always zero when the session
    /// serializes correctly; tests assert on it.
    pub writes_after_close: u32,
}

/// Sink factory that records everything in memory.
///
/// Stands in for the encoder in tests and the demo binary: every opened sink
/// appends to a shared log the factory hands back for inspection.
#[derive(Clone, Default)]
pub struct MemorySinkFactory {
    files: Arc<Mutex<Vec<StoredVideo>>>,
}

impl MemorySinkFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn videos(&self) -> Vec<StoredVideo> {
        self.files.lock().map(|files| files.clone()).unwrap_or_default()
    }

    /// The most recent video opened at `path`.
    pub fn video(&self, path: &str) -> Option<StoredVideo> {
        self.files
            .lock()
            .ok()
            .and_then(|files| files.iter().rev().find(|v| v.path == path).cloned())
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(&self, path: &Path, config: &RecordConfig) -> Result<Box<dyn VideoSink>> {
        if path.as_os_str().is_empty() {
            return Err(CaptureError::SinkOpen {
                path: String::new(),
                reason: "empty path".into(),
            });
        }
        if config.width == 0 || config.height == 0 || config.fps <= 0.0 {
            return Err(CaptureError::SinkOpen {
                path: path.display().to_string(),
                reason: format!(
                    "unsupported parameters: {}x{} @ {} fps",
                    config.width, config.height, config.fps
                ),
            });
        }

        let mut files = self.files.lock().map_err(|_| CaptureError::SinkOpen {
            path: path.display().to_string(),
            reason: "sink log poisoned".into(),
        })?;
        files.push(StoredVideo {
            path: path.display().to_string(),
            config: *config,
            frame_lens: Vec::new(),
            closed: false,
            writes_after_close: 0,
        });
        let index = files.len() - 1;
        info!(path = %path.display(), fourcc = %config.fourcc, "memory sink opened");

        Ok(Box::new(MemorySink {
            files: Arc::clone(&self.files),
            index,
        }))
    }
}

/// Writer end of a [`MemorySinkFactory`] entry
#[derive(Debug)]
pub struct MemorySink {
    files: Arc<Mutex<Vec<StoredVideo>>>,
    index: usize,
}

impl VideoSink for MemorySink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| CaptureError::Device("sink log poisoned".into()))?;
        let Some(entry) = files.get_mut(self.index) else {
            return Err(CaptureError::Device("sink log entry vanished".into()));
        };
        if entry.closed {
            entry.writes_after_close += 1;
            return Err(CaptureError::Device("frame written after close".into()));
        }
        entry.frame_lens.push(frame.data.len());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| CaptureError::Device("sink log poisoned".into()))?;
        if let Some(entry) = files.get_mut(self.index) {
            entry.closed = true;
            debug!(path = %entry.path, frames = entry.frame_lens.len(), "memory sink closed");
        }
        Ok(())
    }
}
