pub mod capture;
pub mod grabber;
pub mod record;
pub mod session;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use capture::{CallbackBridge, Frame, FrameView, PixelFormat};
pub use grabber::{FrameGeometry, FrameGrabber, MockGrabber, V4l2Grabber};
pub use record::{MemorySinkFactory, RecordConfig, RecordingSession, SinkFactory, VideoSink};
pub use session::{CameraSession, CameraState};

/// Error type for capture and recording operations
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Device open/property/streaming call failed; surfaced to the caller.
    #[error("device error: {0}")]
    Device(String),

    /// The video writer could not be created (bad path, unsupported codec/dims).
    #[error("failed to open video sink {path}: {reason}")]
    SinkOpen { path: String, reason: String },

    /// A recording operation was issued before any sink was configured.
    #[error("recording session has no open sink")]
    NotConfigured,

    /// A write arrived while recording was disabled; the frame is dropped.
    #[error("recording is not enabled")]
    NotRecording,

    /// Driver buffer length disagrees with the advertised frame geometry.
    #[error(
        "frame buffer geometry mismatch: {actual} bytes for \
         {width}x{height}x{bytes_per_pixel} (expected {expected})"
    )]
    InvalidGeometry {
        expected: usize,
        actual: usize,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
    },

    /// Error caught at the frame-ready callback boundary; never crosses into driver code.
    #[error("fault inside frame-ready callback: {0}")]
    CallbackFault(String),

    /// Crop rectangle falls outside the native sensor frame.
    #[error("crop {crop:?} exceeds native frame {native_width}x{native_height}")]
    InvalidCrop {
        crop: CropRegion,
        native_width: u32,
        native_height: u32,
    },

    /// Operation not permitted in the session's current state.
    #[error("{op} is not valid in state {state}")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for capture and recording operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// System configuration, constructed once and threaded through the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    pub record: RecordSettings,
}

/// Camera device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Device path ("/dev/video0") or "mock" for the software grabber.
    pub device: String,
    pub pixel_format: PixelFormat,
    pub rotation: Rotation,
    pub crop: CropRegion,
    /// Absolute exposure in [0, 1]; out-of-range values are clamped.
    pub exposure: f64,
    pub gain: i64,
    pub fps: f64,
}

/// Target container settings for triggered recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSettings {
    /// Four-character codec code, e.g. "MJPG".
    pub fourcc: String,
    pub fps: f64,
}

/// Sensor-relative crop rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    pub top: u32,
    pub left: u32,
    pub width: u32,
    pub height: u32,
}

/// Frame rotation applied by the driver's rotate filter.
/// `None` disables the filter entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub const fn degrees(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Cw90 => 90,
            Self::Cw180 => 180,
            Self::Cw270 => 270,
        }
    }

    /// Whether this rotation exchanges frame width and height.
    pub const fn swaps_axes(self) -> bool {
        matches!(self, Self::Cw90 | Self::Cw270)
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(degrees: u16) -> std::result::Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Self::None),
            90 => Ok(Self::Cw90),
            180 => Ok(Self::Cw180),
            270 => Ok(Self::Cw270),
            other => Err(format!("rotation must be 0/90/180/270, got {other}")),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees() as u16
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| CaptureError::Config(e.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                device: "mock".into(),
                pixel_format: PixelFormat::Y800,
                rotation: Rotation::None,
                crop: CropRegion {
                    top: 0,
                    left: 0,
                    width: 1024,
                    height: 768,
                },
                exposure: 0.01,
                gain: 0,
                fps: 30.0,
            },
            record: RecordSettings {
                fourcc: "MJPG".into(),
                fps: 30.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_from_degrees() {
        assert_eq!(Rotation::try_from(0), Ok(Rotation::None));
        assert_eq!(Rotation::try_from(270), Ok(Rotation::Cw270));
        assert!(Rotation::try_from(45).is_err());
    }

    #[test]
    fn rotation_axis_swap() {
        assert!(Rotation::Cw90.swaps_axes());
        assert!(Rotation::Cw270.swaps_axes());
        assert!(!Rotation::None.swaps_axes());
        assert!(!Rotation::Cw180.swaps_axes());
    }

    #[test]
    fn default_config_is_consistent() {
        let config = Config::default();
        assert_eq!(config.camera.rotation, Rotation::None);
        assert_eq!(config.record.fourcc.len(), 4);
    }
}
