//! Frame-grabber driver abstraction.
//!
//! [`FrameGrabber`] mirrors the vendor SDK surface the session consumes:
//! device lifecycle, the frame-filter graph, property classes, live-mode
//! control and the frame-ready callback hook. Two backends ship: a software
//! [`MockGrabber`] with its own driver thread and a V4L2-backed
//! [`V4l2Grabber`] for free-run devices.

pub mod mock;
pub mod v4l2;

use std::sync::Arc;

use crate::Result;

pub use mock::{MockGrabber, MockTrigger};
pub use v4l2::V4l2Grabber;

/// Buffer geometry reported by the driver for the current video format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    /// Total driver buffer size in bytes.
    pub buffer_size: usize,
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
}

impl FrameGeometry {
    /// Expected byte length of one frame.
    pub const fn frame_len(&self) -> usize {
        (self.width * self.height * self.bytes_per_pixel) as usize
    }
}

/// Property value classes exposed by the driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    /// On/off switch.
    Switch(bool),
    /// Absolute floating-point value.
    Absolute(f64),
    /// Raw integer value.
    Value(i64),
}

impl PropertyValue {
    pub const fn as_switch(self) -> Option<bool> {
        match self {
            Self::Switch(on) => Some(on),
            _ => None,
        }
    }

    pub const fn as_absolute(self) -> Option<f64> {
        match self {
            Self::Absolute(value) => Some(value),
            _ => None,
        }
    }

    pub const fn as_value(self) -> Option<i64> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// Handle to a frame filter created on the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterHandle(pub(crate) u32);

/// Proof that the frame-ready callback has been registered on a grabber.
///
/// Issued at most once per grabber instance; a second registration attempt is
/// rejected by the driver, so holding the token is holding the registration.
/// The token is deliberately not `Clone`.
#[derive(Debug)]
pub struct RegistrationToken {
    _private: (),
}

impl RegistrationToken {
    pub(crate) const fn new() -> Self {
        Self { _private: () }
    }
}

/// Frame-ready callback invoked on the driver's capture thread, once per
/// completed frame, with the raw buffer and the driver-assigned sequence
/// number. The buffer is only valid for the duration of the call.
pub type FrameReadyCallback = Arc<dyn Fn(&[u8], u64) + Send + Sync>;

/// Property and filter names understood by the backends
pub mod names {
    pub const TRIGGER: &str = "Trigger";
    pub const ENABLE: &str = "Enable";
    pub const POLARITY: &str = "Polarity";
    pub const EXPOSURE: &str = "Exposure";
    pub const GAIN: &str = "Gain";
    pub const VALUE: &str = "Value";
    pub const FLIP_VERTICAL: &str = "Flip Vertical";
    pub const PARTIAL_SCAN: &str = "Partial scan";
    pub const AUTO_CENTER: &str = "Auto-center";
    pub const X_OFFSET: &str = "X Offset";
    pub const Y_OFFSET: &str = "Y Offset";

    pub const FILTER_ROTATE: &str = "Rotate Flip";
    pub const ROTATION_ANGLE: &str = "Rotation Angle";
    pub const FILTER_ROI: &str = "ROI";
    pub const ROI_TOP: &str = "Top";
    pub const ROI_LEFT: &str = "Left";
    pub const ROI_WIDTH: &str = "Width";
    pub const ROI_HEIGHT: &str = "Height";
}

/// Abstraction over the vendor frame-grabber driver.
///
/// All methods are issued from the controlling thread; the driver delivers
/// frames on its own capture thread through the registered callback.
pub trait FrameGrabber: Send {
    /// Open the device. Idempotent for an already-open device.
    fn open(&mut self) -> Result<()>;

    /// Close the device, stopping any live stream.
    fn close(&mut self);

    /// Create a frame filter by name, returning its handle.
    fn create_filter(&mut self, name: &str) -> Result<FilterHandle>;

    /// Attach a created filter to the frame path.
    fn add_filter(&mut self, filter: FilterHandle) -> Result<()>;

    /// Set a parameter on a created filter.
    fn set_filter_parameter(
        &mut self,
        filter: FilterHandle,
        key: &str,
        value: PropertyValue,
    ) -> Result<()>;

    fn set_property(&mut self, category: &str, name: &str, value: PropertyValue) -> Result<()>;

    fn get_property(&self, category: &str, name: &str) -> Result<PropertyValue>;

    /// Start live streaming, optionally with the driver's own preview display.
    fn start_live(&mut self, show_display: bool) -> Result<()>;

    /// Pause streaming without tearing down the stream.
    fn suspend_live(&mut self) -> Result<()>;

    /// Stop streaming.
    fn stop_live(&mut self);

    /// Toggle free-run continuous delivery (as opposed to triggered delivery).
    /// The device requires live mode to be suspended around this call.
    fn set_continuous_mode(&mut self, enabled: bool) -> Result<()>;

    /// Register the frame-ready callback. Exactly once per grabber: a second
    /// call fails with a device error instead of corrupting driver state.
    fn register_frame_ready(&mut self, callback: FrameReadyCallback) -> Result<RegistrationToken>;

    /// Buffer geometry of frames as delivered to the callback (post-filter).
    fn frame_geometry(&self) -> Result<FrameGeometry>;

    /// Native sensor geometry before any filter is applied.
    fn native_geometry(&self) -> Result<FrameGeometry>;

    fn set_frame_rate(&mut self, fps: f64) -> Result<()>;

    fn frame_rate(&self) -> Result<f64>;
}
