//! Camera session: device configuration and the triggered-capture state machine.
//!
//! Owns the grabber handle, exactly one recording session at a time, and the
//! one-shot callback registration. All driver reconfiguration happens here so
//! transitions stay guarded instead of scattered across boolean flags.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::capture::CallbackBridge;
use crate::grabber::{names, FrameGeometry, FrameGrabber, PropertyValue, RegistrationToken};
use crate::record::{FourCc, RecordConfig, RecordingSession, SinkFactory};
use crate::{CaptureError, Config, CropRegion, Result, Rotation};

/// Capture states. Transitions:
/// `Idle -> Live -> Armed -> Recording -> Armed -> Live`,
/// plus `set_crop` from `Idle`/`Live` back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    /// Device open and configured, not streaming.
    Idle,
    /// Free-run continuous streaming.
    Live,
    /// Hardware trigger enabled, recording target armed.
    Armed,
    /// Triggered frames are being persisted.
    Recording,
}

impl CameraState {
    const fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Live => "Live",
            Self::Armed => "Armed",
            Self::Recording => "Recording",
        }
    }
}

/// A configured camera with a triggered-recording pipeline
pub struct CameraSession {
    grabber: Box<dyn FrameGrabber>,
    config: Config,
    bridge: Arc<CallbackBridge>,
    sinks: Arc<dyn SinkFactory>,
    /// The one recording target; replaced wholesale on re-arm.
    session: Arc<RecordingSession>,
    registration: Option<RegistrationToken>,
    show_display: bool,
    state: CameraState,
}

impl std::fmt::Debug for CameraSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraSession")
            .field("config", &self.config)
            .field("show_display", &self.show_display)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CameraSession {
    /// Open the device, apply rotate/crop filters and initial properties.
    ///
    /// The crop rectangle must lie within the native sensor frame (after
    /// rotation, since the rotate filter runs first in the chain).
    pub fn new(
        grabber: Box<dyn FrameGrabber>,
        config: Config,
        sinks: Arc<dyn SinkFactory>,
    ) -> Result<Self> {
        let mut session = Self {
            grabber,
            config,
            bridge: Arc::new(CallbackBridge::new()),
            sinks,
            session: Arc::new(RecordingSession::new()),
            registration: None,
            show_display: false,
            state: CameraState::Idle,
        };

        session.grabber.open()?;
        session.validate_crop(session.config.camera.crop)?;
        session.apply_filters()?;
        session.grabber.set_frame_rate(session.config.camera.fps)?;

        let exposure = session.config.camera.exposure;
        let gain = session.config.camera.gain;
        session.set_exposure(exposure);
        session.set_gain(gain);

        info!(device = %session.config.camera.device, "camera session ready");
        Ok(session)
    }

    pub const fn state(&self) -> CameraState {
        self.state
    }

    pub const fn crop(&self) -> CropRegion {
        self.config.camera.crop
    }

    /// Post-filter buffer geometry as the driver will deliver it.
    pub fn frame_geometry(&self) -> Result<FrameGeometry> {
        self.grabber.frame_geometry()
    }

    /// Frame dimensions of the current video format.
    pub fn video_dimensions(&self) -> Result<(u32, u32)> {
        let geometry = self.grabber.frame_geometry()?;
        Ok((geometry.width, geometry.height))
    }

    /// Bridge statistics: (frames written, frames dropped, faults).
    pub fn bridge_stats(&self) -> (u64, u64, u64) {
        self.bridge.stats()
    }

    /// The frame-ready bridge, shared with the driver's capture thread.
    pub fn bridge(&self) -> Arc<CallbackBridge> {
        Arc::clone(&self.bridge)
    }

    /// `Idle -> Live`: reset flip, enable free-run, disable trigger, start.
    pub fn start_live(&mut self, show_display: bool) -> Result<()> {
        self.require(&[CameraState::Idle], "start_live")?;
        self.grabber.set_property(
            names::FLIP_VERTICAL,
            names::ENABLE,
            PropertyValue::Switch(false),
        )?;
        self.grabber.set_continuous_mode(true)?;
        self.grabber
            .set_property(names::TRIGGER, names::ENABLE, PropertyValue::Switch(false))?;
        self.grabber.start_live(show_display)?;
        self.show_display = show_display;
        self.state = CameraState::Live;
        info!("live streaming started");
        Ok(())
    }

    /// `Live -> Armed`: enable the hardware trigger and configure a fresh
    /// recording target at `path`, with dimensions derived from the current
    /// buffer geometry. The frame-ready callback is registered on the first
    /// arm and never again.
    pub fn arm_trigger(&mut self, path: &Path) -> Result<()> {
        self.require(&[CameraState::Live], "arm_trigger")?;

        self.grabber
            .set_property(names::TRIGGER, names::ENABLE, PropertyValue::Switch(true))?;

        if self.registration.is_none() {
            let callback = self.bridge.frame_ready_callback();
            self.registration = Some(self.grabber.register_frame_ready(callback)?);
        }

        // Replacing the target releases the prior sink first.
        if self.session.is_configured() {
            let (times, _) = self.session.release();
            warn!(
                frames = times.len(),
                "previous recording target released while arming"
            );
        }

        let geometry = self.grabber.frame_geometry()?;
        let record = RecordConfig {
            fourcc: FourCc::parse(&self.config.record.fourcc)?,
            fps: self.config.record.fps,
            width: geometry.width,
            height: geometry.height,
        };

        self.session = Arc::new(RecordingSession::new());
        self.session.configure(&*self.sinks, path, &record)?;
        self.bridge.install(Arc::clone(&self.session), geometry);

        self.state = CameraState::Armed;
        info!(path = %path.display(), width = geometry.width, height = geometry.height,
              "trigger armed");
        Ok(())
    }

    /// `Armed -> Recording`: triggered frames start persisting.
    pub fn start_recording(&mut self) -> Result<()> {
        self.require(&[CameraState::Armed], "start_recording")?;
        self.session.set_recording(true)?;
        self.state = CameraState::Recording;
        info!("recording enabled");
        Ok(())
    }

    /// `Recording -> Armed`: stop accepting frames, close the sink and hand
    /// back the per-frame `(timestamps, sequence_numbers)` history. Any flip
    /// transform applied during recording is reverted.
    pub fn stop_recording(&mut self) -> Result<(Vec<f64>, Vec<u64>)> {
        self.require(&[CameraState::Recording], "stop_recording")?;

        self.session.set_recording(false)?;
        let history = self.session.release();

        if let Err(e) = self.grabber.set_property(
            names::FLIP_VERTICAL,
            names::ENABLE,
            PropertyValue::Switch(false),
        ) {
            warn!(error = %e, "failed to revert flip after recording");
        }

        self.state = CameraState::Armed;
        info!(frames = history.0.len(), "recording stopped");
        Ok(history)
    }

    /// `Armed -> Live`: disable the trigger and resume free-run streaming.
    /// The device requires live mode to be suspended around the continuous
    /// mode change.
    pub fn disarm_trigger(&mut self) -> Result<()> {
        self.require(&[CameraState::Armed], "disarm_trigger")?;

        self.bridge.clear();
        if self.session.is_configured() {
            let (times, _) = self.session.release();
            debug!(frames = times.len(), "unrecorded target released on disarm");
        }

        self.grabber.suspend_live()?;
        self.grabber.set_continuous_mode(true)?;
        self.grabber
            .set_property(names::TRIGGER, names::ENABLE, PropertyValue::Switch(false))?;
        self.grabber.start_live(self.show_display)?;

        self.state = CameraState::Live;
        info!("trigger disarmed, free-run streaming resumed");
        Ok(())
    }

    /// Change the crop rectangle. Only valid from `Idle`/`Live`: the device
    /// is fully closed and reopened with filters reapplied, and is left in
    /// `Idle` - streaming must be restarted explicitly.
    pub fn set_crop(&mut self, crop: CropRegion) -> Result<()> {
        self.require(&[CameraState::Idle, CameraState::Live], "set_crop")?;
        self.validate_crop(crop)?;

        self.grabber.stop_live();
        self.grabber.close();
        self.grabber.open()?;

        self.config.camera.crop = crop;
        self.apply_filters()?;
        self.grabber.set_frame_rate(self.config.camera.fps)?;
        let exposure = self.config.camera.exposure;
        let gain = self.config.camera.gain;
        self.set_exposure(exposure);
        self.set_gain(gain);

        self.state = CameraState::Idle;
        info!(?crop, "device reopened with new crop; restart streaming to resume");
        Ok(())
    }

    /// Set absolute exposure, clamped to `[0, 1]`. Driver rejection is a
    /// logged no-op; live hardware control prefers safe defaults over faults.
    pub fn set_exposure(&mut self, value: f64) {
        let clamped = value.clamp(0.0, 1.0);
        match self.grabber.set_property(
            names::EXPOSURE,
            names::VALUE,
            PropertyValue::Absolute(clamped),
        ) {
            Ok(()) => self.config.camera.exposure = clamped,
            Err(e) => warn!(error = %e, value = clamped, "exposure not applied"),
        }
    }

    pub fn exposure(&self) -> Result<f64> {
        self.property_absolute(names::EXPOSURE, names::VALUE)
    }

    /// Set sensor gain. Out-of-range values are a logged no-op.
    pub fn set_gain(&mut self, value: i64) {
        match self.grabber.set_property(
            names::GAIN,
            names::VALUE,
            PropertyValue::Absolute(value as f64),
        ) {
            Ok(()) => self.config.camera.gain = value,
            Err(e) => warn!(error = %e, value, "gain not applied"),
        }
    }

    pub fn gain(&self) -> Result<i64> {
        Ok(self.property_absolute(names::GAIN, names::VALUE)?.round() as i64)
    }

    pub fn set_frame_rate(&mut self, fps: f64) -> Result<()> {
        self.grabber.set_frame_rate(fps)?;
        self.config.camera.fps = fps;
        Ok(())
    }

    pub fn frame_rate(&self) -> Result<f64> {
        self.grabber.frame_rate()
    }

    pub fn trigger_polarity(&self) -> Result<bool> {
        self.property_switch(names::TRIGGER, names::POLARITY)
    }

    /// Set trigger polarity and return the value read back from the device.
    pub fn set_trigger_polarity(&mut self, value: bool) -> Result<bool> {
        self.grabber
            .set_property(names::TRIGGER, names::POLARITY, PropertyValue::Switch(value))?;
        self.trigger_polarity()
    }

    pub fn set_partial_scan(&mut self, x_offset: Option<i64>, y_offset: Option<i64>) -> Result<()> {
        if let Some(x) = x_offset {
            self.grabber
                .set_property(names::PARTIAL_SCAN, names::X_OFFSET, PropertyValue::Value(x))?;
        }
        if let Some(y) = y_offset {
            self.grabber
                .set_property(names::PARTIAL_SCAN, names::Y_OFFSET, PropertyValue::Value(y))?;
        }
        Ok(())
    }

    pub fn partial_scan(&self) -> Result<(i64, i64)> {
        let x = self
            .grabber
            .get_property(names::PARTIAL_SCAN, names::X_OFFSET)?
            .as_value()
            .ok_or_else(|| CaptureError::Device("X Offset is not an integer".into()))?;
        let y = self
            .grabber
            .get_property(names::PARTIAL_SCAN, names::Y_OFFSET)?
            .as_value()
            .ok_or_else(|| CaptureError::Device("Y Offset is not an integer".into()))?;
        Ok((x, y))
    }

    pub fn set_auto_center(&mut self, enabled: bool) -> Result<()> {
        self.grabber.set_property(
            names::PARTIAL_SCAN,
            names::AUTO_CENTER,
            PropertyValue::Switch(enabled),
        )
    }

    pub fn set_flip_vertical(&mut self, enabled: bool) -> Result<()> {
        debug!(enabled, "flip vertical");
        self.grabber.set_property(
            names::FLIP_VERTICAL,
            names::ENABLE,
            PropertyValue::Switch(enabled),
        )
    }

    pub fn flip_vertical(&self) -> Result<bool> {
        self.property_switch(names::FLIP_VERTICAL, names::ENABLE)
    }

    /// Stop streaming and close the device. Any active recording is released.
    pub fn close(&mut self) {
        self.bridge.clear();
        if self.session.is_configured() {
            let (times, _) = self.session.release();
            warn!(frames = times.len(), "recording released on close");
        }
        self.grabber.stop_live();
        self.grabber.close();
        self.state = CameraState::Idle;
        info!("camera session closed");
    }

    fn property_switch(&self, category: &str, name: &str) -> Result<bool> {
        self.grabber
            .get_property(category, name)?
            .as_switch()
            .ok_or_else(|| CaptureError::Device(format!("{category}/{name} is not a switch")))
    }

    fn property_absolute(&self, category: &str, name: &str) -> Result<f64> {
        self.grabber
            .get_property(category, name)?
            .as_absolute()
            .ok_or_else(|| {
                CaptureError::Device(format!("{category}/{name} is not an absolute value"))
            })
    }

    fn require(&self, allowed: &[CameraState], op: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CaptureError::InvalidState {
                op,
                state: self.state.name(),
            })
        }
    }

    /// Crop must fit the native frame, in post-rotation coordinates since the
    /// rotate filter runs before the ROI filter.
    fn validate_crop(&self, crop: CropRegion) -> Result<()> {
        let native = self.grabber.native_geometry()?;
        let (mut width, mut height) = (native.width, native.height);
        if self.config.camera.rotation.swaps_axes() {
            std::mem::swap(&mut width, &mut height);
        }

        let fits = crop.width > 0
            && crop.height > 0
            && crop.left.checked_add(crop.width).is_some_and(|r| r <= width)
            && crop.top.checked_add(crop.height).is_some_and(|b| b <= height);
        if fits {
            Ok(())
        } else {
            Err(CaptureError::InvalidCrop {
                crop,
                native_width: width,
                native_height: height,
            })
        }
    }

    fn apply_filters(&mut self) -> Result<()> {
        if self.config.camera.rotation != Rotation::None {
            let rotate = self.grabber.create_filter(names::FILTER_ROTATE)?;
            self.grabber.add_filter(rotate)?;
            self.grabber.set_filter_parameter(
                rotate,
                names::ROTATION_ANGLE,
                PropertyValue::Value(self.config.camera.rotation.degrees()),
            )?;
        }

        let crop = self.config.camera.crop;
        let roi = self.grabber.create_filter(names::FILTER_ROI)?;
        self.grabber.add_filter(roi)?;
        for (key, value) in [
            (names::ROI_TOP, crop.top),
            (names::ROI_LEFT, crop.left),
            (names::ROI_HEIGHT, crop.height),
            (names::ROI_WIDTH, crop.width),
        ] {
            self.grabber
                .set_filter_parameter(roi, key, PropertyValue::Value(i64::from(value)))?;
        }
        Ok(())
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.bridge.clear();
        if self.session.is_configured() {
            let _ = self.session.release();
        }
        self.grabber.stop_live();
        self.grabber.close();
    }
}
