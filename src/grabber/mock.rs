//! Software frame grabber for development and testing without hardware.
//!
//! Runs a real driver thread that paces synthetic frames at the configured
//! rate, so callback ordering and threading behave like the vendor stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{
    names, FilterHandle, FrameGeometry, FrameGrabber, FrameReadyCallback, PropertyValue,
    RegistrationToken,
};
use crate::{CaptureError, Result};

enum DriverEvent {
    TriggerPulse,
    Shutdown,
}

/// Mock grabber with a software driver thread
pub struct MockGrabber {
    shared: Arc<DriverShared>,
    events: flume::Sender<DriverEvent>,
    worker: Option<JoinHandle<()>>,
    open: bool,
    native: FrameGeometry,
    fps: f64,
    filters: Vec<MockFilter>,
    next_filter: u32,
    properties: HashMap<(String, String), PropertyValue>,
}

struct MockFilter {
    handle: FilterHandle,
    name: String,
    params: HashMap<String, PropertyValue>,
    attached: bool,
}

/// State shared with the driver thread
struct DriverShared {
    live: AtomicBool,
    continuous: AtomicBool,
    trigger_enabled: AtomicBool,
    /// Driver-assigned frame counter; advances every frame period whether or
    /// not a frame is delivered, so delivered sequences may have gaps.
    sequence: AtomicU64,
    frame_period_us: AtomicU64,
    callback: Mutex<Option<FrameReadyCallback>>,
    geometry: Mutex<FrameGeometry>,
}

impl MockGrabber {
    /// Create a mock grabber with the given native sensor geometry.
    pub fn new(native: FrameGeometry) -> Self {
        let shared = Arc::new(DriverShared {
            live: AtomicBool::new(false),
            continuous: AtomicBool::new(true),
            trigger_enabled: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            frame_period_us: AtomicU64::new(33_333),
            callback: Mutex::new(None),
            geometry: Mutex::new(native),
        });

        let (events, events_rx) = flume::unbounded();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("mock-grabber".into())
            .spawn(move || driver_loop(&worker_shared, &events_rx))
            .ok();
        if worker.is_none() {
            warn!("failed to spawn mock driver thread; no frames will be delivered");
        }

        let mut properties = HashMap::new();
        for (category, name, value) in [
            (names::TRIGGER, names::ENABLE, PropertyValue::Switch(false)),
            (names::TRIGGER, names::POLARITY, PropertyValue::Switch(false)),
            (names::EXPOSURE, names::VALUE, PropertyValue::Absolute(0.01)),
            (names::GAIN, names::VALUE, PropertyValue::Absolute(0.0)),
            (
                names::FLIP_VERTICAL,
                names::ENABLE,
                PropertyValue::Switch(false),
            ),
            (
                names::FLIP_VERTICAL,
                names::VALUE,
                PropertyValue::Switch(false),
            ),
            (
                names::PARTIAL_SCAN,
                names::AUTO_CENTER,
                PropertyValue::Switch(true),
            ),
            (names::PARTIAL_SCAN, names::X_OFFSET, PropertyValue::Value(0)),
            (names::PARTIAL_SCAN, names::Y_OFFSET, PropertyValue::Value(0)),
        ] {
            properties.insert((category.to_owned(), name.to_owned()), value);
        }

        Self {
            shared,
            events,
            worker,
            open: false,
            native,
            fps: 30.0,
            filters: Vec::new(),
            next_filter: 0,
            properties,
        }
    }

    /// Default 1024x768 8-bit mono sensor.
    pub fn y800() -> Self {
        Self::new(FrameGeometry {
            buffer_size: 1024 * 768,
            width: 1024,
            height: 768,
            bytes_per_pixel: 1,
        })
    }

    /// Simulate one hardware trigger pulse.
    ///
    /// Delivered asynchronously by the driver thread, like the real edge
    /// input: a pulse while the trigger is disabled or the device is not live
    /// advances the frame counter but delivers nothing.
    pub fn pulse_trigger(&self) {
        if self.events.send(DriverEvent::TriggerPulse).is_err() {
            warn!("mock driver thread is gone; trigger pulse dropped");
        }
    }

    /// External trigger line, usable after the grabber has been boxed into a
    /// session. Pulses behave exactly like [`MockGrabber::pulse_trigger`].
    pub fn trigger_line(&self) -> MockTrigger {
        MockTrigger {
            events: self.events.clone(),
        }
    }

    /// Sequence value the driver counter currently stands at.
    pub fn current_sequence(&self) -> u64 {
        self.shared.sequence.load(Ordering::Relaxed)
    }

    fn require_open(&self, op: &'static str) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(CaptureError::Device(format!("{op}: device is not open")))
        }
    }

    /// Recompute post-filter geometry from the native format and the
    /// attached filter chain, in attach order.
    fn recompute_geometry(&self) {
        let mut geometry = self.native;
        for filter in self.filters.iter().filter(|f| f.attached) {
            match filter.name.as_str() {
                names::FILTER_ROI => {
                    let width = filter
                        .params
                        .get(names::ROI_WIDTH)
                        .and_then(|v| v.as_value());
                    let height = filter
                        .params
                        .get(names::ROI_HEIGHT)
                        .and_then(|v| v.as_value());
                    if let (Some(w), Some(h)) = (width, height) {
                        geometry.width = w.clamp(1, i64::from(geometry.width)) as u32;
                        geometry.height = h.clamp(1, i64::from(geometry.height)) as u32;
                    }
                }
                names::FILTER_ROTATE => {
                    let angle = filter
                        .params
                        .get(names::ROTATION_ANGLE)
                        .and_then(|v| v.as_value())
                        .unwrap_or(0);
                    if angle == 90 || angle == 270 {
                        std::mem::swap(&mut geometry.width, &mut geometry.height);
                    }
                }
                other => debug!(filter = other, "unknown filter ignored by mock"),
            }
        }
        geometry.buffer_size = geometry.frame_len();
        if let Ok(mut shared_geometry) = self.shared.geometry.lock() {
            *shared_geometry = geometry;
        }
    }
}

impl FrameGrabber for MockGrabber {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        info!("mock grabber opened");
        Ok(())
    }

    fn close(&mut self) {
        self.shared.live.store(false, Ordering::Release);
        self.open = false;
        // Closing tears down the filter graph, like the vendor driver.
        self.filters.clear();
        self.recompute_geometry();
        info!("mock grabber closed");
    }

    fn create_filter(&mut self, name: &str) -> Result<FilterHandle> {
        self.require_open("create_filter")?;
        let handle = FilterHandle(self.next_filter);
        self.next_filter += 1;
        self.filters.push(MockFilter {
            handle,
            name: name.to_owned(),
            params: HashMap::new(),
            attached: false,
        });
        Ok(handle)
    }

    fn add_filter(&mut self, filter: FilterHandle) -> Result<()> {
        self.require_open("add_filter")?;
        let entry = self
            .filters
            .iter_mut()
            .find(|f| f.handle == filter)
            .ok_or_else(|| CaptureError::Device(format!("unknown filter handle {filter:?}")))?;
        entry.attached = true;
        self.recompute_geometry();
        Ok(())
    }

    fn set_filter_parameter(
        &mut self,
        filter: FilterHandle,
        key: &str,
        value: PropertyValue,
    ) -> Result<()> {
        self.require_open("set_filter_parameter")?;
        let entry = self
            .filters
            .iter_mut()
            .find(|f| f.handle == filter)
            .ok_or_else(|| CaptureError::Device(format!("unknown filter handle {filter:?}")))?;
        entry.params.insert(key.to_owned(), value);
        self.recompute_geometry();
        Ok(())
    }

    fn set_property(&mut self, category: &str, name: &str, value: PropertyValue) -> Result<()> {
        self.require_open("set_property")?;
        if category == names::TRIGGER && name == names::ENABLE {
            let enabled = value
                .as_switch()
                .ok_or_else(|| CaptureError::Device("Trigger/Enable expects a switch".into()))?;
            self.shared.trigger_enabled.store(enabled, Ordering::Release);
        }
        self.properties
            .insert((category.to_owned(), name.to_owned()), value);
        Ok(())
    }

    fn get_property(&self, category: &str, name: &str) -> Result<PropertyValue> {
        self.require_open("get_property")?;
        self.properties
            .get(&(category.to_owned(), name.to_owned()))
            .copied()
            .ok_or_else(|| CaptureError::Device(format!("unknown property {category}/{name}")))
    }

    fn start_live(&mut self, show_display: bool) -> Result<()> {
        self.require_open("start_live")?;
        self.shared.live.store(true, Ordering::Release);
        info!(show_display, "mock live stream started");
        Ok(())
    }

    fn suspend_live(&mut self) -> Result<()> {
        self.require_open("suspend_live")?;
        self.shared.live.store(false, Ordering::Release);
        debug!("mock live stream suspended");
        Ok(())
    }

    fn stop_live(&mut self) {
        self.shared.live.store(false, Ordering::Release);
        debug!("mock live stream stopped");
    }

    fn set_continuous_mode(&mut self, enabled: bool) -> Result<()> {
        self.require_open("set_continuous_mode")?;
        if self.shared.live.load(Ordering::Acquire) {
            return Err(CaptureError::Device(
                "continuous mode can only change while live is suspended".into(),
            ));
        }
        self.shared.continuous.store(enabled, Ordering::Release);
        Ok(())
    }

    fn register_frame_ready(&mut self, callback: FrameReadyCallback) -> Result<RegistrationToken> {
        self.require_open("register_frame_ready")?;
        let mut slot = self
            .shared
            .callback
            .lock()
            .map_err(|_| CaptureError::Device("driver callback slot poisoned".into()))?;
        if slot.is_some() {
            return Err(CaptureError::Device(
                "frame-ready callback already registered".into(),
            ));
        }
        *slot = Some(callback);
        info!("frame-ready callback registered");
        Ok(RegistrationToken::new())
    }

    fn frame_geometry(&self) -> Result<FrameGeometry> {
        self.require_open("frame_geometry")?;
        self.shared
            .geometry
            .lock()
            .map(|g| *g)
            .map_err(|_| CaptureError::Device("driver geometry poisoned".into()))
    }

    fn native_geometry(&self) -> Result<FrameGeometry> {
        Ok(self.native)
    }

    fn set_frame_rate(&mut self, fps: f64) -> Result<()> {
        if fps <= 0.0 || !fps.is_finite() {
            return Err(CaptureError::Device(format!("invalid frame rate {fps}")));
        }
        self.fps = fps;
        self.shared
            .frame_period_us
            .store((1_000_000.0 / fps) as u64, Ordering::Relaxed);
        Ok(())
    }

    fn frame_rate(&self) -> Result<f64> {
        Ok(self.fps)
    }
}

/// Clonable handle to the mock grabber's hardware trigger input
#[derive(Clone)]
pub struct MockTrigger {
    events: flume::Sender<DriverEvent>,
}

impl MockTrigger {
    pub fn pulse(&self) {
        if self.events.send(DriverEvent::TriggerPulse).is_err() {
            warn!("mock driver thread is gone; trigger pulse dropped");
        }
    }
}

impl Drop for MockGrabber {
    fn drop(&mut self) {
        let _ = self.events.send(DriverEvent::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn driver_loop(shared: &DriverShared, events: &flume::Receiver<DriverEvent>) {
    loop {
        let period =
            Duration::from_micros(shared.frame_period_us.load(Ordering::Relaxed).max(1_000));
        match events.recv_timeout(period) {
            Ok(DriverEvent::Shutdown) | Err(flume::RecvTimeoutError::Disconnected) => break,
            Ok(DriverEvent::TriggerPulse) => {
                let sequence = shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                if shared.live.load(Ordering::Acquire)
                    && shared.trigger_enabled.load(Ordering::Acquire)
                {
                    deliver(shared, sequence);
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                // The sensor produced a frame this interval whether or not
                // anyone consumes it; the counter advances regardless.
                let sequence = shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                if shared.live.load(Ordering::Acquire)
                    && shared.continuous.load(Ordering::Acquire)
                    && !shared.trigger_enabled.load(Ordering::Acquire)
                {
                    deliver(shared, sequence);
                }
            }
        }
    }
}

fn deliver(shared: &DriverShared, sequence: u64) {
    let Ok(geometry) = shared.geometry.lock().map(|g| *g) else {
        return;
    };
    let Ok(slot) = shared.callback.lock() else {
        return;
    };
    if let Some(callback) = slot.as_ref() {
        let buffer = synthetic_frame(geometry, sequence);
        callback(&buffer, sequence);
    }
}

/// Horizontal gradient shifted by the sequence number, so consecutive frames
/// differ and tests can tell them apart.
fn synthetic_frame(geometry: FrameGeometry, sequence: u64) -> Vec<u8> {
    let stride = (geometry.width * geometry.bytes_per_pixel) as usize;
    let mut data = vec![0u8; geometry.frame_len()];
    for (y, row) in data.chunks_mut(stride).enumerate() {
        for (x, value) in row.iter_mut().enumerate() {
            *value = ((x + y + sequence as usize) % 256) as u8;
        }
    }
    data
}
