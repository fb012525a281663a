//! V4L2 frame-grabber backend.
//!
//! Maps the vendor-SDK surface onto a plain V4L2 capture device: mmap
//! streaming on a dedicated capture thread, exposure/gain through controls
//! discovered by name, and the ROI/rotate/flip transforms applied in
//! software per frame (free-run webcams have no vendor filter graph and no
//! hardware trigger; enabling the trigger is accepted as a logged no-op).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{
    names, FilterHandle, FrameGeometry, FrameGrabber, FrameReadyCallback, PropertyValue,
    RegistrationToken,
};
use crate::capture::PixelFormat;
use crate::{CaptureError, Result};

const BUFFER_COUNT: u32 = 4;

/// V4L2-backed frame grabber
pub struct V4l2Grabber {
    path: String,
    pixel_format: PixelFormat,
    device: Option<Device>,
    shared: Arc<CaptureShared>,
    worker: Option<JoinHandle<()>>,
    native: FrameGeometry,
    fps: f64,
    filters: Vec<SoftFilter>,
    next_filter: u32,
    properties: HashMap<(String, String), PropertyValue>,
}

struct SoftFilter {
    handle: FilterHandle,
    name: String,
    params: HashMap<String, i64>,
    attached: bool,
}

/// State shared with the capture thread
struct CaptureShared {
    stop: AtomicBool,
    /// Frames are dequeued regardless (keeps the queue moving) but only
    /// delivered while live.
    deliver: AtomicBool,
    callback: Mutex<Option<FrameReadyCallback>>,
    transform: Mutex<FrameTransform>,
}

/// Software rendition of the vendor filter chain, applied per frame in
/// chain order: rotate, then crop, then flip.
#[derive(Debug, Clone, Copy, Default)]
struct FrameTransform {
    rotation_deg: i64,
    crop: Option<(u32, u32, u32, u32)>, // top, left, width, height
    flip_vertical: bool,
}

impl V4l2Grabber {
    /// Open the device at `path` and negotiate `pixel_format`.
    pub fn open_path(path: &str, pixel_format: PixelFormat) -> Result<Self> {
        let device = open_device(path, pixel_format)?;
        let native = native_geometry_of(&device, pixel_format)?;
        info!(
            path,
            width = native.width,
            height = native.height,
            "V4L2 grabber opened"
        );

        Ok(Self {
            path: path.to_owned(),
            pixel_format,
            device: Some(device),
            shared: Arc::new(CaptureShared {
                stop: AtomicBool::new(false),
                deliver: AtomicBool::new(false),
                callback: Mutex::new(None),
                transform: Mutex::new(FrameTransform::default()),
            }),
            worker: None,
            native,
            fps: 30.0,
            filters: Vec::new(),
            next_filter: 0,
            properties: HashMap::new(),
        })
    }

    fn device(&self) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| CaptureError::Device(format!("{}: device is not open", self.path)))
    }

    /// Push the attached filter chain into the capture thread's transform.
    fn sync_transform(&self) {
        let mut transform = FrameTransform::default();
        for filter in self.filters.iter().filter(|f| f.attached) {
            match filter.name.as_str() {
                names::FILTER_ROTATE => {
                    transform.rotation_deg =
                        filter.params.get(names::ROTATION_ANGLE).copied().unwrap_or(0);
                }
                names::FILTER_ROI => {
                    let get = |key: &str| filter.params.get(key).copied();
                    if let (Some(top), Some(left), Some(width), Some(height)) = (
                        get(names::ROI_TOP),
                        get(names::ROI_LEFT),
                        get(names::ROI_WIDTH),
                        get(names::ROI_HEIGHT),
                    ) {
                        transform.crop =
                            Some((top as u32, left as u32, width as u32, height as u32));
                    }
                }
                other => debug!(filter = other, "unknown filter ignored by V4L2 backend"),
            }
        }
        transform.flip_vertical = self
            .properties
            .get(&(names::FLIP_VERTICAL.to_owned(), names::ENABLE.to_owned()))
            .and_then(|v| v.as_switch())
            .unwrap_or(false);

        let mut shared = self
            .shared
            .transform
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *shared = transform;
    }

    /// Look up a control by (case-insensitive) name fragment.
    fn find_control(&self, fragment: &str) -> Result<v4l::control::Description> {
        let device = self.device()?;
        let controls = device
            .query_controls()
            .map_err(|e| CaptureError::Device(e.to_string()))?;
        let needle = fragment.to_ascii_lowercase();
        controls
            .into_iter()
            .find(|c| c.name.to_ascii_lowercase().contains(&needle))
            .ok_or_else(|| CaptureError::Device(format!("no control matching {fragment:?}")))
    }

    fn set_scaled_control(&self, fragment: &str, normalized: f64) -> Result<()> {
        let desc = self.find_control(fragment)?;
        let range = (desc.maximum - desc.minimum) as f64;
        let raw = desc.minimum + (normalized.clamp(0.0, 1.0) * range).round() as i64;
        self.device()?
            .set_control(Control {
                id: desc.id,
                value: Value::Integer(raw),
            })
            .map_err(|e| CaptureError::Device(e.to_string()))
    }

    fn set_raw_control(&self, fragment: &str, value: i64) -> Result<()> {
        let desc = self.find_control(fragment)?;
        let clamped = value.clamp(desc.minimum, desc.maximum);
        self.device()?
            .set_control(Control {
                id: desc.id,
                value: Value::Integer(clamped),
            })
            .map_err(|e| CaptureError::Device(e.to_string()))
    }

    fn read_control(&self, fragment: &str) -> Result<(i64, i64, i64)> {
        let desc = self.find_control(fragment)?;
        let control = self
            .device()?
            .control(desc.id)
            .map_err(|e| CaptureError::Device(e.to_string()))?;
        match control.value {
            Value::Integer(raw) => Ok((raw, desc.minimum, desc.maximum)),
            _ => Err(CaptureError::Device(format!(
                "control {fragment:?} is not an integer"
            ))),
        }
    }
}

impl FrameGrabber for V4l2Grabber {
    fn open(&mut self) -> Result<()> {
        if self.device.is_none() {
            let device = open_device(&self.path, self.pixel_format)?;
            self.native = native_geometry_of(&device, self.pixel_format)?;
            self.device = Some(device);
            // Reopening tears down the filter chain, like the vendor driver.
            self.filters.clear();
            self.sync_transform();
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stop_live();
        self.device = None;
        self.filters.clear();
        self.sync_transform();
        info!(path = %self.path, "V4L2 grabber closed");
    }

    fn create_filter(&mut self, name: &str) -> Result<FilterHandle> {
        self.device()?;
        let handle = FilterHandle(self.next_filter);
        self.next_filter += 1;
        self.filters.push(SoftFilter {
            handle,
            name: name.to_owned(),
            params: HashMap::new(),
            attached: false,
        });
        Ok(handle)
    }

    fn add_filter(&mut self, filter: FilterHandle) -> Result<()> {
        let entry = self
            .filters
            .iter_mut()
            .find(|f| f.handle == filter)
            .ok_or_else(|| CaptureError::Device(format!("unknown filter handle {filter:?}")))?;
        entry.attached = true;
        self.sync_transform();
        Ok(())
    }

    fn set_filter_parameter(
        &mut self,
        filter: FilterHandle,
        key: &str,
        value: PropertyValue,
    ) -> Result<()> {
        let raw = value
            .as_value()
            .ok_or_else(|| CaptureError::Device(format!("filter parameter {key} expects an integer")))?;
        let entry = self
            .filters
            .iter_mut()
            .find(|f| f.handle == filter)
            .ok_or_else(|| CaptureError::Device(format!("unknown filter handle {filter:?}")))?;
        entry.params.insert(key.to_owned(), raw);
        self.sync_transform();
        Ok(())
    }

    fn set_property(&mut self, category: &str, name: &str, value: PropertyValue) -> Result<()> {
        match (category, name) {
            (names::EXPOSURE, names::VALUE) => {
                let normalized = value.as_absolute().ok_or_else(|| {
                    CaptureError::Device("Exposure/Value expects an absolute value".into())
                })?;
                self.set_scaled_control("exposure", normalized)?;
            }
            (names::GAIN, names::VALUE) => {
                let gain = value.as_absolute().ok_or_else(|| {
                    CaptureError::Device("Gain/Value expects an absolute value".into())
                })?;
                self.set_raw_control("gain", gain.round() as i64)?;
            }
            (names::TRIGGER, names::ENABLE) => {
                // Free-run devices have no hardware trigger input; recording
                // is still gated downstream by the session's enabled flag.
                warn!("hardware trigger not available on V4L2 device; ignoring");
            }
            (names::PARTIAL_SCAN, _) => {
                debug!(name, "partial scan not supported on V4L2 device; stored only");
            }
            _ => {}
        }
        self.properties
            .insert((category.to_owned(), name.to_owned()), value);
        if category == names::FLIP_VERTICAL {
            self.sync_transform();
        }
        Ok(())
    }

    fn get_property(&self, category: &str, name: &str) -> Result<PropertyValue> {
        match (category, name) {
            (names::EXPOSURE, names::VALUE) => {
                let (raw, min, max) = self.read_control("exposure")?;
                let range = (max - min).max(1) as f64;
                Ok(PropertyValue::Absolute((raw - min) as f64 / range))
            }
            (names::GAIN, names::VALUE) => {
                let (raw, _, _) = self.read_control("gain")?;
                Ok(PropertyValue::Absolute(raw as f64))
            }
            _ => self
                .properties
                .get(&(category.to_owned(), name.to_owned()))
                .copied()
                .ok_or_else(|| {
                    CaptureError::Device(format!("unknown property {category}/{name}"))
                }),
        }
    }

    fn start_live(&mut self, _show_display: bool) -> Result<()> {
        if self.worker.is_some() {
            self.shared.deliver.store(true, Ordering::Release);
            return Ok(());
        }

        let device = self.device()?;
        let stream: MmapStream<'static> =
            MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
                .map_err(|e| CaptureError::Device(e.to_string()))?;

        self.shared.stop.store(false, Ordering::Release);
        self.shared.deliver.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let native = self.native;
        let worker = std::thread::Builder::new()
            .name("v4l2-capture".into())
            .spawn(move || capture_loop(stream, &shared, native))
            .map_err(|e| CaptureError::Device(format!("failed to spawn capture thread: {e}")))?;
        self.worker = Some(worker);
        info!("V4L2 capture stream started");
        Ok(())
    }

    fn suspend_live(&mut self) -> Result<()> {
        self.shared.deliver.store(false, Ordering::Release);
        debug!("V4L2 capture suspended");
        Ok(())
    }

    fn stop_live(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.deliver.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn set_continuous_mode(&mut self, enabled: bool) -> Result<()> {
        if !enabled {
            warn!("triggered delivery not available on V4L2 device; staying in free-run");
        }
        Ok(())
    }

    fn register_frame_ready(&mut self, callback: FrameReadyCallback) -> Result<RegistrationToken> {
        let mut slot = self
            .shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
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
        let transform = *self
            .shared
            .transform
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(effective_geometry(self.native, transform))
    }

    fn native_geometry(&self) -> Result<FrameGeometry> {
        Ok(self.native)
    }

    fn set_frame_rate(&mut self, fps: f64) -> Result<()> {
        if fps <= 0.0 || !fps.is_finite() {
            return Err(CaptureError::Device(format!("invalid frame rate {fps}")));
        }
        let device = self.device()?;
        device
            .set_params(&v4l::video::capture::Parameters::with_fps(fps as u32))
            .map_err(|e| CaptureError::Device(e.to_string()))?;
        self.fps = fps;
        Ok(())
    }

    fn frame_rate(&self) -> Result<f64> {
        Ok(self.fps)
    }
}

impl Drop for V4l2Grabber {
    fn drop(&mut self) {
        self.stop_live();
    }
}

fn open_device(path: &str, pixel_format: PixelFormat) -> Result<Device> {
    let device =
        Device::with_path(path).map_err(|e| CaptureError::Device(format!("{path}: {e}")))?;

    let caps = device
        .query_caps()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    info!("Device: {} ({})", caps.card, caps.driver);
    if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
        return Err(CaptureError::Device(format!(
            "{path}: device doesn't support video capture"
        )));
    }

    let mut fmt = device
        .format()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    fmt.fourcc = fourcc_of(pixel_format);
    device
        .set_format(&fmt)
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    Ok(device)
}

fn native_geometry_of(device: &Device, pixel_format: PixelFormat) -> Result<FrameGeometry> {
    let fmt = device
        .format()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    if fmt.fourcc != fourcc_of(pixel_format) {
        warn!(
            requested = %fourcc_of(pixel_format),
            actual = %fmt.fourcc,
            "device did not accept requested pixel format"
        );
    }
    let bytes_per_pixel = pixel_format.bytes_per_pixel();
    Ok(FrameGeometry {
        buffer_size: (fmt.width * fmt.height * bytes_per_pixel) as usize,
        width: fmt.width,
        height: fmt.height,
        bytes_per_pixel,
    })
}

const fn fourcc_of(pixel_format: PixelFormat) -> FourCC {
    match pixel_format {
        PixelFormat::Y800 => FourCC::new(b"GREY"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Rgb32 => FourCC::new(b"RGB4"),
    }
}

fn capture_loop(mut stream: MmapStream<'static>, shared: &CaptureShared, native: FrameGeometry) {
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let (buf, meta) = match stream.next() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "V4L2 dequeue failed");
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };

        if !shared.deliver.load(Ordering::Acquire) {
            continue;
        }

        let expected = native.frame_len();
        if buf.len() < expected {
            warn!(
                got = buf.len(),
                expected, "short V4L2 buffer; frame dropped"
            );
            continue;
        }

        let transform = match shared.transform.lock() {
            Ok(t) => *t,
            Err(_) => continue,
        };
        let frame = apply_transform(&buf[..expected], native, transform);

        let Ok(slot) = shared.callback.lock() else {
            continue;
        };
        if let Some(callback) = slot.as_ref() {
            callback(&frame, u64::from(meta.sequence));
        }
    }
    debug!("V4L2 capture thread exited");
}

/// Apply the software filter chain, returning the transformed frame bytes.
fn apply_transform(buf: &[u8], native: FrameGeometry, transform: FrameTransform) -> Vec<u8> {
    let bpp = native.bytes_per_pixel as usize;
    let (data, width, height) = rotate(
        buf,
        native.width as usize,
        native.height as usize,
        bpp,
        transform.rotation_deg,
    );

    let (mut data, width, _height) = match transform.crop {
        Some((top, left, crop_w, crop_h)) => crop(
            &data,
            width,
            height,
            bpp,
            top as usize,
            left as usize,
            crop_w as usize,
            crop_h as usize,
        ),
        None => (data, width, height),
    };

    if transform.flip_vertical {
        flip_rows(&mut data, width * bpp);
    }
    data
}

fn effective_geometry(native: FrameGeometry, transform: FrameTransform) -> FrameGeometry {
    let mut geometry = native;
    if transform.rotation_deg == 90 || transform.rotation_deg == 270 {
        std::mem::swap(&mut geometry.width, &mut geometry.height);
    }
    if let Some((top, left, crop_w, crop_h)) = transform.crop {
        geometry.width = crop_w.min(geometry.width.saturating_sub(left)).max(1);
        geometry.height = crop_h.min(geometry.height.saturating_sub(top)).max(1);
    }
    geometry.buffer_size = geometry.frame_len();
    geometry
}

/// Rotate a packed-pixel frame clockwise by 0/90/180/270 degrees.
fn rotate(src: &[u8], width: usize, height: usize, bpp: usize, degrees: i64) -> (Vec<u8>, usize, usize) {
    match degrees {
        90 | 270 => {
            let mut dst = vec![0u8; src.len()];
            let (dst_w, dst_h) = (height, width);
            for y in 0..height {
                for x in 0..width {
                    let (dx, dy) = if degrees == 90 {
                        (height - 1 - y, x)
                    } else {
                        (y, width - 1 - x)
                    };
                    let s = (y * width + x) * bpp;
                    let d = (dy * dst_w + dx) * bpp;
                    dst[d..d + bpp].copy_from_slice(&src[s..s + bpp]);
                }
            }
            (dst, dst_w, dst_h)
        }
        180 => {
            let mut dst = vec![0u8; src.len()];
            for y in 0..height {
                for x in 0..width {
                    let s = (y * width + x) * bpp;
                    let d = ((height - 1 - y) * width + (width - 1 - x)) * bpp;
                    dst[d..d + bpp].copy_from_slice(&src[s..s + bpp]);
                }
            }
            (dst, width, height)
        }
        _ => (src.to_vec(), width, height),
    }
}

/// Extract a crop window, clamped to the frame.
#[allow(clippy::too_many_arguments)]
fn crop(
    src: &[u8],
    width: usize,
    height: usize,
    bpp: usize,
    top: usize,
    left: usize,
    crop_w: usize,
    crop_h: usize,
) -> (Vec<u8>, usize, usize) {
    let left = left.min(width.saturating_sub(1));
    let top = top.min(height.saturating_sub(1));
    let out_w = crop_w.min(width - left).max(1);
    let out_h = crop_h.min(height - top).max(1);

    let mut dst = Vec::with_capacity(out_w * out_h * bpp);
    for y in top..top + out_h {
        let start = (y * width + left) * bpp;
        dst.extend_from_slice(&src[start..start + out_w * bpp]);
    }
    (dst, out_w, out_h)
}

fn flip_rows(data: &mut [u8], stride: usize) {
    if stride == 0 {
        return;
    }
    let rows = data.len() / stride;
    for y in 0..rows / 2 {
        let (a, b) = data.split_at_mut((rows - 1 - y) * stride);
        a[y * stride..y * stride + stride].swap_with_slice(&mut b[..stride]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(width: u32, height: u32) -> FrameGeometry {
        FrameGeometry {
            buffer_size: (width * height) as usize,
            width,
            height,
            bytes_per_pixel: 1,
        }
    }

    #[test]
    fn rotate_90_transposes() {
        // 3x2 frame:
        // 1 2 3
        // 4 5 6
        let src = [1, 2, 3, 4, 5, 6];
        let (dst, w, h) = rotate(&src, 3, 2, 1, 90);
        assert_eq!((w, h), (2, 3));
        // Clockwise:
        // 4 1
        // 5 2
        // 6 3
        assert_eq!(dst, vec![4, 1, 5, 2, 6, 3]);
    }

    #[test]
    fn rotate_180_reverses() {
        let src = [1, 2, 3, 4, 5, 6];
        let (dst, w, h) = rotate(&src, 3, 2, 1, 180);
        assert_eq!((w, h), (3, 2));
        assert_eq!(dst, vec![6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn crop_window_is_clamped() {
        // 4x3 frame, crop 2x2 at (1, 1)
        let src: Vec<u8> = (0..12).collect();
        let (dst, w, h) = crop(&src, 4, 3, 1, 1, 1, 2, 2);
        assert_eq!((w, h), (2, 2));
        assert_eq!(dst, vec![5, 6, 9, 10]);

        // Oversized crop clamps to the frame
        let (dst, w, h) = crop(&src, 4, 3, 1, 0, 0, 99, 99);
        assert_eq!((w, h), (4, 3));
        assert_eq!(dst, src);
    }

    #[test]
    fn flip_reverses_row_order() {
        let mut data = vec![1, 2, 3, 4, 5, 6];
        flip_rows(&mut data, 2);
        assert_eq!(data, vec![5, 6, 3, 4, 1, 2]);
    }

    #[test]
    fn effective_geometry_composes_rotate_and_crop() {
        let transform = FrameTransform {
            rotation_deg: 90,
            crop: Some((0, 0, 100, 50)),
            flip_vertical: false,
        };
        let geometry = effective_geometry(native(640, 480), transform);
        // 640x480 rotated -> 480x640, then cropped to 100x50.
        assert_eq!((geometry.width, geometry.height), (100, 50));
        assert_eq!(geometry.buffer_size, 100 * 50);
    }

    #[test]
    fn transform_pipeline_matches_geometry() {
        let geometry = native(4, 4);
        let transform = FrameTransform {
            rotation_deg: 180,
            crop: Some((1, 1, 2, 2)),
            flip_vertical: true,
        };
        let src: Vec<u8> = (0..16).collect();
        let out = apply_transform(&src, geometry, transform);
        let expected = effective_geometry(geometry, transform);
        assert_eq!(out.len(), expected.frame_len());
    }
}
