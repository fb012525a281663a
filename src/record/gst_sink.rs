//! GStreamer-backed AVI/MJPG file sink

use std::path::Path;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use super::sink::{FourCc, RecordConfig, SinkFactory, VideoSink};
use crate::capture::Frame;
use crate::{CaptureError, Result};

/// Opens [`GstSink`] writers
#[derive(Debug, Clone, Copy, Default)]
pub struct GstSinkFactory;

impl SinkFactory for GstSinkFactory {
    fn open(&self, path: &Path, config: &RecordConfig) -> Result<Box<dyn VideoSink>> {
        GstSink::open(path, config).map(|sink| Box::new(sink) as Box<dyn VideoSink>)
    }
}

/// AVI/MJPG writer: `appsrc -> videoconvert -> jpegenc -> avimux -> filesink`
#[derive(Debug)]
pub struct GstSink {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    config: RecordConfig,
    frames_pushed: u64,
    caps_set: bool,
}

impl GstSink {
    pub fn open(path: &Path, config: &RecordConfig) -> Result<Self> {
        let sink_open = |reason: String| CaptureError::SinkOpen {
            path: path.display().to_string(),
            reason,
        };

        if config.fourcc != FourCc::MJPG {
            return Err(sink_open(format!(
                "unsupported codec {}; this sink encodes MJPG",
                config.fourcc
            )));
        }
        if config.width == 0 || config.height == 0 || config.fps <= 0.0 {
            return Err(sink_open(format!(
                "unsupported parameters: {}x{} @ {} fps",
                config.width, config.height, config.fps
            )));
        }

        gst::init().map_err(|e| sink_open(format!("failed to initialize GStreamer: {e}")))?;

        let pipeline_str = format!(
            "appsrc name=src is-live=true format=time ! \
             videoconvert ! \
             jpegenc ! \
             avimux ! \
             filesink location=\"{}\"",
            path.display()
        );
        debug!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| sink_open(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| sink_open("failed to create pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| sink_open("failed to find appsrc element".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| sink_open("failed to cast to AppSrc".into()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| sink_open(format!("failed to start pipeline: {e}")))?;

        info!(path = %path.display(), fps = config.fps, "gstreamer sink opened");
        Ok(Self {
            pipeline,
            appsrc,
            config: *config,
            frames_pushed: 0,
            caps_set: false,
        })
    }

    fn raw_format(bytes_per_pixel: u32) -> Result<gst_video::VideoFormat> {
        match bytes_per_pixel {
            1 => Ok(gst_video::VideoFormat::Gray8),
            3 => Ok(gst_video::VideoFormat::Rgb),
            4 => Ok(gst_video::VideoFormat::Rgbx),
            other => Err(CaptureError::Device(format!(
                "unsupported pixel depth {other} bytes"
            ))),
        }
    }
}

impl VideoSink for GstSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if !self.caps_set {
            let format = Self::raw_format(frame.meta.bytes_per_pixel)?;
            let info = gst_video::VideoInfo::builder(format, frame.meta.width, frame.meta.height)
                .fps(gst::Fraction::new(self.config.fps.round() as i32, 1))
                .build()
                .map_err(|e| CaptureError::Device(format!("invalid video info: {e}")))?;
            let caps = info
                .to_caps()
                .map_err(|e| CaptureError::Device(format!("invalid caps: {e}")))?;
            self.appsrc.set_caps(Some(&caps));
            self.caps_set = true;
        }

        let mut buffer = gst::Buffer::from_slice(frame.data.clone());
        {
            let buffer = buffer.get_mut().ok_or_else(|| {
                CaptureError::Device("frame buffer is not writable".into())
            })?;
            let nanos = (self.frames_pushed as f64 * 1_000_000_000.0 / self.config.fps) as u64;
            buffer.set_pts(gst::ClockTime::from_nseconds(nanos));
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| CaptureError::Device(format!("push_buffer failed: {e:?}")))?;
        self.frames_pushed += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Err(e) = self.appsrc.end_of_stream() {
            warn!(error = ?e, "end_of_stream failed");
        }

        // Wait for the muxer to finalize the container before tearing down.
        if let Some(bus) = self.pipeline.bus() {
            let _ = bus.timed_pop_filtered(
                gst::ClockTime::from_seconds(5),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );
        }

        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| CaptureError::Device(format!("pipeline teardown failed: {e}")))?;
        info!(frames = self.frames_pushed, "gstreamer sink closed");
        Ok(())
    }
}

impl Drop for GstSink {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
