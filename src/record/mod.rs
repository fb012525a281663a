pub mod session;
pub mod sink;

#[cfg(feature = "gstreamer-sink")]
pub mod gst_sink;

pub use session::RecordingSession;
pub use sink::{FourCc, MemorySinkFactory, RecordConfig, SinkFactory, VideoSink};

#[cfg(feature = "gstreamer-sink")]
pub use gst_sink::GstSinkFactory;
