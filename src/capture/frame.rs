//! Frame types shared between the driver callback and the recording path

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::grabber::FrameGeometry;
use crate::{CaptureError, Result};

/// Owned frame with zero-copy semantics
#[derive(Debug, Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Driver-assigned sequence number; monotonically increasing, may have gaps.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Y800,
    Rgb24,
    Rgb32,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Y800 => 1,
            Self::Rgb24 => 3,
            Self::Rgb32 => 4,
        }
    }
}

/// Read-only pixel grid over a driver-owned buffer.
///
/// The underlying memory belongs to the driver and is only valid for the
/// duration of the frame-ready callback; the borrow keeps the view from
/// outliving it. Consume with [`FrameView::to_frame`] before returning.
#[derive(Debug)]
pub struct FrameView<'a> {
    data: &'a [u8],
    geometry: FrameGeometry,
}

impl<'a> FrameView<'a> {
    /// Interpret `data` as a `width x height x bytes_per_pixel` grid.
    ///
    /// Fails with [`CaptureError::InvalidGeometry`] when the buffer length
    /// does not match the advertised geometry.
    pub fn new(data: &'a [u8], geometry: FrameGeometry) -> Result<Self> {
        let expected = geometry.frame_len();
        if data.len() != expected {
            return Err(CaptureError::InvalidGeometry {
                expected,
                actual: data.len(),
                width: geometry.width,
                height: geometry.height,
                bytes_per_pixel: geometry.bytes_per_pixel,
            });
        }
        Ok(Self { data, geometry })
    }

    pub const fn width(&self) -> u32 {
        self.geometry.width
    }

    pub const fn height(&self) -> u32 {
        self.geometry.height
    }

    pub const fn bytes_per_pixel(&self) -> u32 {
        self.geometry.bytes_per_pixel
    }

    /// Raw bytes of one pixel row.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.geometry.height {
            return None;
        }
        let stride = (self.geometry.width * self.geometry.bytes_per_pixel) as usize;
        let start = y as usize * stride;
        self.data.get(start..start + stride)
    }

    /// Copy the driver buffer into an owned [`Frame`] tagged with `sequence`.
    pub fn to_frame(&self, sequence: u64) -> Frame {
        Frame {
            data: Bytes::copy_from_slice(self.data),
            meta: Arc::new(FrameMetadata {
                sequence,
                width: self.geometry.width,
                height: self.geometry.height,
                bytes_per_pixel: self.geometry.bytes_per_pixel,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(width: u32, height: u32, bpp: u32) -> FrameGeometry {
        FrameGeometry {
            buffer_size: (width * height * bpp) as usize,
            width,
            height,
            bytes_per_pixel: bpp,
        }
    }

    #[test]
    fn view_accepts_matching_buffer() {
        let buf = vec![0u8; 4 * 2 * 3];
        let view = FrameView::new(&buf, geometry(4, 2, 3)).expect("geometry matches");
        assert_eq!(view.width(), 4);
        assert_eq!(view.height(), 2);
    }

    #[test]
    fn view_rejects_length_mismatch() {
        let buf = vec![0u8; 10];
        let err = FrameView::new(&buf, geometry(4, 2, 3)).unwrap_err();
        match err {
            CaptureError::InvalidGeometry {
                expected, actual, ..
            } => {
                assert_eq!(expected, 24);
                assert_eq!(actual, 10);
            }
            other => panic!("expected InvalidGeometry, got {other:?}"),
        }
    }

    #[test]
    fn row_access_is_bounded() {
        let buf: Vec<u8> = (0..12).collect();
        let view = FrameView::new(&buf, geometry(2, 3, 2)).expect("geometry matches");
        assert_eq!(view.row(0), Some(&buf[0..4]));
        assert_eq!(view.row(2), Some(&buf[8..12]));
        assert_eq!(view.row(3), None);
    }

    #[test]
    fn to_frame_copies_out() {
        let buf: Vec<u8> = (0..6).collect();
        let view = FrameView::new(&buf, geometry(3, 2, 1)).expect("geometry matches");
        let frame = view.to_frame(7);
        assert_eq!(&frame.data[..], &buf[..]);
        assert_eq!(frame.meta.sequence, 7);
        assert_eq!(frame.meta.width, 3);
        assert_eq!(frame.meta.height, 2);
    }
}
