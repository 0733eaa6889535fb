//! CPU compositing seam.
//!
//! Pixel-level effects live outside the renderer. The pipeline hands every
//! CPU-path frame to a [`FrameCompositor`] together with its instruction and
//! encodes whatever comes back.

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::PixelFormat;
use cutline_media::{Frame, FramePool};

use crate::instruction::{FrameInstruction, FrameSource};

/// Size and layout of the frames the encoder expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Produces the CPU frame to encode for one instruction.
pub trait FrameCompositor: Send {
    /// `source` is the decoded frame for clip instructions and `None` for
    /// colour fills. The result may have any geometry; the encoder converts.
    fn composite(
        &mut self,
        instruction: &FrameInstruction,
        source: Option<Frame>,
        output: &OutputGeometry,
        pool: &FramePool,
    ) -> CutlineResult<Frame>;
}

/// Passes decoded frames through untouched and renders colour fills.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughCompositor;

impl FrameCompositor for PassThroughCompositor {
    fn composite(
        &mut self,
        instruction: &FrameInstruction,
        source: Option<Frame>,
        output: &OutputGeometry,
        pool: &FramePool,
    ) -> CutlineResult<Frame> {
        match (&instruction.source, source) {
            (_, Some(frame)) => Ok(frame),
            (FrameSource::ColorFill(color), None) => {
                Frame::filled(pool, output.width, output.height, output.format, *color)
            }
            (other, None) => Err(CutlineError::render(format!(
                "nothing to composite for {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutline_media::Rgba;

    fn geometry() -> OutputGeometry {
        OutputGeometry {
            width: 8,
            height: 4,
            format: PixelFormat::Yuv420p,
        }
    }

    #[test]
    fn color_fill_matches_output_geometry() {
        let pool = FramePool::new(2);
        let frame = PassThroughCompositor
            .composite(
                &FrameInstruction::color(Rgba::BLACK),
                None,
                &geometry(),
                &pool,
            )
            .expect("fill should render");
        assert_eq!((frame.width, frame.height), (8, 4));
        assert_eq!(frame.format, PixelFormat::Yuv420p);
        assert!(!frame.is_resident());
    }

    #[test]
    fn decoded_frames_pass_through() {
        let pool = FramePool::new(2);
        let source = Frame::filled(&pool, 16, 16, PixelFormat::Nv12, Rgba::BLACK).unwrap();
        let expected = source.checksum().unwrap();
        let out = PassThroughCompositor
            .composite(&FrameInstruction::clip("a", 0), Some(source), &geometry(), &pool)
            .unwrap();
        assert_eq!(out.checksum().unwrap(), expected);
        assert_eq!(out.width, 16);
    }

    #[test]
    fn skip_has_nothing_to_composite() {
        let pool = FramePool::new(2);
        assert!(PassThroughCompositor
            .composite(&FrameInstruction::skip(), None, &geometry(), &pool)
            .is_err());
    }
}
