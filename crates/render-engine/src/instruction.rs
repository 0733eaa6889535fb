//! Per-frame instructions consumed by the pipeline.

use serde::{Deserialize, Serialize};

use cutline_common::error::CutlineResult;
use cutline_media::Rgba;

/// Where the pixels of one output frame come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameSource {
    /// A frame of a registered source, by source-relative index.
    Clip { source_id: String, frame_index: u64 },

    /// No source: the frame is a solid colour.
    ColorFill(Rgba),

    /// Produce nothing for this output slot.
    Skip,
}

/// One output frame's worth of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInstruction {
    pub source: FrameSource,

    /// True for any fade, effect, transform, flip or transition. Such
    /// frames always take the CPU path.
    #[serde(default)]
    pub requires_cpu_processing: bool,
}

impl FrameInstruction {
    pub fn clip(source_id: impl Into<String>, frame_index: u64) -> Self {
        Self {
            source: FrameSource::Clip {
                source_id: source_id.into(),
                frame_index,
            },
            requires_cpu_processing: false,
        }
    }

    pub fn color(color: Rgba) -> Self {
        Self {
            source: FrameSource::ColorFill(color),
            requires_cpu_processing: false,
        }
    }

    pub fn skip() -> Self {
        Self {
            source: FrameSource::Skip,
            requires_cpu_processing: false,
        }
    }

    /// Mark the frame as needing CPU compositing.
    pub fn with_processing(mut self) -> Self {
        self.requires_cpu_processing = true;
        self
    }

    pub fn source_id(&self) -> Option<&str> {
        match &self.source {
            FrameSource::Clip { source_id, .. } => Some(source_id),
            _ => None,
        }
    }
}

/// Instructions for a straight run of one source, `start..end`.
pub fn clip_range(source_id: &str, start: u64, end: u64) -> Vec<FrameInstruction> {
    (start..end)
        .map(|index| FrameInstruction::clip(source_id, index))
        .collect()
}

/// Parse a JSON array of instructions.
pub fn parse_instructions(json: &str) -> CutlineResult<Vec<FrameInstruction>> {
    Ok(serde_json::from_str(json)?)
}

/// Whether a frame can stay on the GPU from decoder to encoder.
pub fn zero_copy_eligible(
    decoder_hardware: bool,
    encoder_hardware: bool,
    requires_cpu_processing: bool,
) -> bool {
    decoder_hardware && encoder_hardware && !requires_cpu_processing
}
