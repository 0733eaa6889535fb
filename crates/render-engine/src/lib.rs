//! Cutline Render Engine
//!
//! Turns a list of per-frame instructions into one encoded output. Each
//! instruction names a source frame, a colour fill, or a skip; the pipeline
//! decides per frame whether the pixels can stay on the GPU.
//!
//! # Pipeline Architecture
//!
//! ```text
//! source A ──► SourceDecoder ──┐
//!                              ├── zero-copy? ── yes ──────────────┐
//! source B ──► SourceDecoder ──┘        │                          │
//!                                       no                         ▼
//!                                       └──► FrameCompositor ──► OutputEncoder ──► output.mp4
//! ```
//!
//! Shutdown runs encoder, then decoders, then the shared hardware context.

pub mod compositor;
pub mod instruction;
pub mod job;
pub mod pipeline;

pub use compositor::{FrameCompositor, OutputGeometry, PassThroughCompositor};
pub use instruction::{
    clip_range, parse_instructions, zero_copy_eligible, FrameInstruction, FrameSource,
};
pub use job::{render_job, RenderJob};
pub use pipeline::{
    FrameOutcome, ProgressCallback, RenderOptions, RenderPipeline, RenderProgress, RenderStage,
    RenderStats, RenderSummary,
};
