//! Whole renders as async jobs.

use std::path::PathBuf;
use std::sync::Arc;

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::HardwareContextManager;
use cutline_media::MediaBackend;

use crate::instruction::FrameInstruction;
use crate::pipeline::{
    ProgressCallback, RenderOptions, RenderPipeline, RenderProgress, RenderStage, RenderSummary,
};

/// A render ready to run.
pub struct RenderJob {
    /// Output file path.
    pub output: PathBuf,

    /// Source ids and the files they refer to.
    pub sources: Vec<(String, PathBuf)>,

    pub instructions: Vec<FrameInstruction>,

    pub options: RenderOptions,
}

/// Render `job` on a blocking worker.
///
/// The pipeline is single-threaded; it runs off the async executor because
/// codec and container calls block.
pub async fn render_job(
    job: RenderJob,
    media: Arc<dyn MediaBackend>,
    manager: Arc<HardwareContextManager>,
    progress: Option<ProgressCallback>,
) -> CutlineResult<RenderSummary> {
    tracing::info!(
        output = %job.output.display(),
        sources = job.sources.len(),
        instructions = job.instructions.len(),
        "Starting render"
    );

    if let Some(parent) = job.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    tokio::task::spawn_blocking(move || {
        let mut pipeline = RenderPipeline::new(&job.output, media, manager, job.options)?;
        for (id, path) in job.sources {
            pipeline.add_source(id, path);
        }
        pipeline.render_all(&job.instructions, progress.as_ref())?;
        let summary = pipeline.finish()?;
        if let Some(cb) = &progress {
            cb(RenderProgress {
                progress: 1.0,
                frames_rendered: summary.stats.instructions,
                total_frames: summary.stats.instructions,
                eta_secs: 0.0,
                stage: RenderStage::Complete,
            });
        }
        Ok(summary)
    })
    .await
    .map_err(|e| CutlineError::render(format!("render task failed: {e}")))?
}
