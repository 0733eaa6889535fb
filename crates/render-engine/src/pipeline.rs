//! The render loop: one encoder, lazily opened source decoders, and the
//! per-frame choice between the CPU path and zero-copy passthrough.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use cutline_common::config::AppConfig;
use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::{HardwareBackend, HardwareContextManager};
use cutline_media::{
    DecoderOptions, DecoderStats, EncoderOptions, EncoderStats, FramePool, MediaBackend,
    OutputEncoder, Rational, SourceDecoder,
};

use crate::compositor::{FrameCompositor, OutputGeometry, PassThroughCompositor};
use crate::instruction::{zero_copy_eligible, FrameInstruction, FrameSource};

/// Session options for one render.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub encoder: EncoderOptions,
    pub decoder: DecoderOptions,
}

impl RenderOptions {
    pub fn from_config(
        config: &AppConfig,
        width: u32,
        height: u32,
        frame_rate: Rational,
    ) -> CutlineResult<Self> {
        Ok(Self {
            encoder: EncoderOptions::from_config(config, width, height, frame_rate)?,
            decoder: DecoderOptions::from_config(config)?,
        })
    }
}

/// Progress report for a render.
#[derive(Debug, Clone)]
pub struct RenderProgress {
    /// Current progress [0.0, 1.0].
    pub progress: f64,

    /// Instructions processed so far.
    pub frames_rendered: u64,

    pub total_frames: u64,

    /// Estimated time remaining in seconds.
    pub eta_secs: f64,

    pub stage: RenderStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    Preparing,
    Rendering,
    Finalizing,
    Complete,
}

/// Progress callback for rendering.
pub type ProgressCallback = Box<dyn Fn(RenderProgress) + Send>;

/// What happened to one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Encoded { zero_copy: bool },
    Skipped,
    /// The source had no frame for the request and is now exhausted.
    Dropped,
}

/// Counters for one render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub instructions: u64,
    pub frames_encoded: u64,
    pub zero_copy_frames: u64,
    pub cpu_frames: u64,
    pub color_frames: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub sources_opened: u64,
    pub exhausted_sources: u64,
}

/// Result of a finished render.
#[derive(Debug, Clone)]
pub struct RenderSummary {
    pub output: PathBuf,
    pub stats: RenderStats,
    pub encoder: EncoderStats,
    pub decoders: Vec<(String, DecoderStats)>,
}

/// Drives decoders and the encoder for one output file.
pub struct RenderPipeline {
    output: PathBuf,
    media: Arc<dyn MediaBackend>,
    manager: Arc<HardwareContextManager>,
    sources: HashMap<String, PathBuf>,
    decoders: BTreeMap<String, SourceDecoder>,
    exhausted: HashSet<String>,
    encoder: Option<OutputEncoder>,
    compositor: Box<dyn FrameCompositor>,
    decoder_options: DecoderOptions,
    geometry: OutputGeometry,
    pool: FramePool,
    stats: RenderStats,
    finished: bool,
}

impl RenderPipeline {
    /// Open the output encoder. Sources are opened on first use.
    pub fn new(
        output: impl AsRef<Path>,
        media: Arc<dyn MediaBackend>,
        manager: Arc<HardwareContextManager>,
        options: RenderOptions,
    ) -> CutlineResult<Self> {
        let output = output.as_ref().to_path_buf();
        let mut encoder_options = options.encoder;
        encoder_options.zero_copy =
            options.decoder.allow_hardware && options.decoder.backend != HardwareBackend::None;
        let pool = FramePool::new(encoder_options.pool_soft_limit);

        let encoder = OutputEncoder::create(&output, media.as_ref(), &manager, encoder_options)?;
        let settings = encoder.settings();
        let geometry = OutputGeometry {
            width: settings.width,
            height: settings.height,
            format: settings.input_format,
        };
        tracing::info!(
            output = %output.display(),
            hardware = encoder.is_using_hardware(),
            backend = %encoder.backend(),
            "Render pipeline ready"
        );

        Ok(Self {
            output,
            media,
            manager,
            sources: HashMap::new(),
            decoders: BTreeMap::new(),
            exhausted: HashSet::new(),
            encoder: Some(encoder),
            compositor: Box::new(PassThroughCompositor),
            decoder_options: options.decoder,
            geometry,
            pool,
            stats: RenderStats::default(),
            finished: false,
        })
    }

    /// Register a source file under `id`.
    pub fn add_source(&mut self, id: impl Into<String>, path: impl Into<PathBuf>) -> &mut Self {
        self.sources.insert(id.into(), path.into());
        self
    }

    pub fn with_compositor(mut self, compositor: Box<dyn FrameCompositor>) -> Self {
        self.compositor = compositor;
        self
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn geometry(&self) -> OutputGeometry {
        self.geometry
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn encoder(&self) -> Option<&OutputEncoder> {
        self.encoder.as_ref()
    }

    pub fn decoder(&self, id: &str) -> Option<&SourceDecoder> {
        self.decoders.get(id)
    }

    pub fn is_exhausted(&self, id: &str) -> bool {
        self.exhausted.contains(id)
    }

    fn ensure_decoder(&mut self, id: &str) -> CutlineResult<()> {
        if self.decoders.contains_key(id) {
            return Ok(());
        }
        let path = self
            .sources
            .get(id)
            .ok_or_else(|| CutlineError::config(format!("unknown source id {id:?}")))?;
        let decoder = SourceDecoder::open(
            path,
            self.media.as_ref(),
            &self.manager,
            self.decoder_options.clone(),
        )?;
        tracing::debug!(
            source = id,
            hardware = decoder.is_using_hardware(),
            frames = decoder.frame_count(),
            "Source opened"
        );
        self.decoders.insert(id.to_string(), decoder);
        self.stats.sources_opened += 1;
        Ok(())
    }

    /// Render one output frame.
    ///
    /// Construction failures and encoder errors propagate. A source that
    /// runs out of frames is marked exhausted and its later frames are
    /// dropped.
    pub fn render_frame(&mut self, instruction: &FrameInstruction) -> CutlineResult<FrameOutcome> {
        if self.finished {
            return Err(CutlineError::render("pipeline already finished"));
        }
        self.stats.instructions += 1;

        let (source_id, frame_index) = match &instruction.source {
            FrameSource::Skip => {
                self.stats.skipped += 1;
                return Ok(FrameOutcome::Skipped);
            }
            FrameSource::ColorFill(_) => {
                let frame =
                    self.compositor
                        .composite(instruction, None, &self.geometry, &self.pool)?;
                self.encoder_mut()?.write_frame(&frame)?;
                self.stats.color_frames += 1;
                self.stats.frames_encoded += 1;
                return Ok(FrameOutcome::Encoded { zero_copy: false });
            }
            FrameSource::Clip {
                source_id,
                frame_index,
            } => (source_id.as_str(), *frame_index),
        };

        if self.exhausted.contains(source_id) {
            self.stats.dropped += 1;
            return Ok(FrameOutcome::Dropped);
        }
        self.ensure_decoder(source_id)?;

        let geometry = self.geometry;
        let decoder = self
            .decoders
            .get_mut(source_id)
            .ok_or_else(|| CutlineError::render(format!("source {source_id:?} is not open")))?;
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| CutlineError::render("encoder already closed"))?;

        // A source at another size needs scaling, which is CPU work.
        let info = decoder.info();
        let rescale = info.width != geometry.width || info.height != geometry.height;
        let zero_copy = zero_copy_eligible(
            decoder.is_using_hardware(),
            encoder.is_using_hardware(),
            instruction.requires_cpu_processing || rescale,
        );

        let frame = if zero_copy {
            decoder.get_hardware_frame(frame_index)
        } else {
            decoder.get_frame(frame_index)
        };
        let Some(frame) = frame else {
            tracing::warn!(
                source = source_id,
                frame_index,
                "Source has no more frames; dropping the rest of its contribution"
            );
            self.exhausted.insert(source_id.to_string());
            self.stats.exhausted_sources += 1;
            self.stats.dropped += 1;
            return Ok(FrameOutcome::Dropped);
        };

        if zero_copy {
            encoder.write_hardware_frame(&frame)?;
            self.stats.zero_copy_frames += 1;
        } else {
            let composited =
                self.compositor
                    .composite(instruction, Some(frame), &geometry, &self.pool)?;
            encoder.write_frame(&composited)?;
            self.stats.cpu_frames += 1;
        }
        self.stats.frames_encoded += 1;
        Ok(FrameOutcome::Encoded { zero_copy })
    }

    fn encoder_mut(&mut self) -> CutlineResult<&mut OutputEncoder> {
        self.encoder
            .as_mut()
            .ok_or_else(|| CutlineError::render("encoder already closed"))
    }

    /// Render every instruction, reporting progress after each one.
    pub fn render_all(
        &mut self,
        instructions: &[FrameInstruction],
        progress: Option<&ProgressCallback>,
    ) -> CutlineResult<RenderStats> {
        let total = instructions.len() as u64;
        let started = Instant::now();
        report(progress, 0, total, 0.0, RenderStage::Preparing);

        for (done, instruction) in instructions.iter().enumerate() {
            self.render_frame(instruction)?;
            let done = done as u64 + 1;
            report(
                progress,
                done,
                total,
                started.elapsed().as_secs_f64(),
                RenderStage::Rendering,
            );
        }
        report(
            progress,
            total,
            total,
            started.elapsed().as_secs_f64(),
            RenderStage::Finalizing,
        );
        Ok(self.stats)
    }

    /// Finalize the output and release every session: encoder first,
    /// then decoders, then the shared hardware context.
    pub fn finish(mut self) -> CutlineResult<RenderSummary> {
        let decoders = self
            .decoders
            .iter()
            .map(|(id, d)| (id.clone(), d.stats()))
            .collect();
        let encoder = self.teardown()?;
        tracing::info!(
            output = %self.output.display(),
            frames = self.stats.frames_encoded,
            zero_copy = self.stats.zero_copy_frames,
            dropped = self.stats.dropped,
            "Render finished"
        );
        Ok(RenderSummary {
            output: self.output.clone(),
            stats: self.stats,
            encoder,
            decoders,
        })
    }

    fn teardown(&mut self) -> CutlineResult<EncoderStats> {
        if self.finished {
            return Err(CutlineError::render("pipeline already finished"));
        }
        self.finished = true;

        let closed = match self.encoder.take() {
            Some(encoder) => encoder.close(),
            None => Err(CutlineError::render("encoder already closed")),
        };
        while let Some((id, decoder)) = self.decoders.pop_first() {
            drop(decoder);
            tracing::debug!(source = %id, "Source closed");
        }
        self.manager.reset();
        closed
    }
}

impl Drop for RenderPipeline {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.teardown() {
            tracing::error!(output = %self.output.display(), error = %e, "Render teardown failed");
        }
    }
}

fn report(
    progress: Option<&ProgressCallback>,
    done: u64,
    total: u64,
    elapsed_secs: f64,
    stage: RenderStage,
) {
    let Some(cb) = progress else {
        return;
    };
    let fraction = if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    };
    let eta_secs = if fraction > 0.0 {
        (elapsed_secs / fraction - elapsed_secs).max(0.0)
    } else {
        0.0
    };
    cb(RenderProgress {
        progress: fraction,
        frames_rendered: done,
        total_frames: total,
        eta_secs,
        stage,
    });
}
