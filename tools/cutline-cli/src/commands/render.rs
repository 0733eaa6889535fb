//! Render a source through the pipeline.

use std::sync::Arc;

use cutline_common::config::AppConfig;
use cutline_hwaccel::{default_provider, HardwareContextManager};
use cutline_media::ffmpeg::FfmpegBackend;
use cutline_media::MediaBackend;
use cutline_render_engine::{
    clip_range, parse_instructions, render_job, RenderJob, RenderOptions, RenderProgress,
};

use crate::RenderArgs;

/// Fold command-line overrides into the loaded configuration.
fn apply_overrides(config: &mut AppConfig, args: &RenderArgs) {
    if let Some(backend) = &args.hwaccel {
        config.hardware.backend = backend.clone();
    }
    if let Some(device) = args.device {
        config.hardware.device_index = device;
    }
    if args.no_hw_decode {
        config.hardware.decode = false;
    }
    if args.no_hw_encode {
        config.hardware.encode = false;
    }
    if let Some(codec) = &args.codec {
        config.encoder.codec = codec.clone();
    }
    if args.bitrate.is_some() {
        config.encoder.bitrate_kbps = args.bitrate;
    }
    if args.quality.is_some() {
        config.encoder.quality = args.quality;
    }
    if args.preset.is_some() {
        config.encoder.preset = args.preset.clone();
    }
    if let Some(threads) = args.threads {
        config.encoder.threads = threads;
        config.decoder.threads = threads;
    }
}

pub async fn run(args: RenderArgs) -> anyhow::Result<()> {
    let mut config = AppConfig::load();
    apply_overrides(&mut config, &args);

    let media = Arc::new(FfmpegBackend::new());
    let info = media
        .open_source(&args.input)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", args.input.display()))?
        .stream_info()
        .clone();

    let width = args.width.unwrap_or(info.width);
    let height = args.height.unwrap_or(info.height);
    let instructions = match &args.instructions {
        Some(path) => parse_instructions(&std::fs::read_to_string(path)?)?,
        None => {
            let end = args.end.unwrap_or_else(|| info.total_frames());
            if end <= args.start {
                anyhow::bail!("empty frame range {}..{end}", args.start);
            }
            clip_range("main", args.start, end)
        }
    };

    println!("Rendering: {}", args.input.display());
    println!("  Output: {}", args.output.display());
    println!("  Codec: {}", config.encoder.codec);
    println!("  Resolution: {width}x{height} @ {}", info.frame_rate);
    println!("  Hardware: {}", config.hardware.backend);
    println!("  Frames: {}", instructions.len());

    let job = RenderJob {
        output: args.output.clone(),
        sources: vec![("main".to_string(), args.input.clone())],
        instructions,
        options: RenderOptions::from_config(&config, width, height, info.frame_rate)?,
    };

    let manager: Arc<HardwareContextManager> =
        HardwareContextManager::named("default", default_provider);
    let progress_cb: Box<dyn Fn(RenderProgress) + Send> = Box::new(|p| {
        print!(
            "\r  Progress: {:.1}% ({}/{} frames, ETA: {:.0}s)  ",
            p.progress * 100.0,
            p.frames_rendered,
            p.total_frames,
            p.eta_secs,
        );
    });

    let result = render_job(job, media, manager, Some(progress_cb)).await;
    println!();
    let summary = result.map_err(|e| anyhow::anyhow!("Render failed: {e}"))?;

    println!("Render complete: {}", summary.output.display());
    println!(
        "  Frames: {} encoded ({} zero-copy), {} skipped, {} dropped",
        summary.stats.frames_encoded,
        summary.stats.zero_copy_frames,
        summary.stats.skipped,
        summary.stats.dropped
    );
    println!(
        "  Packets: {} ({} uploads, {} conversions)",
        summary.encoder.packets_written, summary.encoder.uploads, summary.encoder.conversions
    );
    if summary.encoder.abandoned_frames > 0 {
        println!(
            "  Warning: {} frames were abandoned when the encoder stopped responding",
            summary.encoder.abandoned_frames
        );
    }
    for (id, stats) in &summary.decoders {
        println!(
            "  Source {id}: {} delivered, {} seeks, {} decode errors",
            stats.frames_delivered, stats.container_seeks, stats.decode_errors
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: RenderArgs,
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let wrapper = Wrapper::parse_from([
            "cutline",
            "in.mp4",
            "-o",
            "out.mp4",
            "--hwaccel",
            "vaapi",
            "--no-hw-encode",
            "--quality",
            "19",
            "--threads",
            "4",
        ]);
        let mut config = AppConfig::default();
        apply_overrides(&mut config, &wrapper.args);

        assert_eq!(config.hardware.backend, "vaapi");
        assert!(config.hardware.decode);
        assert!(!config.hardware.encode);
        assert_eq!(config.encoder.quality, Some(19));
        assert_eq!(config.encoder.bitrate_kbps, None);
        assert_eq!(config.encoder.threads, 4);
        assert_eq!(config.decoder.threads, 4);
        assert_eq!(config.encoder.codec, AppConfig::default().encoder.codec);
    }
}
