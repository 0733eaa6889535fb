//! Check hardware capabilities.

use std::sync::Arc;

use cutline_common::config::DrainPolicy;
use cutline_hwaccel::synthetic::SyntheticDeviceProvider;
use cutline_hwaccel::{
    decode_strategy, encoder_name, DecodeStrategy, HardwareBackend, HardwareContextManager,
    HardwareRegistry, VideoCodec,
};
use cutline_media::synthetic::{SyntheticBackend, SyntheticClip};
use cutline_media::{DecoderOptions, EncoderOptions, Rational};
use cutline_render_engine::{clip_range, FrameInstruction, RenderOptions, RenderPipeline};

const CODECS: [VideoCodec; 3] = [VideoCodec::H264, VideoCodec::Hevc, VideoCodec::Av1];

pub fn run(self_test: bool) -> anyhow::Result<()> {
    println!("Cutline System Check");
    println!("{}", "=".repeat(50));

    if cutline_hwaccel::ffmpeg::AVAILABLE {
        println!("[OK] Native codec libraries linked");
    } else {
        println!("[WARN] Built without the `ffmpeg` feature; only software dry runs work");
    }

    let registry = HardwareRegistry::new(cutline_hwaccel::default_provider());
    let report = registry.report();
    println!("[OK] Device provider: {}", report.provider);
    if report.devices.is_empty() {
        println!("[WARN] No GPU devices found; rendering will use software codecs");
    }
    for device in &report.devices {
        let path = device
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("     {} #{} ({path})", device.backend, device.index);
    }
    println!("  Best backend: {}", report.best);

    for backend in &report.available {
        println!();
        println!("  {backend} sessions:");
        for codec in CODECS {
            let encoder = encoder_name(codec, *backend).unwrap_or("-");
            let decoder = match decode_strategy(codec, *backend) {
                DecodeStrategy::Dedicated(name) => name.to_string(),
                DecodeStrategy::AttachContext => format!("{codec} + device context"),
                DecodeStrategy::Unsupported => "-".to_string(),
            };
            println!("     {codec:<5} encode: {encoder:<20} decode: {decoder}");
        }
    }

    if self_test {
        println!();
        run_self_test()?;
    }

    Ok(())
}

/// Render a short synthetic timeline in software and on every simulated
/// backend, checking that each frame reaches the output.
fn run_self_test() -> anyhow::Result<()> {
    println!("Self-test (synthetic media, no GPU required)");
    let (width, height, fps) = (320, 180, Rational::new(30, 1));

    let mut instructions = clip_range("main", 0, 45);
    instructions.push(FrameInstruction::color(cutline_media::Rgba::BLACK));
    instructions.extend(clip_range("main", 60, 90).into_iter().map(|i| i.with_processing()));

    let backends = [
        HardwareBackend::None,
        HardwareBackend::Cuda,
        HardwareBackend::Vaapi,
        HardwareBackend::VideoToolbox,
    ];
    for backend in backends {
        let media = Arc::new(
            SyntheticBackend::new().with_default_clip(SyntheticClip::new(90, width, height, fps)),
        );
        let manager = Arc::new(HardwareContextManager::new(Arc::new(
            SyntheticDeviceProvider::with_backends(&[backend]),
        )));
        let options = RenderOptions {
            encoder: EncoderOptions {
                backend,
                allow_hardware: backend.is_hardware(),
                drain: DrainPolicy::immediate(),
                ..EncoderOptions::new(VideoCodec::H264, width, height, fps)
            },
            decoder: DecoderOptions {
                backend,
                allow_hardware: backend.is_hardware(),
                teardown_delay: std::time::Duration::ZERO,
                ..DecoderOptions::default()
            },
        };

        let mut pipeline = RenderPipeline::new("self-test.mp4", media.clone(), manager, options)?;
        pipeline.add_source("main", "main.mp4");
        pipeline.render_all(&instructions, None)?;
        let summary = pipeline.finish()?;
        let packets = media
            .sink("self-test.mp4")
            .map(|sink| sink.packet_count() as u64)
            .unwrap_or(0);

        if packets != summary.stats.frames_encoded || summary.encoder.abandoned_frames > 0 {
            anyhow::bail!(
                "{backend}: {packets} packets for {} frames",
                summary.stats.frames_encoded
            );
        }
        println!(
            "[OK] {backend:<12} {} frames ({} zero-copy, {} cpu, {} fill)",
            summary.stats.frames_encoded,
            summary.stats.zero_copy_frames,
            summary.stats.cpu_frames,
            summary.stats.color_frames
        );
    }
    Ok(())
}
