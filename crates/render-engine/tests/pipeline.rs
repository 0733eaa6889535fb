use std::sync::{Arc, Mutex};
use std::time::Duration;

use cutline_common::config::DrainPolicy;
use cutline_hwaccel::synthetic::{LifecycleLog, SyntheticDeviceProvider};
use cutline_hwaccel::{HardwareBackend, HardwareContextManager, VideoCodec};
use cutline_media::synthetic::{SyntheticBackend, SyntheticClip};
use cutline_media::{DecoderOptions, EncoderOptions, Rational, Rgba};
use cutline_render_engine::{
    clip_range, render_job, FrameInstruction, FrameOutcome, RenderJob, RenderOptions,
    RenderPipeline, RenderStage,
};
use proptest::prelude::*;

const W: u32 = 64;
const H: u32 = 36;
const OUT: &str = "render.mp4";

fn fps() -> Rational {
    Rational::new(30, 1)
}

fn options(hardware: bool) -> RenderOptions {
    let backend = if hardware {
        HardwareBackend::Auto
    } else {
        HardwareBackend::None
    };
    RenderOptions {
        encoder: EncoderOptions {
            backend,
            allow_hardware: hardware,
            drain: DrainPolicy::immediate(),
            ..EncoderOptions::new(VideoCodec::H264, W, H, fps())
        },
        decoder: DecoderOptions {
            backend,
            allow_hardware: hardware,
            teardown_delay: Duration::ZERO,
            ..DecoderOptions::default()
        },
    }
}

fn media() -> Arc<SyntheticBackend> {
    Arc::new(
        SyntheticBackend::new()
            .with_clip("a.mp4", SyntheticClip::new(30, W, H, fps()))
            .with_clip("b.mp4", SyntheticClip::new(30, W, H, fps()))
            .with_clip("small.mp4", SyntheticClip::new(10, W / 2, H / 2, fps())),
    )
}

fn manager(backends: &[HardwareBackend]) -> Arc<HardwareContextManager> {
    Arc::new(HardwareContextManager::new(Arc::new(
        SyntheticDeviceProvider::with_backends(backends),
    )))
}

fn pipeline(
    media: &Arc<SyntheticBackend>,
    manager: &Arc<HardwareContextManager>,
    hardware: bool,
) -> RenderPipeline {
    let mut pipeline =
        RenderPipeline::new(OUT, media.clone(), manager.clone(), options(hardware))
            .expect("pipeline should open");
    pipeline
        .add_source("a", "a.mp4")
        .add_source("b", "b.mp4")
        .add_source("small", "small.mp4")
        .add_source("missing", "missing.mp4");
    pipeline
}

#[test]
fn software_render_interleaves_sources_and_fills() {
    let media = media();
    let mgr = manager(&[]);
    let mut pipeline = pipeline(&media, &mgr, true);

    let mut instructions = clip_range("a", 0, 10);
    instructions.push(FrameInstruction::color(Rgba::BLACK));
    instructions.push(FrameInstruction::skip());
    instructions.extend(clip_range("b", 20, 25));
    pipeline.render_all(&instructions, None).expect("render");

    let summary = pipeline.finish().expect("finish");
    assert_eq!(summary.stats.frames_encoded, 16);
    assert_eq!(summary.stats.cpu_frames, 15);
    assert_eq!(summary.stats.color_frames, 1);
    assert_eq!(summary.stats.skipped, 1);
    assert_eq!(summary.stats.zero_copy_frames, 0);
    assert_eq!(summary.stats.sources_opened, 2);
    assert_eq!(summary.encoder.packets_written, 16);
    assert_eq!(summary.decoders.len(), 2);

    let payloads = media.sink(OUT).expect("sink").payloads();
    let clip = SyntheticClip::new(30, W, H, fps());
    assert_eq!(payloads[0], clip.frame_checksum(0).unwrap().to_le_bytes().to_vec());
    assert_eq!(payloads[11], clip.frame_checksum(20).unwrap().to_le_bytes().to_vec());
}

#[test]
fn hardware_sessions_pass_frames_through_the_gpu() {
    let media = media();
    let mgr = manager(&[HardwareBackend::Cuda]);
    let mut pipeline = pipeline(&media, &mgr, true);

    let first = pipeline.render_frame(&FrameInstruction::clip("a", 0)).unwrap();
    assert_eq!(first, FrameOutcome::Encoded { zero_copy: true });
    let processed = pipeline
        .render_frame(&FrameInstruction::clip("a", 1).with_processing())
        .unwrap();
    assert_eq!(processed, FrameOutcome::Encoded { zero_copy: false });
    let scaled = pipeline.render_frame(&FrameInstruction::clip("small", 0)).unwrap();
    assert_eq!(scaled, FrameOutcome::Encoded { zero_copy: false });

    let summary = pipeline.finish().unwrap();
    assert_eq!(summary.stats.zero_copy_frames, 1);
    assert_eq!(summary.stats.cpu_frames, 2);
    assert_eq!(summary.encoder.zero_copy_frames, 1);
    assert_eq!(summary.encoder.uploads, 2);
    assert!(!mgr.is_initialized());
}

#[test]
fn zero_copy_output_matches_the_cpu_path() {
    let run = |processing: bool| {
        let media = media();
        let mgr = manager(&[HardwareBackend::Vaapi]);
        let mut pipeline = pipeline(&media, &mgr, true);
        let instructions: Vec<_> = clip_range("a", 0, 30)
            .into_iter()
            .map(|i| if processing { i.with_processing() } else { i })
            .collect();
        pipeline.render_all(&instructions, None).unwrap();
        let summary = pipeline.finish().unwrap();
        (summary.stats, media.sink(OUT).unwrap().payloads())
    };
    let (direct, direct_payloads) = run(false);
    let (cpu, cpu_payloads) = run(true);
    assert_eq!(direct.zero_copy_frames, 30);
    assert_eq!(cpu.cpu_frames, 30);
    assert_eq!(direct_payloads, cpu_payloads);
}

#[test]
fn exhausted_sources_drop_their_remaining_frames() {
    let media = media();
    let mgr = manager(&[]);
    let mut pipeline = pipeline(&media, &mgr, false);

    let mut instructions = clip_range("small", 0, 14);
    instructions.extend(clip_range("a", 0, 3));
    pipeline.render_all(&instructions, None).unwrap();
    assert!(pipeline.is_exhausted("small"));
    assert!(!pipeline.is_exhausted("a"));
    assert_eq!(
        pipeline.render_frame(&FrameInstruction::clip("small", 0)).unwrap(),
        FrameOutcome::Dropped
    );

    let summary = pipeline.finish().unwrap();
    assert_eq!(summary.stats.frames_encoded, 13);
    assert_eq!(summary.stats.dropped, 5);
    assert_eq!(summary.stats.exhausted_sources, 1);
    assert_eq!(media.sink(OUT).unwrap().packet_count(), 13);
}

#[test]
fn unknown_or_missing_sources_are_errors() {
    let media = media();
    let mgr = manager(&[]);
    let mut pipeline = pipeline(&media, &mgr, false);
    assert!(pipeline.render_frame(&FrameInstruction::clip("nope", 0)).is_err());
    assert!(pipeline.render_frame(&FrameInstruction::clip("missing", 0)).is_err());
    assert!(pipeline.render_frame(&FrameInstruction::clip("a", 0)).is_ok());
}

#[test]
fn finish_releases_encoder_then_decoders_then_context() {
    let log = LifecycleLog::default();
    let media = Arc::new(
        SyntheticBackend::new()
            .with_default_clip(SyntheticClip::new(10, W, H, fps()))
            .with_log(log.clone()),
    );
    let mgr = Arc::new(HardwareContextManager::new(Arc::new(
        SyntheticDeviceProvider::with_backends(&[HardwareBackend::Cuda]).with_log(log.clone()),
    )));
    let mut pipeline = RenderPipeline::new(OUT, media.clone(), mgr.clone(), options(true)).unwrap();
    pipeline.add_source("a", "a.mp4");
    pipeline.render_all(&clip_range("a", 0, 10), None).unwrap();
    pipeline.finish().unwrap();

    let expected: Vec<String> = [
        "sink.close",
        "encoder.stop",
        "encoder.release",
        "decoder.stop",
        "decoder.release",
        "context.release",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    assert_eq!(log.entries(), expected);
}

#[test]
fn dropping_an_unfinished_pipeline_still_writes_the_trailer() {
    let media = media();
    let mgr = manager(&[HardwareBackend::Cuda]);
    let mut pipeline = pipeline(&media, &mgr, true);
    pipeline.render_all(&clip_range("a", 0, 5), None).unwrap();
    drop(pipeline);

    let sink = media.sink(OUT).unwrap();
    assert_eq!(sink.trailers(), 1);
    assert_eq!(sink.packet_count(), 5);
    assert!(!mgr.is_initialized());
}

#[tokio::test]
async fn render_job_reports_progress_through_completion() {
    let media = media();
    let stages = Arc::new(Mutex::new(Vec::new()));
    let seen = stages.clone();
    let job = RenderJob {
        output: OUT.into(),
        sources: vec![("a".into(), "a.mp4".into())],
        instructions: clip_range("a", 0, 12),
        options: options(false),
    };

    let summary = render_job(
        job,
        media.clone(),
        manager(&[]),
        Some(Box::new(move |p| seen.lock().unwrap().push((p.stage, p.frames_rendered)))),
    )
    .await
    .expect("render job");

    assert_eq!(summary.stats.frames_encoded, 12);
    let stages = stages.lock().unwrap();
    assert_eq!(stages.first(), Some(&(RenderStage::Preparing, 0)));
    assert_eq!(stages.last(), Some(&(RenderStage::Complete, 12)));
    assert_eq!(
        stages.iter().filter(|(s, _)| *s == RenderStage::Rendering).count(),
        12
    );
}

fn instruction() -> impl Strategy<Value = FrameInstruction> {
    prop_oneof![
        4 => (prop::sample::select(vec!["a", "b", "small"]), 0u64..36, any::<bool>()).prop_map(
            |(id, index, processing)| {
                let i = FrameInstruction::clip(id, index);
                if processing { i.with_processing() } else { i }
            }
        ),
        1 => any::<u8>().prop_map(|v| FrameInstruction::color(Rgba::new(v, v, v, 255))),
        1 => Just(FrameInstruction::skip()),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_instruction_is_accounted_for(
        instructions in prop::collection::vec(instruction(), 0..60),
        hardware in any::<bool>(),
    ) {
        let media = media();
        let mgr = manager(&[HardwareBackend::Cuda]);
        let mut pipeline = pipeline(&media, &mgr, hardware);
        pipeline.render_all(&instructions, None).unwrap();
        let summary = pipeline.finish().unwrap();

        let stats = summary.stats;
        prop_assert_eq!(stats.instructions, instructions.len() as u64);
        prop_assert_eq!(stats.frames_encoded + stats.skipped + stats.dropped, stats.instructions);
        prop_assert_eq!(stats.zero_copy_frames + stats.cpu_frames + stats.color_frames, stats.frames_encoded);
        prop_assert_eq!(summary.encoder.packets_written, stats.frames_encoded);
        prop_assert_eq!(media.sink(OUT).unwrap().packet_count() as u64, stats.frames_encoded);
        if !hardware {
            prop_assert_eq!(stats.zero_copy_frames, 0);
        }
        prop_assert!(!mgr.is_initialized());
    }
}
