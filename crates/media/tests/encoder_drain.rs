use std::sync::Arc;
use std::time::Duration;

use cutline_common::config::DrainPolicy;
use cutline_hwaccel::synthetic::SyntheticDeviceProvider;
use cutline_hwaccel::{HardwareBackend, HardwareContextManager, PixelFormat, VideoCodec};
use cutline_media::synthetic::{render_pattern, EncoderScript, SyntheticBackend, SyntheticClip};
use cutline_media::{
    ContextOwnership, DecoderOptions, EncodeMode, EncoderOptions, Frame, FramePool, OutputEncoder,
    Rational, SourceDecoder,
};
use proptest::prelude::*;

const OUT: &str = "out.mp4";
const W: u32 = 64;
const H: u32 = 36;

fn options() -> EncoderOptions {
    EncoderOptions {
        drain: DrainPolicy::immediate(),
        ..EncoderOptions::new(VideoCodec::H264, W, H, Rational::new(30, 1))
    }
}

fn hardware_options() -> EncoderOptions {
    EncoderOptions {
        backend: HardwareBackend::Auto,
        allow_hardware: true,
        ..options()
    }
}

fn manager(backends: &[HardwareBackend]) -> Arc<HardwareContextManager> {
    Arc::new(HardwareContextManager::new(Arc::new(
        SyntheticDeviceProvider::with_backends(backends),
    )))
}

fn pattern(pool: &FramePool, index: u64) -> Frame {
    let buffer = render_pattern(index, W, H, PixelFormat::Yuv420p, pool).expect("render");
    Frame::cpu(buffer, None, Default::default())
}

#[test]
fn software_session_writes_every_frame() {
    let media = SyntheticBackend::new();
    let mgr = manager(&[]);
    let mut encoder = OutputEncoder::create(OUT, &media, &mgr, options()).expect("create");
    assert_eq!(encoder.mode(), EncodeMode::Synchronous);
    assert!(!encoder.is_using_hardware());

    let pool = FramePool::new(4);
    for index in 0..25 {
        encoder.write_frame(&pattern(&pool, index)).expect("write");
        let stats = encoder.stats();
        assert_eq!(stats.packets_written + encoder.in_flight(), stats.frames_submitted);
    }
    let stats = encoder.close().expect("close");
    assert_eq!(stats.frames_submitted, 25);
    assert_eq!(stats.packets_written, 25);

    let sink = media.sink(OUT).expect("sink opened");
    assert_eq!(sink.trailers(), 1);
    assert!(sink.is_closed());
    let first = sink.payloads()[0].clone();
    assert_eq!(first, pattern(&pool, 0).checksum().unwrap().to_le_bytes().to_vec());
}

#[test]
fn packets_are_rescaled_into_the_container_time_base() {
    let media = SyntheticBackend::new();
    let mgr = manager(&[]);
    let mut encoder = OutputEncoder::create(OUT, &media, &mgr, options()).expect("create");
    let pool = FramePool::new(4);
    for index in 0..4 {
        encoder.write_frame(&pattern(&pool, index)).unwrap();
    }
    encoder.close().unwrap();

    let pts: Vec<_> = media
        .sink(OUT)
        .unwrap()
        .packets()
        .iter()
        .map(|p| p.pts.unwrap())
        .collect();
    assert_eq!(pts, vec![0, 3000, 6000, 9000]);
}

#[test]
fn finalize_twice_is_the_same_as_once() {
    let media = SyntheticBackend::new();
    let mgr = manager(&[]);
    let mut encoder = OutputEncoder::create(OUT, &media, &mgr, options()).expect("create");
    let pool = FramePool::new(4);
    for index in 0..10 {
        encoder.write_frame(&pattern(&pool, index)).unwrap();
    }
    encoder.finalize().unwrap();
    let once = media.sink(OUT).unwrap().snapshot();
    encoder.finalize().unwrap();
    let twice = media.sink(OUT).unwrap().snapshot();

    assert_eq!(once.packets, twice.packets);
    assert_eq!(twice.trailers, 1);
    assert!(encoder.is_finalized());
    assert_eq!(encoder.in_flight(), 0);
    assert!(encoder.write_frame(&pattern(&pool, 10)).is_err());
}

#[test]
fn failed_flush_is_reported_again_on_close() {
    let script = EncoderScript {
        fail_eos: true,
        ..EncoderScript::default()
    };
    let media = SyntheticBackend::new().with_encoder_script(script);
    let mgr = manager(&[]);
    let mut encoder = OutputEncoder::create(OUT, &media, &mgr, options()).expect("create");
    let pool = FramePool::new(4);
    for index in 0..5 {
        encoder.write_frame(&pattern(&pool, index)).unwrap();
    }

    assert!(encoder.finalize().is_err());
    assert!(encoder.finalize().is_err(), "a failed finalize is not forgotten");
    assert!(!encoder.is_finalized());
    assert!(encoder.write_frame(&pattern(&pool, 5)).is_err());
    assert!(encoder.close().is_err());

    let sink = media.sink(OUT).unwrap();
    assert_eq!(sink.trailers(), 0);
    assert!(sink.is_closed());
}

#[test]
fn hardware_session_runs_asynchronously_and_owns_its_context() {
    let media = SyntheticBackend::new();
    let mgr = manager(&[HardwareBackend::Vaapi]);
    let mut encoder =
        OutputEncoder::create(OUT, &media, &mgr, hardware_options()).expect("create");
    assert_eq!(encoder.mode(), EncodeMode::Asynchronous);
    assert_eq!(encoder.backend(), HardwareBackend::Vaapi);
    assert_eq!(encoder.ownership(), ContextOwnership::Owned);
    assert_eq!(encoder.settings().input_format, PixelFormat::Nv12);

    let pool = FramePool::new(4);
    for index in 0..40 {
        encoder.write_frame(&pattern(&pool, index)).unwrap();
        let stats = encoder.stats();
        assert_eq!(stats.packets_written + encoder.in_flight(), stats.frames_submitted);
        assert!(encoder.in_flight() <= 8);
    }
    let stats = encoder.close().unwrap();
    assert_eq!(stats.packets_written, 40);
    assert_eq!(stats.uploads, 40);
    assert_eq!(stats.conversions, 40);
    assert!(!mgr.is_initialized(), "owned context is reset on close");
}

#[test]
fn unsupported_codec_on_the_backend_falls_back() {
    let media = SyntheticBackend::new();
    let mgr = manager(&[HardwareBackend::VideoToolbox]);
    let opts = EncoderOptions {
        codec: VideoCodec::Av1,
        ..hardware_options()
    };
    let encoder = OutputEncoder::create(OUT, &media, &mgr, opts).expect("fallback");
    assert!(!encoder.is_using_hardware());
    assert_eq!(encoder.mode(), EncodeMode::Synchronous);
    assert!(!mgr.is_initialized(), "a context created only for the attempt is dropped");
}

#[test]
fn wedged_flush_is_bounded_and_reported() {
    let script = EncoderScript {
        stall_after_eos: true,
        ..EncoderScript::default()
    };
    let media = SyntheticBackend::new().with_encoder_script(script);
    let mgr = manager(&[HardwareBackend::Cuda]);
    let opts = EncoderOptions {
        drain: DrainPolicy {
            max_flush_iterations: 5,
            max_drain_attempts: 3,
            ..DrainPolicy::immediate()
        },
        ..hardware_options()
    };
    let mut encoder = OutputEncoder::create(OUT, &media, &mgr, opts).expect("create");
    let pool = FramePool::new(4);
    for index in 0..12 {
        encoder.write_frame(&pattern(&pool, index)).unwrap();
    }
    encoder.finalize().expect("budget exhaustion is not an error");
    assert_eq!(encoder.in_flight(), 0);

    let stats = encoder.close().unwrap();
    assert_eq!(stats.abandoned_frames, 2);
    assert_eq!(stats.packets_written, 10);
    assert_eq!(media.sink(OUT).unwrap().trailers(), 1);
}

#[test]
fn zero_copy_and_upload_produce_identical_packets() {
    let clip = SyntheticClip::new(30, W, H, Rational::new(30, 1));
    let run = |zero_copy: bool, out: &str| {
        let media = SyntheticBackend::new().with_default_clip(clip.clone());
        let mgr = manager(&[HardwareBackend::Cuda]);
        let mut decoder = SourceDecoder::open(
            "in.mp4",
            &media,
            &mgr,
            DecoderOptions {
                backend: HardwareBackend::Auto,
                allow_hardware: true,
                teardown_delay: Duration::ZERO,
                ..DecoderOptions::default()
            },
        )
        .expect("decoder");
        let mut encoder = OutputEncoder::create(
            out,
            &media,
            &mgr,
            EncoderOptions {
                zero_copy,
                ..hardware_options()
            },
        )
        .expect("encoder");
        assert_eq!(encoder.ownership(), ContextOwnership::Borrowed);

        for index in 0..30 {
            let frame = if zero_copy {
                decoder.get_hardware_frame(index)
            } else {
                decoder.get_frame(index)
            }
            .expect("frame");
            encoder.write_hardware_frame(&frame).unwrap();
        }
        let stats = encoder.close().unwrap();
        (stats, media.sink(out).unwrap().payloads())
    };

    let (direct, direct_payloads) = run(true, "direct.mp4");
    let (uploaded, uploaded_payloads) = run(false, "uploaded.mp4");
    assert_eq!(direct.zero_copy_frames, 30);
    assert_eq!(direct.uploads, 0);
    assert_eq!(uploaded.zero_copy_frames, 0);
    assert_eq!(uploaded.uploads, 30);
    assert_eq!(direct_payloads, uploaded_payloads);
}

#[test]
fn foreign_device_frames_are_rejected() {
    let media = SyntheticBackend::new().with_default_clip(SyntheticClip::new(
        5,
        W / 2,
        H / 2,
        Rational::new(30, 1),
    ));
    let mgr = manager(&[HardwareBackend::Cuda]);
    let mut decoder = SourceDecoder::open(
        "small.mp4",
        &media,
        &mgr,
        DecoderOptions {
            backend: HardwareBackend::Cuda,
            allow_hardware: true,
            teardown_delay: Duration::ZERO,
            ..DecoderOptions::default()
        },
    )
    .unwrap();
    let mut encoder = OutputEncoder::create(OUT, &media, &mgr, hardware_options()).unwrap();
    let frame = decoder.get_hardware_frame(0).unwrap();
    assert!(encoder.write_hardware_frame(&frame).is_err());
    assert!(encoder.write_frame(&frame).is_err());
}

#[test]
fn software_fallback_matches_a_software_only_run() {
    let run = |mgr: Arc<HardwareContextManager>, opts: EncoderOptions| {
        let media = SyntheticBackend::new();
        let mut encoder = OutputEncoder::create(OUT, &media, &mgr, opts).expect("create");
        let pool = FramePool::new(4);
        for index in 0..20 {
            encoder.write_frame(&pattern(&pool, index)).unwrap();
        }
        assert!(!encoder.is_using_hardware());
        encoder.close().unwrap();
        media.sink(OUT).unwrap().payloads()
    };
    let fallback = run(manager(&[]), hardware_options());
    let software = run(manager(&[HardwareBackend::Cuda]), options());
    assert_eq!(fallback, software);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_accepted_frame_becomes_a_packet(
        frames in 0u64..40,
        latency in 0usize..4,
        headroom in 1usize..8,
        again_every in proptest::option::of(2u64..5),
        report_capacity in any::<bool>(),
        hardware in any::<bool>(),
    ) {
        let script = EncoderScript {
            queue_capacity: latency + headroom,
            report_capacity,
            latency,
            again_every,
            stall_after_eos: false,
            fail_eos: false,
        };
        let media = SyntheticBackend::new().with_encoder_script(script);
        let mgr = manager(&[HardwareBackend::Cuda]);
        let opts = if hardware { hardware_options() } else { options() };
        let mut encoder = OutputEncoder::create(OUT, &media, &mgr, opts).unwrap();
        let pool = FramePool::new(4);

        for index in 0..frames {
            encoder.write_frame(&pattern(&pool, index)).unwrap();
            let stats = encoder.stats();
            prop_assert_eq!(stats.packets_written + encoder.in_flight(), stats.frames_submitted);
        }
        encoder.finalize().unwrap();
        prop_assert_eq!(encoder.in_flight(), 0);
        let stats = encoder.close().unwrap();
        prop_assert_eq!(stats.packets_written, frames);
        prop_assert_eq!(stats.abandoned_frames, 0);
        prop_assert_eq!(media.sink(OUT).unwrap().packet_count() as u64, frames);
    }
}
