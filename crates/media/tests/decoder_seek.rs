use std::sync::Arc;
use std::time::Duration;

use cutline_hwaccel::synthetic::SyntheticDeviceProvider;
use cutline_hwaccel::{HardwareBackend, HardwareContextManager};
use cutline_media::synthetic::{SyntheticBackend, SyntheticClip, TimestampMode};
use cutline_media::{DecoderOptions, Rational, SourceDecoder};
use proptest::prelude::*;

const CLIP: &str = "clip.mp4";

fn clip(frames: u64) -> SyntheticClip {
    SyntheticClip::new(frames, 64, 36, Rational::new(30, 1))
}

fn software_options() -> DecoderOptions {
    DecoderOptions {
        teardown_delay: Duration::ZERO,
        ..DecoderOptions::default()
    }
}

fn hardware_options(backend: HardwareBackend) -> DecoderOptions {
    DecoderOptions {
        backend,
        allow_hardware: true,
        ..software_options()
    }
}

fn no_hardware() -> HardwareContextManager {
    HardwareContextManager::new(Arc::new(SyntheticDeviceProvider::unavailable()))
}

fn cuda() -> HardwareContextManager {
    HardwareContextManager::new(Arc::new(SyntheticDeviceProvider::with_backends(&[
        HardwareBackend::Cuda,
    ])))
}

fn checksum(decoder: &mut SourceDecoder, index: u64) -> u64 {
    decoder
        .get_frame(index)
        .unwrap_or_else(|| panic!("frame {index} should decode"))
        .checksum()
        .expect("decoded frames live on the CPU")
}

#[test]
fn sequential_decode_of_ten_seconds_seeks_once() {
    let media = SyntheticBackend::new().with_clip(CLIP, clip(300));
    let manager = no_hardware();
    let mut decoder =
        SourceDecoder::open(CLIP, &media, &manager, software_options()).expect("open source");
    assert_eq!(decoder.frame_count(), 300);

    let mut delivered = 0;
    for index in 0..300 {
        let frame = decoder.get_frame(index).expect("sequential frame");
        assert_eq!(frame.checksum().unwrap(), clip(300).frame_checksum(index).unwrap());
        delivered += 1;
    }
    assert_eq!(delivered, 300);
    assert_eq!(decoder.stats().container_seeks, 1);
    assert_eq!(media.probe(CLIP).unwrap().seeks(), 1);
    assert!(decoder.get_frame(300).is_none());
}

#[test]
fn last_then_first_frame_costs_two_seeks() {
    let source = clip(300);
    let media = SyntheticBackend::new().with_clip(CLIP, source.clone());
    let manager = no_hardware();
    let mut decoder =
        SourceDecoder::open(CLIP, &media, &manager, software_options()).expect("open source");

    assert_eq!(checksum(&mut decoder, 299), source.frame_checksum(299).unwrap());
    assert_eq!(checksum(&mut decoder, 0), source.frame_checksum(0).unwrap());
    assert_eq!(decoder.stats().container_seeks, 2);
    assert_eq!(media.probe(CLIP).unwrap().seek_targets(), vec![299, 0]);
}

#[test]
fn repeated_requests_return_identical_content() {
    let media = SyntheticBackend::new().with_clip(CLIP, clip(120));
    let manager = no_hardware();
    let mut decoder =
        SourceDecoder::open(CLIP, &media, &manager, software_options()).expect("open source");

    let first = checksum(&mut decoder, 45);
    let seeks = decoder.stats().container_seeks;
    assert_eq!(checksum(&mut decoder, 45), first);
    assert_eq!(decoder.stats().container_seeks, seeks);

    checksum(&mut decoder, 3);
    assert_eq!(checksum(&mut decoder, 45), first);
}

#[test]
fn threshold_boundary_is_inclusive() {
    let media = SyntheticBackend::new().with_clip(CLIP, clip(300));
    let manager = no_hardware();
    let mut decoder =
        SourceDecoder::open(CLIP, &media, &manager, software_options()).expect("open source");

    checksum(&mut decoder, 10);
    checksum(&mut decoder, 70);
    assert_eq!(decoder.stats().container_seeks, 1, "a 60-frame jump decodes forward");
    checksum(&mut decoder, 131);
    assert_eq!(decoder.stats().container_seeks, 2, "a 61-frame jump seeks");
}

#[test]
fn configured_threshold_replaces_the_default() {
    let media = SyntheticBackend::new().with_clip(CLIP, clip(300));
    let manager = no_hardware();
    let options = DecoderOptions {
        seek_threshold: 5,
        ..software_options()
    };
    let mut decoder = SourceDecoder::open(CLIP, &media, &manager, options).expect("open source");

    checksum(&mut decoder, 0);
    checksum(&mut decoder, 5);
    assert_eq!(decoder.stats().container_seeks, 1);
    checksum(&mut decoder, 11);
    assert_eq!(decoder.stats().container_seeks, 2);
}

#[test]
fn corrupt_packets_are_skipped_and_the_gap_is_held() {
    let source = clip(60).with_corrupt_frames([5]);
    let media = SyntheticBackend::new().with_clip(CLIP, source.clone());
    let manager = no_hardware();
    let mut decoder =
        SourceDecoder::open(CLIP, &media, &manager, software_options()).expect("open source");

    for index in 0..5 {
        assert_eq!(checksum(&mut decoder, index), source.frame_checksum(index).unwrap());
    }
    let next = source.frame_checksum(6).unwrap();
    assert_eq!(checksum(&mut decoder, 5), next);
    assert_eq!(checksum(&mut decoder, 6), next);
    assert_eq!(checksum(&mut decoder, 7), source.frame_checksum(7).unwrap());
    assert_eq!(decoder.stats().decode_errors, 1);
}

#[test]
fn untimed_frames_are_counted_from_the_seek_landing() {
    let source = clip(120).with_timestamps(TimestampMode::IndexOnly);
    let media = SyntheticBackend::new().with_clip(CLIP, source.clone());
    let manager = no_hardware();
    let mut decoder =
        SourceDecoder::open(CLIP, &media, &manager, software_options()).expect("open source");

    assert_eq!(checksum(&mut decoder, 45), source.frame_checksum(45).unwrap());
    assert_ne!(checksum(&mut decoder, 45), source.frame_checksum(30).unwrap());
    assert_eq!(checksum(&mut decoder, 10), source.frame_checksum(10).unwrap());
    assert_eq!(checksum(&mut decoder, 100), source.frame_checksum(100).unwrap());
    assert_eq!(media.probe(CLIP).unwrap().seek_targets(), vec![45, 10, 100]);
}

#[test]
fn seeks_without_a_landing_rewind_to_the_start() {
    let source = clip(120).with_timestamps(TimestampMode::Missing);
    let media = SyntheticBackend::new().with_clip(CLIP, source.clone());
    let manager = no_hardware();
    let mut decoder =
        SourceDecoder::open(CLIP, &media, &manager, software_options()).expect("open source");

    assert_eq!(checksum(&mut decoder, 45), source.frame_checksum(45).unwrap());
    assert_eq!(checksum(&mut decoder, 10), source.frame_checksum(10).unwrap());
    assert_eq!(checksum(&mut decoder, 11), source.frame_checksum(11).unwrap());
    assert_eq!(media.probe(CLIP).unwrap().seek_targets(), vec![45, 0, 10, 0]);
    assert_eq!(decoder.stats().container_seeks, 4);
}

#[test]
fn missing_source_is_a_construction_error() {
    let media = SyntheticBackend::new();
    let manager = no_hardware();
    assert!(SourceDecoder::open("absent.mp4", &media, &manager, software_options()).is_err());
}

#[test]
fn unavailable_hardware_falls_back_to_software() {
    let media = SyntheticBackend::new().with_clip(CLIP, clip(30));
    let manager = no_hardware();
    let mut decoder = SourceDecoder::open(
        CLIP,
        &media,
        &manager,
        hardware_options(HardwareBackend::Cuda),
    )
    .expect("fallback is not an error");

    assert!(!decoder.is_using_hardware());
    assert_eq!(decoder.backend(), HardwareBackend::None);
    assert!(decoder.fallback_reason().is_some());
    assert!(decoder.get_frame(0).is_some());
}

#[test]
fn failed_hardware_session_falls_back_to_software() {
    let media = SyntheticBackend::new()
        .with_clip(CLIP, clip(30))
        .with_hardware_sessions(false, true);
    let manager = cuda();
    let decoder = SourceDecoder::open(CLIP, &media, &manager, hardware_options(HardwareBackend::Auto))
        .expect("fallback is not an error");
    assert!(!decoder.is_using_hardware());
}

#[test]
fn hardware_decode_matches_software_decode() {
    let source = clip(90);
    let media = SyntheticBackend::new().with_clip(CLIP, source.clone());
    let hw_manager = cuda();
    let sw_manager = no_hardware();
    let mut hardware = SourceDecoder::open(
        CLIP,
        &media,
        &hw_manager,
        hardware_options(HardwareBackend::Auto),
    )
    .expect("open hardware");
    let mut software =
        SourceDecoder::open(CLIP, &media, &sw_manager, software_options()).expect("open software");

    assert!(hardware.is_using_hardware());
    assert_eq!(hardware.backend(), HardwareBackend::Cuda);
    for index in [0, 1, 2, 40, 17, 89] {
        assert_eq!(checksum(&mut hardware, index), checksum(&mut software, index));
    }

    let resident = hardware.get_hardware_frame(50).expect("device frame");
    assert!(resident.is_resident());
    assert!(software.get_hardware_frame(50).unwrap().cpu_buffer().is_some());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn container_seek_happens_iff_backward_or_far(a in 0u64..200, b in 0u64..200) {
        let media = SyntheticBackend::new().with_clip(CLIP, clip(200));
        let manager = no_hardware();
        let mut decoder = SourceDecoder::open(CLIP, &media, &manager, software_options()).unwrap();

        prop_assert!(decoder.get_frame(a).is_some());
        let before = decoder.stats().container_seeks;
        prop_assert!(decoder.get_frame(b).is_some());
        let seeked = decoder.stats().container_seeks > before;
        prop_assert_eq!(seeked, b < a || b - a > 60);
    }

    #[test]
    fn random_access_always_returns_the_requested_frame(
        indices in proptest::collection::vec(0u64..150, 1..12),
        timestamps in prop_oneof![
            Just(TimestampMode::Full),
            Just(TimestampMode::IndexOnly),
            Just(TimestampMode::Missing),
        ],
    ) {
        let source = clip(150).with_timestamps(timestamps);
        let media = SyntheticBackend::new().with_clip(CLIP, source.clone());
        let manager = no_hardware();
        let mut decoder = SourceDecoder::open(CLIP, &media, &manager, software_options()).unwrap();
        for index in indices {
            let frame = decoder.get_frame(index).unwrap();
            prop_assert_eq!(frame.checksum().unwrap(), source.frame_checksum(index).unwrap());
        }
    }
}
