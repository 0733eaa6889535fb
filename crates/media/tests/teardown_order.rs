use std::sync::Arc;
use std::time::Duration;

use cutline_common::config::DrainPolicy;
use cutline_hwaccel::synthetic::{LifecycleLog, SyntheticDeviceProvider};
use cutline_hwaccel::{HardwareBackend, HardwareContextManager, VideoCodec};
use cutline_media::synthetic::{SyntheticBackend, SyntheticClip};
use cutline_media::{
    ContextOwnership, DecoderOptions, EncoderOptions, OutputEncoder, Rational, SourceDecoder,
};

fn setup() -> (LifecycleLog, SyntheticBackend, Arc<HardwareContextManager>) {
    let log = LifecycleLog::default();
    let media = SyntheticBackend::new()
        .with_default_clip(SyntheticClip::new(20, 32, 18, Rational::new(25, 1)))
        .with_log(log.clone());
    let provider =
        SyntheticDeviceProvider::with_backends(&[HardwareBackend::Cuda]).with_log(log.clone());
    let manager = Arc::new(HardwareContextManager::new(Arc::new(provider)));
    (log, media, manager)
}

fn encoder_options(allow_hardware: bool) -> EncoderOptions {
    EncoderOptions {
        backend: HardwareBackend::Auto,
        allow_hardware,
        drain: DrainPolicy::immediate(),
        ..EncoderOptions::new(VideoCodec::H264, 32, 18, Rational::new(25, 1))
    }
}

fn decoder_options(allow_hardware: bool) -> DecoderOptions {
    DecoderOptions {
        backend: HardwareBackend::Auto,
        allow_hardware,
        teardown_delay: Duration::ZERO,
        ..DecoderOptions::default()
    }
}

fn events(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn owned_encoder_releases_the_context_last() {
    let (log, media, manager) = setup();
    let encoder =
        OutputEncoder::create("out.mp4", &media, &manager, encoder_options(true)).expect("create");
    assert_eq!(encoder.ownership(), ContextOwnership::Owned);
    encoder.close().expect("close");

    assert_eq!(
        log.entries(),
        events(&["sink.close", "encoder.stop", "encoder.release", "context.release"])
    );
    assert!(!manager.is_initialized());
}

#[test]
fn borrowed_encoder_leaves_the_context_to_its_owner() {
    let (log, media, manager) = setup();
    let decoder =
        SourceDecoder::open("in.mp4", &media, &manager, decoder_options(true)).expect("decoder");
    let encoder =
        OutputEncoder::create("out.mp4", &media, &manager, encoder_options(true)).expect("create");
    assert_eq!(encoder.ownership(), ContextOwnership::Borrowed);

    encoder.close().expect("close");
    assert_eq!(log.position("context.release"), None);
    assert!(manager.is_initialized());

    manager.reset();
    assert_eq!(log.position("context.release"), None);
    drop(decoder);
    assert_eq!(
        log.entries(),
        events(&[
            "sink.close",
            "encoder.stop",
            "encoder.release",
            "decoder.stop",
            "decoder.release",
            "context.release",
        ])
    );
}

#[test]
fn context_outlives_an_owner_while_a_decoder_holds_it() {
    let (log, media, manager) = setup();
    let encoder =
        OutputEncoder::create("out.mp4", &media, &manager, encoder_options(true)).expect("create");
    assert_eq!(encoder.ownership(), ContextOwnership::Owned);
    let decoder =
        SourceDecoder::open("in.mp4", &media, &manager, decoder_options(true)).expect("decoder");
    assert!(decoder.is_using_hardware());

    encoder.close().expect("close");
    assert!(!manager.is_initialized());
    assert_eq!(log.position("context.release"), None);

    drop(decoder);
    let entries = log.entries();
    assert_eq!(entries.last().map(String::as_str), Some("context.release"));
    assert!(log.position("decoder.stop") < log.position("decoder.release"));
}

#[test]
fn dropping_an_open_encoder_still_finalizes() {
    let (log, media, manager) = setup();
    let encoder =
        OutputEncoder::create("out.mp4", &media, &manager, encoder_options(true)).expect("create");
    drop(encoder);

    let sink = media.sink("out.mp4").expect("sink");
    assert_eq!(sink.trailers(), 1);
    assert!(sink.is_closed());
    assert_eq!(log.entries().last().map(String::as_str), Some("context.release"));
}

#[test]
fn software_sessions_are_released_without_a_stop() {
    let (log, media, manager) = setup();
    let decoder =
        SourceDecoder::open("in.mp4", &media, &manager, decoder_options(false)).expect("decoder");
    let encoder =
        OutputEncoder::create("out.mp4", &media, &manager, encoder_options(false)).expect("create");
    encoder.close().expect("close");
    drop(decoder);

    assert_eq!(
        log.entries(),
        events(&["sink.close", "encoder.release", "decoder.release"])
    );
    assert!(!manager.is_initialized());
}
