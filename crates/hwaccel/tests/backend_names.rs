use std::sync::Arc;

use cutline_hwaccel::synthetic::SyntheticDeviceProvider;
use cutline_hwaccel::{
    decode_strategy, encoder_name, ContextRequest, DecodeStrategy, HardwareBackend,
    HardwareContextManager, HardwareRegistry, PixelFormat, VideoCodec,
};
use proptest::prelude::*;

const ALL_BACKENDS: [HardwareBackend; 5] = [
    HardwareBackend::None,
    HardwareBackend::Auto,
    HardwareBackend::Cuda,
    HardwareBackend::Vaapi,
    HardwareBackend::VideoToolbox,
];

fn backend_subset() -> impl Strategy<Value = Vec<HardwareBackend>> {
    proptest::sample::subsequence(HardwareBackend::PROBE_ORDER.to_vec(), 0..=3)
}

#[test]
fn canonical_names_parse_back() {
    for backend in ALL_BACKENDS {
        assert_eq!(HardwareBackend::parse(backend.name()), backend);
        assert_eq!(HardwareBackend::from(backend.to_string().as_str()), backend);
    }
    for codec in [VideoCodec::H264, VideoCodec::Hevc, VideoCodec::Av1] {
        assert_eq!(VideoCodec::parse(codec.name()), Some(codec));
    }
}

#[test]
fn backend_names_serialize_lowercase() {
    let json = serde_json::to_string(&HardwareBackend::VideoToolbox).expect("serialize");
    assert_eq!(json, "\"videotoolbox\"");
    let back: HardwareBackend = serde_json::from_str("\"cuda\"").expect("deserialize");
    assert_eq!(back, HardwareBackend::Cuda);
    let format: PixelFormat = serde_json::from_str("\"p010le\"").expect("deserialize");
    assert_eq!(format, PixelFormat::P010le);
}

#[test]
fn every_encodable_pair_is_also_decodable() {
    for backend in HardwareBackend::PROBE_ORDER {
        for codec in [VideoCodec::H264, VideoCodec::Hevc, VideoCodec::Av1] {
            if encoder_name(codec, backend).is_some() {
                assert_ne!(
                    decode_strategy(codec, backend),
                    DecodeStrategy::Unsupported,
                    "{codec} on {backend}"
                );
            }
        }
    }
}

#[test]
fn unavailable_provider_resolves_everything_to_software() {
    let manager = HardwareContextManager::new(Arc::new(SyntheticDeviceProvider::unavailable()));
    assert_eq!(manager.registry().best_backend(), HardwareBackend::None);
    assert!(!manager.initialize(ContextRequest::new(HardwareBackend::Cuda, 0)));
    assert_eq!(manager.backend(), HardwareBackend::None);
}

proptest! {
    #[test]
    fn parse_never_panics_and_never_yields_auto_by_accident(name in "\\PC{0,16}") {
        let backend = HardwareBackend::parse(&name);
        if backend == HardwareBackend::Auto {
            prop_assert_eq!(name.trim().to_ascii_lowercase(), "auto");
        }
        let _ = PixelFormat::parse(&name);
        let _ = VideoCodec::parse(&name);
    }

    #[test]
    fn parse_ignores_case_and_padding(index in 0usize..5, upper in any::<bool>(), pad in 0usize..3) {
        let backend = ALL_BACKENDS[index];
        let mut name = backend.name().to_string();
        if upper {
            name = name.to_ascii_uppercase();
        }
        let padded = format!("{}{name}{}", " ".repeat(pad), "\t".repeat(pad));
        prop_assert_eq!(HardwareBackend::parse(&padded), backend);
    }

    #[test]
    fn auto_resolves_to_the_highest_priority_available_backend(available in backend_subset()) {
        let registry = HardwareRegistry::new(Arc::new(SyntheticDeviceProvider::with_backends(&available)));
        let resolved = registry.resolve(HardwareBackend::Auto);
        let expected = HardwareBackend::PRIORITY
            .into_iter()
            .find(|b| available.contains(b))
            .unwrap_or(HardwareBackend::None);
        prop_assert_eq!(resolved, expected);
        prop_assert_ne!(resolved, HardwareBackend::Auto);
        prop_assert_eq!(registry.list_available_backends().len(), available.len());
    }

    #[test]
    fn initialize_succeeds_exactly_when_the_backend_is_present(
        available in backend_subset(),
        index in 0usize..5,
    ) {
        let requested = ALL_BACKENDS[index];
        let manager = HardwareContextManager::new(Arc::new(SyntheticDeviceProvider::with_backends(&available)));
        let ok = manager.initialize(ContextRequest::new(requested, 0));
        let expected = match requested {
            HardwareBackend::None => false,
            HardwareBackend::Auto => !available.is_empty(),
            concrete => available.contains(&concrete),
        };
        prop_assert_eq!(ok, expected);
        prop_assert_eq!(manager.is_initialized(), expected);
        if ok {
            prop_assert!(manager.backend().is_hardware());
        }
    }
}
