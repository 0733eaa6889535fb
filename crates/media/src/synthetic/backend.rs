use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::synthetic::LifecycleLog;
use cutline_hwaccel::{HardwareBackend, HardwareContext};

use super::codec::{EncoderScript, SyntheticDecoder, SyntheticEncoder};
use super::convert::CopyConverter;
use super::sink::{MemorySink, SinkHandle};
use super::source::{SourceProbe, SyntheticClip, SyntheticSource};
use crate::codec::{
    EncoderSettings, FallbackReason, FrameConverter, FrameDecoder, FrameEncoder, MediaBackend,
    PacketSink, PacketSource, StreamInfo,
};
use crate::pool::FramePool;
use crate::rational::Rational;

/// [`MediaBackend`] over synthetic clips and memory sinks.
pub struct SyntheticBackend {
    clips: HashMap<PathBuf, SyntheticClip>,
    default_clip: Option<SyntheticClip>,
    hardware_decode: bool,
    hardware_encode: bool,
    decoder_latency: usize,
    script: EncoderScript,
    sink_time_base: Rational,
    log: Option<LifecycleLog>,
    sinks: Mutex<HashMap<PathBuf, SinkHandle>>,
    probes: Mutex<HashMap<PathBuf, SourceProbe>>,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self {
            clips: HashMap::new(),
            default_clip: None,
            hardware_decode: true,
            hardware_encode: true,
            decoder_latency: 2,
            script: EncoderScript::default(),
            sink_time_base: Rational::new(1, 90000),
            log: None,
            sinks: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
        }
    }
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clip(mut self, path: impl Into<PathBuf>, clip: SyntheticClip) -> Self {
        self.clips.insert(path.into(), clip);
        self
    }

    /// Clip served for any path without a registered clip.
    pub fn with_default_clip(mut self, clip: SyntheticClip) -> Self {
        self.default_clip = Some(clip);
        self
    }

    /// Whether hardware sessions can be opened (given a live context).
    pub fn with_hardware_sessions(mut self, decode: bool, encode: bool) -> Self {
        self.hardware_decode = decode;
        self.hardware_encode = encode;
        self
    }

    pub fn with_decoder_latency(mut self, latency: usize) -> Self {
        self.decoder_latency = latency;
        self
    }

    pub fn with_encoder_script(mut self, script: EncoderScript) -> Self {
        self.script = script;
        self
    }

    pub fn with_log(mut self, log: LifecycleLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Record of the last sink opened at `path`.
    pub fn sink(&self, path: impl AsRef<Path>) -> Option<SinkHandle> {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path.as_ref())
            .cloned()
    }

    /// Counters of every source opened at `path`.
    pub fn probe(&self, path: impl AsRef<Path>) -> Option<SourceProbe> {
        self.probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path.as_ref())
            .cloned()
    }

    fn decoder(&self, info: &StreamInfo, backend: HardwareBackend, pool: &FramePool) -> SyntheticDecoder {
        let decoder = SyntheticDecoder::new(info, backend, pool).with_latency(self.decoder_latency);
        match &self.log {
            Some(log) => decoder.with_log(log.clone()),
            None => decoder,
        }
    }

    fn encoder(&self, settings: &EncoderSettings, backend: HardwareBackend) -> SyntheticEncoder {
        let encoder = SyntheticEncoder::new(settings, backend, self.script.clone());
        match &self.log {
            Some(log) => encoder.with_log(log.clone()),
            None => encoder,
        }
    }
}

impl MediaBackend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn open_source(&self, path: &Path) -> CutlineResult<Box<dyn PacketSource>> {
        let clip = self
            .clips
            .get(path)
            .or(self.default_clip.as_ref())
            .cloned()
            .ok_or_else(|| CutlineError::FileNotFound {
                path: path.to_path_buf(),
            })?;
        let probe = self
            .probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(path.to_path_buf())
            .or_default()
            .clone();
        Ok(Box::new(SyntheticSource::with_probe(clip, probe)))
    }

    fn open_hardware_decoder(
        &self,
        info: &StreamInfo,
        context: &HardwareContext,
        pool: &FramePool,
        _threads: u32,
    ) -> Result<Box<dyn FrameDecoder>, FallbackReason> {
        if !self.hardware_decode {
            return Err(FallbackReason::OpenFailed {
                name: format!("synthetic_{}", context.backend()),
                message: "hardware decoding disabled on this backend".into(),
            });
        }
        Ok(Box::new(self.decoder(info, context.backend(), pool)))
    }

    fn open_software_decoder(
        &self,
        info: &StreamInfo,
        pool: &FramePool,
        _threads: u32,
    ) -> CutlineResult<Box<dyn FrameDecoder>> {
        if info.codec.is_none() {
            return Err(CutlineError::decode(format!(
                "no decoder for {}",
                info.codec_name
            )));
        }
        Ok(Box::new(self.decoder(info, HardwareBackend::None, pool)))
    }

    fn open_sink(&self, path: &Path) -> CutlineResult<Box<dyn PacketSink>> {
        let mut sink = MemorySink::new(self.sink_time_base);
        if let Some(log) = &self.log {
            sink = sink.with_log(log.clone());
        }
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), sink.handle());
        Ok(Box::new(sink))
    }

    fn open_hardware_encoder(
        &self,
        settings: &EncoderSettings,
        context: &HardwareContext,
        _pool: &FramePool,
    ) -> Result<Box<dyn FrameEncoder>, FallbackReason> {
        if !self.hardware_encode {
            return Err(FallbackReason::OpenFailed {
                name: format!("synthetic_{}_{}", settings.codec, context.backend()),
                message: "hardware encoding disabled on this backend".into(),
            });
        }
        Ok(Box::new(self.encoder(settings, context.backend())))
    }

    fn open_software_encoder(
        &self,
        settings: &EncoderSettings,
        _pool: &FramePool,
    ) -> CutlineResult<Box<dyn FrameEncoder>> {
        Ok(Box::new(self.encoder(settings, HardwareBackend::None)))
    }

    fn converter(&self) -> Box<dyn FrameConverter> {
        Box::new(CopyConverter)
    }
}
