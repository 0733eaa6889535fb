//! In-memory media backend.
//!
//! Everything here runs without native libraries or a GPU: a container
//! source that counts seeks and renders deterministic frames, a decoder and
//! encoder that can pose as hardware sessions, a memory sink, and a CPU
//! converter. Used by the test suites and by `cutline check --self-test`.

mod backend;
mod codec;
mod convert;
mod sink;
mod source;

pub use backend::SyntheticBackend;
pub use codec::{EncoderScript, SurfaceContent, SyntheticDecoder, SyntheticEncoder, SyntheticSurface};
pub use convert::CopyConverter;
pub use sink::{MemorySink, SinkHandle, SinkRecord};
pub use source::{
    render_pattern, FrameCountHint, SourceProbe, SyntheticClip, SyntheticSource, TimestampMode,
};
