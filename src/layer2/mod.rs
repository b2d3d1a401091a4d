// Layer 2: normalisation and shared rolling state

pub mod baseline;
pub mod buffers;
pub mod context;
pub mod normalizer;

pub use baseline::VolumeBaseline;
pub use buffers::{BufferManager, BufferStats};
pub use context::{ContextBuffer, to_base_symbol};
pub use normalizer::{NormalizedFrame, Normalizer, NormalizerStats, ParseError};
