pub mod adts;
pub mod decoder;
pub mod encoder;

pub use decoder::OpusDecoder;
pub use encoder::{AacEncoder, AdtsFrame};

/// Sample rate the audio pipeline runs at end to end.
pub const SAMPLE_RATE: u32 = 48000;
/// Channel count negotiated for Opus and kept through AAC.
pub const CHANNELS: u8 = 2;
