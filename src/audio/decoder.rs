use anyhow::{anyhow, Result};
use tracing::debug;

/// Decoded PCM segment, interleaved 16-bit samples.
#[derive(Debug, Clone)]
pub struct PcmFrame {
    pub samples: Vec<i16>,
    /// RTP timestamp of the Opus packet (48 kHz clock, passed through).
    pub timestamp: u32,
}

/// Stateful Opus decoder. Packet loss concealment is not used: a failed
/// decode drops the frame and the pipeline moves on.
pub struct OpusDecoder {
    decoder: opus::Decoder,
    channels: usize,
    scratch: Vec<i16>,
}

/// Largest Opus frame is 120 ms, 5760 samples per channel at 48 kHz.
const MAX_FRAME_SAMPLES: usize = 5760;

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u8) -> Result<Self> {
        let mapped = match channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            other => return Err(anyhow!("unsupported channel count {}", other)),
        };
        let decoder = opus::Decoder::new(sample_rate, mapped)
            .map_err(|e| anyhow!("opus decoder create failed: {}", e))?;
        Ok(Self {
            decoder,
            channels: channels as usize,
            scratch: vec![0i16; MAX_FRAME_SAMPLES * channels as usize],
        })
    }

    pub fn decode(&mut self, packet: &[u8], timestamp: u32) -> Option<PcmFrame> {
        match self.decoder.decode(packet, &mut self.scratch, false) {
            Ok(samples) => Some(PcmFrame {
                samples: self.scratch[..samples * self.channels].to_vec(),
                timestamp,
            }),
            Err(err) => {
                debug!("opus decode failed, dropping frame: {}", err);
                None
            }
        }
    }
}
