use anyhow::{anyhow, Result};
use bytes::Bytes;
use fdk_aac::enc::{BitRate, ChannelMode, Encoder, EncoderParams, Transport};
use tracing::{debug, trace};

/// One encoded AAC frame with its 7-byte ADTS header.
#[derive(Debug, Clone)]
pub struct AdtsFrame {
    pub data: Bytes,
    /// 48 kHz clock, midpoint of the PCM segment that produced the frame.
    pub timestamp: u32,
}

/// AAC-LC encoder over buffered PCM.
///
/// Opus hands us 20 ms segments while AAC frames are 1024 samples
/// (~21.33 ms), so input is accumulated until a full frame is available and
/// output timestamps are the midpoint of the buffered segment to smooth the
/// frame-size mismatch.
pub struct AacEncoder {
    encoder: Encoder,
    channels: usize,
    pending: Vec<i16>,
    /// Timestamp of the oldest buffered sample.
    segment_start: Option<u32>,
    outbuf: Vec<u8>,
}

const FRAME_SAMPLES: usize = 1024;
const DEFAULT_BITRATE: u32 = 64000;

impl AacEncoder {
    pub fn new(sample_rate: u32, channels: u8, vbr: bool) -> Result<Self> {
        let channel_mode = match channels {
            1 => ChannelMode::Mono,
            2 => ChannelMode::Stereo,
            other => return Err(anyhow!("unsupported channel count {}", other)),
        };
        let bit_rate = if vbr {
            BitRate::VbrMedium
        } else {
            BitRate::Cbr(DEFAULT_BITRATE)
        };
        let encoder = Encoder::new(EncoderParams {
            bit_rate,
            sample_rate,
            transport: Transport::Adts,
            channels: channel_mode,
        })
        .map_err(|e| anyhow!("aac encoder create failed: {:?}", e))?;
        Ok(Self {
            encoder,
            channels: channels as usize,
            pending: Vec::with_capacity(FRAME_SAMPLES * channels as usize * 2),
            segment_start: None,
            outbuf: vec![0u8; 8192],
        })
    }

    /// Feed interleaved PCM; returns every ADTS frame that became complete.
    pub fn push(&mut self, samples: &[i16], timestamp: u32) -> Vec<AdtsFrame> {
        if self.segment_start.is_none() {
            self.segment_start = Some(timestamp);
        }
        self.pending.extend_from_slice(samples);

        let frame_len = FRAME_SAMPLES * self.channels;
        let mut frames = Vec::new();
        while self.pending.len() >= frame_len {
            let input: Vec<i16> = self.pending.drain(..frame_len).collect();
            match self.encoder.encode(&input, &mut self.outbuf) {
                Ok(info) => {
                    if info.output_size > 0 {
                        let start = self.segment_start.unwrap_or(timestamp);
                        let midpoint =
                            start.wrapping_add(timestamp.wrapping_sub(start) / 2);
                        trace!(
                            "aac frame: {} bytes at ts {}",
                            info.output_size,
                            midpoint
                        );
                        frames.push(AdtsFrame {
                            data: Bytes::copy_from_slice(&self.outbuf[..info.output_size]),
                            timestamp: midpoint,
                        });
                    }
                }
                Err(err) => {
                    debug!("aac encode failed, dropping frame: {:?}", err);
                }
            }
            self.segment_start = Some(timestamp);
        }
        frames
    }
}
