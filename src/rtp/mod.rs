use bytes::Bytes;

pub mod h264;
pub mod opus;

/// One reassembled media access unit, ready for the muxer.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// Annex-B byte stream for video, one Opus packet for audio.
    pub data: Bytes,
    /// RTP timestamp (90 kHz video, 48 kHz audio).
    pub timestamp: u32,
    /// Whether the unit contains an IDR slice (always false for audio).
    pub keyframe: bool,
}

/// Per-SSRC sequence tracking with a 2^15 wrap guard: a packet is accepted
/// only if it is newer than the last seen one in wrapped 16-bit arithmetic.
#[derive(Debug, Default)]
pub struct SequenceGuard {
    last: Option<u16>,
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, seq: u16) -> bool {
        match self.last {
            None => {
                self.last = Some(seq);
                true
            }
            Some(last) => {
                let advance = seq.wrapping_sub(last);
                if advance != 0 && advance < 0x8000 {
                    self.last = Some(seq);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
