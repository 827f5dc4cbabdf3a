use tracing::{debug, info};

use crate::rtp::h264::payload_starts_keyframe;
use crate::sdp::VideoCodec;

pub mod vp8;

pub use vp8::Vp8RewriteContext;

/// Outcome of running one RTP packet through the selector.
#[derive(Debug, Default, Clone, Copy)]
pub struct Selection {
    /// Forward this packet downstream.
    pub keep: bool,
    /// The packet is the first of a new substream; rewrite contexts must
    /// treat it as a discontinuity.
    pub switched: bool,
}

/// Picks one of up to three simulcast SSRCs and decides when it is safe to
/// move between them (only on a keyframe of the wanted substream).
pub struct SimulcastSelector {
    ssrcs: [u32; 3],
    codec: VideoCodec,
    active: Option<usize>,
    target: usize,
    templayer_target: u8,
}

impl SimulcastSelector {
    pub fn new(ssrcs: [u32; 3], codec: VideoCodec) -> Self {
        Self {
            ssrcs,
            codec,
            active: None,
            // Aim for the highest quality by default.
            target: 2,
            templayer_target: 2,
        }
    }

    pub fn active_substream(&self) -> Option<usize> {
        self.active
    }

    pub fn templayer_target(&self) -> u8 {
        self.templayer_target
    }

    /// Change the wanted substream. Returns true when a switch is now
    /// pending, in which case the caller should request a PLI upstream so a
    /// keyframe arrives on the new substream.
    pub fn set_target(&mut self, target: usize) -> bool {
        self.target = target.min(2);
        let pending = self.active != Some(self.target);
        if pending {
            info!("simulcast target moved to substream {}", self.target);
        }
        pending
    }

    pub fn set_templayer_target(&mut self, target: u8) {
        self.templayer_target = target.min(2);
    }

    /// Decide whether an incoming packet belongs to the forwarded stream.
    pub fn process(&mut self, ssrc: u32, payload: &[u8]) -> Selection {
        let Some(index) = self.ssrcs.iter().position(|s| *s == ssrc) else {
            // Unknown SSRC; not one of the declared simulcast layers.
            return Selection::default();
        };

        match self.active {
            Some(active) if active == index => Selection {
                keep: true,
                switched: false,
            },
            Some(active) => {
                // Only leave the active substream for the target, and only
                // on a keyframe so downstream decoders never see a torn
                // reference chain.
                if index == self.target && self.starts_keyframe(payload) {
                    debug!("simulcast substream switch {} -> {}", active, index);
                    self.active = Some(index);
                    Selection {
                        keep: true,
                        switched: true,
                    }
                } else {
                    Selection::default()
                }
            }
            None => {
                if index == self.target {
                    info!("simulcast selected substream {} (ssrc {})", index, ssrc);
                    self.active = Some(index);
                    Selection {
                        keep: true,
                        switched: false,
                    }
                } else {
                    Selection::default()
                }
            }
        }
    }

    fn starts_keyframe(&self, payload: &[u8]) -> bool {
        match self.codec {
            VideoCodec::H264 => payload_starts_keyframe(payload),
            VideoCodec::Vp8 => vp8::payload_starts_keyframe(payload),
        }
    }
}

/// Re-stamps sequence numbers and timestamps across substream switches so
/// the output looks like one continuous RTP stream.
#[derive(Debug, Default)]
pub struct RtpRewriter {
    seq_offset: u16,
    ts_offset: u32,
    last_out_seq: Option<u16>,
    last_out_ts: Option<u32>,
}

/// Assumed timestamp step across a switch boundary (one frame at 30 fps in
/// the 90 kHz clock).
const SWITCH_TS_STEP: u32 = 3000;

impl RtpRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rewrite(&mut self, seq: u16, timestamp: u32, discontinuity: bool) -> (u16, u32) {
        if discontinuity {
            if let Some(last_seq) = self.last_out_seq {
                self.seq_offset = last_seq.wrapping_add(1).wrapping_sub(seq);
            }
            if let Some(last_ts) = self.last_out_ts {
                self.ts_offset = last_ts.wrapping_add(SWITCH_TS_STEP).wrapping_sub(timestamp);
            }
        }
        let out_seq = seq.wrapping_add(self.seq_offset);
        let out_ts = timestamp.wrapping_add(self.ts_offset);
        self.last_out_seq = Some(out_seq);
        self.last_out_ts = Some(out_ts);
        (out_seq, out_ts)
    }
}
