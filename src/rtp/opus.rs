use bytes::Bytes;
use tracing::trace;

use super::{AccessUnit, SequenceGuard};

/// RTP Opus handling: each payload is one complete Opus packet, so there is
/// no reassembly, only payload-type filtering and sequence ordering. The
/// sample count is derived from the TOC byte for diagnostics; the decoder
/// reports the authoritative count.
pub struct OpusDepacketizer {
    payload_type: u8,
    guard: SequenceGuard,
}

impl OpusDepacketizer {
    pub fn new(payload_type: u8) -> Self {
        Self {
            payload_type,
            guard: SequenceGuard::new(),
        }
    }

    pub fn push(
        &mut self,
        payload: &[u8],
        payload_type: u8,
        sequence: u16,
        timestamp: u32,
    ) -> Option<AccessUnit> {
        if payload.is_empty() {
            return None;
        }
        if payload_type != self.payload_type {
            trace!("skipping packet with payload type {}", payload_type);
            return None;
        }
        if !self.guard.accept(sequence) {
            trace!("skipping out-of-sequence audio packet {}", sequence);
            return None;
        }
        if let Some(samples) = nb_samples(payload) {
            trace!("opus packet: {} samples at 48kHz", samples);
        }
        Some(AccessUnit {
            data: Bytes::copy_from_slice(payload),
            timestamp,
            keyframe: false,
        })
    }
}

/// Samples per packet at 48 kHz, derived from the TOC byte: frame duration
/// from the configuration number, frame count from the count code (with
/// the count byte for code 3 packets).
pub fn nb_samples(packet: &[u8]) -> Option<usize> {
    let toc = *packet.first()?;
    let config = toc >> 3;
    let samples_per_frame = if config < 12 {
        // SILK modes: 10/20/40/60 ms.
        [480, 960, 1920, 2880][(config % 4) as usize]
    } else if config < 16 {
        // Hybrid modes: 10/20 ms.
        [480, 960][(config & 1) as usize]
    } else {
        // CELT modes: 2.5/5/10/20 ms.
        [120, 240, 480, 960][(config % 4) as usize]
    };
    let frames = match toc & 0x03 {
        0 => 1,
        1 | 2 => 2,
        _ => (*packet.get(1)? & 0x3F) as usize,
    };
    if frames == 0 {
        return None;
    }
    Some(samples_per_frame * frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_matching_payload_through() {
        let mut depay = OpusDepacketizer::new(111);
        let unit = depay.push(&[0xFC, 1, 2, 3], 111, 7, 960).expect("unit");
        assert_eq!(unit.timestamp, 960);
        assert_eq!(unit.data.as_ref(), &[0xFC, 1, 2, 3]);
    }

    #[test]
    fn filters_foreign_payload_types_and_stale_sequences() {
        let mut depay = OpusDepacketizer::new(111);
        assert!(depay.push(&[0xFC], 96, 1, 0).is_none());
        assert!(depay.push(&[0xFC], 111, 10, 0).is_some());
        assert!(depay.push(&[0xFC], 111, 10, 960).is_none());
        assert!(depay.push(&[0xFC], 111, 9, 960).is_none());
        assert!(depay.push(&[0xFC], 111, 11, 960).is_some());
    }

    #[test]
    fn toc_sample_counts() {
        // Config 31 (CELT FB 20 ms), one frame: 960 samples.
        assert_eq!(nb_samples(&[0b1111_1000]), Some(960));
        // Config 3 (SILK NB 60 ms), one frame: 2880 samples.
        assert_eq!(nb_samples(&[0b0001_1000]), Some(2880));
        // Code 1: two frames of 10 ms hybrid.
        assert_eq!(nb_samples(&[0b0110_0001]), Some(960));
        // Code 3 with a count byte of 3 frames, 20 ms CELT each.
        assert_eq!(nb_samples(&[0b1111_1011, 3]), Some(2880));
        assert_eq!(nb_samples(&[]), None);
        assert_eq!(nb_samples(&[0b1111_1011]), None);
    }
}
