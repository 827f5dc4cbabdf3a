use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use super::AccessUnit;

mod nal_type {
    pub const NAL_SLICE_IDR: u8 = 5;
    pub const NAL_SPS: u8 = 7;
    pub const NAL_PPS: u8 = 8;
    pub const NAL_STAP_A: u8 = 24;
    pub const NAL_FU_A: u8 = 28;
}

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Reassemble RTP H.264 payloads (RFC 6184) into Annex-B access units.
///
/// Handles single NALUs (types 1-23), STAP-A aggregates and FU-A fragments.
/// NALUs sharing one RTP timestamp form one access unit, emitted when the
/// first NALU of the next timestamp arrives. SPS/PPS are never flushed on
/// their own: a parameter-only unit is held back and prepended to the next
/// IDR, so the muxer always sees configuration ahead of the keyframe.
pub struct H264Depacketizer {
    au: BytesMut,
    au_timestamp: Option<u32>,
    au_has_idr: bool,
    au_has_slice: bool,
    params: BytesMut,
    fragment: Option<BytesMut>,
}

impl Default for H264Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self {
            au: BytesMut::new(),
            au_timestamp: None,
            au_has_idr: false,
            au_has_slice: false,
            params: BytesMut::new(),
            fragment: None,
        }
    }

    /// Push one RTP payload with its timestamp. Returns the access unit the
    /// previous timestamp completed, if any.
    pub fn push(&mut self, payload: &[u8], timestamp: u32) -> Option<AccessUnit> {
        if payload.is_empty() {
            return None;
        }

        let finished = match self.au_timestamp {
            Some(current) if current != timestamp => self.take_unit(current),
            _ => None,
        };
        self.au_timestamp = Some(timestamp);

        let nal_type = payload[0] & 0x1F;
        match nal_type {
            1..=23 => self.push_nalu(payload),
            nal_type::NAL_STAP_A => {
                // One byte aggregate header, then (size | nalu)*.
                let mut offset = 1;
                while offset + 2 <= payload.len() {
                    let size =
                        ((payload[offset] as usize) << 8) | payload[offset + 1] as usize;
                    offset += 2;
                    if size == 0 || offset + size > payload.len() {
                        debug!("malformed STAP-A, nalu size {} at offset {}", size, offset);
                        break;
                    }
                    self.push_nalu(&payload[offset..offset + size]);
                    offset += size;
                }
            }
            nal_type::NAL_FU_A => self.push_fragment(payload),
            _ => trace!("ignoring NAL type {}", nal_type),
        }

        finished
    }

    /// Flush whatever is buffered; used at teardown.
    pub fn flush(&mut self) -> Option<AccessUnit> {
        let timestamp = self.au_timestamp.take()?;
        self.take_unit(timestamp)
    }

    fn push_fragment(&mut self, payload: &[u8]) {
        if payload.len() < 3 {
            debug!("FU-A payload too short");
            return;
        }
        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let fragment_type = fu_header & 0x1F;

        if start {
            // Reconstruct the NAL header from F/NRI of the indicator.
            let mut nalu = BytesMut::with_capacity(payload.len());
            nalu.put_u8((payload[0] & 0xE0) | fragment_type);
            nalu.extend_from_slice(&payload[2..]);
            self.fragment = Some(nalu);
        } else {
            match self.fragment.as_mut() {
                Some(nalu) => nalu.extend_from_slice(&payload[2..]),
                // Lost the start fragment; nothing to append to.
                None => {
                    trace!("dropping FU-A continuation without start");
                    return;
                }
            }
        }
        if end {
            if let Some(nalu) = self.fragment.take() {
                self.push_nalu(&nalu);
            }
        }
    }

    fn push_nalu(&mut self, nalu: &[u8]) {
        if nalu.is_empty() {
            return;
        }
        match nalu[0] & 0x1F {
            nal_type::NAL_SPS | nal_type::NAL_PPS => {}
            nal_type::NAL_SLICE_IDR => {
                self.au_has_idr = true;
                self.au_has_slice = true;
            }
            _ => self.au_has_slice = true,
        }
        self.au.extend_from_slice(&START_CODE);
        self.au.extend_from_slice(nalu);
    }

    fn take_unit(&mut self, timestamp: u32) -> Option<AccessUnit> {
        let unit = std::mem::take(&mut self.au);
        let has_idr = self.au_has_idr;
        let has_slice = self.au_has_slice;
        self.au_has_idr = false;
        self.au_has_slice = false;
        self.fragment = None;

        if unit.is_empty() {
            return None;
        }
        if !has_slice {
            // Parameter sets only: hold them for the next IDR.
            self.params.extend_from_slice(&unit);
            return None;
        }

        let data = if has_idr && !self.params.is_empty() {
            let mut out = std::mem::take(&mut self.params);
            out.extend_from_slice(&unit);
            out.freeze()
        } else {
            unit.freeze()
        };

        Some(AccessUnit {
            data,
            timestamp,
            keyframe: has_idr,
        })
    }
}

/// Probe an RTP payload for the start of a keyframe, without reassembly.
/// Used by the simulcast selector to decide when a substream switch is safe.
pub fn payload_starts_keyframe(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    match payload[0] & 0x1F {
        nal_type::NAL_SLICE_IDR | nal_type::NAL_SPS => true,
        nal_type::NAL_STAP_A => {
            let mut offset = 1;
            while offset + 2 <= payload.len() {
                let size = ((payload[offset] as usize) << 8) | payload[offset + 1] as usize;
                offset += 2;
                if size == 0 || offset + size > payload.len() {
                    return false;
                }
                match payload[offset] & 0x1F {
                    nal_type::NAL_SLICE_IDR | nal_type::NAL_SPS => return true,
                    _ => offset += size,
                }
            }
            false
        }
        nal_type::NAL_FU_A => {
            payload.len() >= 2
                && payload[1] & 0x80 != 0
                && payload[1] & 0x1F == nal_type::NAL_SLICE_IDR
        }
        _ => false,
    }
}
