use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::audio::adts;

pub const TAG_AUDIO: u8 = 8;
pub const TAG_VIDEO: u8 = 9;
pub const TAG_SCRIPT: u8 = 18;

/// One FLV tag: type, millisecond timestamp and body. The body is what an
/// RTMP audio/video message carries; `encode` adds the 11-byte tag header
/// for file-style framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTag {
    pub tag_type: u8,
    pub timestamp: u32,
    pub data: Bytes,
}

impl FlvTag {
    /// Serialize as tag header + body (no PreviousTagSize trailer).
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(11 + self.data.len());
        out.put_u8(self.tag_type & 0x1F);
        // 3-byte data size.
        out.put_u8((self.data.len() >> 16) as u8);
        out.put_u8((self.data.len() >> 8) as u8);
        out.put_u8(self.data.len() as u8);
        // 3-byte timestamp plus extended high byte.
        out.put_u8((self.timestamp >> 16) as u8);
        out.put_u8((self.timestamp >> 8) as u8);
        out.put_u8(self.timestamp as u8);
        out.put_u8((self.timestamp >> 24) as u8);
        // StreamID, always zero.
        out.put_u8(0);
        out.put_u8(0);
        out.put_u8(0);
        out.extend_from_slice(&self.data);
        out.freeze()
    }

    /// Parse a serialized tag back; the inverse of `encode`.
    pub fn parse(data: &[u8]) -> Option<(FlvTag, u32)> {
        if data.len() < 11 {
            return None;
        }
        let size = ((data[1] as usize) << 16) | ((data[2] as usize) << 8) | data[3] as usize;
        if data.len() < 11 + size {
            return None;
        }
        let timestamp = ((data[7] as u32) << 24)
            | ((data[4] as u32) << 16)
            | ((data[5] as u32) << 8)
            | data[6] as u32;
        let stream_id =
            ((data[8] as u32) << 16) | ((data[9] as u32) << 8) | data[10] as u32;
        Some((
            FlvTag {
                tag_type: data[0] & 0x1F,
                timestamp,
                data: Bytes::copy_from_slice(&data[11..11 + size]),
            },
            stream_id,
        ))
    }
}

/// Serializes access units into FLV tags with per-track re-based,
/// non-decreasing millisecond timestamps.
///
/// Exactly one AAC sequence header (AudioSpecificConfig) and one AVC
/// configuration record are emitted per publish, always ahead of the first
/// raw tag of their track.
pub struct FlvMuxer {
    audio_origin: Option<u32>,
    video_origin: Option<u32>,
    audio_config_sent: bool,
    video_config_sent: bool,
    last_audio_ms: u32,
    last_video_ms: u32,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

/// FLV AudioTagHeader for AAC: format 10, 16-bit samples, stereo. AAC tags
/// always carry the 44 kHz rate flag; players read the true rate from the
/// AudioSpecificConfig.
const AUDIO_TAG_AAC: u8 = 0xAF;

impl Default for FlvMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlvMuxer {
    pub fn new() -> Self {
        Self {
            audio_origin: None,
            video_origin: None,
            audio_config_sent: false,
            video_config_sent: false,
            last_audio_ms: 0,
            last_video_ms: 0,
            sps: None,
            pps: None,
        }
    }

    /// Mux one ADTS frame (48 kHz clock timestamp).
    pub fn mux_audio(&mut self, frame: &[u8], pts: u32) -> Result<Vec<FlvTag>> {
        let header = adts::parse_header(frame)
            .ok_or_else(|| anyhow!("not an ADTS frame, {} bytes", frame.len()))?;
        let raw = &frame[header.header_len..header.frame_len];

        let origin = *self.audio_origin.get_or_insert(pts);
        let ms = rebase(pts, origin, 48, self.last_audio_ms);
        self.last_audio_ms = ms;

        let mut tags = Vec::with_capacity(2);
        if !self.audio_config_sent {
            let asc = header.audio_specific_config();
            let mut body = BytesMut::with_capacity(4);
            body.put_u8(AUDIO_TAG_AAC);
            body.put_u8(0x00); // sequence header
            body.extend_from_slice(&asc);
            tags.push(FlvTag {
                tag_type: TAG_AUDIO,
                timestamp: ms,
                data: body.freeze(),
            });
            self.audio_config_sent = true;
        }

        let mut body = BytesMut::with_capacity(2 + raw.len());
        body.put_u8(AUDIO_TAG_AAC);
        body.put_u8(0x01); // raw AAC
        body.extend_from_slice(raw);
        tags.push(FlvTag {
            tag_type: TAG_AUDIO,
            timestamp: ms,
            data: body.freeze(),
        });
        Ok(tags)
    }

    /// Mux one Annex-B access unit (90 kHz clock timestamps).
    pub fn mux_video(&mut self, unit: &[u8], pts: u32, dts: u32) -> Result<Vec<FlvTag>> {
        let nalus = split_annexb(unit);
        if nalus.is_empty() {
            return Err(anyhow!("access unit without NAL units"));
        }

        let mut keyframe = false;
        let mut payload = BytesMut::new();
        for nalu in &nalus {
            match nalu[0] & 0x1F {
                7 => {
                    if self.sps.is_none() {
                        trace!("caching SPS, {} bytes", nalu.len());
                    }
                    self.sps = Some(nalu.to_vec());
                }
                8 => {
                    if self.pps.is_none() {
                        trace!("caching PPS, {} bytes", nalu.len());
                    }
                    self.pps = Some(nalu.to_vec());
                }
                nal_type => {
                    if nal_type == 5 {
                        keyframe = true;
                    }
                    payload.put_u32(nalu.len() as u32);
                    payload.extend_from_slice(nalu);
                }
            }
        }
        if payload.is_empty() {
            // Parameter sets only; nothing to emit.
            return Ok(Vec::new());
        }

        let origin = *self.video_origin.get_or_insert(dts);
        let ms = rebase(dts, origin, 90, self.last_video_ms);
        self.last_video_ms = ms;
        let composition = pts.wrapping_sub(dts) / 90;

        let mut tags = Vec::with_capacity(2);
        if !self.video_config_sent {
            let (Some(sps), Some(pps)) = (self.sps.as_deref(), self.pps.as_deref()) else {
                debug!("dropping video frame before SPS/PPS are known");
                return Ok(Vec::new());
            };
            if !keyframe {
                debug!("dropping inter frame before the first keyframe");
                return Ok(Vec::new());
            }
            let mut body = BytesMut::with_capacity(16 + sps.len() + pps.len());
            body.put_u8(0x17); // keyframe, AVC
            body.put_u8(0x00); // sequence header
            body.put_u8(0x00);
            body.put_u8(0x00);
            body.put_u8(0x00);
            write_avc_config(&mut body, sps, pps);
            tags.push(FlvTag {
                tag_type: TAG_VIDEO,
                timestamp: ms,
                data: body.freeze(),
            });
            self.video_config_sent = true;
        }

        let mut body = BytesMut::with_capacity(5 + payload.len());
        body.put_u8(if keyframe { 0x17 } else { 0x27 });
        body.put_u8(0x01); // NALU
        body.put_u8((composition >> 16) as u8);
        body.put_u8((composition >> 8) as u8);
        body.put_u8(composition as u8);
        body.extend_from_slice(&payload);
        tags.push(FlvTag {
            tag_type: TAG_VIDEO,
            timestamp: ms,
            data: body.freeze(),
        });
        Ok(tags)
    }
}

/// Re-base an RTP timestamp against the track origin and convert to
/// milliseconds. Deltas are interpreted as signed 32-bit so a slightly
/// stale timestamp clamps to the last emitted value instead of wrapping.
fn rebase(pts: u32, origin: u32, clock_per_ms: u32, last_ms: u32) -> u32 {
    let delta = pts.wrapping_sub(origin) as i32;
    if delta <= 0 {
        return last_ms;
    }
    (delta as u32 / clock_per_ms).max(last_ms)
}

/// AVCDecoderConfigurationRecord from one SPS and one PPS.
fn write_avc_config(out: &mut BytesMut, sps: &[u8], pps: &[u8]) {
    out.put_u8(1); // configurationVersion
    out.put_u8(sps.get(1).copied().unwrap_or(0)); // AVCProfileIndication
    out.put_u8(sps.get(2).copied().unwrap_or(0)); // profile_compatibility
    out.put_u8(sps.get(3).copied().unwrap_or(0)); // AVCLevelIndication
    out.put_u8(0xFF); // 4-byte NALU lengths
    out.put_u8(0xE1); // one SPS
    out.put_u16(sps.len() as u16);
    out.extend_from_slice(sps);
    out.put_u8(1); // one PPS
    out.put_u16(pps.len() as u16);
    out.extend_from_slice(pps);
}

/// Split an Annex-B byte stream into NAL units (start codes stripped).
/// 4-byte start codes are matched first, so a `00 00 00 01` boundary never
/// leaves a stray zero on the preceding unit.
fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut nalus = Vec::new();
    let mut offset = 0;
    let mut current: Option<usize> = None;
    while offset < data.len() {
        let start_len = if data[offset..].starts_with(&[0, 0, 0, 1]) {
            4
        } else if data[offset..].starts_with(&[0, 0, 1]) {
            3
        } else {
            offset += 1;
            continue;
        };
        if let Some(start) = current.take() {
            if offset > start {
                nalus.push(&data[start..offset]);
            }
        }
        offset += start_len;
        current = Some(offset);
    }
    if let Some(start) = current {
        if start < data.len() {
            nalus.push(&data[start..]);
        }
    }
    nalus
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADTS: [u8; 8] = [0xFF, 0xF1, 0x4C, 0x80, 0x01, 0x00, 0xFC, 0xAB];

    fn annexb(nalus: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nalu in nalus {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nalu);
        }
        out
    }

    #[test]
    fn tag_round_trip() {
        let tag = FlvTag {
            tag_type: TAG_VIDEO,
            timestamp: 0x0123_4567,
            data: Bytes::from_static(&[1, 2, 3, 4, 5]),
        };
        let encoded = tag.encode();
        let (parsed, stream_id) = FlvTag::parse(&encoded).expect("parse");
        assert_eq!(parsed, tag);
        assert_eq!(stream_id, 0);
    }

    #[test]
    fn audio_emits_one_sequence_header_then_raw_tags() {
        let mut muxer = FlvMuxer::new();
        let tags = muxer.mux_audio(&ADTS, 96000).unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].data.as_ref(), &[0xAF, 0x00, 0x11, 0x90]);
        assert_eq!(tags[0].timestamp, 0);
        assert_eq!(tags[1].data.as_ref(), &[0xAF, 0x01, 0xAB]);

        let tags = muxer.mux_audio(&ADTS, 96000 + 1024).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].timestamp, 1024 / 48);
    }

    #[test]
    fn video_emits_config_before_first_keyframe() {
        let mut muxer = FlvMuxer::new();
        let sps = [0x67, 0x42, 0xE0, 0x1E];
        let pps = [0x68, 0xCE];
        let idr = [0x65, 0xAA, 0xBB];

        // Inter frame before any configuration: dropped.
        let tags = muxer
            .mux_video(&annexb(&[&[0x61, 0x01]]), 0, 0)
            .unwrap();
        assert!(tags.is_empty());

        let unit = annexb(&[&sps, &pps, &idr]);
        let tags = muxer.mux_video(&unit, 90000, 90000).unwrap();
        assert_eq!(tags.len(), 2);
        // Sequence header: keyframe+AVC, type 0, zero composition time.
        assert_eq!(&tags[0].data[..5], &[0x17, 0x00, 0x00, 0x00, 0x00]);
        // avcC starts with version 1 and the SPS profile bytes.
        assert_eq!(&tags[0].data[5..9], &[1, 0x42, 0xE0, 0x1E]);
        // Data tag: length-prefixed IDR only, SPS/PPS live in the config.
        assert_eq!(&tags[1].data[..5], &[0x17, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(&tags[1].data[5..9], &[0, 0, 0, 3]);
        assert_eq!(&tags[1].data[9..12], &idr);
        assert_eq!(tags[1].timestamp, 0);

        let tags = muxer
            .mux_video(&annexb(&[&[0x61, 0x01]]), 93000, 93000)
            .unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].data[0], 0x27);
        assert_eq!(tags[0].timestamp, 1000 / 30);
    }

    #[test]
    fn timestamps_rebase_and_never_decrease() {
        let mut muxer = FlvMuxer::new();
        muxer.mux_audio(&ADTS, 480000).unwrap();
        let tags = muxer.mux_audio(&ADTS, 480000 - 960).unwrap();
        // Would be negative after re-basing; clamped to the last value.
        assert_eq!(tags[0].timestamp, 0);
        let tags = muxer.mux_audio(&ADTS, 480000 + 960).unwrap();
        assert_eq!(tags[0].timestamp, 20);
    }

    #[test]
    fn split_annexb_handles_mixed_start_codes() {
        let mut data = vec![0, 0, 1, 0x67, 1, 2];
        data.extend_from_slice(&[0, 0, 0, 1, 0x68, 3]);
        let nalus = split_annexb(&data);
        assert_eq!(nalus.len(), 2);
        assert_eq!(nalus[0], &[0x67, 1, 2]);
        assert_eq!(nalus[1], &[0x68, 3]);
    }
}
