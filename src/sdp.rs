use std::io::Cursor;

use ::sdp::description::common::{Address, Attribute, ConnectionInformation};
use ::sdp::description::media::{MediaDescription, MediaName, RangedPort};
use ::sdp::description::session::{Origin, SessionDescription, TimeDescription, Timing};
use anyhow::{anyhow, Result};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Opus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Vp8,
}

impl AudioCodec {
    pub fn name(&self) -> &'static str {
        "opus"
    }
}

impl VideoCodec {
    pub fn name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H264",
            VideoCodec::Vp8 => "VP8",
        }
    }
}

/// The codec picked out of one offered m-line.
#[derive(Debug, Clone)]
pub struct MediaSelection {
    pub payload_type: u8,
    pub rtpmap: String,
    pub fmtp: Option<String>,
    pub mid: Option<String>,
}

#[derive(Debug, Clone)]
struct OfferedMedia {
    kind: String,
    protos: Vec<String>,
    mid: Option<String>,
    selection: Option<MediaSelection>,
}

/// Everything the session needs out of an SDP offer.
#[derive(Debug, Clone)]
pub struct Offer {
    pub audio: Option<MediaSelection>,
    pub video: Option<(VideoCodec, MediaSelection)>,
    media: Vec<OfferedMedia>,
}

/// Parse an offer, selecting Opus for audio and H.264 (VP8 as fallback)
/// for video. An m-line the offerer marked recvonly/inactive cannot carry
/// media towards us and is treated as absent.
pub fn parse_offer(raw: &str) -> Result<Offer> {
    let mut reader = Cursor::new(raw.as_bytes());
    let session = SessionDescription::unmarshal(&mut reader)
        .map_err(|e| anyhow!("error parsing offer: {}", e))?;

    let mut audio = None;
    let mut video = None;
    let mut media = Vec::with_capacity(session.media_descriptions.len());

    for m in &session.media_descriptions {
        let kind = m.media_name.media.clone();
        let mid = attribute(m, "mid").map(str::to_string);
        let sendable = !has_flag(m, "recvonly") && !has_flag(m, "inactive");

        let mut selection = None;
        if sendable && kind == "audio" && audio.is_none() {
            if let Some(found) = find_codec(m, "opus", mid.clone()) {
                audio = Some(found.clone());
                selection = Some(found);
            }
        } else if sendable && kind == "video" && video.is_none() {
            if let Some(found) = find_codec(m, "H264", mid.clone()) {
                video = Some((VideoCodec::H264, found.clone()));
                selection = Some(found);
            } else if let Some(found) = find_codec(m, "VP8", mid.clone()) {
                video = Some((VideoCodec::Vp8, found.clone()));
                selection = Some(found);
            }
        }
        media.push(OfferedMedia {
            kind,
            protos: m.media_name.protos.clone(),
            mid,
            selection,
        });
    }

    debug!(
        "offer parsed: audio {:?}, video {:?}",
        audio.as_ref().map(|a| a.payload_type),
        video.as_ref().map(|(codec, v)| (codec.name(), v.payload_type))
    );
    Ok(Offer {
        audio,
        video,
        media,
    })
}

/// Build the recvonly answer for a parsed offer. M-lines without a picked
/// codec are rejected with port zero.
pub fn build_answer(offer: &Offer, session_id: u64, session_version: u64, name: &str) -> String {
    let mut media_descriptions = Vec::with_capacity(offer.media.len());
    for m in &offer.media {
        media_descriptions.push(match &m.selection {
            Some(selection) => accepted_media(m, selection),
            None => rejected_media(m),
        });
    }

    let answer = SessionDescription {
        version: 0,
        origin: Origin {
            username: "-".to_string(),
            session_id,
            session_version,
            network_type: "IN".to_string(),
            address_type: "IP4".to_string(),
            unicast_address: "0.0.0.0".to_string(),
        },
        session_name: name.to_string(),
        session_information: None,
        uri: None,
        email_address: None,
        phone_number: None,
        connection_information: Some(ConnectionInformation {
            network_type: "IN".to_string(),
            address_type: "IP4".to_string(),
            address: Some(Address {
                address: "0.0.0.0".to_string(),
                ttl: None,
                range: None,
            }),
        }),
        bandwidth: vec![],
        time_descriptions: vec![TimeDescription {
            timing: Timing {
                start_time: 0,
                stop_time: 0,
            },
            repeat_times: vec![],
        }],
        time_zones: vec![],
        encryption_key: None,
        attributes: vec![],
        media_descriptions,
    };
    answer.marshal()
}

fn accepted_media(offered: &OfferedMedia, selection: &MediaSelection) -> MediaDescription {
    let mut attributes = Vec::new();
    if let Some(mid) = &selection.mid {
        attributes.push(value_attr("mid", mid));
    }
    attributes.push(flag_attr("recvonly"));
    attributes.push(flag_attr("rtcp-mux"));
    attributes.push(value_attr("rtpmap", &selection.rtpmap));
    if let Some(fmtp) = &selection.fmtp {
        attributes.push(value_attr("fmtp", fmtp));
    }
    if offered.kind == "video" {
        for feedback in ["nack", "nack pli", "ccm fir", "goog-remb"] {
            attributes.push(value_attr(
                "rtcp-fb",
                &format!("{} {}", selection.payload_type, feedback),
            ));
        }
    }
    MediaDescription {
        media_name: MediaName {
            media: offered.kind.clone(),
            port: RangedPort {
                value: 9,
                range: None,
            },
            protos: offered.protos.clone(),
            formats: vec![selection.payload_type.to_string()],
        },
        media_title: None,
        connection_information: None,
        bandwidth: vec![],
        encryption_key: None,
        attributes,
    }
}

fn rejected_media(offered: &OfferedMedia) -> MediaDescription {
    let mut attributes = vec![flag_attr("inactive")];
    if let Some(mid) = &offered.mid {
        attributes.insert(0, value_attr("mid", mid));
    }
    MediaDescription {
        media_name: MediaName {
            media: offered.kind.clone(),
            port: RangedPort {
                value: 0,
                range: None,
            },
            protos: offered.protos.clone(),
            formats: vec!["0".to_string()],
        },
        media_title: None,
        connection_information: None,
        bandwidth: vec![],
        encryption_key: None,
        attributes,
    }
}

fn value_attr(key: &str, value: &str) -> Attribute {
    Attribute {
        key: key.to_string(),
        value: Some(value.to_string()),
    }
}

fn flag_attr(key: &str) -> Attribute {
    Attribute {
        key: key.to_string(),
        value: None,
    }
}

fn attribute<'a>(m: &'a MediaDescription, key: &str) -> Option<&'a str> {
    m.attributes
        .iter()
        .find(|a| a.key == key)
        .and_then(|a| a.value.as_deref())
}

fn has_flag(m: &MediaDescription, key: &str) -> bool {
    m.attributes.iter().any(|a| a.key == key && a.value.is_none())
}

fn find_codec(m: &MediaDescription, codec: &str, mid: Option<String>) -> Option<MediaSelection> {
    for a in &m.attributes {
        if a.key != "rtpmap" {
            continue;
        }
        let Some(value) = a.value.as_deref() else {
            continue;
        };
        let mut parts = value.splitn(2, ' ');
        let (Some(pt), Some(encoding)) = (parts.next(), parts.next()) else {
            continue;
        };
        let encoding_name = encoding.split('/').next().unwrap_or_default();
        if !encoding_name.eq_ignore_ascii_case(codec) {
            continue;
        }
        let Ok(payload_type) = pt.parse::<u8>() else {
            continue;
        };
        let fmtp = m.attributes.iter().find_map(|a| {
            if a.key != "fmtp" {
                return None;
            }
            let value = a.value.as_deref()?;
            value
                .split(' ')
                .next()
                .filter(|first| *first == pt)
                .map(|_| value.to_string())
        });
        return Some(MediaSelection {
            payload_type,
            rtpmap: value.to_string(),
            fmtp,
            mid,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 20518 0 IN IP4 203.0.113.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 54400 UDP/TLS/RTP/SAVPF 111 103\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtpmap:103 ISAC/16000\r\n\
m=video 55400 UDP/TLS/RTP/SAVPF 100 101\r\n\
a=mid:1\r\n\
a=sendonly\r\n\
a=rtpmap:100 H264/90000\r\n\
a=fmtp:100 profile-level-id=42e01f;packetization-mode=1\r\n\
a=rtpmap:101 VP8/90000\r\n";

    #[test]
    fn selects_opus_and_h264() {
        let offer = parse_offer(OFFER).unwrap();
        let audio = offer.audio.as_ref().expect("audio");
        assert_eq!(audio.payload_type, 111);
        assert_eq!(audio.fmtp.as_deref(), Some("111 minptime=10;useinbandfec=1"));
        let (codec, video) = offer.video.as_ref().expect("video");
        assert_eq!(*codec, VideoCodec::H264);
        assert_eq!(video.payload_type, 100);
    }

    #[test]
    fn falls_back_to_vp8() {
        let offer_vp8 = OFFER.replace("a=rtpmap:100 H264/90000\r\n", "");
        let offer = parse_offer(&offer_vp8).unwrap();
        let (codec, video) = offer.video.as_ref().expect("video");
        assert_eq!(*codec, VideoCodec::Vp8);
        assert_eq!(video.payload_type, 101);
    }

    #[test]
    fn recvonly_offer_media_is_ignored() {
        let offer_text = OFFER.replace("a=sendrecv", "a=recvonly");
        let offer = parse_offer(&offer_text).unwrap();
        assert!(offer.audio.is_none());
        assert!(offer.video.is_some());
    }

    #[test]
    fn answer_is_recvonly_and_parses_back() {
        let offer = parse_offer(OFFER).unwrap();
        let answer = build_answer(&offer, 1234, 1, "Recording 42");
        assert!(answer.contains("s=Recording 42"));
        assert!(answer.contains("a=recvonly"));
        assert!(answer.contains("a=rtpmap:111 opus/48000/2"));
        assert!(answer.contains("a=rtcp-fb:100 ccm fir"));
        // And it is valid SDP.
        let parsed =
            SessionDescription::unmarshal(&mut Cursor::new(answer.as_bytes())).unwrap();
        assert_eq!(parsed.media_descriptions.len(), 2);
        assert_eq!(parsed.origin.session_id, 1234);
    }

    #[test]
    fn audio_only_offer_rejects_nothing() {
        let audio_only = "v=0\r\no=- 1 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n";
        let offer = parse_offer(audio_only).unwrap();
        assert!(offer.audio.is_some());
        assert!(offer.video.is_none());
        let answer = build_answer(&offer, 1, 1, "Recording 1");
        assert!(answer.contains("m=audio 9"));
        assert!(!answer.contains("m=video"));
    }

    #[test]
    fn bad_sdp_is_an_error() {
        assert!(parse_offer("this is not sdp").is_err());
    }
}
