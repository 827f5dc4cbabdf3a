use anyhow::Result;
use tracing::{debug, trace, warn};
use webrtc::rtp::packet::Packet;

use crate::audio::{AacEncoder, OpusDecoder};
use crate::error::PluginError;
use crate::flv::FlvMuxer;
use crate::recordings::Recording;
use crate::rtp::h264::H264Depacketizer;
use crate::rtp::opus::OpusDepacketizer;
use crate::rtp::SequenceGuard;
use crate::rtmp::{PublisherOptions, RtmpPublisher};
use crate::sdp::VideoCodec;
use crate::session::feedback::FeedbackState;
use crate::simulcast::{RtpRewriter, SimulcastSelector, Vp8RewriteContext};

/// What the session should do after a video packet went through.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct VideoOutcome {
    /// A substream switch happened; ask the publisher for a keyframe.
    pub needs_pli: bool,
}

pub(crate) struct SimulcastState {
    selector: SimulcastSelector,
    rewriter: RtpRewriter,
    vp8: Vp8RewriteContext,
}

pub(crate) struct VideoPath {
    payload_type: u8,
    codec: VideoCodec,
    depacketizer: H264Depacketizer,
    guard: SequenceGuard,
    simulcast: Option<SimulcastState>,
}

pub(crate) struct AudioPath {
    depacketizer: OpusDepacketizer,
    decoder: OpusDecoder,
    encoder: AacEncoder,
}

/// The per-publish stage chain, composed once at `record` time. The stages
/// own no back-pointers: data flows forward through method calls and fatal
/// errors bubble back as `Err`.
pub(crate) struct Pipeline {
    publisher: RtmpPublisher,
    muxer: FlvMuxer,
    video: Option<VideoPath>,
    audio: Option<AudioPath>,
    pub(crate) feedback: FeedbackState,
}

impl Pipeline {
    /// Build every stage for a recording, failing with the stage-specific
    /// error code. Stage creation order (and the teardown order in
    /// `shutdown`) follows the dependency chain RTMP -> FLV -> AAC ->
    /// Opus -> depacketizers.
    pub(crate) async fn build(
        recording: &Recording,
        simulcast_ssrcs: Option<[u32; 3]>,
        options: PublisherOptions,
    ) -> Result<Pipeline, PluginError> {
        let publisher = RtmpPublisher::connect(recording.target.clone(), options)
            .await
            .map_err(|e| PluginError::RtmpClientFailed(e.to_string()))?;
        let muxer = FlvMuxer::new();

        let audio = match &recording.audio {
            Some(descriptor) => {
                let encoder = AacEncoder::new(descriptor.sample_rate, descriptor.channels, false)
                    .map_err(|e| PluginError::AacEncoderFailed(e.to_string()))?;
                let decoder = OpusDecoder::new(descriptor.sample_rate, descriptor.channels)
                    .map_err(|e| PluginError::OpusDecoderFailed(e.to_string()))?;
                Some(AudioPath {
                    depacketizer: OpusDepacketizer::new(descriptor.payload_type),
                    decoder,
                    encoder,
                })
            }
            None => None,
        };

        let video = recording.video.as_ref().map(|descriptor| {
            let simulcast = simulcast_ssrcs
                .filter(|ssrcs| ssrcs.iter().any(|ssrc| *ssrc != 0))
                .map(|ssrcs| SimulcastState {
                    selector: SimulcastSelector::new(ssrcs, descriptor.codec),
                    rewriter: RtpRewriter::new(),
                    vp8: Vp8RewriteContext::new(),
                });
            VideoPath {
                payload_type: descriptor.payload_type,
                codec: descriptor.codec,
                depacketizer: H264Depacketizer::new(),
                guard: SequenceGuard::new(),
                simulcast,
            }
        });

        Ok(Pipeline {
            publisher,
            muxer,
            video,
            audio,
            feedback: FeedbackState::new(),
        })
    }

    pub(crate) fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub(crate) fn has_video(&self) -> bool {
        self.video.is_some()
    }

    /// Move the simulcast substream target; true means a PLI should be
    /// requested so the new layer starts on a keyframe.
    pub(crate) fn set_substream(&mut self, target: usize) -> bool {
        match self.video.as_mut().and_then(|v| v.simulcast.as_mut()) {
            Some(sim) => sim.selector.set_target(target),
            None => false,
        }
    }

    pub(crate) fn set_temporal_layer(&mut self, target: u8) {
        if let Some(sim) = self.video.as_mut().and_then(|v| v.simulcast.as_mut()) {
            sim.selector.set_templayer_target(target);
        }
    }

    /// Run one video RTP packet through selection, depacketizing, muxing
    /// and publish. `Err` is fatal to the publish (category e); malformed
    /// media is dropped here and logged (category d).
    pub(crate) async fn process_video(&mut self, packet: &Packet) -> Result<VideoOutcome> {
        let Some(video) = self.video.as_mut() else {
            return Ok(VideoOutcome::default());
        };
        if packet.header.payload_type != video.payload_type {
            trace!(
                "skipping video packet with payload type {}",
                packet.header.payload_type
            );
            return Ok(VideoOutcome::default());
        }

        let mut payload = packet.payload.to_vec();
        let mut sequence = packet.header.sequence_number;
        let mut timestamp = packet.header.timestamp;
        let mut outcome = VideoOutcome { needs_pli: false };

        if let Some(sim) = video.simulcast.as_mut() {
            let selection = sim.selector.process(packet.header.ssrc, &payload);
            if !selection.keep {
                return Ok(VideoOutcome::default());
            }
            if selection.switched {
                outcome.needs_pli = true;
            }
            let (seq, ts) = sim.rewriter.rewrite(sequence, timestamp, selection.switched);
            sequence = seq;
            timestamp = ts;
            if video.codec == VideoCodec::Vp8 {
                let target = sim.selector.templayer_target();
                if !sim.vp8.rewrite(&mut payload, selection.switched, target) {
                    return Ok(VideoOutcome::default());
                }
            }
        }

        if !video.guard.accept(sequence) {
            trace!("skipping out-of-sequence video packet {}", sequence);
            return Ok(outcome);
        }

        match video.codec {
            VideoCodec::H264 => {
                if let Some(unit) = video.depacketizer.push(&payload, timestamp) {
                    if unit.keyframe {
                        debug!("got a keyframe, {} bytes", unit.data.len());
                    }
                    match self.muxer.mux_video(&unit.data, unit.timestamp, unit.timestamp) {
                        Ok(tags) => {
                            for tag in tags {
                                self.publisher.feed(&tag).await?;
                            }
                        }
                        Err(err) => debug!("flv muxer refused video unit: {}", err),
                    }
                }
            }
            VideoCodec::Vp8 => {
                // FLV carries H.264 only; VP8 is consumed for simulcast
                // bookkeeping and goes no further.
                trace!("dropping VP8 payload after simulcast handling");
            }
        }
        Ok(outcome)
    }

    /// Run one audio RTP packet through decode, encode, muxing and publish.
    pub(crate) async fn process_audio(&mut self, packet: &Packet) -> Result<()> {
        let Some(audio) = self.audio.as_mut() else {
            return Ok(());
        };
        let Some(unit) = audio.depacketizer.push(
            &packet.payload,
            packet.header.payload_type,
            packet.header.sequence_number,
            packet.header.timestamp,
        ) else {
            return Ok(());
        };
        let Some(pcm) = audio.decoder.decode(&unit.data, unit.timestamp) else {
            return Ok(());
        };
        for frame in audio.encoder.push(&pcm.samples, pcm.timestamp) {
            match self.muxer.mux_audio(&frame.data, frame.timestamp) {
                Ok(tags) => {
                    for tag in tags {
                        self.publisher.feed(&tag).await?;
                    }
                }
                Err(err) => debug!("flv muxer refused audio frame: {}", err),
            }
        }
        Ok(())
    }

    /// Orderly teardown: flush the tail of the video stream, then close the
    /// RTMP connection. Stage drop order follows construction order in
    /// reverse.
    pub(crate) async fn shutdown(mut self) {
        if let Some(video) = self.video.as_mut() {
            if let Some(unit) = video.depacketizer.flush() {
                if let Ok(tags) = self.muxer.mux_video(&unit.data, unit.timestamp, unit.timestamp)
                {
                    for tag in tags {
                        if let Err(err) = self.publisher.feed(&tag).await {
                            warn!("flush during teardown failed: {}", err);
                            break;
                        }
                    }
                }
            }
        }
        self.publisher.close().await;
    }
}
