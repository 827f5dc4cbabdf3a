use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, trace, warn};
use webrtc::rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtp::packet::Packet;
use webrtc::util::{Marshal, Unmarshal};

use crate::gateway::{done_event, Gateway};
use crate::recordings::{Recording, Recordings};
use crate::request::ConfigureRequest;

pub(crate) mod feedback;
pub(crate) mod pipeline;

use pipeline::Pipeline;

/// Session lifecycle. Transitions are monotonic; a closed session never
/// goes back to publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Negotiating,
    Publishing,
    HangingUp,
    Closed,
}

/// Default publisher bitrate advertised via REMB: 1 mbps.
const DEFAULT_BITRATE: u32 = 1024 * 1024;
/// Default keyframe request interval, milliseconds.
const DEFAULT_KEYFRAME_INTERVAL: u64 = 4000;
/// Lower clamp for the keyframe request interval.
const MIN_KEYFRAME_INTERVAL: u64 = 1000;

/// One PeerConnection handled by the plugin.
pub struct Session {
    pub(crate) handle: u64,
    state: Mutex<State>,
    video_bitrate: AtomicU32,
    video_keyframe_interval: AtomicU64,
    sdp_sessid: AtomicI64,
    sdp_version: AtomicU64,
    recording: Mutex<Option<Arc<Recording>>>,
    /// Recording this session watches, when acting as a viewer.
    playback: Mutex<Option<Arc<Recording>>>,
    media: tokio::sync::Mutex<Option<Pipeline>>,
    hanging_up: AtomicBool,
    destroyed: AtomicBool,
}

impl Session {
    pub(crate) fn new(handle: u64) -> Self {
        Self {
            handle,
            state: Mutex::new(State::Idle),
            video_bitrate: AtomicU32::new(DEFAULT_BITRATE),
            video_keyframe_interval: AtomicU64::new(DEFAULT_KEYFRAME_INTERVAL),
            sdp_sessid: AtomicI64::new(0),
            sdp_version: AtomicU64::new(0),
            recording: Mutex::new(None),
            playback: Mutex::new(None),
            media: tokio::sync::Mutex::new(None),
            hanging_up: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: State) {
        *self.state.lock().unwrap() = state;
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }

    pub fn recording(&self) -> Option<Arc<Recording>> {
        self.recording.lock().unwrap().clone()
    }

    pub(crate) fn set_recording(&self, recording: Option<Arc<Recording>>) {
        *self.recording.lock().unwrap() = recording;
    }

    pub fn playback(&self) -> Option<Arc<Recording>> {
        self.playback.lock().unwrap().clone()
    }

    pub(crate) fn set_playback(&self, recording: Option<Arc<Recording>>) {
        *self.playback.lock().unwrap() = recording;
    }

    pub(crate) fn video_bitrate(&self) -> u32 {
        self.video_bitrate.load(Ordering::Relaxed)
    }

    pub(crate) fn keyframe_interval(&self) -> Duration {
        Duration::from_millis(self.video_keyframe_interval.load(Ordering::Relaxed))
    }

    /// `configure`: store the clamped knobs and report them back.
    pub(crate) fn configure(&self, request: &ConfigureRequest) -> Value {
        self.video_bitrate
            .store(request.video_bitrate_max, Ordering::Relaxed);
        let interval = request.video_keyframe_interval.max(MIN_KEYFRAME_INTERVAL);
        if interval != request.video_keyframe_interval {
            warn!(
                "video keyframe interval clamped from {} to {} ms",
                request.video_keyframe_interval, interval
            );
        }
        self.video_keyframe_interval
            .store(interval, Ordering::Relaxed);
        debug!(
            "configured bitrate {} and keyframe interval {} ms",
            request.video_bitrate_max, interval
        );
        json!({
            "video-bitrate-max": self.video_bitrate.load(Ordering::Relaxed),
            "video-keyframe-interval": interval,
        })
    }

    pub(crate) fn next_sdp_ids(&self, fresh: bool) -> (i64, u64) {
        if fresh {
            self.sdp_sessid
                .store(chrono::Utc::now().timestamp_micros(), Ordering::Relaxed);
            self.sdp_version.store(1, Ordering::Relaxed);
        } else {
            self.sdp_version.fetch_add(1, Ordering::Relaxed);
        }
        (
            self.sdp_sessid.load(Ordering::Relaxed),
            self.sdp_version.load(Ordering::Relaxed),
        )
    }

    /// Install the freshly built pipeline and move to publishing.
    pub(crate) async fn activate(&self, pipeline: Pipeline, recording: Arc<Recording>) {
        *self.media.lock().await = Some(pipeline);
        self.set_recording(Some(recording));
        self.set_state(State::Publishing);
    }

    /// Admin introspection, mirrored on the gateway's query API.
    pub fn query_info(&self) -> Value {
        let recording = self.recording();
        let kind = if recording.is_some() {
            "recorder"
        } else if self.playback().is_some() {
            "player"
        } else {
            "none"
        };
        json!({
            "type": kind,
            "recording_id": recording.as_ref().map(|r| r.id),
            "recording_name": recording.as_ref().map(|r| r.name.clone()),
            "state": format!("{:?}", self.state()),
            "hangingup": self.hanging_up.load(Ordering::Acquire) as i32,
            "destroyed": self.destroyed.load(Ordering::Acquire) as i32,
        })
    }

    /// Hot path: one decrypted RTP packet from the gateway I/O threads.
    pub(crate) async fn incoming_rtp(
        &self,
        video: bool,
        buf: &[u8],
        gateway: &Arc<dyn Gateway>,
        recordings: &Recordings,
    ) {
        if self.is_destroyed() || self.hanging_up.load(Ordering::Acquire) {
            return;
        }
        if self.state() != State::Publishing {
            return;
        }
        let mut raw = buf;
        let Ok(packet) = Packet::unmarshal(&mut raw) else {
            trace!("dropping unparsable RTP packet, {} bytes", buf.len());
            return;
        };

        let mut media = self.media.lock().await;
        let Some(pipeline) = media.as_mut() else {
            return;
        };

        if video {
            match pipeline.process_video(&packet).await {
                Ok(outcome) => {
                    if outcome.needs_pli {
                        debug!("simulcast switch needs a PLI");
                        self.relay_pli(gateway, packet.header.ssrc);
                    }
                    self.drive_feedback(pipeline, gateway, packet.header.ssrc);
                }
                Err(err) => {
                    let pipeline = media.take();
                    drop(media);
                    self.fatal_teardown(pipeline, gateway, recordings, err).await;
                }
            }
        } else if let Err(err) = pipeline.process_audio(&packet).await {
            let pipeline = media.take();
            drop(media);
            self.fatal_teardown(pipeline, gateway, recordings, err).await;
        }
    }

    /// Move the simulcast target substream; requests a PLI when a switch
    /// becomes pending.
    pub async fn set_substream(&self, target: usize, gateway: &Arc<dyn Gateway>) {
        let mut media = self.media.lock().await;
        if let Some(pipeline) = media.as_mut() {
            if pipeline.set_substream(target) {
                self.relay_pli(gateway, 0);
            }
        }
    }

    pub async fn set_temporal_layer(&self, target: u8) {
        let mut media = self.media.lock().await;
        if let Some(pipeline) = media.as_mut() {
            pipeline.set_temporal_layer(target);
        }
    }

    fn drive_feedback(&self, pipeline: &mut Pipeline, gateway: &Arc<dyn Gateway>, ssrc: u32) {
        if let Some(bitrate) = pipeline.feedback.poll_remb(self.video_bitrate()) {
            let remb = ReceiverEstimatedMaximumBitrate {
                sender_ssrc: 1,
                bitrate: bitrate as f32,
                ssrcs: vec![ssrc],
            };
            if let Ok(data) = remb.marshal() {
                trace!("sending REMB at {} bps", bitrate);
                gateway.relay_rtcp(self.handle, true, &data);
            }
        }
        if let Some(seq) = pipeline
            .feedback
            .poll_keyframe_request(self.keyframe_interval())
        {
            // Both a FIR and a PLI, to cover publishers that only honor
            // one of the two.
            let fir = FullIntraRequest {
                sender_ssrc: 1,
                media_ssrc: ssrc,
                fir: vec![FirEntry {
                    ssrc,
                    sequence_number: seq,
                }],
            };
            if let Ok(data) = fir.marshal() {
                debug!("requesting keyframe (FIR #{})", seq);
                gateway.relay_rtcp(self.handle, true, &data);
            }
            self.relay_pli(gateway, ssrc);
        }
    }

    fn relay_pli(&self, gateway: &Arc<dyn Gateway>, ssrc: u32) {
        let pli = PictureLossIndication {
            sender_ssrc: 1,
            media_ssrc: ssrc,
        };
        if let Ok(data) = pli.marshal() {
            gateway.relay_rtcp(self.handle, true, &data);
        }
    }

    /// Orderly hangup: the first caller wins the flag and runs teardown;
    /// everyone else returns immediately. Emits the final `done` event.
    pub(crate) async fn hangup(
        &self,
        gateway: &Arc<dyn Gateway>,
        recordings: &Recordings,
    ) -> bool {
        if self.hanging_up.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.state() == State::Closed {
            return false;
        }
        info!("hanging up session {}", self.handle);
        self.set_state(State::HangingUp);

        let pipeline = self.media.lock().await.take();
        if let Some(pipeline) = pipeline {
            pipeline.shutdown().await;
        }
        if let Some(recording) = self.recording.lock().unwrap().take() {
            recordings.remove(recording.id);
        }
        self.set_state(State::Closed);
        gateway.push_event(self.handle, None, done_event(), None);
        true
    }

    async fn fatal_teardown(
        &self,
        pipeline: Option<Pipeline>,
        gateway: &Arc<dyn Gateway>,
        recordings: &Recordings,
        err: anyhow::Error,
    ) {
        warn!("fatal pipeline error on session {}: {}", self.handle, err);
        if self.hanging_up.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(State::HangingUp);
        if let Some(pipeline) = pipeline {
            pipeline.shutdown().await;
        }
        if let Some(recording) = self.recording.lock().unwrap().take() {
            recordings.remove(recording.id);
        }
        self.set_state(State::Closed);
        gateway.push_event(self.handle, None, done_event(), None);
    }
}
