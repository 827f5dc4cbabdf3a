use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::error::PluginError;
use crate::gateway::{error_event, result_event};
use crate::recordings::{AudioDescriptor, Recording, VideoDescriptor};
use crate::request::{Jsep, PlayRequest, RecordRequest, Request};
use crate::rtmp::{PublisherOptions, RtmpTarget};
use crate::sdp;
use crate::session::pipeline::Pipeline;
use crate::session::{Session, State};
use crate::PluginInner;

/// Work items for the single handler task. Requests from one session stay
/// in arrival order because there is exactly one consumer.
pub(crate) enum HandlerMessage {
    Request {
        handle: u64,
        transaction: Option<String>,
        body: Value,
        jsep: Option<Jsep>,
    },
    /// Shutdown sentinel, pushed at plugin deinit.
    Exit,
}

pub(crate) async fn run_worker(
    inner: Arc<PluginInner>,
    mut queue: UnboundedReceiver<HandlerMessage>,
) {
    debug!("joining handler task");
    while let Some(message) = queue.recv().await {
        match message {
            HandlerMessage::Exit => break,
            HandlerMessage::Request {
                handle,
                transaction,
                body,
                jsep,
            } => {
                let Some(session) = inner.session(handle) else {
                    warn!("no session associated with handle {}", handle);
                    continue;
                };
                if session.is_destroyed() {
                    continue;
                }
                dispatch(&inner, &session, handle, transaction.as_deref(), &body, jsep).await;
            }
        }
    }
    debug!("leaving handler task");
}

async fn dispatch(
    inner: &Arc<PluginInner>,
    session: &Arc<Session>,
    handle: u64,
    transaction: Option<&str>,
    body: &Value,
    jsep: Option<Jsep>,
) {
    let request = match Request::parse(body) {
        Ok(request) => request,
        Err(err) => {
            inner
                .gateway
                .push_event(handle, transaction, error_event(err.code(), err.to_string()), None);
            return;
        }
    };
    let outcome = match request {
        Request::Record(record) => handle_record(inner, session, transaction, record, jsep).await,
        Request::Play(play) => handle_play(inner, session, transaction, play),
        Request::Start => handle_start(inner, session, transaction, jsep),
        Request::Stop => handle_stop(inner, session, transaction).await,
        Request::Configure(_) => {
            // Synchronous; never lands on the worker.
            Err(PluginError::InvalidRequest("configure".into()))
        }
    };
    if let Err(err) = outcome {
        warn!("request on session {} failed: {}", handle, err);
        inner
            .gateway
            .push_event(handle, transaction, error_event(err.code(), err.to_string()), None);
    }
}

async fn handle_record(
    inner: &Arc<PluginInner>,
    session: &Arc<Session>,
    transaction: Option<&str>,
    request: RecordRequest,
    jsep: Option<Jsep>,
) -> Result<(), PluginError> {
    let jsep = jsep
        .filter(|jsep| !jsep.sdp.is_empty() && jsep.kind.eq_ignore_ascii_case("offer"))
        .ok_or_else(|| PluginError::MissingElement("SDP offer".into()))?;
    let offer =
        sdp::parse_offer(&jsep.sdp).map_err(|e| PluginError::InvalidSdp(e.to_string()))?;

    // Renegotiation (e.g. an ICE restart): answer again, keep the pipeline.
    if jsep.update || request.update {
        let recording = match (session.state(), session.recording()) {
            (State::Publishing, Some(recording)) => recording,
            _ => {
                return Err(PluginError::InvalidState(
                    "not a recording session, can't update",
                ))
            }
        };
        let (sessid, version) = session.next_sdp_ids(false);
        let answer = sdp::build_answer(
            &offer,
            sessid as u64,
            version,
            &format!("Recording {}", recording.id),
        );
        let event = result_event(json!({"status": "recording", "id": recording.id}));
        let answer_jsep = json!({"type": "answer", "sdp": answer, "restart": true});
        inner
            .gateway
            .push_event(session.handle, transaction, event, Some(answer_jsep));
        return Ok(());
    }

    if session.state() != State::Idle {
        return Err(PluginError::InvalidState("session is already recording"));
    }
    if !request.rtmp.starts_with("rtmp://") {
        return Err(PluginError::InvalidElement("rtmp".into()));
    }
    // The client-supplied target is authoritative.
    let target =
        RtmpTarget::parse(&request.rtmp).map_err(|_| PluginError::InvalidElement("rtmp".into()))?;
    if offer.audio.is_none() && offer.video.is_none() {
        return Err(PluginError::InvalidSdp(
            "offer carries no supported codecs".into(),
        ));
    }

    session.set_state(State::Negotiating);
    let result = record_session(inner, session, transaction, &request, &jsep, offer, target).await;
    if result.is_err() && session.state() == State::Negotiating {
        session.set_state(State::Idle);
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn record_session(
    inner: &Arc<PluginInner>,
    session: &Arc<Session>,
    transaction: Option<&str>,
    request: &RecordRequest,
    jsep: &Jsep,
    offer: sdp::Offer,
    target: RtmpTarget,
) -> Result<(), PluginError> {
    let id = inner.recordings.allocate_id(request.id)?;
    info!("starting new recording {} ({})", id, request.name);

    let recording = Arc::new(Recording {
        id,
        name: request.name.clone(),
        target,
        audio: offer.audio.as_ref().map(|selection| AudioDescriptor {
            codec: sdp::AudioCodec::Opus,
            payload_type: selection.payload_type,
            sample_rate: crate::audio::SAMPLE_RATE,
            channels: crate::audio::CHANNELS,
        }),
        video: offer
            .video
            .as_ref()
            .map(|(codec, selection)| VideoDescriptor {
                codec: *codec,
                payload_type: selection.payload_type,
            }),
        offer: std::sync::Mutex::new(Some(jsep.sdp.clone())),
        date: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    });

    // Simulcast only applies when H.264 or VP8 got negotiated (it did, or
    // there is no video descriptor at all).
    let simulcast = recording
        .video
        .as_ref()
        .and_then(|_| jsep.simulcast.map(|info| info.ssrcs()));

    let pipeline = Pipeline::build(&recording, simulcast, inner.publisher_options()).await?;
    inner.recordings.insert(recording.clone())?;

    let (sessid, version) = session.next_sdp_ids(true);
    let answer = sdp::build_answer(
        &offer,
        sessid as u64,
        version,
        &format!("Recording {}", id),
    );
    let has_audio = pipeline.has_audio();
    let has_video = pipeline.has_video();
    session.activate(pipeline, recording).await;

    let event = result_event(json!({"status": "recording", "id": id}));
    let answer_jsep = json!({"type": "answer", "sdp": answer});
    inner
        .gateway
        .push_event(session.handle, transaction, event, Some(answer_jsep));

    if inner.notify_events && inner.gateway.events_is_enabled() {
        inner.gateway.notify_event(
            session.handle,
            json!({
                "event": "recording",
                "id": id,
                "audio": has_audio,
                "video": has_video,
            }),
        );
    }
    Ok(())
}

fn handle_play(
    inner: &Arc<PluginInner>,
    session: &Arc<Session>,
    transaction: Option<&str>,
    request: PlayRequest,
) -> Result<(), PluginError> {
    let recording = inner
        .recordings
        .get(request.id)
        .ok_or(PluginError::NotFound(request.id))?;
    let offer = recording
        .offer
        .lock()
        .unwrap()
        .clone()
        .ok_or_else(|| PluginError::InvalidRecording("recording has no offer yet".into()))?;
    if request.restart {
        debug!("play restart requested for recording {}", request.id);
    }
    session.set_playback(Some(recording.clone()));

    let event = result_event(json!({"status": "preparing", "id": request.id}));
    let offer_jsep = json!({"type": "offer", "sdp": offer});
    inner
        .gateway
        .push_event(session.handle, transaction, event, Some(offer_jsep));
    if inner.notify_events && inner.gateway.events_is_enabled() {
        inner.gateway.notify_event(
            session.handle,
            json!({"event": "playing", "id": request.id}),
        );
    }
    Ok(())
}

fn handle_start(
    inner: &Arc<PluginInner>,
    session: &Arc<Session>,
    transaction: Option<&str>,
    jsep: Option<Jsep>,
) -> Result<(), PluginError> {
    let playback = session
        .playback()
        .ok_or(PluginError::InvalidState("not a playout session, can't start"))?;
    jsep.filter(|jsep| !jsep.sdp.is_empty() && jsep.kind.eq_ignore_ascii_case("answer"))
        .ok_or_else(|| PluginError::MissingElement("SDP answer".into()))?;

    let event = result_event(json!({"status": "playing"}));
    inner
        .gateway
        .push_event(session.handle, transaction, event, None);
    if inner.notify_events && inner.gateway.events_is_enabled() {
        inner
            .gateway
            .notify_event(session.handle, json!({"event": "playing", "id": playback.id}));
    }
    Ok(())
}

async fn handle_stop(
    inner: &Arc<PluginInner>,
    session: &Arc<Session>,
    transaction: Option<&str>,
) -> Result<(), PluginError> {
    let recording = session.recording();
    let mut result = json!({"status": "stopped"});
    if let Some(recording) = &recording {
        result["id"] = json!(recording.id);
    }
    inner
        .gateway
        .push_event(session.handle, transaction, result_event(result), None);
    if let Some(recording) = &recording {
        if inner.notify_events && inner.gateway.events_is_enabled() {
            inner.gateway.notify_event(
                session.handle,
                json!({"event": "stopped", "id": recording.id}),
            );
        }
    }
    // The hangup path emits the final done event and releases the stages.
    session.hangup(&inner.gateway, &inner.recordings).await;
    Ok(())
}
