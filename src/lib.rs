//! WebRTC to RTMP push-stream plugin.
//!
//! The gateway owns ICE, DTLS, SRTP and the signalling transport; this
//! crate consumes already-decrypted RTP/RTCP and a JSON request channel,
//! and republishes the media as an FLV-muxed stream over RTMP. One
//! [`Plugin`] instance serves many sessions, each driving its own
//! depacketize -> transcode -> mux -> publish pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub mod audio;
pub mod config;
pub mod error;
pub mod flv;
pub mod gateway;
pub mod recordings;
pub mod request;
pub mod rtmp;
pub mod rtp;
pub mod sdp;
pub mod session;
pub mod simulcast;

mod dispatcher;

pub use config::Config;
pub use error::PluginError;
pub use gateway::{Gateway, PLUGIN_PACKAGE};
pub use request::{Jsep, Request};
pub use session::{Session, State};

use dispatcher::HandlerMessage;
use gateway::error_event;
use recordings::Recordings;
use rtmp::PublisherOptions;

/// What `handle_message` hands back to the gateway.
#[derive(Debug, Clone)]
pub enum PluginReply {
    /// Complete response, delivered synchronously.
    Synchronous(Value),
    /// Request was queued; the result arrives later via `push_event`.
    Queued,
}

impl PluginReply {
    /// The JSON the gateway should relay for this reply.
    pub fn json(&self) -> Value {
        match self {
            PluginReply::Synchronous(value) => value.clone(),
            PluginReply::Queued => json!({"pushstream": "ok"}),
        }
    }
}

pub(crate) struct PluginInner {
    config: Config,
    pub(crate) gateway: Arc<dyn Gateway>,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    pub(crate) recordings: Recordings,
    pub(crate) notify_events: bool,
    queue: UnboundedSender<HandlerMessage>,
}

impl PluginInner {
    pub(crate) fn session(&self, handle: u64) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(&handle).cloned()
    }

    pub(crate) fn publisher_options(&self) -> PublisherOptions {
        PublisherOptions {
            connect_timeout: Duration::from_millis(self.config.rtmp.connect_timeout),
            send_timeout: Duration::from_millis(self.config.rtmp.send_timeout),
            chunk_size: self.config.rtmp.chunk_size,
        }
    }
}

/// The plugin: session registry, recordings registry and the one handler
/// task draining deferred requests.
pub struct Plugin {
    inner: Arc<PluginInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Plugin {
    /// Initialize the plugin: validate the configuration, make sure the
    /// recordings directory exists and start the handler task. Must run
    /// inside a tokio runtime.
    pub fn init(config: Config, gateway: Arc<dyn Gateway>) -> anyhow::Result<Self> {
        config.validate()?;
        config.ensure_recordings_path()?;
        let notify_events = config.general.events;
        if !notify_events && gateway.events_is_enabled() {
            warn!("notification of events to handlers disabled");
        }

        let (queue, rx) = unbounded_channel();
        let inner = Arc::new(PluginInner {
            config,
            gateway,
            sessions: Mutex::new(HashMap::new()),
            recordings: Recordings::new(),
            notify_events,
            queue,
        });
        let worker = tokio::spawn(dispatcher::run_worker(inner.clone(), rx));
        info!("{} initialized", PLUGIN_PACKAGE);
        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stop the handler task and drop every session.
    pub async fn destroy(&self) {
        let _ = self.inner.queue.send(HandlerMessage::Exit);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.inner.sessions.lock().unwrap().clear();
        info!("{} destroyed", PLUGIN_PACKAGE);
    }

    pub fn create_session(&self, handle: u64) -> Result<(), PluginError> {
        let mut sessions = self.inner.sessions.lock().unwrap();
        if sessions.contains_key(&handle) {
            return Err(PluginError::Unknown(format!(
                "session {} already exists",
                handle
            )));
        }
        sessions.insert(handle, Arc::new(Session::new(handle)));
        debug!("created session {}", handle);
        Ok(())
    }

    /// Tear the session down (hangup included) and forget it.
    pub async fn destroy_session(&self, handle: u64) -> Result<(), PluginError> {
        let session = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            sessions.remove(&handle)
        }
        .ok_or_else(|| PluginError::Unknown(format!("no session {}", handle)))?;
        session
            .hangup(&self.inner.gateway, &self.inner.recordings)
            .await;
        session.mark_destroyed();
        debug!("destroyed session {}", handle);
        Ok(())
    }

    /// Session accessor for embedders (substream moves, introspection).
    pub fn session(&self, handle: u64) -> Option<Arc<Session>> {
        self.inner.session(handle)
    }

    pub fn query_session(&self, handle: u64) -> Option<Value> {
        self.inner.session(handle).map(|s| s.query_info())
    }

    /// Entry point for client requests. `configure` and protocol errors
    /// are answered inline; everything else lands on the handler task.
    pub fn handle_message(
        &self,
        handle: u64,
        transaction: Option<&str>,
        message: Option<Value>,
        jsep: Option<Value>,
    ) -> PluginReply {
        let Some(session) = self.inner.session(handle) else {
            return PluginReply::Synchronous(error_event(
                499,
                "no session associated with this handle",
            ));
        };
        if session.is_destroyed() {
            return PluginReply::Synchronous(error_event(499, "session has already been destroyed"));
        }
        let Some(body) = message else {
            let err = PluginError::NoMessage;
            return PluginReply::Synchronous(error_event(err.code(), err.to_string()));
        };

        match Request::parse(&body) {
            Ok(Request::Configure(configure)) => {
                let settings = session.configure(&configure);
                PluginReply::Synchronous(json!({
                    "pushstream": "configure",
                    "status": "ok",
                    "settings": settings,
                }))
            }
            Ok(_) => {
                let jsep = jsep.and_then(|value| serde_json::from_value::<Jsep>(value).ok());
                let queued = self.inner.queue.send(HandlerMessage::Request {
                    handle,
                    transaction: transaction.map(str::to_string),
                    body,
                    jsep,
                });
                if queued.is_err() {
                    return PluginReply::Synchronous(error_event(499, "plugin is shutting down"));
                }
                PluginReply::Queued
            }
            Err(err) => PluginReply::Synchronous(error_event(err.code(), err.to_string())),
        }
    }

    /// Decrypted RTP from the gateway. Runs the pipeline inline on the
    /// calling task; per-session ordering is the caller's delivery order.
    pub async fn incoming_rtp(&self, handle: u64, video: bool, buf: &[u8]) {
        let Some(session) = self.inner.session(handle) else {
            return;
        };
        session
            .incoming_rtp(video, buf, &self.inner.gateway, &self.inner.recordings)
            .await;
    }

    /// RTCP from the publisher; nothing to do with it here.
    pub fn incoming_rtcp(&self, handle: u64, video: bool, buf: &[u8]) {
        trace!(
            "ignoring {} bytes of {} RTCP on session {}",
            buf.len(),
            if video { "video" } else { "audio" },
            handle
        );
    }

    /// The PeerConnection is up.
    pub fn setup_media(&self, handle: u64) {
        if let Some(session) = self.inner.session(handle) {
            info!("webrtc media is now available on session {}", session.handle);
        }
    }

    /// The gateway reports the PeerConnection as gone.
    pub async fn hangup_media(&self, handle: u64) {
        let Some(session) = self.inner.session(handle) else {
            warn!("no session associated with handle {}", handle);
            return;
        };
        session
            .hangup(&self.inner.gateway, &self.inner.recordings)
            .await;
    }

    /// Number of live recordings, for introspection.
    pub fn recordings_count(&self) -> usize {
        self.inner.recordings.len()
    }
}

/// Build the process-level request authenticator from configuration:
/// stored-token mode (preloading any configured tokens), or signed-token
/// mode when a secret is set. `None` when authentication is disabled.
pub fn init_auth(config: &Config) -> Option<auth::TokenAuth> {
    if !config.auth.enabled {
        warn!("token based authentication disabled");
        return None;
    }
    match &config.auth.secret {
        Some(secret) => Some(auth::TokenAuth::signed(secret.clone())),
        None => {
            let tokens = auth::TokenAuth::stored();
            for token in &config.auth.tokens {
                tokens.add_token(token);
            }
            Some(tokens)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_mode_follows_configuration() {
        let mut config = Config::default();
        assert!(init_auth(&config).is_none());

        config.auth.enabled = true;
        config.auth.tokens = vec!["preloaded".into()];
        let stored = init_auth(&config).unwrap();
        assert!(stored.is_stored_mode());
        assert!(stored.check_token("preloaded"));

        config.auth.secret = Some("sharedsecret".into());
        let signed = init_auth(&config).unwrap();
        assert!(!signed.is_stored_mode());
        assert!(!signed.check_token("preloaded"));
    }
}
