use serde_json::{json, Value};

/// Package identifier the gateway and the token ACLs know this plugin by.
pub const PLUGIN_PACKAGE: &str = "janus.plugin.pushstream";

/// Callbacks into the gateway core. The gateway owns ICE/DTLS/SRTP and the
/// signalling transport; the plugin only hands it RTCP feedback to relay and
/// JSON events to deliver.
pub trait Gateway: Send + Sync + 'static {
    /// Relay an RTCP feedback packet towards the publisher.
    fn relay_rtcp(&self, handle: u64, video: bool, data: &[u8]);
    /// Push an event (and optionally a JSEP answer) to the client that owns
    /// the session.
    fn push_event(&self, handle: u64, transaction: Option<&str>, event: Value, jsep: Option<Value>);
    /// Whether event handlers are attached to the gateway at all.
    fn events_is_enabled(&self) -> bool;
    /// Forward plugin-internal info to event handlers.
    fn notify_event(&self, handle: u64, info: Value);
}

pub(crate) fn error_event(code: u16, cause: impl AsRef<str>) -> Value {
    json!({
        "pushstream": "event",
        "error_code": code,
        "error": cause.as_ref(),
    })
}

pub(crate) fn result_event(result: Value) -> Value {
    json!({
        "pushstream": "event",
        "result": result,
    })
}

pub(crate) fn done_event() -> Value {
    json!({
        "pushstream": "event",
        "result": "done",
    })
}
