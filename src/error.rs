use thiserror::Error;

/// Plugin-level errors surfaced to clients as `{"error_code", "error"}`
/// events. The numeric codes are a wire contract and must not change.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("no message")]
    NoMessage,
    #[error("JSON error: not an object")]
    InvalidJson,
    #[error("unknown request '{0}'")]
    InvalidRequest(String),
    #[error("invalid element: {0}")]
    InvalidElement(String),
    #[error("missing element: {0}")]
    MissingElement(String),
    #[error("recording {0} not found")]
    NotFound(u64),
    #[error("invalid recording: {0}")]
    InvalidRecording(String),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("error parsing SDP: {0}")]
    InvalidSdp(String),
    #[error("recording {0} already exists")]
    RecordingExists(u64),
    #[error("{0}")]
    Unknown(String),
    #[error("create rtmp client failed: {0}")]
    RtmpClientFailed(String),
    #[error("create flv muxer failed: {0}")]
    FlvMuxerFailed(String),
    #[error("create aac encoder failed: {0}")]
    AacEncoderFailed(String),
    #[error("create opus decoder failed: {0}")]
    OpusDecoderFailed(String),
    #[error("create rtp video decoder failed: {0}")]
    RtpVideoDecoderFailed(String),
    #[error("create rtp audio decoder failed: {0}")]
    RtpAudioDecoderFailed(String),
}

impl PluginError {
    pub fn code(&self) -> u16 {
        match self {
            PluginError::NoMessage => 411,
            PluginError::InvalidJson => 412,
            PluginError::InvalidRequest(_) => 413,
            PluginError::InvalidElement(_) => 414,
            PluginError::MissingElement(_) => 415,
            PluginError::NotFound(_) => 416,
            PluginError::InvalidRecording(_) => 417,
            PluginError::InvalidState(_) => 418,
            PluginError::InvalidSdp(_) => 419,
            PluginError::RecordingExists(_) => 420,
            PluginError::Unknown(_) => 499,
            PluginError::RtmpClientFailed(_) => 500,
            PluginError::FlvMuxerFailed(_) => 501,
            PluginError::AacEncoderFailed(_) => 502,
            PluginError::OpusDecoderFailed(_) => 503,
            PluginError::RtpVideoDecoderFailed(_) => 504,
            PluginError::RtpAudioDecoderFailed(_) => 505,
        }
    }
}
