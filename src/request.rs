use serde::Deserialize;
use serde_json::Value;

use crate::error::PluginError;

/// JSEP payload attached to a request by the gateway.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub sdp: String,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub simulcast: Option<SimulcastInfo>,
}

/// Simulcast SSRC triple negotiated by the publisher, as relayed in JSEP.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SimulcastInfo {
    #[serde(rename = "ssrc-0", default)]
    pub ssrc_0: u32,
    #[serde(rename = "ssrc-1", default)]
    pub ssrc_1: u32,
    #[serde(rename = "ssrc-2", default)]
    pub ssrc_2: u32,
}

impl SimulcastInfo {
    pub fn ssrcs(&self) -> [u32; 3] {
        [self.ssrc_0, self.ssrc_1, self.ssrc_2]
    }
}

#[derive(Debug, Clone)]
pub enum Request {
    Configure(ConfigureRequest),
    Record(RecordRequest),
    Play(PlayRequest),
    Start,
    Stop,
}

#[derive(Debug, Clone)]
pub struct ConfigureRequest {
    pub video_bitrate_max: u32,
    pub video_keyframe_interval: u64,
}

#[derive(Debug, Clone)]
pub struct RecordRequest {
    pub name: String,
    pub id: Option<u64>,
    pub rtmp: String,
    pub update: bool,
}

#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub id: u64,
    pub restart: bool,
}

impl Request {
    pub fn parse(root: &Value) -> Result<Request, PluginError> {
        let Some(object) = root.as_object() else {
            return Err(PluginError::InvalidJson);
        };
        let request = match object.get("request") {
            None => return Err(PluginError::MissingElement("request".into())),
            Some(Value::String(request)) => request.as_str(),
            Some(_) => return Err(PluginError::InvalidElement("request".into())),
        };
        match request.to_ascii_lowercase().as_str() {
            "configure" => Ok(Request::Configure(ConfigureRequest {
                video_bitrate_max: required_u64(root, "video-bitrate-max")? as u32,
                video_keyframe_interval: required_u64(root, "video-keyframe-interval")?,
            })),
            "record" => {
                let name = required_string(root, "name")?;
                if name.is_empty() {
                    return Err(PluginError::InvalidElement("name".into()));
                }
                let rtmp = required_string(root, "rtmp")?;
                Ok(Request::Record(RecordRequest {
                    name,
                    id: optional_positive_u64(root, "id")?,
                    rtmp,
                    update: root
                        .get("update")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }))
            }
            "play" => Ok(Request::Play(PlayRequest {
                id: optional_positive_u64(root, "id")?
                    .ok_or_else(|| PluginError::MissingElement("id".into()))?,
                restart: match root.get("restart") {
                    None | Some(Value::Null) => false,
                    Some(Value::Bool(restart)) => *restart,
                    Some(_) => return Err(PluginError::InvalidElement("restart".into())),
                },
            })),
            "start" => Ok(Request::Start),
            "stop" => Ok(Request::Stop),
            _ => Err(PluginError::InvalidRequest(request.to_string())),
        }
    }
}

fn required_string(root: &Value, key: &str) -> Result<String, PluginError> {
    match root.get(key) {
        None | Some(Value::Null) => Err(PluginError::MissingElement(key.into())),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(PluginError::InvalidElement(key.into())),
    }
}

fn required_u64(root: &Value, key: &str) -> Result<u64, PluginError> {
    match root.get(key) {
        None | Some(Value::Null) => Err(PluginError::MissingElement(key.into())),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| PluginError::InvalidElement(key.into())),
    }
}

fn optional_positive_u64(root: &Value, key: &str) -> Result<Option<u64>, PluginError> {
    match root.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_u64() {
            Some(value) if value > 0 => Ok(Some(value)),
            _ => Err(PluginError::InvalidElement(key.into())),
        },
    }
}
