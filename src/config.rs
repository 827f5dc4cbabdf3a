use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub rtmp: Rtmp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct General {
    /// Directory recordings metadata lives in; created at 0755 if missing.
    #[serde(default = "default_path")]
    pub path: String,
    /// Whether state changes are forwarded to event handlers.
    #[serde(default = "default_events")]
    pub events: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Auth {
    /// Enables request authentication.
    #[serde(default)]
    pub enabled: bool,
    /// Switches from stored-token to signed-token mode when set.
    #[serde(default)]
    pub secret: Option<String>,
    /// Tokens preloaded into the stored set.
    #[serde(default)]
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Rtmp {
    /// Publisher connect timeout, milliseconds.
    #[serde(default = "default_rtmp_timeout")]
    pub connect_timeout: u64,
    /// Per-send timeout before a blocked socket counts as backpressure.
    #[serde(default = "default_rtmp_timeout")]
    pub send_timeout: u64,
    /// Outbound RTMP chunk size.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
}

fn default_path() -> String {
    String::from("/var/lib/pushstream/recordings")
}

fn default_events() -> bool {
    true
}

fn default_rtmp_timeout() -> u64 {
    2000
}

fn default_chunk_size() -> u32 {
    4096
}

impl Default for General {
    fn default() -> Self {
        Self {
            path: default_path(),
            events: default_events(),
        }
    }
}

impl Default for Rtmp {
    fn default() -> Self {
        Self {
            connect_timeout: default_rtmp_timeout(),
            send_timeout: default_rtmp_timeout(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Config {
    pub fn parse(path: Option<String>) -> anyhow::Result<Self> {
        let raw = match path {
            Some(path) => fs::read_to_string(path)?,
            None => fs::read_to_string("config.toml")
                .or_else(|_| fs::read_to_string("/etc/pushstream/config.toml"))
                .unwrap_or_default(),
        };
        let cfg: Self = toml::from_str(raw.as_str())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.path.is_empty() {
            return Err(anyhow::anyhow!("general.path cannot be empty"));
        }
        if self.rtmp.chunk_size < 128 {
            return Err(anyhow::anyhow!("rtmp.chunk_size must be at least 128"));
        }
        Ok(())
    }

    /// Make sure the recordings directory exists, creating it at mode 0755.
    pub fn ensure_recordings_path(&self) -> anyhow::Result<()> {
        let path = Path::new(&self.general.path);
        if !path.is_dir() {
            fs::create_dir_all(path)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_on_empty_input() {
        let cfg: Config = toml::from_str("").unwrap();
        assert!(cfg.general.events);
        assert_eq!(cfg.rtmp.connect_timeout, 2000);
        assert_eq!(cfg.rtmp.chunk_size, 4096);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_general_section() {
        let cfg: Config = toml::from_str(
            r#"
            [general]
            path = "/tmp/pushstream"
            events = false

            [auth]
            enabled = true
            secret = "sharedsecret"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.general.path, "/tmp/pushstream");
        assert!(!cfg.general.events);
        assert!(cfg.auth.enabled);
        assert_eq!(cfg.auth.secret.as_deref(), Some("sharedsecret"));
    }

    #[test]
    fn rejects_tiny_chunk_size() {
        let cfg: Config = toml::from_str("[rtmp]\nchunk_size = 16\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn creates_recordings_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("recordings");
        let cfg = Config {
            general: General {
                path: target.to_string_lossy().into_owned(),
                events: true,
            },
            ..Default::default()
        };
        cfg.ensure_recordings_path().unwrap();
        assert!(target.is_dir());
    }
}
