use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::PluginError;
use crate::rtmp::RtmpTarget;
use crate::sdp::{AudioCodec, VideoCodec};

/// Descriptor of one active publish.
#[derive(Debug)]
pub struct Recording {
    pub id: u64,
    pub name: String,
    pub target: RtmpTarget,
    pub audio: Option<AudioDescriptor>,
    pub video: Option<VideoDescriptor>,
    /// SDP offer cached for potential viewers.
    pub offer: Mutex<Option<String>>,
    pub date: String,
}

#[derive(Debug, Clone)]
pub struct AudioDescriptor {
    pub codec: AudioCodec,
    pub payload_type: u8,
    pub sample_rate: u32,
    pub channels: u8,
}

#[derive(Debug, Clone)]
pub struct VideoDescriptor {
    pub codec: VideoCodec,
    pub payload_type: u8,
}

/// Registry of live recordings, keyed by id. One lock, no lock held while
/// doing anything slow.
#[derive(Default)]
pub struct Recordings {
    map: Mutex<HashMap<u64, Arc<Recording>>>,
}

impl Recordings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id: the requested one (421 territory if taken) or a fresh
    /// random one.
    pub fn allocate_id(&self, requested: Option<u64>) -> Result<u64, PluginError> {
        let map = self.map.lock().unwrap();
        match requested {
            Some(id) => {
                if map.contains_key(&id) {
                    return Err(PluginError::RecordingExists(id));
                }
                Ok(id)
            }
            None => {
                let mut id = 0u64;
                while id == 0 || map.contains_key(&id) {
                    id = rand::random();
                }
                Ok(id)
            }
        }
    }

    pub fn insert(&self, recording: Arc<Recording>) -> Result<(), PluginError> {
        let mut map = self.map.lock().unwrap();
        if map.contains_key(&recording.id) {
            return Err(PluginError::RecordingExists(recording.id));
        }
        map.insert(recording.id, recording);
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<Arc<Recording>> {
        self.map.lock().unwrap().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Recording>> {
        self.map.lock().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(id: u64) -> Arc<Recording> {
        Arc::new(Recording {
            id,
            name: format!("rec-{}", id),
            target: RtmpTarget {
                host: "localhost".into(),
                port: 1935,
                app: "app".into(),
                stream: "stream".into(),
            },
            audio: None,
            video: None,
            offer: Mutex::new(None),
            date: "2024-01-01 00:00:00".into(),
        })
    }

    #[test]
    fn ids_collide_with_420() {
        let registry = Recordings::new();
        registry.insert(recording(7)).unwrap();
        let err = registry.allocate_id(Some(7)).unwrap_err();
        assert_eq!(err.code(), 420);
        assert!(registry.allocate_id(Some(8)).is_ok());
        // Random allocation always lands on a free nonzero id.
        let id = registry.allocate_id(None).unwrap();
        assert_ne!(id, 0);
        assert_ne!(id, 7);
    }

    #[test]
    fn insert_get_remove() {
        let registry = Recordings::new();
        registry.insert(recording(1)).unwrap();
        assert!(registry.insert(recording(1)).is_err());
        assert_eq!(registry.get(1).unwrap().name, "rec-1");
        assert!(registry.remove(1).is_some());
        assert!(registry.get(1).is_none());
        assert!(registry.is_empty());
    }
}
