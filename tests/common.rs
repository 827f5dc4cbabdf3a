#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use bytes::{Bytes, BytesMut};
use pushstream::gateway::Gateway;
use pushstream::rtmp::amf::{self, Amf0Value};
use pushstream::rtmp::chunk::{message_type, ChunkReader, ChunkWriter, Message};

/// Honor RUST_LOG in test runs; safe to call from every test.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// One event the plugin pushed through the gateway callbacks.
#[derive(Debug, Clone)]
pub struct PushedEvent {
    pub handle: u64,
    pub transaction: Option<String>,
    pub event: Value,
    pub jsep: Option<Value>,
}

/// Test double for the gateway core: records everything.
#[derive(Default)]
pub struct MockGateway {
    pub events: Mutex<Vec<PushedEvent>>,
    pub rtcp: Mutex<Vec<(bool, Vec<u8>)>>,
    pub notifications: Mutex<Vec<Value>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        init_logging();
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<PushedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Poll until an event matching the predicate shows up.
    pub async fn wait_for_event<F>(&self, mut matches: F, timeout: Duration) -> Option<PushedEvent>
    where
        F: FnMut(&PushedEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.events().iter().find(|e| matches(e)) {
                return Some(event.clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Gateway for MockGateway {
    fn relay_rtcp(&self, _handle: u64, video: bool, data: &[u8]) {
        self.rtcp.lock().unwrap().push((video, data.to_vec()));
    }

    fn push_event(
        &self,
        handle: u64,
        transaction: Option<&str>,
        event: Value,
        jsep: Option<Value>,
    ) {
        self.events.lock().unwrap().push(PushedEvent {
            handle,
            transaction: transaction.map(str::to_string),
            event,
            jsep,
        });
    }

    fn events_is_enabled(&self) -> bool {
        true
    }

    fn notify_event(&self, _handle: u64, info: Value) {
        self.notifications.lock().unwrap().push(info);
    }
}

/// Everything the loopback RTMP server observed.
#[derive(Default)]
pub struct RtmpServerLog {
    /// Audio/video messages in arrival order: (type, timestamp, payload).
    pub media: Mutex<Vec<(u8, u32, Vec<u8>)>>,
    /// Command names in arrival order.
    pub commands: Mutex<Vec<String>>,
    /// User-control events (type field), e.g. a pong.
    pub user_control: Mutex<Vec<u16>>,
}

impl RtmpServerLog {
    pub fn media(&self) -> Vec<(u8, u32, Vec<u8>)> {
        self.media.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub async fn wait_for_media(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.media.lock().unwrap().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    pub async fn wait_for_command(&self, name: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.commands().iter().any(|c| c == name) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

/// Minimal RTMP server good enough to accept one publish: handshake,
/// connect/createStream/publish acknowledgment, then media recording.
/// Sends one ping right after the publish starts.
pub async fn spawn_rtmp_server() -> (SocketAddr, Arc<RtmpServerLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let log = Arc::new(RtmpServerLog::default());
    let server_log = log.clone();

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        // Handshake: C0+C1 in, S0+S1+S2 out, C2 in.
        let mut c0c1 = [0u8; 1537];
        if socket.read_exact(&mut c0c1).await.is_err() {
            return;
        }
        let mut response = Vec::with_capacity(1 + 1536 * 2);
        response.push(3);
        response.extend_from_slice(&[7u8; 1536]); // S1
        response.extend_from_slice(&c0c1[1..]); // S2 echoes C1
        if socket.write_all(&response).await.is_err() {
            return;
        }
        let mut c2 = [0u8; 1536];
        if socket.read_exact(&mut c2).await.is_err() {
            return;
        }

        let mut reader = ChunkReader::new();
        let writer = ChunkWriter::new(128);
        let mut buf = [0u8; 8192];
        loop {
            let Ok(n) = socket.read(&mut buf).await else {
                return;
            };
            if n == 0 {
                return;
            }
            let Ok(messages) = reader.push(&buf[..n]) else {
                return;
            };
            for message in messages {
                match message.type_id {
                    // Chunk-size changes are applied inside ChunkReader.
                    message_type::SET_CHUNK_SIZE => {}
                    message_type::USER_CONTROL => {
                        if message.payload.len() >= 2 {
                            let event =
                                ((message.payload[0] as u16) << 8) | message.payload[1] as u16;
                            server_log.user_control.lock().unwrap().push(event);
                        }
                    }
                    message_type::AUDIO | message_type::VIDEO => {
                        server_log.media.lock().unwrap().push((
                            message.type_id,
                            message.timestamp,
                            message.payload.to_vec(),
                        ));
                    }
                    message_type::COMMAND_AMF0 => {
                        let Ok(values) = amf::read_all(&message.payload) else {
                            continue;
                        };
                        let name = values
                            .first()
                            .and_then(Amf0Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let transaction =
                            values.get(1).and_then(Amf0Value::as_number).unwrap_or(0.0);
                        server_log.commands.lock().unwrap().push(name.clone());
                        match name.as_str() {
                            "connect" => {
                                let result = command_message(
                                    &writer,
                                    vec![
                                        Amf0Value::String("_result".into()),
                                        Amf0Value::Number(transaction),
                                        Amf0Value::Object(vec![(
                                            "fmsVer".into(),
                                            Amf0Value::String("FMS/3,5,7,7009".into()),
                                        )]),
                                        Amf0Value::Object(vec![
                                            (
                                                "level".into(),
                                                Amf0Value::String("status".into()),
                                            ),
                                            (
                                                "code".into(),
                                                Amf0Value::String(
                                                    "NetConnection.Connect.Success".into(),
                                                ),
                                            ),
                                        ]),
                                    ],
                                );
                                if socket.write_all(&result).await.is_err() {
                                    return;
                                }
                            }
                            "createStream" => {
                                let result = command_message(
                                    &writer,
                                    vec![
                                        Amf0Value::String("_result".into()),
                                        Amf0Value::Number(transaction),
                                        Amf0Value::Null,
                                        Amf0Value::Number(1.0),
                                    ],
                                );
                                if socket.write_all(&result).await.is_err() {
                                    return;
                                }
                            }
                            "publish" => {
                                let status = command_message(
                                    &writer,
                                    vec![
                                        Amf0Value::String("onStatus".into()),
                                        Amf0Value::Number(0.0),
                                        Amf0Value::Null,
                                        Amf0Value::Object(vec![
                                            (
                                                "level".into(),
                                                Amf0Value::String("status".into()),
                                            ),
                                            (
                                                "code".into(),
                                                Amf0Value::String(
                                                    "NetStream.Publish.Start".into(),
                                                ),
                                            ),
                                        ]),
                                    ],
                                );
                                if socket.write_all(&status).await.is_err() {
                                    return;
                                }
                                // Probe keep-alive handling.
                                let mut ping = BytesMut::new();
                                writer.write_message(
                                    &mut ping,
                                    2,
                                    &Message {
                                        type_id: message_type::USER_CONTROL,
                                        stream_id: 0,
                                        timestamp: 0,
                                        payload: Bytes::from_static(&[0, 6, 0, 0, 0, 9]),
                                    },
                                );
                                if socket.write_all(&ping).await.is_err() {
                                    return;
                                }
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
        }
    });

    (address, log)
}

fn command_message(writer: &ChunkWriter, values: Vec<Amf0Value>) -> Vec<u8> {
    let mut payload = BytesMut::new();
    for value in &values {
        amf::write_value(&mut payload, value);
    }
    let mut wire = BytesMut::new();
    writer.write_message(
        &mut wire,
        3,
        &Message {
            type_id: message_type::COMMAND_AMF0,
            stream_id: 0,
            timestamp: 0,
            payload: payload.freeze(),
        },
    );
    wire.to_vec()
}
