use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::flv::{FlvTag, TAG_AUDIO, TAG_VIDEO};

pub mod amf;
pub mod chunk;
pub mod handshake;

use amf::Amf0Value;
use chunk::{message_type, ChunkReader, ChunkWriter, Message};

/// Chunk stream ids, fixed per media kind.
const CSID_CONTROL: u8 = 2;
const CSID_COMMAND: u8 = 3;
const CSID_VIDEO: u8 = 4;
const CSID_AUDIO: u8 = 6;

/// Parsed `rtmp://<host>[:<port>]/<app>/<stream>` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpTarget {
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream: String,
}

impl RtmpTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).context("invalid RTMP url")?;
        if url.scheme() != "rtmp" {
            bail!("not an rtmp:// url: {}", raw);
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("rtmp url without host: {}", raw))?
            .to_string();
        let port = url.port().unwrap_or(1935);
        let mut segments: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        if segments.len() < 2 {
            bail!("rtmp url must name an app and a stream: {}", raw);
        }
        let stream = segments.pop().unwrap_or_default().to_string();
        let app = segments.join("/");
        Ok(Self {
            host,
            port,
            app,
            stream,
        })
    }

    pub fn tc_url(&self) -> String {
        format!("rtmp://{}:{}/{}", self.host, self.port, self.app)
    }
}

/// Timeouts and chunking knobs, lifted from the plugin configuration.
#[derive(Debug, Clone, Copy)]
pub struct PublisherOptions {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub chunk_size: u32,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(2),
            chunk_size: 4096,
        }
    }
}

/// RTMP publishing client over one TCP connection.
///
/// `connect` runs the handshake and the `connect`/`releaseStream`/
/// `FCPublish`/`createStream`/`publish` sequence; afterwards `feed` wraps
/// FLV tag bodies into chunks. All socket writes are bounded by the send
/// timeout: a slow peer surfaces as a backpressure error, never as a stall
/// or a silent drop.
pub struct RtmpPublisher {
    stream: TcpStream,
    target: RtmpTarget,
    reader: ChunkReader,
    writer: ChunkWriter,
    send_timeout: Duration,
    message_stream_id: u32,
    next_transaction: u32,
    window_ack_size: u32,
    bytes_received: u64,
    last_ack_sent: u64,
}

impl RtmpPublisher {
    pub async fn connect(target: RtmpTarget, options: PublisherOptions) -> Result<Self> {
        let address = format!("{}:{}", target.host, target.port);
        info!(
            "rtmp publish to {} (app {}, stream {})",
            address, target.app, target.stream
        );
        let mut stream = tokio::time::timeout(
            options.connect_timeout,
            TcpStream::connect(address.as_str()),
        )
        .await
        .map_err(|_| anyhow!("rtmp connect to {} timed out", address))?
        .with_context(|| format!("rtmp connect to {}", address))?;
        stream.set_nodelay(true).ok();

        handshake::client_handshake(&mut stream, options.connect_timeout).await?;

        let mut publisher = Self {
            stream,
            target,
            reader: ChunkReader::new(),
            writer: ChunkWriter::new(options.chunk_size as usize),
            send_timeout: options.send_timeout,
            message_stream_id: 0,
            next_transaction: 1,
            window_ack_size: 0,
            bytes_received: 0,
            last_ack_sent: 0,
        };

        publisher.announce_chunk_size(options.chunk_size).await?;
        publisher
            .publish_sequence(options.connect_timeout)
            .await?;
        Ok(publisher)
    }

    async fn publish_sequence(&mut self, timeout: Duration) -> Result<()> {
        let connect_txn = self.take_transaction();
        let command_object = Amf0Value::Object(vec![
            ("app".into(), Amf0Value::String(self.target.app.clone())),
            ("type".into(), Amf0Value::String("nonprivate".into())),
            (
                "flashVer".into(),
                Amf0Value::String("FMLE/3.0 (compatible; pushstream)".into()),
            ),
            ("tcUrl".into(), Amf0Value::String(self.target.tc_url())),
        ]);
        self.send_command(
            "connect",
            connect_txn,
            vec![command_object],
            0,
        )
        .await?;
        self.await_result(connect_txn, timeout)
            .await
            .context("rtmp connect refused")?;
        debug!("rtmp connect accepted");

        let release_txn = self.take_transaction();
        self.send_command(
            "releaseStream",
            release_txn,
            vec![Amf0Value::Null, Amf0Value::String(self.target.stream.clone())],
            0,
        )
        .await?;
        let fcpublish_txn = self.take_transaction();
        self.send_command(
            "FCPublish",
            fcpublish_txn,
            vec![Amf0Value::Null, Amf0Value::String(self.target.stream.clone())],
            0,
        )
        .await?;

        let create_txn = self.take_transaction();
        self.send_command("createStream", create_txn, vec![Amf0Value::Null], 0)
            .await?;
        let result = self
            .await_result(create_txn, timeout)
            .await
            .context("rtmp createStream refused")?;
        self.message_stream_id = result
            .get(3)
            .and_then(Amf0Value::as_number)
            .map(|id| id as u32)
            .unwrap_or(1);
        debug!("rtmp stream id {}", self.message_stream_id);

        self.send_command(
            "publish",
            0,
            vec![
                Amf0Value::Null,
                Amf0Value::String(self.target.stream.clone()),
                Amf0Value::String("live".into()),
            ],
            self.message_stream_id,
        )
        .await?;
        self.await_publish_start(timeout).await?;
        info!("rtmp publishing started");
        Ok(())
    }

    /// Push one FLV tag. A blocked socket past the send timeout is a
    /// backpressure error and fatal to the publish.
    pub async fn feed(&mut self, tag: &FlvTag) -> Result<()> {
        self.drain_inbound().await?;

        let csid = match tag.tag_type {
            TAG_VIDEO => CSID_VIDEO,
            TAG_AUDIO => CSID_AUDIO,
            _ => CSID_COMMAND,
        };
        let message = Message {
            type_id: tag.tag_type,
            stream_id: self.message_stream_id,
            timestamp: tag.timestamp,
            payload: tag.data.clone(),
        };
        let mut wire = BytesMut::new();
        self.writer.write_message(&mut wire, csid, &message);
        self.send_bytes(wire.freeze()).await
    }

    /// Best-effort orderly shutdown: FCUnpublish and deleteStream, then
    /// close the socket.
    pub async fn close(&mut self) {
        let unpublish_txn = self.take_transaction();
        let _ = self
            .send_command(
                "FCUnpublish",
                unpublish_txn,
                vec![Amf0Value::Null, Amf0Value::String(self.target.stream.clone())],
                self.message_stream_id,
            )
            .await;
        let delete_txn = self.take_transaction();
        let _ = self
            .send_command(
                "deleteStream",
                delete_txn,
                vec![
                    Amf0Value::Null,
                    Amf0Value::Number(self.message_stream_id as f64),
                ],
                0,
            )
            .await;
        let _ = self.stream.shutdown().await;
        info!("rtmp publish closed");
    }

    fn take_transaction(&mut self) -> u32 {
        let txn = self.next_transaction;
        self.next_transaction += 1;
        txn
    }

    async fn announce_chunk_size(&mut self, chunk_size: u32) -> Result<()> {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(chunk_size);
        self.send_control(message_type::SET_CHUNK_SIZE, payload.freeze())
            .await
    }

    async fn send_control(&mut self, type_id: u8, payload: Bytes) -> Result<()> {
        let message = Message {
            type_id,
            stream_id: 0,
            timestamp: 0,
            payload,
        };
        let mut wire = BytesMut::new();
        self.writer.write_message(&mut wire, CSID_CONTROL, &message);
        self.send_bytes(wire.freeze()).await
    }

    async fn send_command(
        &mut self,
        name: &str,
        transaction: u32,
        arguments: Vec<Amf0Value>,
        stream_id: u32,
    ) -> Result<()> {
        trace!("rtmp command {} (txn {})", name, transaction);
        let mut payload = BytesMut::new();
        amf::write_value(&mut payload, &Amf0Value::String(name.into()));
        amf::write_value(&mut payload, &Amf0Value::Number(transaction as f64));
        for argument in &arguments {
            amf::write_value(&mut payload, argument);
        }
        let message = Message {
            type_id: message_type::COMMAND_AMF0,
            stream_id,
            timestamp: 0,
            payload: payload.freeze(),
        };
        let mut wire = BytesMut::new();
        self.writer.write_message(&mut wire, CSID_COMMAND, &message);
        self.send_bytes(wire.freeze()).await
    }

    async fn send_bytes(&mut self, data: Bytes) -> Result<()> {
        tokio::time::timeout(self.send_timeout, self.stream.write_all(&data))
            .await
            .map_err(|_| anyhow!("rtmp send blocked past {:?}, backpressure", self.send_timeout))?
            .context("rtmp send")?;
        Ok(())
    }

    /// Wait for the `_result` matching a transaction, servicing control
    /// messages while it is outstanding.
    async fn await_result(
        &mut self,
        transaction: u32,
        timeout: Duration,
    ) -> Result<Vec<Amf0Value>> {
        self.await_command(timeout, |values| {
            let name = values.first().and_then(Amf0Value::as_str);
            let txn = values.get(1).and_then(Amf0Value::as_number);
            match name {
                Some("_result") if txn == Some(transaction as f64) => Some(Ok(())),
                Some("_error") => Some(Err(command_error(values))),
                _ => None,
            }
        })
        .await
    }

    async fn await_publish_start(&mut self, timeout: Duration) -> Result<()> {
        self.await_command(timeout, |values| {
            let name = values.first().and_then(Amf0Value::as_str);
            match name {
                Some("onStatus") => {
                    let info = values.iter().find(|v| v.property("code").is_some());
                    let code = info
                        .and_then(|v| v.property("code"))
                        .and_then(Amf0Value::as_str)
                        .unwrap_or("");
                    if code == "NetStream.Publish.Start" {
                        Some(Ok(()))
                    } else if code.contains("Error")
                        || code.contains("BadName")
                        || code.contains("Failed")
                    {
                        Some(Err(anyhow!("publish rejected: {}", code)))
                    } else {
                        None
                    }
                }
                Some("_error") => Some(Err(command_error(values))),
                _ => None,
            }
        })
        .await
        .map(|_| ())
    }

    async fn await_command<F>(&mut self, timeout: Duration, mut check: F) -> Result<Vec<Amf0Value>>
    where
        F: FnMut(&[Amf0Value]) -> Option<Result<()>>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = [0u8; 4096];
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| anyhow!("timed out waiting for rtmp response"))?;
            let read = tokio::time::timeout(remaining, self.stream.readable())
                .await
                .map_err(|_| anyhow!("timed out waiting for rtmp response"))?;
            read.context("rtmp socket")?;
            let n = match self.stream.try_read(&mut buf) {
                Ok(0) => bail!("rtmp peer closed the connection"),
                Ok(n) => n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e).context("rtmp read"),
            };
            for message in self.ingest(&buf[..n]).await? {
                if message.type_id == message_type::COMMAND_AMF0 {
                    let values = amf::read_all(&message.payload)?;
                    if let Some(outcome) = check(&values) {
                        outcome?;
                        return Ok(values);
                    }
                    trace!(
                        "rtmp command passed over: {:?}",
                        values.first().and_then(Amf0Value::as_str)
                    );
                }
            }
        }
    }

    /// Opportunistically handle whatever the server pushed at us.
    async fn drain_inbound(&mut self) -> Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.try_read(&mut buf) {
                Ok(0) => bail!("rtmp peer closed the connection"),
                Ok(n) => {
                    for message in self.ingest(&buf[..n]).await? {
                        if message.type_id == message_type::COMMAND_AMF0 {
                            let values = amf::read_all(&message.payload).unwrap_or_default();
                            let name = values.first().and_then(Amf0Value::as_str);
                            if name == Some("_error") {
                                return Err(command_error(&values));
                            }
                            if name == Some("onStatus") {
                                let code = values
                                    .iter()
                                    .find_map(|v| v.property("code"))
                                    .and_then(Amf0Value::as_str)
                                    .unwrap_or("");
                                if code.contains("Error") || code.contains("Failed") {
                                    return Err(anyhow!("rtmp publish failed: {}", code));
                                }
                            }
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e).context("rtmp read"),
            }
        }
    }

    /// Parse inbound bytes, honoring protocol control messages.
    async fn ingest(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        self.bytes_received += data.len() as u64;
        let messages = self.reader.push(data)?;
        let mut out = Vec::with_capacity(messages.len());
        for message in messages {
            match message.type_id {
                message_type::SET_CHUNK_SIZE => {
                    if message.payload.len() >= 4 {
                        let size = u32::from_be_bytes([
                            message.payload[0],
                            message.payload[1],
                            message.payload[2],
                            message.payload[3],
                        ]);
                        debug!("rtmp peer chunk size {}", size);
                        self.reader.set_chunk_size(size as usize);
                    }
                }
                message_type::WINDOW_ACK_SIZE => {
                    if message.payload.len() >= 4 {
                        self.window_ack_size = u32::from_be_bytes([
                            message.payload[0],
                            message.payload[1],
                            message.payload[2],
                            message.payload[3],
                        ]);
                        debug!("rtmp window ack size {}", self.window_ack_size);
                    }
                }
                message_type::SET_PEER_BANDWIDTH => {
                    trace!("rtmp peer bandwidth message honored");
                }
                message_type::USER_CONTROL => {
                    self.handle_user_control(&message.payload).await?;
                }
                message_type::ACKNOWLEDGEMENT | message_type::ABORT => {}
                _ => out.push(message),
            }
        }
        self.maybe_acknowledge().await?;
        Ok(out)
    }

    async fn handle_user_control(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < 2 {
            return Ok(());
        }
        let event = ((payload[0] as u16) << 8) | payload[1] as u16;
        // Ping (6) gets a pong (7) with the same payload.
        if event == 6 {
            trace!("rtmp ping, sending pong");
            let mut pong = BytesMut::with_capacity(payload.len());
            pong.put_u16(7);
            pong.extend_from_slice(&payload[2..]);
            self.send_control(message_type::USER_CONTROL, pong.freeze())
                .await?;
        }
        Ok(())
    }

    async fn maybe_acknowledge(&mut self) -> Result<()> {
        if self.window_ack_size == 0 {
            return Ok(());
        }
        if self.bytes_received - self.last_ack_sent >= self.window_ack_size as u64 {
            self.last_ack_sent = self.bytes_received;
            let mut payload = BytesMut::with_capacity(4);
            payload.put_u32(self.bytes_received as u32);
            self.send_control(message_type::ACKNOWLEDGEMENT, payload.freeze())
                .await?;
        }
        Ok(())
    }
}

fn command_error(values: &[Amf0Value]) -> anyhow::Error {
    let description = values
        .iter()
        .find_map(|v| v.property("description"))
        .and_then(Amf0Value::as_str)
        .or_else(|| {
            values
                .iter()
                .find_map(|v| v.property("code"))
                .and_then(Amf0Value::as_str)
        })
        .unwrap_or("unspecified error");
    warn!("rtmp _error: {}", description);
    anyhow!("rtmp error: {}", description)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rtmp_urls() {
        let target = RtmpTarget::parse("rtmp://media.example.com/live/room1").unwrap();
        assert_eq!(target.host, "media.example.com");
        assert_eq!(target.port, 1935);
        assert_eq!(target.app, "live");
        assert_eq!(target.stream, "room1");
        assert_eq!(target.tc_url(), "rtmp://media.example.com:1935/live");

        let target = RtmpTarget::parse("rtmp://10.0.0.1:19350/app/sub/stream").unwrap();
        assert_eq!(target.port, 19350);
        assert_eq!(target.app, "app/sub");
        assert_eq!(target.stream, "stream");
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(RtmpTarget::parse("http://host/app/stream").is_err());
        assert!(RtmpTarget::parse("rtmp://host/apponly").is_err());
        assert!(RtmpTarget::parse("not a url").is_err());
    }
}
