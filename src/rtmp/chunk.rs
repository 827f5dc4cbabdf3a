use std::collections::HashMap;

use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Chunk size both peers start from until a Set Chunk Size arrives.
pub const DEFAULT_CHUNK_SIZE: usize = 128;

pub mod message_type {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACKNOWLEDGEMENT: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const DATA_AMF0: u8 = 18;
    pub const COMMAND_AMF0: u8 = 20;
}

/// One reassembled RTMP message.
#[derive(Debug, Clone)]
pub struct Message {
    pub type_id: u8,
    pub stream_id: u32,
    pub timestamp: u32,
    pub payload: Bytes,
}

/// Serializes messages into chunks: a type-0 header for the first chunk,
/// type-3 continuations for the rest.
pub struct ChunkWriter {
    chunk_size: usize,
}

impl ChunkWriter {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    pub fn write_message(&self, out: &mut BytesMut, csid: u8, message: &Message) {
        debug_assert!(csid >= 2 && csid <= 63);
        let extended = message.timestamp >= 0xFFFFFF;
        let header_ts = if extended { 0xFFFFFF } else { message.timestamp };

        out.put_u8(csid & 0x3F); // fmt 0
        out.put_u8((header_ts >> 16) as u8);
        out.put_u8((header_ts >> 8) as u8);
        out.put_u8(header_ts as u8);
        out.put_u8((message.payload.len() >> 16) as u8);
        out.put_u8((message.payload.len() >> 8) as u8);
        out.put_u8(message.payload.len() as u8);
        out.put_u8(message.type_id);
        out.put_u32_le(message.stream_id);
        if extended {
            out.put_u32(message.timestamp);
        }

        let mut offset = 0;
        loop {
            let take = (message.payload.len() - offset).min(self.chunk_size);
            out.extend_from_slice(&message.payload[offset..offset + take]);
            offset += take;
            if offset >= message.payload.len() {
                break;
            }
            out.put_u8(0xC0 | (csid & 0x3F)); // fmt 3 continuation
            if extended {
                out.put_u32(message.timestamp);
            }
        }
    }
}

#[derive(Default)]
struct ChunkStreamState {
    timestamp: u32,
    timestamp_delta: u32,
    length: usize,
    type_id: u8,
    stream_id: u32,
    extended: bool,
    partial: BytesMut,
}

/// Incremental chunk parser. Feed it raw bytes as they arrive; complete
/// messages come out once all their chunks landed.
pub struct ChunkReader {
    chunk_size: usize,
    buffer: BytesMut,
    streams: HashMap<u32, ChunkStreamState>,
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkReader {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer: BytesMut::new(),
            streams: HashMap::new(),
        }
    }

    /// Honor an inbound Set Chunk Size for everything parsed afterwards.
    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.max(1);
    }

    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();
        while let Some(message) = self.try_parse_chunk()? {
            if let Some(message) = message {
                // A chunk-size change applies to every following chunk,
                // which may sit in the same read buffer.
                if message.type_id == message_type::SET_CHUNK_SIZE && message.payload.len() >= 4 {
                    let size = u32::from_be_bytes([
                        message.payload[0],
                        message.payload[1],
                        message.payload[2],
                        message.payload[3],
                    ]);
                    self.set_chunk_size(size as usize);
                }
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Parse one chunk if fully buffered. Outer `None` means "need more
    /// bytes"; inner `None` means the chunk did not complete a message.
    #[allow(clippy::option_option)]
    fn try_parse_chunk(&mut self) -> Result<Option<Option<Message>>> {
        let buf = &self.buffer[..];
        if buf.is_empty() {
            return Ok(None);
        }
        let fmt = buf[0] >> 6;
        let (csid, mut offset) = match buf[0] & 0x3F {
            0 => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                (64 + buf[1] as u32, 2)
            }
            1 => {
                if buf.len() < 3 {
                    return Ok(None);
                }
                (64 + buf[1] as u32 + (buf[2] as u32) * 256, 3)
            }
            id => (id as u32, 1),
        };

        let header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if buf.len() < offset + header_len {
            return Ok(None);
        }

        let state = self.streams.entry(csid).or_default();
        match fmt {
            0 => {
                state.timestamp = read_u24(&buf[offset..]);
                state.length =
                    read_u24(&buf[offset + 3..]) as usize;
                state.type_id = buf[offset + 6];
                state.stream_id = u32::from_le_bytes([
                    buf[offset + 7],
                    buf[offset + 8],
                    buf[offset + 9],
                    buf[offset + 10],
                ]);
                state.timestamp_delta = 0;
                state.extended = state.timestamp == 0xFFFFFF;
            }
            1 => {
                state.timestamp_delta = read_u24(&buf[offset..]);
                state.length = read_u24(&buf[offset + 3..]) as usize;
                state.type_id = buf[offset + 6];
                state.extended = state.timestamp_delta == 0xFFFFFF;
            }
            2 => {
                state.timestamp_delta = read_u24(&buf[offset..]);
                state.extended = state.timestamp_delta == 0xFFFFFF;
            }
            _ => {}
        }
        offset += header_len;

        let mut extended_value = 0;
        if state.extended {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            extended_value = u32::from_be_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]);
            offset += 4;
        }

        if state.length > 16 * 1024 * 1024 {
            return Err(anyhow!("unreasonable RTMP message length {}", state.length));
        }

        let remaining = state.length.saturating_sub(state.partial.len());
        let take = remaining.min(self.chunk_size);
        if buf.len() < offset + take {
            return Ok(None);
        }

        // Everything needed is buffered; now commit.
        match fmt {
            0 => {
                if state.extended {
                    state.timestamp = extended_value;
                }
            }
            1 | 2 => {
                if state.partial.is_empty() {
                    let delta = if state.extended {
                        extended_value
                    } else {
                        state.timestamp_delta
                    };
                    state.timestamp = state.timestamp.wrapping_add(delta);
                }
            }
            _ => {}
        }
        state
            .partial
            .extend_from_slice(&buf[offset..offset + take]);
        let consumed = offset + take;
        let _ = self.buffer.split_to(consumed);

        if state.partial.len() >= state.length {
            let payload = std::mem::take(&mut state.partial).freeze();
            return Ok(Some(Some(Message {
                type_id: state.type_id,
                stream_id: state.stream_id,
                timestamp: state.timestamp,
                payload,
            })));
        }
        Ok(Some(None))
    }
}

fn read_u24(data: &[u8]) -> u32 {
    ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(payload_len: usize, chunk_size: usize) {
        let message = Message {
            type_id: message_type::VIDEO,
            stream_id: 1,
            timestamp: 1234,
            payload: Bytes::from(vec![0x5A; payload_len]),
        };
        let writer = ChunkWriter::new(chunk_size);
        let mut wire = BytesMut::new();
        writer.write_message(&mut wire, 4, &message);

        let mut reader = ChunkReader::new();
        reader.set_chunk_size(chunk_size);
        let messages = reader.push(&wire).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].type_id, message.type_id);
        assert_eq!(messages[0].stream_id, 1);
        assert_eq!(messages[0].timestamp, 1234);
        assert_eq!(messages[0].payload, message.payload);
    }

    #[test]
    fn single_chunk_message() {
        round_trip(100, 128);
    }

    #[test]
    fn multi_chunk_message() {
        round_trip(1000, 128);
        round_trip(4096 * 3 + 17, 4096);
    }

    #[test]
    fn parses_across_partial_reads() {
        let message = Message {
            type_id: message_type::AUDIO,
            stream_id: 1,
            timestamp: 42,
            payload: Bytes::from(vec![7u8; 300]),
        };
        let writer = ChunkWriter::new(128);
        let mut wire = BytesMut::new();
        writer.write_message(&mut wire, 6, &message);

        let mut reader = ChunkReader::new();
        let mut collected = Vec::new();
        for piece in wire.chunks(13) {
            collected.extend(reader.push(piece).unwrap());
        }
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].payload.len(), 300);
    }

    #[test]
    fn extended_timestamp_round_trip() {
        let message = Message {
            type_id: message_type::VIDEO,
            stream_id: 1,
            timestamp: 0x0100_0000,
            payload: Bytes::from(vec![1u8; 10]),
        };
        let writer = ChunkWriter::new(128);
        let mut wire = BytesMut::new();
        writer.write_message(&mut wire, 4, &message);
        let mut reader = ChunkReader::new();
        let messages = reader.push(&wire).unwrap();
        assert_eq!(messages[0].timestamp, 0x0100_0000);
    }

    #[test]
    fn delta_headers_accumulate_timestamps() {
        // fmt0 then fmt1 continuation on the same chunk stream.
        let mut wire = BytesMut::new();
        let writer = ChunkWriter::new(128);
        writer.write_message(
            &mut wire,
            4,
            &Message {
                type_id: message_type::VIDEO,
                stream_id: 1,
                timestamp: 100,
                payload: Bytes::from(vec![1u8; 4]),
            },
        );
        // Hand-build a fmt1 chunk: delta 33, same length/type.
        wire.put_u8(0x44);
        wire.put_u8(0);
        wire.put_u8(0);
        wire.put_u8(33);
        wire.put_u8(0);
        wire.put_u8(0);
        wire.put_u8(4);
        wire.put_u8(message_type::VIDEO);
        wire.extend_from_slice(&[2u8; 4]);

        let mut reader = ChunkReader::new();
        let messages = reader.push(&wire).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].timestamp, 133);
    }
}
