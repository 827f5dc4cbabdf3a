use anyhow::{anyhow, Result};
use bytes::{BufMut, BytesMut};

/// The subset of AMF0 needed to drive an RTMP publish: command names,
/// transaction ids, command objects and the occasional null placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    Null,
    Undefined,
    EcmaArray(Vec<(String, Amf0Value)>),
}

mod marker {
    pub const NUMBER: u8 = 0x00;
    pub const BOOLEAN: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const OBJECT: u8 = 0x03;
    pub const NULL: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const ECMA_ARRAY: u8 = 0x08;
    pub const OBJECT_END: u8 = 0x09;
    pub const LONG_STRING: u8 = 0x0C;
}

impl Amf0Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Look up a property on an object or ECMA array.
    pub fn property(&self, key: &str) -> Option<&Amf0Value> {
        match self {
            Amf0Value::Object(props) | Amf0Value::EcmaArray(props) => props
                .iter()
                .find_map(|(k, v)| (k == key).then_some(v)),
            _ => None,
        }
    }
}

pub fn write_value(out: &mut BytesMut, value: &Amf0Value) {
    match value {
        Amf0Value::Number(n) => {
            out.put_u8(marker::NUMBER);
            out.put_f64(*n);
        }
        Amf0Value::Boolean(b) => {
            out.put_u8(marker::BOOLEAN);
            out.put_u8(*b as u8);
        }
        Amf0Value::String(s) => {
            out.put_u8(marker::STRING);
            out.put_u16(s.len() as u16);
            out.extend_from_slice(s.as_bytes());
        }
        Amf0Value::Object(props) => {
            out.put_u8(marker::OBJECT);
            write_properties(out, props);
        }
        Amf0Value::Null => out.put_u8(marker::NULL),
        Amf0Value::Undefined => out.put_u8(marker::UNDEFINED),
        Amf0Value::EcmaArray(props) => {
            out.put_u8(marker::ECMA_ARRAY);
            out.put_u32(props.len() as u32);
            write_properties(out, props);
        }
    }
}

fn write_properties(out: &mut BytesMut, props: &[(String, Amf0Value)]) {
    for (key, value) in props {
        out.put_u16(key.len() as u16);
        out.extend_from_slice(key.as_bytes());
        write_value(out, value);
    }
    out.put_u16(0);
    out.put_u8(marker::OBJECT_END);
}

/// Decode every value in a command message body.
pub fn read_all(mut data: &[u8]) -> Result<Vec<Amf0Value>> {
    let mut values = Vec::new();
    while !data.is_empty() {
        values.push(read_value(&mut data)?);
    }
    Ok(values)
}

fn read_value(data: &mut &[u8]) -> Result<Amf0Value> {
    let m = take(data, 1)?[0];
    match m {
        marker::NUMBER => {
            let raw = take(data, 8)?;
            let mut bits = [0u8; 8];
            bits.copy_from_slice(raw);
            Ok(Amf0Value::Number(f64::from_be_bytes(bits)))
        }
        marker::BOOLEAN => Ok(Amf0Value::Boolean(take(data, 1)?[0] != 0)),
        marker::STRING => {
            let len = read_u16(data)? as usize;
            let raw = take(data, len)?;
            Ok(Amf0Value::String(String::from_utf8_lossy(raw).into_owned()))
        }
        marker::LONG_STRING => {
            let len = read_u32(data)? as usize;
            let raw = take(data, len)?;
            Ok(Amf0Value::String(String::from_utf8_lossy(raw).into_owned()))
        }
        marker::OBJECT => Ok(Amf0Value::Object(read_properties(data)?)),
        marker::ECMA_ARRAY => {
            let _count = read_u32(data)?;
            Ok(Amf0Value::EcmaArray(read_properties(data)?))
        }
        marker::NULL => Ok(Amf0Value::Null),
        marker::UNDEFINED => Ok(Amf0Value::Undefined),
        other => Err(anyhow!("unsupported AMF0 marker 0x{:02x}", other)),
    }
}

fn read_properties(data: &mut &[u8]) -> Result<Vec<(String, Amf0Value)>> {
    let mut props = Vec::new();
    loop {
        let len = read_u16(data)? as usize;
        if len == 0 {
            let end = take(data, 1)?[0];
            if end != marker::OBJECT_END {
                return Err(anyhow!("missing AMF0 object end marker"));
            }
            return Ok(props);
        }
        let key = String::from_utf8_lossy(take(data, len)?).into_owned();
        let value = read_value(data)?;
        props.push((key, value));
    }
}

fn take<'a>(data: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if data.len() < len {
        return Err(anyhow!("truncated AMF0 data"));
    }
    let (head, tail) = data.split_at(len);
    *data = tail;
    Ok(head)
}

fn read_u16(data: &mut &[u8]) -> Result<u16> {
    let raw = take(data, 2)?;
    Ok(((raw[0] as u16) << 8) | raw[1] as u16)
}

fn read_u32(data: &mut &[u8]) -> Result<u32> {
    let raw = take(data, 4)?;
    Ok(((raw[0] as u32) << 24) | ((raw[1] as u32) << 16) | ((raw[2] as u32) << 8) | raw[3] as u32)
}
