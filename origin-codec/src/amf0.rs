//! AMF0 value model and its single serializer/deserializer.
//!
//! The dynamic object model is a tagged union with typed accessors; object
//! properties keep their wire order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_EOF: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0a;
const MARKER_LONG_STRING: u8 = 0x0c;

#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    EcmaArray(Vec<(String, Amf0Value)>),
    StrictArray(Vec<Amf0Value>),
    Null,
    Undefined,
}

impl Amf0Value {
    pub fn object() -> Amf0Value {
        Amf0Value::Object(Vec::new())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Amf0Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(v) => Some(v),
            _ => None,
        }
    }

    /// Property lookup on objects and ECMA arrays.
    pub fn get(&self, key: &str) -> Option<&Amf0Value> {
        match self {
            Amf0Value::Object(props) | Amf0Value::EcmaArray(props) => {
                props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    /// Sets a property on an object or ECMA array, replacing an existing one.
    pub fn set(&mut self, key: &str, value: Amf0Value) {
        if let Amf0Value::Object(props) | Amf0Value::EcmaArray(props) = self {
            if let Some(p) = props.iter_mut().find(|(k, _)| k == key) {
                p.1 = value;
            } else {
                props.push((key.to_string(), value));
            }
        }
    }

    /// Decodes one value from the front of `buf`.
    pub fn read(buf: &mut Bytes) -> Result<Amf0Value> {
        if buf.remaining() < 1 {
            return Err(Error::ErrBufferShort);
        }
        let marker = buf.get_u8();
        match marker {
            MARKER_NUMBER => {
                if buf.remaining() < 8 {
                    return Err(Error::ErrBufferShort);
                }
                Ok(Amf0Value::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                if buf.remaining() < 1 {
                    return Err(Error::ErrBufferShort);
                }
                Ok(Amf0Value::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(Amf0Value::String(read_utf8(buf)?)),
            MARKER_LONG_STRING => {
                if buf.remaining() < 4 {
                    return Err(Error::ErrBufferShort);
                }
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return Err(Error::ErrBufferShort);
                }
                let s = String::from_utf8(buf.split_to(len).to_vec())?;
                Ok(Amf0Value::String(s))
            }
            MARKER_OBJECT => Ok(Amf0Value::Object(read_properties(buf)?)),
            MARKER_ECMA_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(Error::ErrBufferShort);
                }
                let _count = buf.get_u32();
                Ok(Amf0Value::EcmaArray(read_properties(buf)?))
            }
            MARKER_STRICT_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(Error::ErrBufferShort);
                }
                let count = buf.get_u32() as usize;
                let mut items = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    items.push(Amf0Value::read(buf)?);
                }
                Ok(Amf0Value::StrictArray(items))
            }
            MARKER_NULL => Ok(Amf0Value::Null),
            MARKER_UNDEFINED => Ok(Amf0Value::Undefined),
            other => Err(Error::ErrAmf0Marker(other)),
        }
    }

    /// Encodes this value to the back of `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            Amf0Value::Number(v) => {
                buf.put_u8(MARKER_NUMBER);
                buf.put_f64(*v);
            }
            Amf0Value::Boolean(v) => {
                buf.put_u8(MARKER_BOOLEAN);
                buf.put_u8(u8::from(*v));
            }
            Amf0Value::String(v) => {
                if v.len() > u16::MAX as usize {
                    buf.put_u8(MARKER_LONG_STRING);
                    buf.put_u32(v.len() as u32);
                    buf.put_slice(v.as_bytes());
                } else {
                    buf.put_u8(MARKER_STRING);
                    write_utf8(buf, v);
                }
            }
            Amf0Value::Object(props) => {
                buf.put_u8(MARKER_OBJECT);
                write_properties(buf, props);
            }
            Amf0Value::EcmaArray(props) => {
                buf.put_u8(MARKER_ECMA_ARRAY);
                buf.put_u32(props.len() as u32);
                write_properties(buf, props);
            }
            Amf0Value::StrictArray(items) => {
                buf.put_u8(MARKER_STRICT_ARRAY);
                buf.put_u32(items.len() as u32);
                for item in items {
                    item.write(buf);
                }
            }
            Amf0Value::Null => buf.put_u8(MARKER_NULL),
            Amf0Value::Undefined => buf.put_u8(MARKER_UNDEFINED),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write(&mut buf);
        buf.freeze()
    }
}

fn read_utf8(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(Error::ErrBufferShort);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(Error::ErrBufferShort);
    }
    Ok(String::from_utf8(buf.split_to(len).to_vec())?)
}

fn write_utf8(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn read_properties(buf: &mut Bytes) -> Result<Vec<(String, Amf0Value)>> {
    let mut props = Vec::new();
    loop {
        let name = read_utf8(buf)?;
        if name.is_empty() {
            if buf.remaining() < 1 {
                return Err(Error::ErrAmf0ObjectEof);
            }
            let marker = buf.get_u8();
            if marker != MARKER_OBJECT_EOF {
                return Err(Error::ErrAmf0ObjectEof);
            }
            return Ok(props);
        }
        let value = Amf0Value::read(buf)?;
        props.push((name, value));
    }
}

fn write_properties(buf: &mut BytesMut, props: &[(String, Amf0Value)]) {
    for (name, value) in props {
        write_utf8(buf, name);
        value.write(buf);
    }
    buf.put_u16(0);
    buf.put_u8(MARKER_OBJECT_EOF);
}

/// Decodes every value until the buffer is exhausted; the shape of RTMP
/// command payloads.
pub fn read_all(buf: &mut Bytes) -> Result<Vec<Amf0Value>> {
    let mut values = Vec::new();
    while buf.has_remaining() {
        values.push(Amf0Value::read(buf)?);
    }
    Ok(values)
}
