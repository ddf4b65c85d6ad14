//! Typed AMF0 command packets over the chunk layer.

use bytes::{Bytes, BytesMut};
use codec::amf0::{self, Amf0Value};
use shared::error::{Error, Result};

use crate::chunk::{message_type, RtmpMessage};

/// A decoded AMF0 command: name, transaction id, then its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub args: Vec<Amf0Value>,
}

impl Command {
    pub fn decode(payload: &Bytes) -> Result<Command> {
        let mut buf = payload.clone();
        let values = amf0::read_all(&mut buf)?;
        let mut iter = values.into_iter();
        let name = match iter.next() {
            Some(Amf0Value::String(s)) => s,
            _ => return Err(Error::ErrRtmpCommand("missing name".to_string())),
        };
        let transaction_id = match iter.next() {
            Some(Amf0Value::Number(n)) => n,
            // Data messages (e.g. onMetaData) carry no transaction id.
            Some(other) => {
                let args: Vec<Amf0Value> = std::iter::once(other).chain(iter).collect();
                return Ok(Command {
                    name,
                    transaction_id: 0.0,
                    args,
                });
            }
            None => 0.0,
        };
        Ok(Command {
            name,
            transaction_id,
            args: iter.collect(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        Amf0Value::String(self.name.clone()).write(&mut buf);
        Amf0Value::Number(self.transaction_id).write(&mut buf);
        for arg in &self.args {
            arg.write(&mut buf);
        }
        buf.freeze()
    }

    pub fn into_message(self, stream_id: u32) -> RtmpMessage {
        RtmpMessage::new(message_type::AMF0_COMMAND, 0, stream_id, self.encode())
    }
}

/// `_result` for connect, with the server properties object.
pub fn connect_result(transaction_id: f64) -> Command {
    let mut props = Amf0Value::object();
    props.set("fmsVer", Amf0Value::String("FMS/3,5,3,888".to_string()));
    props.set("capabilities", Amf0Value::Number(127.0));
    props.set("mode", Amf0Value::Number(1.0));
    let mut info = Amf0Value::object();
    info.set("level", Amf0Value::String("status".to_string()));
    info.set("code", Amf0Value::String("NetConnection.Connect.Success".to_string()));
    info.set(
        "description",
        Amf0Value::String("Connection succeeded".to_string()),
    );
    info.set("objectEncoding", Amf0Value::Number(0.0));
    Command {
        name: "_result".to_string(),
        transaction_id,
        args: vec![props, info],
    }
}

/// `_result` for createStream with the allocated stream id.
pub fn create_stream_result(transaction_id: f64, stream_id: u32) -> Command {
    Command {
        name: "_result".to_string(),
        transaction_id,
        args: vec![Amf0Value::Null, Amf0Value::Number(stream_id as f64)],
    }
}

/// `onStatus` events for publish/play lifecycles.
pub fn on_status(code: &str, description: &str) -> Command {
    let mut info = Amf0Value::object();
    info.set("level", Amf0Value::String("status".to_string()));
    info.set("code", Amf0Value::String(code.to_string()));
    info.set("description", Amf0Value::String(description.to_string()));
    info.set("clientid", Amf0Value::String("ASAICiss".to_string()));
    Command {
        name: "onStatus".to_string(),
        transaction_id: 0.0,
        args: vec![Amf0Value::Null, info],
    }
}

/// Protocol-control message builders.
pub fn set_chunk_size(size: u32) -> RtmpMessage {
    RtmpMessage::new(
        message_type::SET_CHUNK_SIZE,
        0,
        0,
        Bytes::copy_from_slice(&size.to_be_bytes()),
    )
}

pub fn window_ack_size(size: u32) -> RtmpMessage {
    RtmpMessage::new(
        message_type::WINDOW_ACK_SIZE,
        0,
        0,
        Bytes::copy_from_slice(&size.to_be_bytes()),
    )
}

pub fn set_peer_bandwidth(size: u32, limit_type: u8) -> RtmpMessage {
    let mut b = size.to_be_bytes().to_vec();
    b.push(limit_type);
    RtmpMessage::new(message_type::SET_PEER_BANDWIDTH, 0, 0, Bytes::from(b))
}

pub fn ack(sequence: u32) -> RtmpMessage {
    RtmpMessage::new(
        message_type::ACK,
        0,
        0,
        Bytes::copy_from_slice(&sequence.to_be_bytes()),
    )
}

/// UserControl StreamBegin(0).
pub fn stream_begin(stream_id: u32) -> RtmpMessage {
    let mut b = vec![0u8, 0];
    b.extend_from_slice(&stream_id.to_be_bytes());
    RtmpMessage::new(message_type::USER_CONTROL, 0, 0, Bytes::from(b))
}

pub mod status {
    pub const PUBLISH_START: &str = "NetStream.Publish.Start";
    pub const UNPUBLISH_SUCCESS: &str = "NetStream.Unpublish.Success";
    pub const PLAY_START: &str = "NetStream.Play.Start";
    pub const PLAY_RESET: &str = "NetStream.Play.Reset";
    pub const PLAY_STOP: &str = "NetStream.Play.Stop";
}
