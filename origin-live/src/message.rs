//! The universal message unit flowing through the hub.

use bytes::Bytes;
use codec::flv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Audio,
    Video,
    Amf0Data,
    Amf0Command,
    Aggregate,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    /// Decode timestamp, milliseconds.
    pub timestamp: i64,
    pub stream_id: u32,
}

/// An immutable message: the payload buffer is shared by refcount, so a
/// clone into every consumer queue costs a pointer, not a copy.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedMessage {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl SharedMessage {
    pub fn new(msg_type: MessageType, timestamp: i64, stream_id: u32, payload: Bytes) -> Self {
        Self {
            header: MessageHeader {
                msg_type,
                timestamp,
                stream_id,
            },
            payload,
        }
    }

    pub fn audio(timestamp: i64, payload: Bytes) -> Self {
        Self::new(MessageType::Audio, timestamp, 0, payload)
    }

    pub fn video(timestamp: i64, payload: Bytes) -> Self {
        Self::new(MessageType::Video, timestamp, 0, payload)
    }

    pub fn amf0_data(payload: Bytes) -> Self {
        Self::new(MessageType::Amf0Data, 0, 0, payload)
    }

    pub fn is_audio(&self) -> bool {
        self.header.msg_type == MessageType::Audio
    }

    pub fn is_video(&self) -> bool {
        self.header.msg_type == MessageType::Video
    }

    pub fn is_av(&self) -> bool {
        self.is_audio() || self.is_video()
    }

    pub fn is_video_keyframe(&self) -> bool {
        self.is_video() && flv::video::is_keyframe(&self.payload)
    }

    pub fn is_video_sequence_header(&self) -> bool {
        self.is_video() && flv::video::is_sequence_header(&self.payload)
    }

    pub fn is_audio_sequence_header(&self) -> bool {
        self.is_audio() && flv::audio::is_sequence_header(&self.payload)
    }

    /// FLV tag type for the remux paths.
    pub fn flv_tag_type(&self) -> u8 {
        match self.header.msg_type {
            MessageType::Audio => flv::TAG_TYPE_AUDIO,
            MessageType::Video => flv::TAG_TYPE_VIDEO,
            _ => flv::TAG_TYPE_SCRIPT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_shared_not_copied() {
        let payload = Bytes::from(vec![0u8; 4096]);
        let msg = SharedMessage::video(40, payload.clone());
        let copy = msg.clone();
        // Same backing buffer.
        assert_eq!(copy.payload.as_ptr(), msg.payload.as_ptr());
    }

    #[test]
    fn test_sniffers() {
        let sh = SharedMessage::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0]));
        assert!(sh.is_video_sequence_header());
        assert!(sh.is_video_keyframe());
        let key = SharedMessage::video(0, Bytes::from_static(&[0x17, 0x01, 0, 0, 0]));
        assert!(key.is_video_keyframe());
        assert!(!key.is_video_sequence_header());
        let ash = SharedMessage::audio(0, Bytes::from_static(&[0xaf, 0x00]));
        assert!(ash.is_audio_sequence_header());
        assert!(ash.is_av());
    }
}
