//! Metadata and sequence-header cache: what every new consumer must see
//! before any normal message.

use crate::message::SharedMessage;

#[derive(Default)]
pub struct MetaCache {
    meta: Option<SharedMessage>,
    video: Option<SharedMessage>,
    audio: Option<SharedMessage>,
    previous_video: Option<SharedMessage>,
    previous_audio: Option<SharedMessage>,
}

impl MetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> Option<&SharedMessage> {
        self.meta.as_ref()
    }

    pub fn vsh(&self) -> Option<&SharedMessage> {
        self.video.as_ref()
    }

    pub fn ash(&self) -> Option<&SharedMessage> {
        self.audio.as_ref()
    }

    pub fn previous_vsh(&self) -> Option<&SharedMessage> {
        self.previous_video.as_ref()
    }

    pub fn previous_ash(&self) -> Option<&SharedMessage> {
        self.previous_audio.as_ref()
    }

    /// A new publisher starts: the current pair becomes previous, and the
    /// current slots clear so stale headers never leak across publishes.
    pub fn update_previous_and_clear(&mut self) {
        if self.video.is_some() {
            self.previous_video = self.video.take();
        }
        if self.audio.is_some() {
            self.previous_audio = self.audio.take();
        }
        self.meta = None;
    }

    pub fn update_data(&mut self, msg: &SharedMessage) {
        self.meta = Some(msg.clone());
    }

    pub fn update_vsh(&mut self, msg: &SharedMessage) {
        self.video = Some(msg.clone());
    }

    pub fn update_ash(&mut self, msg: &SharedMessage) {
        self.audio = Some(msg.clone());
    }

    /// The bootstrap tuple in delivery order: metadata, video sequence
    /// header, audio sequence header, each only if present and requested.
    pub fn dumps(&self, dump_meta: bool, dump_sh: bool) -> Vec<SharedMessage> {
        let mut out = Vec::with_capacity(3);
        if dump_meta {
            if let Some(m) = &self.meta {
                out.push(m.clone());
            }
        }
        if dump_sh {
            if let Some(m) = &self.video {
                out.push(m.clone());
            }
            if let Some(m) = &self.audio {
                out.push(m.clone());
            }
        }
        out
    }

    pub fn dispose(&mut self) {
        self.meta = None;
        self.video = None;
        self.audio = None;
        self.previous_video = None;
        self.previous_audio = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn vsh() -> SharedMessage {
        SharedMessage::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0]))
    }

    fn ash() -> SharedMessage {
        SharedMessage::audio(0, Bytes::from_static(&[0xaf, 0x00]))
    }

    fn metadata() -> SharedMessage {
        SharedMessage::amf0_data(Bytes::from_static(b"onMetaData"))
    }

    #[test]
    fn test_dumps_order_meta_vsh_ash() {
        let mut cache = MetaCache::new();
        cache.update_ash(&ash());
        cache.update_vsh(&vsh());
        cache.update_data(&metadata());
        let out = cache.dumps(true, true);
        assert_eq!(out.len(), 3);
        assert!(!out[0].is_av());
        assert!(out[1].is_video_sequence_header());
        assert!(out[2].is_audio_sequence_header());
    }

    #[test]
    fn test_dumps_respects_flags() {
        let mut cache = MetaCache::new();
        cache.update_vsh(&vsh());
        cache.update_data(&metadata());
        assert_eq!(cache.dumps(false, true).len(), 1);
        assert_eq!(cache.dumps(true, false).len(), 1);
        assert!(cache.dumps(false, false).is_empty());
    }

    #[test]
    fn test_new_publish_clears_current_keeps_previous() {
        let mut cache = MetaCache::new();
        cache.update_vsh(&vsh());
        cache.update_ash(&ash());
        cache.update_data(&metadata());
        cache.update_previous_and_clear();
        assert!(cache.vsh().is_none());
        assert!(cache.ash().is_none());
        assert!(cache.data().is_none());
        assert!(cache.previous_vsh().is_some());
        assert!(cache.previous_ash().is_some());
    }
}
