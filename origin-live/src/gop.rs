//! GOP cache: the frames since the last keyframe, for instant startup of
//! new consumers.

use crate::message::SharedMessage;

/// Audio messages after the last video before we decide the publisher
/// disabled video and purge; about 3 seconds at 26ms per packet.
const PURE_AUDIO_GUESS_COUNT: usize = 115;

pub struct GopCache {
    enabled: bool,
    /// Cap against streams that never send an IDR.
    max_frames: usize,
    cached_video_count: usize,
    audio_after_last_video_count: usize,
    cache: Vec<SharedMessage>,
}

impl Default for GopCache {
    fn default() -> Self {
        Self {
            enabled: true,
            max_frames: 2500,
            cached_video_count: 0,
            audio_after_last_video_count: 0,
            cache: Vec::new(),
        }
    }
}

impl GopCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.clear();
        }
    }

    pub fn set_max_frames(&mut self, v: usize) {
        self.max_frames = v;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Start time of the cached GOP, ms; 0 when empty.
    pub fn start_time(&self) -> i64 {
        self.cache.first().map(|m| m.header.timestamp).unwrap_or(0)
    }

    /// No video frame cached yet: the stream is pure audio right now.
    pub fn pure_audio(&self) -> bool {
        self.cached_video_count == 0
    }

    /// Caches one AV message, clearing on keyframe per GOP semantics.
    pub fn cache(&mut self, msg: &SharedMessage) {
        if !self.enabled {
            return;
        }

        if msg.is_video() {
            self.cached_video_count += 1;
            self.audio_after_last_video_count = 0;
        }
        // Cache nothing until the first video arrives.
        if self.pure_audio() {
            return;
        }
        if msg.is_audio() {
            self.audio_after_last_video_count += 1;
        }
        // The publisher seems to have dropped video; stop wasting memory.
        if self.audio_after_last_video_count > PURE_AUDIO_GUESS_COUNT {
            self.clear();
            return;
        }
        if self.cache.len() > self.max_frames {
            self.clear();
            return;
        }
        if msg.is_video_keyframe() {
            self.clear();
            self.cached_video_count = 1;
        }
        self.cache.push(msg.clone());
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.cached_video_count = 0;
        self.audio_after_last_video_count = 0;
    }

    /// The cached messages in order; the consumer bootstrap appends these
    /// after the sequence headers.
    pub fn dump(&self) -> &[SharedMessage] {
        &self.cache
    }
}
