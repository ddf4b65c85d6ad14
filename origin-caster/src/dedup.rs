//! Per-publisher DTS dedup queue for TS-derived streams, where audio and
//! video frequently collide on the same millisecond.

use live::SharedMessage;
use std::collections::BTreeMap;

/// Colliding DTS values are bumped by 1ms up to this many times before the
/// message is dropped.
const MAX_DTS_BUMPS: i64 = 10;
/// Dequeue once both kinds are this deep.
const AV_DEPTH: usize = 2;
/// Or once one side floods: about 30s of video or audio.
const MAX_VIDEOS: usize = 100;
const MAX_AUDIOS: usize = 300;

#[derive(Default)]
pub struct AvDedupQueue {
    nb_videos: usize,
    nb_audios: usize,
    msgs: BTreeMap<i64, SharedMessage>,
}

impl AvDedupQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.nb_videos = 0;
        self.nb_audios = 0;
        self.msgs.clear();
    }

    /// Inserts keyed by DTS, bumping on collision; a message that cannot
    /// find a free slot within [MAX_DTS_BUMPS] is dropped.
    pub fn push(&mut self, mut msg: SharedMessage) {
        let mut bumps = 0;
        while self.msgs.contains_key(&msg.header.timestamp) {
            msg.header.timestamp += 1;
            bumps += 1;
            if bumps > MAX_DTS_BUMPS {
                log::warn!("drop msg, dts={} still colliding", msg.header.timestamp);
                return;
            }
        }
        if msg.is_audio() {
            self.nb_audios += 1;
        }
        if msg.is_video() {
            self.nb_videos += 1;
        }
        self.msgs.insert(msg.header.timestamp, msg);
    }

    pub fn pop(&mut self) -> Option<SharedMessage> {
        let av_ok = self.nb_videos >= AV_DEPTH && self.nb_audios >= AV_DEPTH;
        let av_overflow = self.nb_videos > MAX_VIDEOS || self.nb_audios > MAX_AUDIOS;
        if !av_ok && !av_overflow {
            return None;
        }
        let (&dts, _) = self.msgs.iter().next()?;
        let msg = self.msgs.remove(&dts)?;
        if msg.is_audio() {
            self.nb_audios -= 1;
        }
        if msg.is_video() {
            self.nb_videos -= 1;
        }
        Some(msg)
    }
}
