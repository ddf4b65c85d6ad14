//! Per-consumer bounded queue with drop-gop overflow, and the consumer
//! object a play session drives.

use crate::jitter::{JitterAlgorithm, RtmpJitter};
use crate::message::SharedMessage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Duration-bounded message queue. On overflow a whole GOP is dropped from
/// the front; with no keyframe in sight the queue clears entirely.
pub struct MessageQueue {
    av_start_time: i64,
    av_end_time: i64,
    max_queue_ms: i64,
    ignore_shrink: bool,
    msgs: VecDeque<SharedMessage>,
}

impl MessageQueue {
    pub fn new(max_queue_ms: i64, ignore_shrink: bool) -> Self {
        Self {
            av_start_time: -1,
            av_end_time: -1,
            max_queue_ms,
            ignore_shrink,
            msgs: VecDeque::new(),
        }
    }

    pub fn set_queue_size(&mut self, max_queue_ms: i64) {
        self.max_queue_ms = max_queue_ms;
    }

    pub fn size(&self) -> usize {
        self.msgs.len()
    }

    /// Duration between the oldest and newest AV message, ms.
    pub fn duration(&self) -> i64 {
        if self.av_start_time < 0 {
            0
        } else {
            self.av_end_time - self.av_start_time
        }
    }

    /// Returns true when the enqueue overflowed and shrank the queue.
    pub fn enqueue(&mut self, msg: SharedMessage) -> bool {
        if msg.is_av() {
            if self.av_start_time < 0 {
                self.av_start_time = msg.header.timestamp;
            }
            self.av_end_time = msg.header.timestamp;
        }
        self.msgs.push_back(msg);

        if self.max_queue_ms > 0 && self.duration() > self.max_queue_ms {
            self.shrink();
            return true;
        }
        false
    }

    /// Dequeues up to `max` messages; 0 means all.
    pub fn dump_packets(&mut self, max: usize) -> Vec<SharedMessage> {
        let count = if max == 0 {
            self.msgs.len()
        } else {
            max.min(self.msgs.len())
        };
        let out: Vec<SharedMessage> = self.msgs.drain(..count).collect();
        if let Some(first) = self.msgs.front() {
            self.av_start_time = first.header.timestamp;
        } else {
            self.av_start_time = -1;
            self.av_end_time = -1;
        }
        out
    }

    /// Drops one whole GOP from the front; clears when no keyframe exists.
    fn shrink(&mut self) {
        let next_keyframe = self
            .msgs
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, m)| m.is_video_keyframe())
            .map(|(i, _)| i);

        match next_keyframe {
            Some(i) => {
                if !self.ignore_shrink {
                    log::warn!(
                        "shrink queue, drop {}/{} msgs, duration={}ms",
                        i,
                        self.msgs.len(),
                        self.duration()
                    );
                }
                self.msgs.drain(..i);
                self.av_start_time = self.msgs.front().map(|m| m.header.timestamp).unwrap_or(-1);
            }
            None => {
                if !self.ignore_shrink {
                    log::warn!("clear queue, no keyframe in {} msgs", self.msgs.len());
                }
                self.clear();
            }
        }
    }

    pub fn clear(&mut self) {
        self.msgs.clear();
        self.av_start_time = -1;
        self.av_end_time = -1;
    }
}

/// The subscriber endpoint: a queue, its jitter corrector and a wakeup for
/// the play session parked in [Consumer::wait].
pub struct Consumer {
    queue: Mutex<MessageQueue>,
    jitter: Mutex<RtmpJitter>,
    paused: AtomicBool,
    should_update_source_id: AtomicBool,
    notify: Notify,
}

impl Consumer {
    pub fn new(queue_size_ms: i64) -> Self {
        Self {
            queue: Mutex::new(MessageQueue::new(queue_size_ms, false)),
            jitter: Mutex::new(RtmpJitter::new()),
            paused: AtomicBool::new(false),
            should_update_source_id: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn set_queue_size(&self, queue_size_ms: i64) {
        self.queue.lock().unwrap().set_queue_size(queue_size_ms);
    }

    /// The source id changed (new publisher); play sessions log it once.
    pub fn update_source_id(&self) {
        self.should_update_source_id.store(true, Ordering::Release);
    }

    pub fn take_source_id_changed(&self) -> bool {
        self.should_update_source_id.swap(false, Ordering::AcqRel)
    }

    /// The last delivered (corrected) packet time.
    pub fn get_time(&self) -> i64 {
        self.jitter.lock().unwrap().get_time()
    }

    /// Called by the source on its publishing coroutine.
    pub fn enqueue(&self, mut msg: SharedMessage, atc: bool, algorithm: JitterAlgorithm) {
        if !atc {
            self.jitter.lock().unwrap().correct(&mut msg, algorithm);
        }
        self.queue.lock().unwrap().enqueue(msg);
        self.notify.notify_one();
    }

    /// Dequeues up to `max` messages; empty while paused.
    pub fn dump_packets(&self, max: usize) -> Vec<SharedMessage> {
        if self.paused.load(Ordering::Acquire) {
            return Vec::new();
        }
        self.queue.lock().unwrap().dump_packets(max)
    }

    pub fn size(&self) -> usize {
        self.queue.lock().unwrap().size()
    }

    /// Parks until at least `min_msgs` are queued or `timeout` elapses.
    pub async fn wait(&self, min_msgs: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.size() < min_msgs {
            let notified = self.notify.notified();
            if self.size() >= min_msgs {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return;
            }
        }
    }

    /// Wakes a parked play session, e.g. on unpublish or interrupt.
    pub fn wakeup(&self) {
        self.notify.notify_one();
    }

    pub fn on_play_pause(&self, pause: bool) {
        log::info!("consumer {}", if pause { "paused" } else { "resumed" });
        self.paused.store(pause, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn keyframe(ts: i64) -> SharedMessage {
        SharedMessage::video(ts, Bytes::from_static(&[0x17, 0x01, 0, 0, 0]))
    }

    fn inter(ts: i64) -> SharedMessage {
        SharedMessage::video(ts, Bytes::from_static(&[0x27, 0x01, 0, 0, 0]))
    }

    #[test]
    fn test_overflow_drops_front_gop() {
        let mut q = MessageQueue::new(1000, true);
        q.enqueue(keyframe(0));
        q.enqueue(inter(400));
        q.enqueue(keyframe(800));
        q.enqueue(inter(900));
        // Crosses the 1000ms budget: the first GOP goes.
        assert!(q.enqueue(inter(1200)));
        let msgs = q.dump_packets(0);
        assert!(msgs[0].is_video_keyframe());
        assert_eq!(msgs[0].header.timestamp, 800);
        assert_eq!(msgs.len(), 3);
    }

    #[test]
    fn test_overflow_without_keyframe_clears() {
        let mut q = MessageQueue::new(1000, true);
        q.enqueue(inter(0));
        q.enqueue(inter(500));
        assert!(q.enqueue(inter(1500)));
        assert_eq!(q.size(), 0);
        assert_eq!(q.duration(), 0);
    }

    #[test]
    fn test_duration_tracks_av_only() {
        let mut q = MessageQueue::new(0, true);
        let mut meta = SharedMessage::amf0_data(Bytes::from_static(b"m"));
        meta.header.timestamp = 99_999;
        q.enqueue(meta);
        assert_eq!(q.duration(), 0);
        q.enqueue(keyframe(100));
        q.enqueue(inter(200));
        assert_eq!(q.duration(), 100);
    }

    #[test]
    fn test_dump_packets_partial() {
        let mut q = MessageQueue::new(0, true);
        for ts in [0, 40, 80, 120] {
            q.enqueue(inter(ts));
        }
        let first = q.dump_packets(2);
        assert_eq!(first.len(), 2);
        assert_eq!(q.size(), 2);
        assert_eq!(q.duration(), 40);
    }

    #[test]
    fn test_consumer_pause_blocks_dump() {
        let c = Consumer::new(0);
        c.enqueue(keyframe(0), false, JitterAlgorithm::Off);
        c.on_play_pause(true);
        assert!(c.dump_packets(0).is_empty());
        c.on_play_pause(false);
        assert_eq!(c.dump_packets(0).len(), 1);
    }

    #[tokio::test]
    async fn test_consumer_wait_wakes_on_enqueue() {
        use std::sync::Arc;
        let c = Arc::new(Consumer::new(0));
        let c2 = c.clone();
        let waiter = tokio::spawn(async move {
            c2.wait(1, Duration::from_secs(5)).await;
            c2.dump_packets(0).len()
        });
        tokio::task::yield_now().await;
        c.enqueue(keyframe(0), false, JitterAlgorithm::Off);
        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_consumer_wait_times_out() {
        let c = Consumer::new(0);
        let begin = std::time::Instant::now();
        c.wait(1, Duration::from_millis(20)).await;
        assert!(begin.elapsed() >= Duration::from_millis(20));
    }
}
