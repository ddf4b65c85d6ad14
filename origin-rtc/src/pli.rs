//! PLI coalescing: queue keyframe requests per SSRC, emit at most one per
//! interval to keep request floods off the publisher.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct PliWorker {
    interval: Duration,
    pending: HashMap<u32, u32>,
    last_sent: HashMap<u32, Instant>,
}

impl PliWorker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: HashMap::new(),
            last_sent: HashMap::new(),
        }
    }

    /// Queues a keyframe request; duplicates coalesce.
    pub fn request(&mut self, ssrc: u32) {
        *self.pending.entry(ssrc).or_insert(0) += 1;
    }

    /// Returns the SSRCs allowed to fire now.
    pub fn poll(&mut self, now: Instant) -> Vec<u32> {
        let mut out = Vec::new();
        let last_sent = &self.last_sent;
        let interval = self.interval;
        self.pending.retain(|&ssrc, &mut coalesced| {
            let ready = last_sent
                .get(&ssrc)
                .map(|&at| now.duration_since(at) >= interval)
                .unwrap_or(true);
            if ready {
                if coalesced > 1 {
                    log::debug!("pli: coalesced {} requests for ssrc={}", coalesced, ssrc);
                }
                out.push(ssrc);
                false
            } else {
                true
            }
        });
        for &ssrc in &out {
            self.last_sent.insert(ssrc, now);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesces_within_interval() {
        let mut w = PliWorker::new(Duration::from_millis(500));
        let t0 = Instant::now();
        w.request(7);
        w.request(7);
        w.request(7);
        assert_eq!(w.poll(t0), vec![7]);
        // More requests inside the interval stay queued.
        w.request(7);
        assert!(w.poll(t0 + Duration::from_millis(100)).is_empty());
        assert_eq!(w.poll(t0 + Duration::from_millis(600)), vec![7]);
    }

    #[test]
    fn test_distinct_ssrcs_independent() {
        let mut w = PliWorker::new(Duration::from_millis(500));
        let t0 = Instant::now();
        w.request(1);
        assert_eq!(w.poll(t0), vec![1]);
        w.request(2);
        let fired = w.poll(t0 + Duration::from_millis(10));
        assert_eq!(fired, vec![2]);
    }

    #[test]
    fn test_no_request_no_fire() {
        let mut w = PliWorker::new(Duration::from_millis(500));
        assert!(w.poll(Instant::now()).is_empty());
    }
}
