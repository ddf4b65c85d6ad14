use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared byte counters of one socket. Sessions hand these to a
/// [NetworkDelta] for rate accounting.
#[derive(Default)]
pub struct IoStat {
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
}

impl IoStat {
    pub fn add_in(&self, n: u64) {
        self.in_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_out(&self, n: u64) {
        self.out_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn recv_bytes(&self) -> u64 {
        self.in_bytes.load(Ordering::Relaxed)
    }

    pub fn send_bytes(&self) -> u64 {
        self.out_bytes.load(Ordering::Relaxed)
    }
}

/// A reusable byte-delta source. It may be detached from a dying socket and
/// re-attached to a fresh one; each re-attach starts a new baseline so the
/// consumer's cumulative totals keep growing monotonically across sockets.
#[derive(Default)]
pub struct NetworkDelta {
    source: Option<Arc<IoStat>>,
    base_in: u64,
    base_out: u64,
}

impl NetworkDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a fresh socket's counters. Whatever the socket already
    /// counted before the attach is not ours.
    pub fn attach(&mut self, stat: Arc<IoStat>) {
        self.base_in = stat.recv_bytes();
        self.base_out = stat.send_bytes();
        self.source = Some(stat);
    }

    /// Detaches, returning the final unconsumed delta of the old socket.
    pub fn detach(&mut self) -> (u64, u64) {
        let last = self.remark();
        self.source = None;
        last
    }

    /// Returns the (in, out) bytes since the previous remark and advances
    /// the baseline.
    pub fn remark(&mut self) -> (u64, u64) {
        let Some(source) = &self.source else {
            return (0, 0);
        };
        let now_in = source.recv_bytes();
        let now_out = source.send_bytes();
        let d = (
            now_in.saturating_sub(self.base_in),
            now_out.saturating_sub(self.base_out),
        );
        self.base_in = now_in;
        self.base_out = now_out;
        d
    }
}

/// One averaged rate over a fixed window.
#[derive(Debug, Clone, Copy)]
struct RateSample {
    window: Duration,
    last_time: Option<Instant>,
    last_total: u64,
    kbps: u64,
}

impl RateSample {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_time: None,
            last_total: 0,
            kbps: 0,
        }
    }

    fn update(&mut self, total: u64, now: Instant) {
        let Some(last) = self.last_time else {
            self.last_time = Some(now);
            self.last_total = total;
            return;
        };
        let elapsed = now.saturating_duration_since(last);
        if elapsed < self.window {
            return;
        }
        let ms = elapsed.as_millis() as u64;
        if ms > 0 {
            self.kbps = (total.saturating_sub(self.last_total)) * 8 / ms;
        }
        self.last_time = Some(now);
        self.last_total = total;
    }
}

/// One direction of a [Kbps]: cumulative total plus the per-sample, 30s and
/// 5m averaged rates.
pub struct KbpsSlice {
    total: u64,
    sample: RateSample,
    sample_30s: RateSample,
    sample_5m: RateSample,
}

impl Default for KbpsSlice {
    fn default() -> Self {
        Self {
            total: 0,
            // The instantaneous rate re-evaluates on every sample call.
            sample: RateSample::new(Duration::ZERO),
            sample_30s: RateSample::new(Duration::from_secs(30)),
            sample_5m: RateSample::new(Duration::from_secs(300)),
        }
    }
}

impl KbpsSlice {
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn kbps(&self) -> u64 {
        self.sample.kbps
    }

    pub fn kbps_30s(&self) -> u64 {
        self.sample_30s.kbps
    }

    pub fn kbps_5m(&self) -> u64 {
        self.sample_5m.kbps
    }
}

/// Bidirectional rate sampler fed by a [NetworkDelta]. Sampling happens at
/// irregular intervals; totals survive the delta source being detached and
/// re-attached to new sockets.
#[derive(Default)]
pub struct Kbps {
    recv: KbpsSlice,
    send: KbpsSlice,
}

impl Kbps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a fresh delta into the cumulative totals.
    pub fn add_delta(&mut self, delta_in: u64, delta_out: u64) {
        self.recv.total += delta_in;
        self.send.total += delta_out;
    }

    /// Recomputes the averaged rates at `now`.
    pub fn sample(&mut self, now: Instant) {
        self.recv.sample.update(self.recv.total, now);
        self.recv.sample_30s.update(self.recv.total, now);
        self.recv.sample_5m.update(self.recv.total, now);
        self.send.sample.update(self.send.total, now);
        self.send.sample_30s.update(self.send.total, now);
        self.send.sample_5m.update(self.send.total, now);
    }

    pub fn recv(&self) -> &KbpsSlice {
        &self.recv
    }

    pub fn send(&self) -> &KbpsSlice {
        &self.send
    }

    pub fn recv_bytes(&self) -> u64 {
        self.recv.total
    }

    pub fn send_bytes(&self) -> u64 {
        self.send.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_remark() {
        let stat = Arc::new(IoStat::default());
        let mut delta = NetworkDelta::new();
        delta.attach(stat.clone());

        stat.add_in(100);
        stat.add_out(40);
        assert_eq!(delta.remark(), (100, 40));
        assert_eq!(delta.remark(), (0, 0));

        stat.add_in(1);
        assert_eq!(delta.remark(), (1, 0));
    }

    #[test]
    fn test_totals_survive_reattach() {
        let mut kbps = Kbps::new();
        let mut delta = NetworkDelta::new();

        // First socket.
        let a = Arc::new(IoStat::default());
        delta.attach(a.clone());
        a.add_in(100);
        a.add_out(10);
        let (di, do_) = delta.remark();
        kbps.add_delta(di, do_);

        // Socket dies; collect the tail and re-attach a fresh one that has
        // already seen unrelated traffic.
        a.add_in(50);
        let (di, do_) = delta.detach();
        kbps.add_delta(di, do_);

        let b = Arc::new(IoStat::default());
        b.add_in(9999); // pre-attach traffic is not ours
        delta.attach(b.clone());
        b.add_in(25);
        b.add_out(5);
        let (di, do_) = delta.remark();
        kbps.add_delta(di, do_);

        // Cumulative totals equal the sum of observed deltas only.
        assert_eq!(kbps.recv_bytes(), 100 + 50 + 25);
        assert_eq!(kbps.send_bytes(), 10 + 5);
    }

    #[test]
    fn test_rate_windows() {
        let mut kbps = Kbps::new();
        let t0 = Instant::now();
        kbps.sample(t0);

        // 1000 bytes over 1 second = 8 kbps.
        kbps.add_delta(1000, 0);
        kbps.sample(t0 + Duration::from_secs(1));
        assert_eq!(kbps.recv().kbps(), 8);
        // The 30s window hasn't elapsed yet.
        assert_eq!(kbps.recv().kbps_30s(), 0);

        kbps.add_delta(29_000, 0);
        kbps.sample(t0 + Duration::from_secs(30));
        assert_eq!(kbps.recv().kbps_30s(), 30_000 * 8 / 30_000);
    }

    #[test]
    fn test_detached_remark_is_zero() {
        let mut delta = NetworkDelta::new();
        assert_eq!(delta.remark(), (0, 0));
    }
}
