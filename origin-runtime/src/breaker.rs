use std::fs;

/// Thresholds are CPU percents (0–100); a level needs `pulse` hot seconds to
/// engage. Zero pulse disables the level.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub high_threshold: u32,
    pub high_pulse: u32,
    pub critical_threshold: u32,
    pub critical_pulse: u32,
    pub dying_threshold: u32,
    pub dying_pulse: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            high_threshold: 90,
            high_pulse: 2,
            critical_threshold: 95,
            critical_pulse: 1,
            dying_threshold: 99,
            dying_pulse: 5,
        }
    }
}

/// CPU water-level state machine, sampled on a 1-second timer.
///
/// A hot sample trips a level to its full pulse count and each cool sample
/// drains one; the level reads engaged while the counter is nonzero. The
/// dying level instead climbs one per hot second (saturating just above its
/// pulse), reads engaged at >= pulse, and resets on any cool sample.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    high_water_level: u32,
    critical_water_level: u32,
    dying_water_level: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        log::info!(
            "CircuitBreaker: enabled={}, high={}x{}, critical={}x{}, dying={}x{}",
            config.enabled,
            config.high_pulse,
            config.high_threshold,
            config.critical_pulse,
            config.critical_threshold,
            config.dying_pulse,
            config.dying_threshold
        );
        Self {
            config,
            high_water_level: 0,
            critical_water_level: 0,
            dying_water_level: 0,
        }
    }

    pub fn hybrid_high_water_level(&self) -> bool {
        self.config.enabled && (self.hybrid_critical_water_level() || self.high_water_level > 0)
    }

    pub fn hybrid_critical_water_level(&self) -> bool {
        self.config.enabled && (self.hybrid_dying_water_level() || self.critical_water_level > 0)
    }

    pub fn hybrid_dying_water_level(&self) -> bool {
        self.config.enabled
            && self.config.dying_pulse > 0
            && self.dying_water_level >= self.config.dying_pulse
    }

    /// Feeds one CPU sample, in percent of one second.
    pub fn on_timer(&mut self, cpu_percent: f32) {
        let c = &self.config;

        if c.enabled
            && c.high_threshold > 0
            && c.high_pulse > 0
            && cpu_percent > c.high_threshold as f32
        {
            self.high_water_level = c.high_pulse;
        } else if self.high_water_level > 0 {
            self.high_water_level -= 1;
        }

        if c.enabled
            && c.critical_threshold > 0
            && c.critical_pulse > 0
            && cpu_percent > c.critical_threshold as f32
        {
            self.critical_water_level = c.critical_pulse;
        } else if self.critical_water_level > 0 {
            self.critical_water_level -= 1;
        }

        if c.enabled
            && c.dying_threshold > 0
            && c.dying_pulse > 0
            && cpu_percent > c.dying_threshold as f32
        {
            self.dying_water_level = (self.dying_water_level + 1).min(c.dying_pulse + 1);
        } else if self.dying_water_level > 0 {
            self.dying_water_level = 0;
        }

        if self.hybrid_high_water_level() || self.hybrid_critical_water_level() {
            log::info!(
                "CircuitBreaker: cpu={:.2}%, break={},{},{}",
                cpu_percent,
                self.hybrid_high_water_level(),
                self.hybrid_critical_water_level(),
                self.hybrid_dying_water_level()
            );
        }
    }
}

/// Process CPU sampler over /proc; two consecutive reads yield the percent
/// of total machine jiffies consumed by this process.
#[derive(Default)]
pub struct ProcCpuSampler {
    last_proc_jiffies: u64,
    last_total_jiffies: u64,
}

impl ProcCpuSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the CPU percent since the previous call, or 0.0 on the first
    /// call or when /proc is unavailable.
    pub fn sample(&mut self) -> f32 {
        let (proc_j, total_j) = match (read_proc_self(), read_proc_total()) {
            (Some(p), Some(t)) => (p, t),
            _ => return 0.0,
        };
        let dp = proc_j.saturating_sub(self.last_proc_jiffies);
        let dt = total_j.saturating_sub(self.last_total_jiffies);
        let first = self.last_total_jiffies == 0;
        self.last_proc_jiffies = proc_j;
        self.last_total_jiffies = total_j;
        if first || dt == 0 {
            return 0.0;
        }
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1);
        (dp as f32) * (ncpu as f32) * 100.0 / (dt as f32)
    }
}

fn read_proc_self() -> Option<u64> {
    let stat = fs::read_to_string("/proc/self/stat").ok()?;
    // Fields 14 (utime) and 15 (stime), counting from 1, after the comm
    // field which may contain spaces inside parentheses.
    let rest = stat.rsplit(')').next()?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn read_proc_total() -> Option<u64> {
    let stat = fs::read_to_string("/proc/stat").ok()?;
    let cpu = stat.lines().next()?;
    let total: u64 = cpu
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse::<u64>().ok())
        .sum();
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(high: u32, pulse: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            enabled: true,
            high_threshold: high,
            high_pulse: pulse,
            critical_threshold: 95,
            critical_pulse: 1,
            dying_threshold: 99,
            dying_pulse: 5,
        })
    }

    #[test]
    fn test_high_water_level_pulse() {
        // high=80%, pulse=2: hot, hot, cool, cool.
        let mut b = breaker(80, 2);
        assert!(!b.hybrid_high_water_level());
        b.on_timer(90.0);
        assert!(b.hybrid_high_water_level());
        b.on_timer(90.0);
        assert!(b.hybrid_high_water_level());
        b.on_timer(20.0);
        assert!(b.hybrid_high_water_level());
        b.on_timer(20.0);
        assert!(!b.hybrid_high_water_level());
    }

    #[test]
    fn test_cool_start_stays_low() {
        let mut b = breaker(80, 2);
        b.on_timer(20.0);
        assert!(!b.hybrid_high_water_level());
        b.on_timer(79.9);
        assert!(!b.hybrid_high_water_level());
    }

    #[test]
    fn test_disabled_never_engages() {
        let mut b = CircuitBreaker::new(CircuitBreakerConfig {
            enabled: false,
            ..Default::default()
        });
        for _ in 0..10 {
            b.on_timer(100.0);
        }
        assert!(!b.hybrid_high_water_level());
        assert!(!b.hybrid_critical_water_level());
        assert!(!b.hybrid_dying_water_level());
    }

    #[test]
    fn test_dying_requires_sustained_load() {
        let mut b = CircuitBreaker::new(CircuitBreakerConfig {
            enabled: true,
            dying_threshold: 99,
            dying_pulse: 3,
            ..Default::default()
        });
        b.on_timer(100.0);
        b.on_timer(100.0);
        assert!(!b.hybrid_dying_water_level());
        b.on_timer(100.0);
        assert!(b.hybrid_dying_water_level());
        // One cool second resets dying entirely.
        b.on_timer(10.0);
        assert!(!b.hybrid_dying_water_level());
    }

    #[test]
    fn test_critical_implies_high() {
        let mut b = breaker(80, 2);
        // Above critical threshold engages both views.
        b.on_timer(96.0);
        assert!(b.hybrid_critical_water_level());
        assert!(b.hybrid_high_water_level());
    }
}
