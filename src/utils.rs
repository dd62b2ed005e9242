use std::time::{Duration, Instant};

/// Counts ticks and reports the rate once per interval.
pub struct FpsCounter {
    ticks: u32,
    window_start: Instant,
    interval: Duration,
}

impl FpsCounter {
    /// A counter reporting once per second.
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            ticks: 0,
            window_start: Instant::now(),
            interval,
        }
    }

    /// Records a tick. Returns the rate when the interval has elapsed.
    pub fn tick(&mut self) -> Option<f32> {
        self.ticks += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed < self.interval {
            return None;
        }
        let fps = self.ticks as f32 / elapsed.as_secs_f32();
        self.ticks = 0;
        self.window_start = Instant::now();
        Some(fps)
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_only_after_interval() {
        let mut counter = FpsCounter::with_interval(Duration::from_secs(3600));
        assert!(counter.tick().is_none());
        assert!(counter.tick().is_none());

        let mut counter = FpsCounter::with_interval(Duration::ZERO);
        let fps = counter.tick().unwrap();
        assert!(fps > 0.0);
    }
}
