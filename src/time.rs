use std::time::Duration;

/// Fixed-step frame clock. Both the runner and the harness advance it by a configured
/// delta, so script timing never depends on how long a frame really took.
pub struct Time {
    pub delta: Duration,
    elapsed: Duration,
    frame: u64,
}

impl Time {
    pub fn new() -> Self {
        Self { delta: Duration::ZERO, elapsed: Duration::ZERO, frame: 0 }
    }

    pub fn advance(&mut self, delta: Duration) {
        self.delta = delta;
        self.elapsed += delta;
        self.frame += 1;
    }

    pub fn delta_millis(&self) -> f64 {
        self.delta.as_nanos() as f64 / 1_000_000.0
    }

    pub fn elapsed_millis(&self) -> f64 {
        self.elapsed.as_nanos() as f64 / 1_000_000.0
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }
}

impl Default for Time {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_steps_accumulate() {
        let mut time = Time::new();
        for _ in 0..3 {
            time.advance(Duration::from_millis(16));
        }
        assert_eq!(time.frame(), 3);
        assert!((time.elapsed_millis() - 48.0).abs() < 1e-9);
        assert!((time.delta_millis() - 16.0).abs() < 1e-9);
    }
}
