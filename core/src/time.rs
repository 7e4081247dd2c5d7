use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch
#[inline]
pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

/// Times a scope and logs at debug level on drop when it ran longer than `TR` milliseconds
pub struct Stopwatch<const TR: u64 = 1000> {
    name: &'static str,
    start: Instant,
}

impl<const TR: u64> Stopwatch<TR> {
    pub fn with_threshold(name: &'static str) -> Self {
        Self { name, start: Instant::now() }
    }

    pub fn exceeded(&self) -> bool {
        self.start.elapsed() > Duration::from_millis(TR)
    }
}

impl<const TR: u64> Drop for Stopwatch<TR> {
    fn drop(&mut self) {
        if self.exceeded() {
            vstate_core::debug!("[{}] slow scope: {:?} over a {}ms threshold", self.name, self.start.elapsed(), TR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopwatch_threshold() {
        let fast = Stopwatch::<60_000>::with_threshold("fast");
        assert!(!fast.exceeded());
        let zero = Stopwatch::<0>::with_threshold("zero");
        std::thread::sleep(Duration::from_millis(2));
        assert!(zero.exceeded());
        assert!(unix_now() > 1_600_000_000_000);
    }
}
