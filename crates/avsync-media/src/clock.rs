/// Settable logical clock for the current audio position.
///
/// `get()` extrapolates from the last `set()` using monotonic wall time. The
/// baseline and the instant it was captured are stored together under one
/// short lock so a reader never pairs a new baseline with an old instant.
/// While paused the clock reads as its frozen baseline.

use std::time::Instant;

use parking_lot::Mutex;

#[derive(Clone, Copy)]
struct Anchor {
    baseline: f64,
    set_at: Instant,
    paused: bool,
}

pub struct PlaybackClock {
    anchor: Mutex<Anchor>,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            anchor: Mutex::new(Anchor {
                baseline: 0.0,
                set_at: Instant::now(),
                paused: false,
            }),
        }
    }

    /// Jump to `seconds`. Keeps the paused state.
    pub fn set(&self, seconds: f64) {
        let mut anchor = self.anchor.lock();
        anchor.baseline = seconds;
        anchor.set_at = Instant::now();
    }

    pub fn get(&self) -> f64 {
        let anchor = *self.anchor.lock();
        if anchor.paused {
            return anchor.baseline;
        }
        anchor.baseline + anchor.set_at.elapsed().as_secs_f64()
    }

    /// Freeze at the current position.
    pub fn pause(&self) {
        let mut anchor = self.anchor.lock();
        if anchor.paused {
            return;
        }
        anchor.baseline += anchor.set_at.elapsed().as_secs_f64();
        anchor.set_at = Instant::now();
        anchor.paused = true;
    }

    /// Continue from the frozen position.
    pub fn resume(&self) {
        let mut anchor = self.anchor.lock();
        if !anchor.paused {
            return;
        }
        anchor.set_at = Instant::now();
        anchor.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.anchor.lock().paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn get_right_after_set() {
        let clock = PlaybackClock::new();
        clock.set(12.5);
        let now = clock.get();
        assert!((12.5..12.51).contains(&now), "got {}", now);
    }

    #[test]
    fn advances_with_wall_time() {
        let clock = PlaybackClock::new();
        clock.set(1.0);
        std::thread::sleep(Duration::from_millis(30));
        let now = clock.get();
        assert!(now >= 1.03, "got {}", now);
        assert!(now < 1.5, "got {}", now);
    }

    #[test]
    fn monotonic_between_sets() {
        let clock = PlaybackClock::new();
        clock.set(5.0);
        let mut last = clock.get();
        for _ in 0..1000 {
            let now = clock.get();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn pause_freezes_and_resume_continues() {
        let clock = PlaybackClock::new();
        clock.set(2.0);
        clock.pause();
        let frozen = clock.get();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.get(), frozen);

        // set while paused moves the frozen point
        clock.set(4.0);
        assert_eq!(clock.get(), 4.0);
        assert!(clock.is_paused());

        clock.resume();
        std::thread::sleep(Duration::from_millis(10));
        assert!(clock.get() > 4.0);
        assert!(!clock.is_paused());
    }
}
