use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Wall/monotonic time abstracted behind a trait so deterministic tests can
/// advance time without sleeping. Grounded on the teacher's pattern of
/// abstracting collaborator concerns (sockets, time) behind small traits
/// rather than calling `Instant::now()` directly from handshake logic.
pub trait MonotonicClock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Default)]
pub struct SystemClock;

impl MonotonicClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

pub fn has_elapsed(clock: &dyn MonotonicClock, since: Instant, threshold: Duration) -> bool {
    clock.now().saturating_duration_since(since) >= threshold
}

/// Schedules the connection's retransmission poll, kept behind a trait for
/// the same reason as `MonotonicClock`: a test driving the handshake state
/// machine needs to fire this on demand rather than waiting out real wall
/// time.
#[async_trait]
pub trait TimerService: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Default)]
pub struct TokioTimerService;

#[async_trait]
impl TimerService for TokioTimerService {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod clock_test {
    use super::*;
    use std::sync::Mutex;

    struct FakeClock {
        now: Mutex<Instant>,
    }

    impl FakeClock {
        fn new() -> Self {
            FakeClock { now: Mutex::new(Instant::now()) }
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now = *now + by;
        }
    }

    impl MonotonicClock for FakeClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    #[test]
    fn has_elapsed_respects_an_injected_clock() {
        let clock = FakeClock::new();
        let start = clock.now();

        assert!(!has_elapsed(&clock, start, Duration::from_secs(1)));
        clock.advance(Duration::from_millis(999));
        assert!(!has_elapsed(&clock, start, Duration::from_secs(1)));
        clock.advance(Duration::from_millis(2));
        assert!(has_elapsed(&clock, start, Duration::from_secs(1)));
    }
}
