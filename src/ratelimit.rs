use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Token-bucket packet pacer shared by all probe tasks of a run.
///
/// A background task adds `pps / ticks-per-second` permits every tick. The
/// bucket holds at most `max(burst, per-tick refill)` permits, so a small
/// burst never caps the long-run rate below `pps`. Dropping the limiter stops
/// the refill task.
pub struct RateLimiter {
    sem: Arc<Semaphore>,
    pps: u64,
    burst: u64,
    refill: Option<JoinHandle<()>>,
}

impl RateLimiter {
    /// Create a limiter with the default tick interval (10 ms).
    pub fn new(pps: u64, burst: u64) -> Arc<Self> {
        Self::new_with_tick(pps, burst, 10)
    }

    /// Create a limiter with an explicit tick interval in milliseconds.
    pub fn new_with_tick(pps: u64, burst: u64, tick_ms: u64) -> Arc<Self> {
        let burst = burst.max(1);
        let tick_ms = tick_ms.clamp(1, 1000);
        let sem = Arc::new(Semaphore::new(burst as usize));

        let refill = (pps > 0).then(|| {
            let sem = sem.clone();
            let per_tick = per_tick(pps, tick_ms);
            let capacity = burst.max(per_tick);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let available = sem.available_permits() as u64;
                    let to_add = per_tick.min(capacity.saturating_sub(available)) as usize;
                    if to_add > 0 {
                        sem.add_permits(to_add);
                    }
                }
            })
        });

        Arc::new(Self {
            sem,
            pps,
            burst,
            refill,
        })
    }

    /// Wait for one packet slot. No-op when `pps == 0`.
    pub async fn acquire(&self) {
        if self.pps == 0 {
            return;
        }
        if let Ok(permit) = self.sem.acquire().await {
            permit.forget();
        }
    }

    pub fn pps(&self) -> u64 {
        self.pps
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.refill.take() {
            handle.abort();
        }
        self.sem.close();
    }
}

fn per_tick(pps: u64, tick_ms: u64) -> u64 {
    let ticks_per_sec = (1000 / tick_ms).max(1);
    pps.div_ceil(ticks_per_sec).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn per_tick_rounds_up() {
        assert_eq!(per_tick(1000, 10), 10);
        assert_eq!(per_tick(150, 100), 15);
        assert_eq!(per_tick(1, 10), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paces_after_burst() {
        let rl = RateLimiter::new_with_tick(100, 10, 10);
        let start = Instant::now();
        // 10 burst permits + 40 refilled at 1 per 10 ms tick
        for _ in 0..50 {
            rl.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(390), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(600), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn high_rate_is_not_capped_by_small_burst() {
        // 500 permits per 10 ms tick against a burst of 100
        let rl = RateLimiter::new(50_000, 100);
        let start = Instant::now();
        for _ in 0..5_000 {
            rl.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed <= Duration::from_millis(150), "elapsed {elapsed:?}");
        assert!(elapsed >= Duration::from_millis(80), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn zero_rate_never_blocks() {
        let rl = RateLimiter::new(0, 1);
        for _ in 0..10_000 {
            rl.acquire().await;
        }
    }
}
