use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{error, trace};
use tokio::time::Instant;

/// Liveness check for the runtime. A heartbeat task feeds it; if the
/// runtime stalls long enough that feeding stops, the monitor gives up.
#[derive(Debug, Clone)]
pub struct Watchdog {
    started: Instant,
    last_feed_ms: Arc<AtomicU64>,
    timeout: Duration,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Watchdog {
            started: Instant::now(),
            last_feed_ms: Arc::new(AtomicU64::new(0)),
            timeout,
        }
    }

    pub fn feed(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_feed_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn starved(&self) -> bool {
        let last_feed = Duration::from_millis(self.last_feed_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last_feed) > self.timeout
    }
}

pub async fn heartbeat(watchdog: Watchdog, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        trace!("Heartbeat");
        watchdog.feed();
    }
}

/// Resolves only when the watchdog starves.
pub async fn monitor(watchdog: Watchdog) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(watchdog.timeout / 3);
    loop {
        ticker.tick().await;
        if watchdog.starved() {
            error!("Heartbeat missed for more than {:?}", watchdog.timeout);
            anyhow::bail!("watchdog starved");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fed_watchdog_is_not_starved() {
        let watchdog = Watchdog::new(Duration::from_secs(15));
        tokio::spawn(heartbeat(watchdog.clone(), Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!watchdog.starved());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_fails_without_heartbeat() {
        let watchdog = Watchdog::new(Duration::from_secs(15));
        watchdog.feed();

        let started = Instant::now();
        assert!(monitor(watchdog).await.is_err());
        assert!(started.elapsed() > Duration::from_secs(15));
    }
}
