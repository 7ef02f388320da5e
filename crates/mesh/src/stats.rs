use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::{MediaTransport, TransportCounters};

/// Anything that can list the transports currently open.
#[async_trait]
pub trait TransportSource: Send + Sync {
    async fn transports(&self) -> Vec<Arc<dyn MediaTransport>>;
}

/// Total bytes across every open connection at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthSample {
    pub at: Instant,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Rates between two consecutive samples, in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandwidthRates {
    pub upload: f64,
    pub download: f64,
    pub total_sent: u64,
    pub total_received: u64,
}

/// Turns successive samples into rates. Counters that go backwards (a
/// connection closed and took its bytes with it) count as zero traffic.
#[derive(Debug, Default)]
pub struct BandwidthTracker {
    previous: Option<BandwidthSample>,
}

impl BandwidthTracker {
    pub fn record(&mut self, sample: BandwidthSample) -> Option<BandwidthRates> {
        let previous = self.previous.replace(sample)?;
        let elapsed = sample.at.saturating_duration_since(previous.at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(BandwidthRates {
            upload: sample.bytes_sent.saturating_sub(previous.bytes_sent) as f64 / elapsed,
            download: sample.bytes_received.saturating_sub(previous.bytes_received) as f64
                / elapsed,
            total_sent: sample.bytes_sent,
            total_received: sample.bytes_received,
        })
    }
}

pub fn format_rate(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1024.0 * 1024.0 {
        format!("{:.1} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    } else if bytes_per_sec >= 1024.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{bytes_per_sec:.0} B/s")
    }
}

pub fn format_total(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.1} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}

async fn sum_counters(source: &dyn TransportSource) -> TransportCounters {
    let mut total = TransportCounters::default();
    for transport in source.transports().await {
        let counters = transport.counters().await;
        total.bytes_sent += counters.bytes_sent;
        total.bytes_received += counters.bytes_received;
    }
    total
}

/// Poll transport counters every `interval` and publish rolling rates until
/// `cancel` fires. Read-only with respect to the connections it samples.
pub async fn run_stats_poller(
    source: Arc<dyn TransportSource>,
    interval: Duration,
    rates_tx: watch::Sender<Option<BandwidthRates>>,
    cancel: CancellationToken,
) {
    let mut tracker = BandwidthTracker::default();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let totals = sum_counters(source.as_ref()).await;
        let sample = BandwidthSample {
            at: Instant::now(),
            bytes_sent: totals.bytes_sent,
            bytes_received: totals.bytes_received,
        };
        let Some(rates) = tracker.record(sample) else {
            continue;
        };
        debug!(
            up = %format_rate(rates.upload),
            down = %format_rate(rates.download),
            sent = %format_total(rates.total_sent),
            received = %format_total(rates.total_received),
            "Bandwidth"
        );
        rates_tx.send_replace(Some(rates));
    }
    debug!("Stats poller stopped");
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::testing::FakeTransport;

    fn sample(at: Instant, sent: u64, received: u64) -> BandwidthSample {
        BandwidthSample {
            at,
            bytes_sent: sent,
            bytes_received: received,
        }
    }

    #[test]
    fn rates_from_consecutive_samples() {
        let mut tracker = BandwidthTracker::default();
        let t0 = Instant::now();
        assert!(tracker.record(sample(t0, 1000, 500)).is_none());
        let rates = tracker
            .record(sample(t0 + Duration::from_secs(2), 5000, 2500))
            .unwrap();
        assert_eq!(rates.upload, 2000.0);
        assert_eq!(rates.download, 1000.0);
        assert_eq!(rates.total_sent, 5000);
    }

    #[test]
    fn shrinking_totals_are_not_negative() {
        let mut tracker = BandwidthTracker::default();
        let t0 = Instant::now();
        tracker.record(sample(t0, 10_000, 10_000));
        let rates = tracker.record(sample(t0 + Duration::from_secs(1), 4000, 12_000)).unwrap();
        assert_eq!(rates.upload, 0.0);
        assert_eq!(rates.download, 2000.0);
    }

    #[test]
    fn formatting() {
        assert_eq!(format_rate(512.0), "512 B/s");
        assert_eq!(format_rate(2048.0), "2.0 KB/s");
        assert_eq!(format_rate(3.5 * 1024.0 * 1024.0), "3.5 MB/s");
        assert_eq!(format_total(999), "999 B");
        assert_eq!(format_total(1536), "1.5 KB");
        assert_eq!(format_total(10 * 1024 * 1024), "10.0 MB");
        assert_eq!(format_total(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    struct Fixed(Vec<Arc<FakeTransport>>);

    #[async_trait]
    impl TransportSource for Fixed {
        async fn transports(&self) -> Vec<Arc<dyn MediaTransport>> {
            self.0
                .iter()
                .map(|t| Arc::clone(t) as Arc<dyn MediaTransport>)
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poller_sums_every_transport() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = FakeTransport::new("a", tx.clone());
        let b = FakeTransport::new("b", tx);
        let source = Arc::new(Fixed(vec![a.clone(), b.clone()]));
        let (rates_tx, mut rates_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let poller = tokio::spawn(run_stats_poller(
            source,
            Duration::from_secs(1),
            rates_tx,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        a.set_counters(TransportCounters {
            bytes_sent: 3000,
            bytes_received: 1000,
        });
        b.set_counters(TransportCounters {
            bytes_sent: 1000,
            bytes_received: 1000,
        });
        rates_rx.changed().await.unwrap();
        let rates = rates_rx.borrow().unwrap();
        assert_eq!(rates.total_sent, 4000);
        assert_eq!(rates.total_received, 2000);
        assert!((rates.upload - 4000.0).abs() < 1.0);

        cancel.cancel();
        poller.await.unwrap();
    }
}
