use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Single measurement emitted by a pipeline component.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    pub name: &'static str,
    pub value: f64,
    /// (key, value) label pairs, eg/ `("collector", "binance-0")`.
    pub labels: Vec<(&'static str, String)>,
}

impl Metric {
    pub fn new(name: &'static str, value: f64) -> Self {
        Self {
            name,
            value,
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.labels.push((key, value.into()));
        self
    }
}

/// Best-effort metric recording. Implementations must never suspend and never crash
/// the producer.
pub trait MetricSink: Send + Sync {
    fn record(&self, metric: Metric);
}

/// [`MetricSink`] that forwards measurements over a bounded channel. A full channel
/// drops the measurement and counts it.
#[derive(Debug)]
pub struct ChannelMetricSink {
    tx: mpsc::Sender<Metric>,
    dropped: AtomicU64,
}

impl ChannelMetricSink {
    /// Construct a sink and the receiver draining it.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Metric>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MetricSink for ChannelMetricSink {
    fn record(&self, metric: Metric) {
        if self.tx.try_send(metric).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// [`MetricSink`] that discards every measurement. Useful in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn record(&self, _: Metric) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_drops_and_counts_on_overflow() {
        tokio_test::block_on(async {
            let (sink, mut rx) = ChannelMetricSink::channel(1);

            sink.record(Metric::new("buffer_size", 1.0));
            sink.record(Metric::new("buffer_size", 2.0));

            assert_eq!(1, sink.dropped());
            assert_eq!(1.0, rx.recv().await.unwrap().value);
            assert!(rx.try_recv().is_err());
        });
    }

    #[test]
    fn test_metric_labels() {
        let metric = Metric::new("messages_total", 10.0).with_label("collector", "binance-0");
        assert_eq!(vec![("collector", "binance-0".to_owned())], metric.labels);
    }
}
