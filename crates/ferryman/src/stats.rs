//! The counter-sink contract for decision telemetry.
//!
//! The concrete sink (statsd, in-memory, ...) is supplied by the embedding
//! process; the proxy only needs increment semantics. Tags are
//! `key:value` strings in the statsd style.

/// A statsd-style counter sink.
pub trait StatsClient: Send + Sync {
    /// Increment `metric` by one.
    fn incr(&self, metric: &str, tags: &[String]);

    /// Increment `metric` by `value`.
    fn count(&self, metric: &str, value: u64, tags: &[String]);
}

/// Sink that drops every metric.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsClient for NoopStats {
    fn incr(&self, _metric: &str, _tags: &[String]) {}
    fn count(&self, _metric: &str, _value: u64, _tags: &[String]) {}
}
