//! Prometheus export of per-tier cache counters.
//!
//! Tiers keep their own counters; [`CacheMetrics::observe`] copies a
//! [`CacheStats`] snapshot into gauges labelled by tier, and
//! [`CacheMetrics::render`] produces the text exposition format.

use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use crate::cache::stats::CacheStats;
use crate::error::{Classify, ErrorKind};

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Exposition output is not UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

impl Classify for MetricsError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidInput
    }
}

pub struct CacheMetrics {
    registry: Registry,
    hits: IntGaugeVec,
    misses: IntGaugeVec,
    evictions: IntGaugeVec,
    loads: IntGaugeVec,
    entries: IntGaugeVec,
    used_bytes: IntGaugeVec,
    budget_bytes: IntGaugeVec,
    hit_rate: GaugeVec,
}

impl CacheMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("hotswap_cache".to_string()), None)?;

        let int_gauge = |name: &str, help: &str| -> Result<IntGaugeVec, MetricsError> {
            let gauge = IntGaugeVec::new(Opts::new(name, help), &["tier"])?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let hits = int_gauge("hits", "Lookups served from the tier")?;
        let misses = int_gauge("misses", "Lookups the tier could not serve")?;
        let evictions = int_gauge("evictions", "Entries removed to make room")?;
        let loads = int_gauge("loads", "Entries populated")?;
        let entries = int_gauge("entries", "Entries currently held")?;
        let used_bytes = int_gauge("used_bytes", "Bytes currently held")?;
        let budget_bytes = int_gauge("budget_bytes", "Byte budget of the tier")?;

        let hit_rate = GaugeVec::new(
            Opts::new("hit_rate", "Hits over total lookups"),
            &["tier"],
        )?;
        registry.register(Box::new(hit_rate.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            evictions,
            loads,
            entries,
            used_bytes,
            budget_bytes,
            hit_rate,
        })
    }

    /// Record the latest counters for `tier`.
    pub fn observe(&self, tier: &str, stats: &CacheStats) {
        let labels = [tier];
        let clamp = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        self.hits.with_label_values(&labels).set(clamp(stats.hits));
        self.misses.with_label_values(&labels).set(clamp(stats.misses));
        self.evictions
            .with_label_values(&labels)
            .set(clamp(stats.evictions));
        self.loads.with_label_values(&labels).set(clamp(stats.loads));
        self.entries
            .with_label_values(&labels)
            .set(clamp(stats.entries as u64));
        self.used_bytes
            .with_label_values(&labels)
            .set(clamp(stats.used_bytes as u64));
        self.budget_bytes
            .with_label_values(&labels)
            .set(clamp(stats.budget_bytes as u64));
        self.hit_rate.with_label_values(&labels).set(stats.hit_rate());
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_tier_labels() {
        let metrics = CacheMetrics::new().unwrap();
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            entries: 2,
            used_bytes: 80,
            budget_bytes: 100,
            ..Default::default()
        };
        metrics.observe("tensor", &stats);
        metrics.observe("hot", &CacheStats::default());

        let text = metrics.render().unwrap();
        assert!(text.contains("hotswap_cache_hits{tier=\"tensor\"} 3"));
        assert!(text.contains("hotswap_cache_used_bytes{tier=\"tensor\"} 80"));
        assert!(text.contains("hotswap_cache_hit_rate{tier=\"tensor\"} 0.75"));
        assert!(text.contains("tier=\"hot\""));
    }

    #[test]
    fn test_observe_overwrites() {
        let metrics = CacheMetrics::new().unwrap();
        metrics.observe("t", &CacheStats { hits: 1, ..Default::default() });
        metrics.observe("t", &CacheStats { hits: 5, ..Default::default() });
        assert!(metrics.render().unwrap().contains("hotswap_cache_hits{tier=\"t\"} 5"));
    }
}
