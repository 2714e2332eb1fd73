//! Recommendation Metrics and Performance Monitoring
//!
//! Per-request bookkeeping for Hybrid Fusion, exported through the `metrics` facade, plus
//! a drop-guard timer for slow-path logging.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use super::filters::Source;

/// Slow request threshold for `issues`
const SLOW_REQUEST_MS: u64 = 200;

/// Metrics for a single recommendation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationMetrics {
    pub profile_id: String,
    pub request_id: String,
    pub timestamp: i64,

    pub total_duration_ms: u64,
    pub served_from_cache: bool,

    pub candidates_considered: usize,
    pub recommendations_returned: usize,
    pub metadata_gaps: usize,

    /// source tag -> outcome tag, for every source that did not rank
    pub fallbacks: BTreeMap<String, String>,
}

impl RecommendationMetrics {
    pub fn new(profile_id: &str) -> Self {
        Self {
            profile_id: profile_id.to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            total_duration_ms: 0,
            served_from_cache: false,
            candidates_considered: 0,
            recommendations_returned: 0,
            metadata_gaps: 0,
            fallbacks: BTreeMap::new(),
        }
    }

    /// Note a source that fell back, and count it
    pub fn fallback(&mut self, source: Source, reason: &'static str) {
        self.fallbacks
            .insert(source.as_str().to_string(), reason.to_string());
        metrics::counter!(
            "streamrec_source_fallbacks_total",
            "source" => source.as_str(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Export the request totals
    pub fn record(&self, result: &'static str) {
        metrics::counter!("streamrec_recommendations_total", "result" => result).increment(1);
        metrics::histogram!("streamrec_recommend_duration_ms").record(self.total_duration_ms as f64);
    }

    /// Quality problems worth a log line
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.total_duration_ms > SLOW_REQUEST_MS {
            issues.push(format!("Slow response: {}ms", self.total_duration_ms));
        }
        if self.recommendations_returned == 0 {
            issues.push("Empty recommendation list".to_string());
        }
        if self.fallbacks.len() >= 3 {
            issues.push(format!(
                "Mostly fallback content: {} sources did not rank",
                self.fallbacks.len()
            ));
        }
        if self.metadata_gaps > 0 {
            issues.push(format!("{} ids without catalog metadata", self.metadata_gaps));
        }

        issues
    }
}

/// Performance timer for tracking operation duration
pub struct PerformanceTimer {
    start: Instant,
    label: String,
}

impl PerformanceTimer {
    pub fn new(label: &str) -> Self {
        Self {
            start: Instant::now(),
            label: label.to_string(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn log_if_slow(&self, threshold_ms: u64) {
        let elapsed = self.elapsed_ms();
        if elapsed > threshold_ms {
            tracing::warn!(
                "Slow operation: {} took {}ms (threshold: {}ms)",
                self.label,
                elapsed,
                threshold_ms
            );
        }
    }
}

impl Drop for PerformanceTimer {
    fn drop(&mut self) {
        let elapsed = self.elapsed_ms();
        tracing::debug!("{} completed in {}ms", self.label, elapsed);
    }
}
