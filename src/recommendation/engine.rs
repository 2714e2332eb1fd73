//! Hybrid Recommendation Engine
//!
//! Orchestrates the four producers, each behind its own cache entry, and fuses their
//! ranked lists into one weighted ranking resolved to catalog metadata.
//!
//! Fusion gives the candidate at rank `i` of a list of length `n` a contribution of
//! `weight * (1 - i / n)` and sums contributions per content id. Equal totals are ordered
//! by content id so the output is stable across calls.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::cache::{CacheKey, ResultCache};
use super::filters::{
    Candidate, CoOccurrenceFilter, GenreFilter, PopularityRanker, Source, SourceOutcome,
};
use super::interactions::{ContentMetadata, InteractionStore};
use super::metrics::{PerformanceTimer, RecommendationMetrics};
use super::scorer::NeuralScorer;
use crate::config::{RecommendationConfig, WeightConfig};
use crate::error::{Error, Result};

/// Tolerance on the sum of the fusion weights
const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Slow request threshold for the hybrid path
const SLOW_RECOMMEND_MS: u64 = 200;

/// Validated per-source fusion weights
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    neural: f64,
    co_occurrence: f64,
    genre: f64,
    popularity: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            neural: 0.4,
            co_occurrence: 0.3,
            genre: 0.2,
            popularity: 0.1,
        }
    }
}

impl FusionWeights {
    /// Rejects negative or non-finite weights and sums other than 1.0
    pub fn new(config: &WeightConfig) -> Result<Self> {
        let weights = Self {
            neural: config.neural,
            co_occurrence: config.co_occurrence,
            genre: config.genre,
            popularity: config.popularity,
        };

        for value in [
            weights.neural,
            weights.co_occurrence,
            weights.genre,
            weights.popularity,
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidConfig {
                    key: "REC_WEIGHT_*",
                    message: format!("weight must be a non-negative number, got {}", value).into(),
                });
            }
        }
        if (weights.total() - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(Error::InvalidConfig {
                key: "REC_WEIGHT_*",
                message: format!("fusion weights must sum to 1.0, got {}", weights.total()).into(),
            });
        }
        Ok(weights)
    }

    pub fn for_source(&self, source: Source) -> f64 {
        match source {
            Source::Neural => self.neural,
            Source::CoOccurrence => self.co_occurrence,
            Source::Genre => self.genre,
            Source::Popularity => self.popularity,
            Source::Hybrid => 0.0,
        }
    }

    pub fn total(&self) -> f64 {
        self.neural + self.co_occurrence + self.genre + self.popularity
    }
}

/// One fusion input: the slot a list fills and the list itself.
///
/// The slot decides the weight, so a popularity list standing in for a cold-start
/// source is weighted as that source.
#[derive(Debug, Clone)]
pub struct SlotList {
    pub slot: Source,
    pub candidates: Vec<Candidate>,
}

/// Weighted rank fusion, best first, ties by content id ascending
pub fn fuse(lists: &[SlotList], weights: &FusionWeights) -> Vec<(String, f64)> {
    let mut totals: HashMap<&str, f64> = HashMap::new();

    for list in lists {
        let weight = weights.for_source(list.slot);
        let n = list.candidates.len() as f64;
        for (rank, candidate) in list.candidates.iter().enumerate() {
            *totals.entry(candidate.content_id.as_str()).or_insert(0.0) +=
                weight * (1.0 - rank as f64 / n);
        }
    }

    let mut fused: Vec<(String, f64)> = totals
        .into_iter()
        .map(|(id, score)| (id.to_string(), score))
        .collect();
    fused.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    fused
}

/// How the hybrid path treats entries already in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Cached,
    /// Recompute the model-dependent lists and overwrite their entries
    Refresh,
}

/// A final recommendation: catalog metadata plus fused score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedContent {
    #[serde(flatten)]
    pub metadata: ContentMetadata,
    pub score: f64,
}

/// Main recommendation engine
#[derive(Clone)]
pub struct RecommendationEngine {
    store: Arc<dyn InteractionStore>,
    cache: Arc<ResultCache>,
    scorer: Arc<NeuralScorer>,
    co_occurrence: CoOccurrenceFilter,
    genre: GenreFilter,
    popularity: PopularityRanker,
    weights: FusionWeights,
    config: RecommendationConfig,
}

impl RecommendationEngine {
    pub fn new(
        store: Arc<dyn InteractionStore>,
        cache: Arc<ResultCache>,
        scorer: Arc<NeuralScorer>,
        config: &RecommendationConfig,
    ) -> Result<Self> {
        Ok(Self {
            co_occurrence: CoOccurrenceFilter::new(store.clone(), config),
            genre: GenreFilter::new(store.clone(), config),
            popularity: PopularityRanker::new(store.clone(), config),
            weights: FusionWeights::new(&config.weights)?,
            config: config.clone(),
            store,
            cache,
            scorer,
        })
    }

    pub fn scorer(&self) -> &Arc<NeuralScorer> {
        &self.scorer
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn weights(&self) -> &FusionWeights {
        &self.weights
    }

    // ---- Cached producers ----

    pub async fn neural_candidates(
        &self,
        profile_id: &str,
        top_k: usize,
    ) -> SourceOutcome<Candidate> {
        let key = CacheKey::for_profile(Source::Neural, profile_id, top_k);
        self.cache
            .get_or_compute(&key, async {
                SourceOutcome::from(self.scorer.recommend(profile_id, top_k).await)
            })
            .await
    }

    pub async fn co_occurrence_candidates(
        &self,
        profile_id: &str,
        top_k: usize,
    ) -> SourceOutcome<Candidate> {
        let key = CacheKey::for_profile(Source::CoOccurrence, profile_id, top_k);
        self.cache
            .get_or_compute(&key, self.co_occurrence.candidates(profile_id, top_k))
            .await
    }

    pub async fn genre_candidates(
        &self,
        profile_id: &str,
        top_k: usize,
    ) -> SourceOutcome<Candidate> {
        let key = CacheKey::for_profile(Source::Genre, profile_id, top_k);
        self.cache
            .get_or_compute(&key, self.genre.candidates(profile_id, top_k))
            .await
    }

    pub async fn popular_candidates(
        &self,
        region: Option<&str>,
        top_k: usize,
    ) -> SourceOutcome<Candidate> {
        let key = CacheKey::popularity(region, top_k);
        self.cache
            .get_or_compute(&key, self.popularity.candidates(region, top_k))
            .await
    }

    /// Neural candidates straight from the current model, written back over any cached list
    async fn fresh_neural_candidates(
        &self,
        profile_id: &str,
        top_k: usize,
    ) -> SourceOutcome<Candidate> {
        let outcome = SourceOutcome::from(self.scorer.recommend(profile_id, top_k).await);
        if let SourceOutcome::Ranked(candidates) = &outcome {
            let key = CacheKey::for_profile(Source::Neural, profile_id, top_k);
            if let Err(e) = self.cache.put(&key, candidates).await {
                warn!("Cache write failed for {}: {}", key, e);
            }
        }
        outcome
    }

    async fn neural_for(
        &self,
        profile_id: &str,
        top_k: usize,
        lookup: Lookup,
    ) -> SourceOutcome<Candidate> {
        match lookup {
            Lookup::Cached => self.neural_candidates(profile_id, top_k).await,
            Lookup::Refresh => self.fresh_neural_candidates(profile_id, top_k).await,
        }
    }

    // ---- Hybrid fusion ----

    /// Global hybrid recommendations
    pub async fn recommend(
        &self,
        profile_id: &str,
        top_k: usize,
    ) -> Result<Vec<RecommendedContent>> {
        self.recommend_in_region(profile_id, None, top_k).await
    }

    /// Recompute and overwrite the global hybrid entry for `profile_id`.
    ///
    /// Neural and hybrid entries are not read, so a newly installed model is used even while
    /// results from the previous one are still cached.
    pub async fn refresh(&self, profile_id: &str, top_k: usize) -> Result<Vec<RecommendedContent>> {
        self.hybrid(profile_id, None, top_k, Lookup::Refresh).await
    }

    /// Hybrid recommendations with popularity scoped to `region`.
    ///
    /// Returns at most `min(top_k, max_top_k)` distinct items. Fails only when no
    /// producer, fallbacks included, could run (`AllSourcesFailed`) or when the final
    /// metadata lookup cannot reach the store.
    pub async fn recommend_in_region(
        &self,
        profile_id: &str,
        region: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<RecommendedContent>> {
        self.hybrid(profile_id, region, top_k, Lookup::Cached).await
    }

    #[instrument(skip(self))]
    async fn hybrid(
        &self,
        profile_id: &str,
        region: Option<&str>,
        top_k: usize,
        lookup: Lookup,
    ) -> Result<Vec<RecommendedContent>> {
        let timer = PerformanceTimer::new("hybrid_recommend");
        let mut metrics = RecommendationMetrics::new(profile_id);

        let top_k = top_k.min(self.config.max_top_k);
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let key = CacheKey::hybrid(profile_id, region, top_k);
        if lookup == Lookup::Cached {
            if let Some(cached) = self.cache.get::<RecommendedContent>(&key).await {
                metrics.served_from_cache = true;
                metrics.recommendations_returned = cached.len();
                metrics.total_duration_ms = timer.elapsed_ms();
                metrics.record("cache_hit");
                return Ok(cached);
            }
        }

        let breadth = self.config.source_candidates;
        let (neural, co_occurrence, genre, popular) = tokio::join!(
            self.neural_for(profile_id, breadth, lookup),
            self.co_occurrence_candidates(profile_id, breadth),
            self.genre_candidates(profile_id, breadth),
            self.popular_candidates(region, self.config.popular_candidates),
        );

        let mut composer = SlotComposer::default();
        composer.take(Source::Popularity, popular, &mut metrics);

        let mut fallback: Option<Option<Vec<Candidate>>> = None;
        for (slot, outcome) in [
            (Source::Neural, neural),
            (Source::CoOccurrence, co_occurrence),
            (Source::Genre, genre),
        ] {
            let needs_fallback = match &outcome {
                SourceOutcome::Ranked(_) => false,
                // Genre cold start contributes an empty list
                SourceOutcome::ColdStart => slot != Source::Genre,
                SourceOutcome::Unavailable(_) => true,
            };
            composer.take(slot, outcome, &mut metrics);

            if needs_fallback {
                if fallback.is_none() {
                    let outcome = self.popular_candidates(region, breadth).await;
                    fallback = Some(composer.ranked_or_log(Source::Popularity, outcome));
                }
                if let Some(Some(list)) = &fallback {
                    composer.fill(slot, list.clone());
                }
            }
        }

        if !composer.any_ranked {
            metrics.total_duration_ms = timer.elapsed_ms();
            metrics.record("all_sources_failed");
            return Err(Error::AllSourcesFailed {
                profile_id: profile_id.to_string(),
            });
        }

        let fused = fuse(&composer.lists, &self.weights);
        metrics.candidates_considered = fused.len();
        let selected: Vec<(String, f64)> = fused.into_iter().take(top_k).collect();

        let results = self.resolve_metadata(selected, &mut metrics).await?;

        if composer.degraded {
            debug!("Not caching degraded result for {}", profile_id);
        } else if let Err(e) = self.cache.put(&key, &results).await {
            warn!("Cache write failed for {}: {}", key, e);
        }

        metrics.recommendations_returned = results.len();
        metrics.total_duration_ms = timer.elapsed_ms();
        metrics.record("ok");
        timer.log_if_slow(SLOW_RECOMMEND_MS);
        for issue in metrics.issues() {
            debug!("Recommendation quality for {}: {}", profile_id, issue);
        }

        debug!(
            "Generated {} hybrid recommendations for {} (request {})",
            results.len(),
            profile_id,
            metrics.request_id
        );
        Ok(results)
    }

    /// One batch lookup; ids without a published catalog row are dropped
    async fn resolve_metadata(
        &self,
        selected: Vec<(String, f64)>,
        metrics: &mut RecommendationMetrics,
    ) -> Result<Vec<RecommendedContent>> {
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = selected.iter().map(|(id, _)| id.clone()).collect();
        let mut by_id: HashMap<String, ContentMetadata> = self
            .store
            .content_metadata(&ids)
            .await
            .map_err(|e| match e {
                Error::StoreUnavailable { .. } => e,
                other => Error::store_unavailable(format!("metadata lookup failed: {}", other)),
            })?
            .into_iter()
            .map(|row| (row.content_id.clone(), row))
            .collect();

        let mut results = Vec::with_capacity(selected.len());
        for (content_id, score) in selected {
            match by_id.remove(&content_id) {
                Some(metadata) => results.push(RecommendedContent { metadata, score }),
                None => {
                    metrics.metadata_gaps += 1;
                    debug!("{}", Error::MetadataGap { content_id });
                }
            }
        }
        Ok(results)
    }
}

/// Collects fusion inputs and tracks how they were obtained
#[derive(Default)]
struct SlotComposer {
    lists: Vec<SlotList>,
    any_ranked: bool,
    degraded: bool,
}

impl SlotComposer {
    fn take(
        &mut self,
        slot: Source,
        outcome: SourceOutcome<Candidate>,
        metrics: &mut RecommendationMetrics,
    ) {
        let reason = outcome.reason();
        match outcome {
            SourceOutcome::Ranked(candidates) => {
                self.any_ranked = true;
                self.fill(slot, candidates);
            }
            SourceOutcome::ColdStart => {
                debug!("{} source has no data for this profile", slot);
                metrics.fallback(slot, reason);
            }
            SourceOutcome::Unavailable(e) => {
                warn!("{} source unavailable: {}", slot, e);
                self.degraded = true;
                metrics.fallback(slot, reason);
            }
        }
    }

    fn ranked_or_log(
        &mut self,
        slot: Source,
        outcome: SourceOutcome<Candidate>,
    ) -> Option<Vec<Candidate>> {
        match outcome {
            SourceOutcome::Ranked(candidates) => {
                self.any_ranked = true;
                Some(candidates)
            }
            SourceOutcome::ColdStart => None,
            SourceOutcome::Unavailable(e) => {
                warn!("{} fallback unavailable: {}", slot, e);
                self.degraded = true;
                None
            }
        }
    }

    fn fill(&mut self, slot: Source, candidates: Vec<Candidate>) {
        if !candidates.is_empty() {
            self.lists.push(SlotList { slot, candidates });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(slot: Source, ids: &[&str]) -> SlotList {
        SlotList {
            slot,
            candidates: ids
                .iter()
                .map(|id| Candidate::new(*id, 1.0, slot))
                .collect(),
        }
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let weights = FusionWeights::new(&WeightConfig::default()).unwrap();
        assert!((weights.total() - 1.0).abs() < WEIGHT_TOLERANCE);
        assert_eq!(weights, FusionWeights::default());
    }

    #[test]
    fn test_invalid_weights_are_rejected() {
        let mut config = WeightConfig::default();
        config.genre = 0.3;
        assert!(FusionWeights::new(&config).is_err());

        let mut config = WeightConfig::default();
        config.neural = -0.1;
        config.co_occurrence = 0.8;
        assert!(FusionWeights::new(&config).is_err());
    }

    #[test]
    fn test_fuse_accumulates_rank_contributions() {
        let weights = FusionWeights::default();
        let fused = fuse(
            &[
                list(Source::Neural, &["a", "b"]),
                list(Source::CoOccurrence, &["b", "c"]),
            ],
            &weights,
        );
        // a: 0.4, b: 0.2 + 0.3 = 0.5, c: 0.15
        let ids: Vec<&str> = fused.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!((fused[0].1 - 0.5).abs() < 1e-12);
        assert!((fused[1].1 - 0.4).abs() < 1e-12);
        assert!((fused[2].1 - 0.15).abs() < 1e-12);
    }

    #[test]
    fn test_fuse_breaks_ties_by_content_id() {
        let weights = FusionWeights::new(&WeightConfig {
            neural: 0.5,
            co_occurrence: 0.5,
            genre: 0.0,
            popularity: 0.0,
        })
        .unwrap();
        let lists = [
            list(Source::Neural, &["zeta"]),
            list(Source::CoOccurrence, &["alpha"]),
        ];
        for _ in 0..5 {
            let fused = fuse(&lists, &weights);
            assert_eq!(fused[0].0, "alpha");
            assert_eq!(fused[1].0, "zeta");
        }
    }

    #[test]
    fn test_fallback_slot_keeps_its_weight() {
        let weights = FusionWeights::default();
        let fused = fuse(
            &[
                list(Source::Neural, &["p1"]),
                list(Source::Popularity, &["p2"]),
            ],
            &weights,
        );
        assert_eq!(fused[0], ("p1".to_string(), 0.4));
        assert_eq!(fused[1], ("p2".to_string(), 0.1));
    }

    #[test]
    fn test_recommended_content_serializes_flat() {
        let item = RecommendedContent {
            metadata: ContentMetadata {
                content_id: "c1".to_string(),
                title: "One".to_string(),
                content_type: "movie".to_string(),
                poster_url: None,
                rating: Some(4.5),
                genres: vec!["drama".to_string()],
            },
            score: 0.7,
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["content_id"], "c1");
        assert_eq!(value["score"], 0.7);
        let back: RecommendedContent = serde_json::from_value(value).unwrap();
        assert_eq!(back, item);
    }
}
