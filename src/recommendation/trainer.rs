//! Scheduled retraining and cache warm-up
//!
//! `retrain` loads the interaction window and installs a new model state. `warm_cache`
//! then recomputes hybrid results for the most active profiles with bounded concurrency,
//! replacing entries left over from the previous model.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::engine::RecommendationEngine;
use super::interactions::InteractionStore;
use super::scorer::NeuralScorer;
use crate::error::{Error, Result};

/// Summary of one training run
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub version: u64,
    pub users: usize,
    pub items: usize,
    pub interactions: usize,
    pub epoch_losses: Vec<f32>,
    pub duration_ms: u64,
}

impl TrainingReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}

/// Summary of one warm-up pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    pub profiles: usize,
    pub warmed: usize,
    pub failed: usize,
}

/// Train on the last `window_days` of interactions and swap the result in
pub async fn retrain(
    store: &dyn InteractionStore,
    scorer: &NeuralScorer,
    window_days: u32,
) -> Result<TrainingReport> {
    let started = Instant::now();

    let interactions = store.load_interactions(window_days).await?;
    info!(
        "Loaded {} interactions from the last {} days",
        interactions.len(),
        window_days
    );

    let trained = scorer.train(interactions).await?;

    let report = TrainingReport {
        version: trained.version,
        users: trained.index.users.len(),
        items: trained.index.items.len(),
        interactions: trained.interactions,
        epoch_losses: trained.epoch_losses.clone(),
        duration_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        "Retrain complete: version {} ({} users, {} items, final loss {:?}) in {}ms",
        report.version,
        report.users,
        report.items,
        report.final_loss(),
        report.duration_ms
    );
    Ok(report)
}

/// Recompute hybrid recommendations for up to `limit` recently active profiles
pub async fn warm_cache(
    engine: Arc<RecommendationEngine>,
    store: &dyn InteractionStore,
    window_days: u32,
    limit: usize,
    concurrency: usize,
    top_k: usize,
) -> Result<WarmupReport> {
    let profiles = store.active_profiles(window_days, limit).await?;
    if profiles.is_empty() {
        info!("No active profiles to warm");
        return Ok(WarmupReport::default());
    }

    info!("Warming hybrid cache for {} profiles", profiles.len());

    let mut report = WarmupReport {
        profiles: profiles.len(),
        ..WarmupReport::default()
    };
    let mut set = JoinSet::new();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    for profile_id in profiles {
        let engine = engine.clone();
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(Error::internal)?;

        set.spawn(async move {
            let _permit = permit;
            let result = engine.refresh(&profile_id, top_k).await;
            (profile_id, result)
        });
    }

    while let Some(res) = set.join_next().await {
        match res {
            Ok((_, Ok(_))) => report.warmed += 1,
            Ok((profile_id, Err(e))) => {
                report.failed += 1;
                warn!("Failed to warm recommendations for {}: {}", profile_id, e);
            }
            Err(e) => {
                report.failed += 1;
                error!("Warm-up task join error: {}", e);
            }
        }
    }

    info!(
        "Warmed recommendations for {}/{} profiles",
        report.warmed, report.profiles
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, RecommendationConfig, TrainingConfig};
    use crate::recommendation::cache::{CacheKey, ResultCache};
    use crate::recommendation::engine::RecommendedContent;
    use crate::recommendation::filters::{Candidate, Source};
    use crate::recommendation::interactions::ContentMetadata;
    use crate::recommendation::memory::{CatalogItem, InMemoryStore};
    use chrono::Duration;

    fn scorer() -> NeuralScorer {
        NeuralScorer::new(
            ModelConfig {
                embedding_dim: 4,
                hidden_layers: vec![8],
                dropout: 0.0,
                embedding_init_std: 0.01,
            },
            TrainingConfig {
                epochs: 2,
                batch_size: 2,
                seed: Some(11),
                ..TrainingConfig::default()
            },
        )
    }

    fn store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        for id in ["c1", "c2", "c3"] {
            store.add_content(CatalogItem::new(id, id, &["drama"]));
        }
        store.record_watch("u1", "c1", 100, 100, true, Duration::hours(3));
        store.record_watch("u2", "c1", 50, 100, false, Duration::hours(2));
        store.record_watch("u2", "c2", 100, 100, true, Duration::hours(1));
        store
    }

    #[tokio::test]
    async fn test_retrain_reports_installed_version() {
        let store = store();
        let scorer = scorer();
        let report = retrain(store.as_ref(), &scorer, 90).await.unwrap();
        assert_eq!(report.version, 1);
        assert_eq!(report.users, 2);
        assert_eq!(report.items, 2);
        assert_eq!(report.epoch_losses.len(), 2);
        assert!(scorer.is_ready());
    }

    #[tokio::test]
    async fn test_retrain_on_empty_window_fails_without_state() {
        let store = Arc::new(InMemoryStore::new());
        let scorer = scorer();
        tokio_test::assert_err!(retrain(store.as_ref(), &scorer, 90).await);
        assert!(!scorer.is_ready());
    }

    #[tokio::test]
    async fn test_warm_cache_fills_hybrid_entries() {
        let store = store();
        let cache = Arc::new(ResultCache::in_memory(Default::default()));
        let engine = Arc::new(
            RecommendationEngine::new(
                store.clone(),
                cache.clone(),
                Arc::new(scorer()),
                &RecommendationConfig::default(),
            )
            .unwrap(),
        );

        let report = warm_cache(engine, store.as_ref(), 90, 10, 2, 5)
            .await
            .unwrap();
        assert_eq!(report.profiles, 2);
        assert_eq!(report.warmed, 2);

        let cached = cache
            .read::<RecommendedContent>(&CacheKey::hybrid("u1", None, 5))
            .await
            .unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn test_warm_cache_replaces_entries_from_previous_model() {
        let store = store();
        let cache = Arc::new(ResultCache::in_memory(Default::default()));
        let config = RecommendationConfig::default();
        let engine = Arc::new(
            RecommendationEngine::new(store.clone(), cache.clone(), Arc::new(scorer()), &config)
                .unwrap(),
        );

        let hybrid_key = CacheKey::hybrid("u1", None, 5);
        let neural_key = CacheKey::for_profile(Source::Neural, "u1", config.source_candidates);
        let stale = RecommendedContent {
            metadata: ContentMetadata {
                content_id: "stale".to_string(),
                title: "Stale".to_string(),
                content_type: "movie".to_string(),
                poster_url: None,
                rating: None,
                genres: Vec::new(),
            },
            score: 1.0,
        };
        cache.put(&hybrid_key, &[stale.clone()]).await.unwrap();
        cache
            .put(&neural_key, &[Candidate::new("stale", 9.0, Source::Neural)])
            .await
            .unwrap();

        retrain(store.as_ref(), engine.scorer(), 90).await.unwrap();
        // The normal path still serves the old entry
        assert_eq!(engine.recommend("u1", 5).await.unwrap(), vec![stale]);

        let report = warm_cache(engine.clone(), store.as_ref(), 90, 10, 2, 5)
            .await
            .unwrap();
        assert_eq!(report.warmed, 2);

        let hybrid = cache
            .read::<RecommendedContent>(&hybrid_key)
            .await
            .unwrap()
            .unwrap();
        assert!(!hybrid.is_empty());
        assert!(hybrid.iter().all(|r| r.metadata.content_id != "stale"));

        let neural = cache.read::<Candidate>(&neural_key).await.unwrap().unwrap();
        assert!(!neural.is_empty());
        assert!(neural.iter().all(|c| c.content_id != "stale"));
        assert_eq!(engine.recommend("u1", 5).await.unwrap(), hybrid);
    }
}
