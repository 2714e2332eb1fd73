use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use streamrec::config::{CacheTtls, ModelConfig, RecommendationConfig, TrainingConfig};
use streamrec::recommendation::{
    retrain, CacheKey, CacheStore, CatalogItem, InMemoryStore, MemoryCache, NeuralScorer,
    RecommendationEngine, RecommendedContent, ResultCache, Source, SourceOutcome, WatchEvent,
};
use streamrec::Error;

fn scorer() -> Arc<NeuralScorer> {
    Arc::new(NeuralScorer::new(
        ModelConfig {
            embedding_dim: 4,
            hidden_layers: vec![8],
            dropout: 0.0,
            embedding_init_std: 0.01,
        },
        TrainingConfig {
            epochs: 2,
            batch_size: 4,
            seed: Some(1),
            ..TrainingConfig::default()
        },
    ))
}

fn engine_over(store: Arc<InMemoryStore>, cache: Arc<ResultCache>) -> RecommendationEngine {
    RecommendationEngine::new(store, cache, scorer(), &RecommendationConfig::default())
        .expect("default weights are valid")
}

fn engine(store: Arc<InMemoryStore>) -> RecommendationEngine {
    engine_over(store, Arc::new(ResultCache::in_memory(CacheTtls::default())))
}

/// The four-interaction catalog from the co-viewing example, plus unrelated titles
fn scenario_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.add_content(CatalogItem::new("c1", "Harbor Lights", &["drama"]));
    store.add_content(CatalogItem::new("c2", "Low Tide", &["comedy"]));
    store.add_content(CatalogItem::new("c3", "North Road", &["drama", "thriller"]));
    store.add_content(CatalogItem::new("c4", "Unwatched", &["documentary"]));
    store.add_content(CatalogItem::new("c5", "Stranger Things Elsewhere", &["horror"]));

    store.record_watch("u1", "c1", 100, 100, true, Duration::hours(5));
    store.record_watch("u1", "c2", 30, 100, false, Duration::hours(4));
    store.record_watch("u2", "c1", 100, 100, true, Duration::hours(3));
    store.record_watch("u2", "c3", 100, 100, true, Duration::hours(2));
    store.record_watch("u3", "c5", 100, 100, true, Duration::hours(1));
    store
}

/// Six titles with strictly decreasing viewer counts: p1 (6 viewers) .. p6 (1 viewer)
fn trending_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    for rank in 1..=6 {
        let id = format!("p{}", rank);
        store.add_content(CatalogItem::new(&id, &id, &["drama"]));
        for viewer in 0..(7 - rank) {
            store.record_watch(
                &format!("viewer{}", viewer),
                &id,
                100,
                100,
                true,
                Duration::hours(1),
            );
        }
    }
    store
}

fn ids(results: &[RecommendedContent]) -> Vec<String> {
    results.iter().map(|r| r.metadata.content_id.clone()).collect()
}

#[tokio::test]
async fn co_viewed_item_outranks_items_without_shared_viewers() {
    let engine = engine(scenario_store());

    let ranked = engine
        .co_occurrence_candidates("u1", 30)
        .await
        .into_ranked()
        .expect("u1 has history");
    assert_eq!(ranked[0].content_id, "c3");
    assert!(ranked.iter().all(|c| c.content_id != "c5"));
    assert!(ranked.iter().all(|c| c.content_id != "c4"));

    let hybrid = engine.recommend("u1", 10).await.unwrap();
    let hybrid_ids = ids(&hybrid);
    let c3 = hybrid_ids.iter().position(|id| id == "c3").expect("c3 recommended");
    if let Some(c5) = hybrid_ids.iter().position(|id| id == "c5") {
        assert!(c3 < c5);
    }
}

#[tokio::test]
async fn untrained_scorer_falls_back_to_popularity() {
    let engine = engine(trending_store());
    assert!(!engine.scorer().is_ready());
    assert!(matches!(
        engine.neural_candidates("viewer0", 30).await,
        SourceOutcome::ColdStart
    ));

    let results = tokio_test::assert_ok!(engine.recommend("viewer0", 5).await);
    assert!(!results.is_empty());
}

#[tokio::test]
async fn zero_history_returns_popularity_ranking() {
    let engine = engine(trending_store());

    let popular: Vec<String> = engine
        .popular_candidates(None, 20)
        .await
        .into_ranked()
        .unwrap()
        .into_iter()
        .map(|c| c.content_id)
        .collect();
    assert_eq!(popular, vec!["p1", "p2", "p3", "p4", "p5", "p6"]);

    let results = engine.recommend("newcomer", 4).await.unwrap();
    assert_eq!(ids(&results), vec!["p1", "p2", "p3", "p4"]);
    assert!(results.windows(2).all(|w| w[0].score > w[1].score));
}

#[tokio::test]
async fn results_are_bounded_and_distinct() {
    let engine = engine(scenario_store());

    for top_k in [1, 2, 3, 50] {
        let results = engine.recommend("u1", top_k).await.unwrap();
        assert!(results.len() <= top_k);
        let unique: HashSet<String> = ids(&results).into_iter().collect();
        assert_eq!(unique.len(), results.len());
    }

    assert!(engine.recommend("u1", 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn tied_inputs_give_stable_order() {
    let store = Arc::new(InMemoryStore::new());
    for id in ["tie-b", "tie-a", "tie-c"] {
        store.add_content(CatalogItem::new(id, id, &["drama"]));
        store.record_watch("someone", id, 100, 100, true, Duration::hours(1));
    }

    let mut outputs = Vec::new();
    for _ in 0..3 {
        // Fresh engine and cache each time so nothing is served from cache
        let results = engine(store.clone()).recommend("newcomer", 3).await.unwrap();
        outputs.push(ids(&results));
    }
    assert_eq!(outputs[0], vec!["tie-a", "tie-b", "tie-c"]);
    assert!(outputs.iter().all(|o| o == &outputs[0]));
}

#[tokio::test]
async fn hybrid_result_is_served_from_cache() {
    let store = trending_store();
    let cache = Arc::new(ResultCache::in_memory(CacheTtls::default()));
    let engine = engine_over(store.clone(), cache.clone());

    let first = engine.recommend("newcomer", 3).await.unwrap();
    assert!(cache
        .read::<RecommendedContent>(&CacheKey::hybrid("newcomer", None, 3))
        .await
        .unwrap()
        .is_some());

    // A new trending title would change a fresh computation
    store.add_content(CatalogItem::new("p0", "p0", &["drama"]));
    for viewer in 0..20 {
        store.record_watch(&format!("late{}", viewer), "p0", 100, 100, true, Duration::minutes(5));
    }

    let second = engine.recommend("newcomer", 3).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn corrupt_hybrid_entry_is_recomputed_and_overwritten() {
    let store = trending_store();
    let backend = Arc::new(MemoryCache::new());
    let cache = Arc::new(ResultCache::new(backend.clone(), CacheTtls::default()));
    let engine = engine_over(store, cache.clone());

    let key = CacheKey::hybrid("newcomer", None, 3);
    backend
        .set_ex(&key.to_string(), "{not json".to_string(), StdDuration::from_secs(60))
        .await
        .unwrap();

    let results = engine.recommend("newcomer", 3).await.unwrap();
    assert_eq!(ids(&results), vec!["p1", "p2", "p3"]);

    let stored = cache.read::<RecommendedContent>(&key).await.unwrap();
    assert_eq!(stored, Some(results));
}

#[tokio::test]
async fn total_outage_is_distinct_from_empty_result() {
    let empty = engine(Arc::new(InMemoryStore::new()));
    let results = tokio_test::assert_ok!(empty.recommend("anyone", 5).await);
    assert!(results.is_empty());

    let store = trending_store();
    store.set_unavailable(true);
    let down = engine(store);
    match down.recommend("viewer0", 5).await {
        Err(Error::AllSourcesFailed { profile_id }) => assert_eq!(profile_id, "viewer0"),
        other => panic!("expected AllSourcesFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn retraining_enables_the_neural_source() {
    let store = scenario_store();
    let engine = engine(store.clone());

    let report = retrain(store.as_ref(), engine.scorer(), 90).await.unwrap();
    assert_eq!(report.version, 1);
    assert_eq!(report.users, 3);

    match engine.neural_candidates("u1", 30).await {
        SourceOutcome::Ranked(candidates) => {
            assert!(!candidates.is_empty());
            assert!(candidates.iter().all(|c| c.source == Source::Neural));
        }
        other => panic!("expected ranked neural candidates, got {}", other.reason()),
    }

    // Profiles outside the training window stay on the fallback path
    assert!(matches!(
        engine.neural_candidates("newcomer", 30).await,
        SourceOutcome::ColdStart
    ));
    assert!(!engine.recommend("u1", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn metadata_outage_surfaces_store_unavailable() {
    let store = scenario_store();
    let engine = engine(store.clone());
    retrain(store.as_ref(), engine.scorer(), 90).await.unwrap();

    // The neural source still ranks without the store; the catalog lookup cannot
    store.set_unavailable(true);
    match engine.recommend("u1", 5).await {
        Err(Error::StoreUnavailable { .. }) => {}
        other => panic!("expected StoreUnavailable, got {:?}", other),
    }
}

#[tokio::test]
async fn ids_without_catalog_rows_are_dropped() {
    let store = trending_store();
    // Popular but never catalogued, and catalogued but unpublished
    for viewer in 0..10 {
        store.record_watch(&format!("fan{}", viewer), "orphan", 100, 100, true, Duration::hours(1));
        store.record_watch(&format!("fan{}", viewer), "draft", 100, 100, true, Duration::hours(1));
    }
    store.add_content(CatalogItem::new("draft", "Draft", &["drama"]).unpublished());

    let results = engine(store).recommend("newcomer", 4).await.unwrap();
    let returned = ids(&results);
    assert!(!returned.contains(&"orphan".to_string()));
    assert!(!returned.contains(&"draft".to_string()));
    assert_eq!(returned, vec!["p1", "p2"]);
}

#[tokio::test]
async fn regional_popularity_only_uses_regional_watches() {
    let store = trending_store();
    store.add_content(CatalogItem::new("fr1", "Le Port", &["drama"]));
    store.record(WatchEvent {
        profile_id: "paris".to_string(),
        content_id: "fr1".to_string(),
        position: 100,
        duration: 100,
        completed: true,
        region: Some("FR".to_string()),
        watched_at: Utc::now() - Duration::hours(1),
    });

    let engine = engine(store);
    let regional = engine
        .recommend_in_region("newcomer", Some("FR"), 5)
        .await
        .unwrap();
    assert_eq!(ids(&regional), vec!["fr1"]);

    let global = engine.recommend("newcomer", 5).await.unwrap();
    assert_eq!(global[0].metadata.content_id, "p1");
}
