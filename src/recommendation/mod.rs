//! Recommendation Module
//!
//! Personalized content recommendations for streaming profiles.
//!
//! ## Architecture
//!
//! 1. **Interactions** - Watch history and catalog reads (`InteractionStore`), backed by
//!    PostgreSQL in production and by an in-process store for tests
//! 2. **Index** - Dense integer ids for profiles and content, fitted per training run
//! 3. **Model / Scorer** - Neural collaborative filtering over the indexed interactions
//! 4. **Filters** - Co-occurrence, genre and popularity candidate producers
//! 5. **Cache** - Per-source result cache with TTLs and in-flight deduplication
//! 6. **Engine** - Weighted rank fusion with cold-start fallbacks
//! 7. **Trainer** - Scheduled retraining and hot-profile cache warm-up
//!
//! ## Fusion Overview
//!
//! Each source contributes `weight * (1 - rank / list_len)` per item:
//! - Neural scorer (40%)
//! - Co-occurrence (30%)
//! - Genre similarity (20%)
//! - Popularity (10%)
//!
//! A neural or co-occurrence slot with no data for the profile is filled with the
//! popularity ranking at that slot's weight.

pub mod cache;
pub mod engine;
pub mod filters;
pub mod index;
pub mod interactions;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod scorer;
pub mod store;
pub mod trainer;

// Re-export the types that are actually used externally
pub use cache::{CacheKey, CacheStore, MemoryCache, RedisCache, ResultCache};
pub use engine::{fuse, FusionWeights, RecommendationEngine, RecommendedContent};
pub use filters::{Candidate, Source, SourceOutcome};
pub use index::{EntityIndex, IdMap};
pub use interactions::{ContentMetadata, Interaction, InteractionStore, WatchEvent};
pub use memory::{CatalogItem, InMemoryStore};
pub use scorer::{NeuralScorer, TrainedModel};
pub use store::PostgresInteractionStore;
pub use trainer::{retrain, warm_cache, TrainingReport, WarmupReport};
