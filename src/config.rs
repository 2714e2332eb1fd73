//! Configuration management for the recommendation engine
//!
//! Provides strongly-typed configuration with validation, environment variable parsing,
//! and sensible defaults. Every section also implements `Default` so the library can be
//! embedded (and tested) without touching the process environment.
//!
//! # Example
//! ```no_run
//! use streamrec::Config;
//! let config = Config::from_env().expect("failed to load config");
//! println!("Embedding dim: {}", config.model.embedding_dim);
//! ```

use crate::error::{Error, Result};
use std::time::Duration;
use tracing::info;

/// Upper bound on the interaction store pool
pub const MAX_POOL_SIZE: u32 = 20;

/// Main application configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Interaction store configuration
    pub database: DatabaseConfig,
    /// Result cache configuration
    pub cache: CacheConfig,
    /// Candidate generation and fusion configuration
    pub recommendation: RecommendationConfig,
    /// Neural scorer architecture
    pub model: ModelConfig,
    /// Training protocol and schedule
    pub training: TrainingConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool (1..=20)
    pub max_connections: u32,
    /// Minimum connections to keep open
    pub min_connections: u32,
    /// How long a caller may wait for a pooled connection
    pub acquire_timeout: Duration,
    /// Idle timeout for connections
    pub idle_timeout: Duration,
    /// Maximum lifetime for connections
    pub max_lifetime: Duration,
    /// Prepared statement cache per connection
    pub statement_cache_size: usize,
    /// Timeout applied to every store operation
    pub query_timeout: Duration,
}

/// Result cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Use Redis; when false an in-process cache is used
    pub enabled: bool,
    /// Timeout applied to every cache operation
    pub op_timeout: Duration,
    /// Per-source time-to-live
    pub ttl: CacheTtls,
}

/// Per-source cache time-to-live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub neural: Duration,
    pub co_occurrence: Duration,
    pub genre: Duration,
    pub popularity: Duration,
    pub hybrid: Duration,
}

/// Fusion weights as configured; validated into `FusionWeights` by the engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightConfig {
    pub neural: f64,
    pub co_occurrence: f64,
    pub genre: f64,
    pub popularity: f64,
}

/// Candidate generation configuration
#[derive(Debug, Clone)]
pub struct RecommendationConfig {
    /// Window for training data, co-occurrence and genre preferences
    pub interaction_window_days: u32,
    /// Window for the popularity ranking
    pub popularity_window_days: u32,
    /// How many recent watches seed the co-occurrence filter
    pub history_limit: usize,
    /// Size of the genre preference set
    pub top_genres: usize,
    /// Oversized list requested from neural, co-occurrence and genre sources
    pub source_candidates: usize,
    /// List size requested from the popularity ranker
    pub popular_candidates: usize,
    /// Default request size
    pub default_top_k: usize,
    /// Hard cap on request size
    pub max_top_k: usize,
    /// Fusion weights
    pub weights: WeightConfig,
}

/// Neural scorer architecture
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Width of the user and item embeddings
    pub embedding_dim: usize,
    /// Widths of the dense stack
    pub hidden_layers: Vec<usize>,
    /// Dropout probability, applied during training only
    pub dropout: f32,
    /// Standard deviation of the embedding initializer
    pub embedding_init_std: f32,
}

/// Training protocol and schedule
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Fixed seed for initialization and shuffling; entropy when unset
    pub seed: Option<u64>,
    /// Period of the scheduled retraining job
    pub interval: Duration,
    /// Profiles whose hybrid cache is warmed after a retrain
    pub warmup_profiles: usize,
    /// Concurrent warm-up computations
    pub warmup_concurrency: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let user = std::env::var("USER").unwrap_or_else(|_| "postgres".to_string());
        Self {
            url: format!("postgres://{}@localhost/streaming", user),
            max_connections: MAX_POOL_SIZE,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
            statement_cache_size: 100,
            query_timeout: Duration::from_millis(5000),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            enabled: true,
            op_timeout: Duration::from_millis(500),
            ttl: CacheTtls::default(),
        }
    }
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            neural: Duration::from_secs(3600),
            co_occurrence: Duration::from_secs(1800),
            genre: Duration::from_secs(1800),
            popularity: Duration::from_secs(600),
            hybrid: Duration::from_secs(900),
        }
    }
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            neural: 0.4,
            co_occurrence: 0.3,
            genre: 0.2,
            popularity: 0.1,
        }
    }
}

impl WeightConfig {
    pub fn total(&self) -> f64 {
        self.neural + self.co_occurrence + self.genre + self.popularity
    }
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            interaction_window_days: 90,
            popularity_window_days: 7,
            history_limit: 50,
            top_genres: 5,
            source_candidates: 30,
            popular_candidates: 20,
            default_top_k: 20,
            max_top_k: 100,
            weights: WeightConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 64,
            hidden_layers: vec![128, 64, 32],
            dropout: 0.2,
            embedding_init_std: 0.01,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 1024,
            learning_rate: 0.001,
            seed: None,
            interval: Duration::from_secs(86_400),
            warmup_profiles: 100,
            warmup_concurrency: 10,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Try to load .env file (ignore if not found)
        dotenvy::dotenv().ok();

        let config = Self {
            database: DatabaseConfig::from_env()?,
            cache: CacheConfig::from_env()?,
            recommendation: RecommendationConfig::from_env()?,
            model: ModelConfig::from_env()?,
            training: TrainingConfig::from_env()?,
        };

        config.validate()?;
        config.log_summary();

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 || self.database.max_connections > MAX_POOL_SIZE {
            return Err(Error::InvalidConfig {
                key: "DB_MAX_CONNECTIONS",
                message: format!("pool size must be within 1..={}", MAX_POOL_SIZE).into(),
            });
        }

        if self.database.max_connections < self.database.min_connections {
            return Err(Error::InvalidConfig {
                key: "DB_MAX_CONNECTIONS",
                message: "max_connections must be >= min_connections".into(),
            });
        }

        let weights = &self.recommendation.weights;
        for (key, value) in [
            ("REC_WEIGHT_NEURAL", weights.neural),
            ("REC_WEIGHT_COOCCURRENCE", weights.co_occurrence),
            ("REC_WEIGHT_GENRE", weights.genre),
            ("REC_WEIGHT_POPULARITY", weights.popularity),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidConfig {
                    key,
                    message: format!("weight must be a non-negative number, got {}", value).into(),
                });
            }
        }
        if (weights.total() - 1.0).abs() > 1e-6 {
            return Err(Error::InvalidConfig {
                key: "REC_WEIGHT_*",
                message: format!("fusion weights must sum to 1.0, got {}", weights.total()).into(),
            });
        }

        if self.recommendation.default_top_k > self.recommendation.max_top_k {
            return Err(Error::InvalidConfig {
                key: "REC_DEFAULT_TOP_K",
                message: "default top_k must not exceed REC_MAX_TOP_K".into(),
            });
        }

        if self.model.embedding_dim == 0 {
            return Err(Error::InvalidConfig {
                key: "MODEL_EMBEDDING_DIM",
                message: "embedding dimension must be positive".into(),
            });
        }
        if self.model.hidden_layers.is_empty() || self.model.hidden_layers.contains(&0) {
            return Err(Error::InvalidConfig {
                key: "MODEL_HIDDEN_LAYERS",
                message: "hidden layers must be a non-empty list of positive widths".into(),
            });
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(Error::InvalidConfig {
                key: "MODEL_DROPOUT",
                message: "dropout must be within [0, 1)".into(),
            });
        }

        if self.training.epochs == 0 || self.training.batch_size == 0 {
            return Err(Error::InvalidConfig {
                key: "TRAIN_EPOCHS",
                message: "epochs and batch size must be positive".into(),
            });
        }
        if !(self.training.learning_rate > 0.0) {
            return Err(Error::InvalidConfig {
                key: "TRAIN_LEARNING_RATE",
                message: "learning rate must be positive".into(),
            });
        }

        Ok(())
    }

    /// Log configuration summary (without sensitive data)
    fn log_summary(&self) {
        info!("Configuration loaded:");
        info!("  Database:");
        info!("    URL: {}", mask_url(&self.database.url));
        info!(
            "    Pool Size: {}-{}",
            self.database.min_connections, self.database.max_connections
        );
        info!("  Cache:");
        info!("    Redis enabled: {}", self.cache.enabled);
        if self.cache.enabled {
            info!("    Redis URL: {}", mask_url(&self.cache.redis_url));
        }
        info!("  Recommendation:");
        info!(
            "    Windows: interactions={}d popularity={}d",
            self.recommendation.interaction_window_days, self.recommendation.popularity_window_days
        );
        info!("    Weights: {:?}", self.recommendation.weights);
        info!("  Model:");
        info!(
            "    Embedding dim: {}, hidden: {:?}",
            self.model.embedding_dim, self.model.hidden_layers
        );
        info!(
            "    Training: epochs={} batch={} lr={}",
            self.training.epochs, self.training.batch_size, self.training.learning_rate
        );
    }
}

impl DatabaseConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let url = get_env("DATABASE_URL").unwrap_or(defaults.url);

        Ok(Self {
            url,
            max_connections: get_env_or("DB_MAX_CONNECTIONS", "20").parse().unwrap_or(20),
            min_connections: get_env_or("DB_MIN_CONNECTIONS", "1").parse().unwrap_or(1),
            acquire_timeout: Duration::from_secs(
                get_env_or("DB_ACQUIRE_TIMEOUT_SECS", "5").parse().unwrap_or(5),
            ),
            idle_timeout: Duration::from_secs(
                get_env_or("DB_IDLE_TIMEOUT_SECS", "600")
                    .parse()
                    .unwrap_or(600),
            ),
            max_lifetime: Duration::from_secs(
                get_env_or("DB_MAX_LIFETIME_SECS", "3600")
                    .parse()
                    .unwrap_or(3600),
            ),
            statement_cache_size: get_env_or("DB_STATEMENT_CACHE_SIZE", "100")
                .parse()
                .unwrap_or(100),
            query_timeout: Duration::from_millis(
                get_env_or("DB_QUERY_TIMEOUT_MS", "5000")
                    .parse()
                    .unwrap_or(5000),
            ),
        })
    }
}

impl CacheConfig {
    fn from_env() -> Result<Self> {
        let ttl = CacheTtls {
            neural: secs_or("REC_TTL_NEURAL_SECS", 3600),
            co_occurrence: secs_or("REC_TTL_COOCCURRENCE_SECS", 1800),
            genre: secs_or("REC_TTL_GENRE_SECS", 1800),
            popularity: secs_or("REC_TTL_POPULAR_SECS", 600),
            hybrid: secs_or("REC_TTL_HYBRID_SECS", 900),
        };

        Ok(Self {
            redis_url: get_env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            enabled: get_env_or("CACHE_ENABLED", "true").parse().unwrap_or(true),
            op_timeout: Duration::from_millis(
                get_env_or("CACHE_OP_TIMEOUT_MS", "500").parse().unwrap_or(500),
            ),
            ttl,
        })
    }
}

impl RecommendationConfig {
    fn from_env() -> Result<Self> {
        let weights = WeightConfig {
            neural: get_env_parsed_or("REC_WEIGHT_NEURAL", 0.4)?,
            co_occurrence: get_env_parsed_or("REC_WEIGHT_COOCCURRENCE", 0.3)?,
            genre: get_env_parsed_or("REC_WEIGHT_GENRE", 0.2)?,
            popularity: get_env_parsed_or("REC_WEIGHT_POPULARITY", 0.1)?,
        };

        Ok(Self {
            interaction_window_days: get_env_or("REC_INTERACTION_WINDOW_DAYS", "90")
                .parse()
                .unwrap_or(90),
            popularity_window_days: get_env_or("REC_POPULARITY_WINDOW_DAYS", "7")
                .parse()
                .unwrap_or(7),
            history_limit: get_env_or("REC_HISTORY_LIMIT", "50").parse().unwrap_or(50),
            top_genres: get_env_or("REC_TOP_GENRES", "5").parse().unwrap_or(5),
            source_candidates: get_env_or("REC_SOURCE_CANDIDATES", "30")
                .parse()
                .unwrap_or(30),
            popular_candidates: get_env_or("REC_POPULAR_CANDIDATES", "20")
                .parse()
                .unwrap_or(20),
            default_top_k: get_env_or("REC_DEFAULT_TOP_K", "20").parse().unwrap_or(20),
            max_top_k: get_env_or("REC_MAX_TOP_K", "100").parse().unwrap_or(100),
            weights,
        })
    }
}

impl ModelConfig {
    fn from_env() -> Result<Self> {
        let hidden_raw = get_env_or("MODEL_HIDDEN_LAYERS", "128,64,32");
        let hidden_layers = parse_widths(&hidden_raw).map_err(|message| Error::InvalidConfig {
            key: "MODEL_HIDDEN_LAYERS",
            message: message.into(),
        })?;

        Ok(Self {
            embedding_dim: get_env_or("MODEL_EMBEDDING_DIM", "64").parse().unwrap_or(64),
            hidden_layers,
            dropout: get_env_parsed_or("MODEL_DROPOUT", 0.2)?,
            embedding_init_std: get_env_parsed_or("MODEL_EMBEDDING_INIT_STD", 0.01)?,
        })
    }
}

impl TrainingConfig {
    fn from_env() -> Result<Self> {
        let seed = match std::env::var("TRAIN_SEED") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse::<u64>().map_err(|e| {
                Error::InvalidConfig {
                    key: "TRAIN_SEED",
                    message: format!("Invalid value '{}': {}", raw, e).into(),
                }
            })?),
            _ => None,
        };

        Ok(Self {
            epochs: get_env_or("TRAIN_EPOCHS", "10").parse().unwrap_or(10),
            batch_size: get_env_or("TRAIN_BATCH_SIZE", "1024").parse().unwrap_or(1024),
            learning_rate: get_env_parsed_or("TRAIN_LEARNING_RATE", 0.001)?,
            seed,
            interval: secs_or("TRAIN_INTERVAL_SECS", 86_400),
            warmup_profiles: get_env_or("WARMUP_PROFILES", "100").parse().unwrap_or(100),
            warmup_concurrency: get_env_or("WARMUP_CONCURRENCY", "10").parse().unwrap_or(10),
        })
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Get required environment variable
fn get_env(key: &'static str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::MissingEnvVar { var: key })
}

/// Get environment variable with default
fn get_env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an optional environment variable, rejecting malformed values
fn get_env_parsed_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value.trim().parse().map_err(|e: T::Err| Error::InvalidConfig {
            key,
            message: format!("Invalid value '{}': {}", value, e).into(),
        }),
        Err(_) => Ok(default),
    }
}

fn secs_or(key: &str, default: u64) -> Duration {
    Duration::from_secs(get_env_or(key, &default.to_string()).parse().unwrap_or(default))
}

/// Parse a comma-separated list of layer widths
fn parse_widths(raw: &str) -> std::result::Result<Vec<usize>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|e| format!("Invalid layer width '{}': {}", s, e))
        })
        .collect()
}

/// Mask sensitive parts of URL
fn mask_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let (before, after) = url.split_at(colon_pos + 1);
            let (_, rest) = after.split_at(at_pos - colon_pos - 1);
            return format!("{}****{}", before, rest);
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.hidden_layers, vec![128, 64, 32]);
        assert_eq!(config.cache.ttl.neural, Duration::from_secs(3600));
        assert_eq!(config.cache.ttl.popularity, Duration::from_secs(600));
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = Config::default();
        config.recommendation.weights.neural = 0.5;
        match config.validate() {
            Err(Error::InvalidConfig { key, .. }) => assert_eq!(key, "REC_WEIGHT_*"),
            other => panic!("expected weight validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_pool_bounds() {
        let mut config = Config::default();
        config.database.max_connections = 21;
        assert!(config.validate().is_err());

        config.database.max_connections = 0;
        assert!(config.validate().is_err());

        config.database.max_connections = 4;
        config.database.min_connections = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_widths() {
        assert_eq!(parse_widths("128, 64,32").unwrap(), vec![128, 64, 32]);
        assert!(parse_widths("128,abc").is_err());
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("postgres://app:secret@db/streaming"),
            "postgres://app:****@db/streaming"
        );
        assert_eq!(mask_url("redis://127.0.0.1:6379"), "redis://127.0.0.1:6379");
    }
}
