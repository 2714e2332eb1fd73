//! Neural Scorer
//!
//! Owns the currently served Model State. Training builds a complete new state off the
//! async runtime and installs it with a single pointer swap; inference takes an `Arc`
//! snapshot per request, so a swap never tears a batch in flight and a failed run leaves
//! the previous state serving.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, instrument};

use super::filters::{Candidate, Source};
use super::index::EntityIndex;
use super::interactions::Interaction;
use super::metrics::PerformanceTimer;
use super::model::{NcfModel, TrainingSample};
use crate::config::{ModelConfig, TrainingConfig};
use crate::error::{Error, Result};

/// Items scored per rayon task
const SCORE_CHUNK: usize = 4096;

/// One immutable trained model with the index it was fitted against
#[derive(Debug)]
pub struct TrainedModel {
    pub version: u64,
    pub trained_at: DateTime<Utc>,
    pub index: EntityIndex,
    pub epoch_losses: Vec<f32>,
    pub interactions: usize,
    model: NcfModel,
}

impl TrainedModel {
    /// Probability for every known item, in item-index order
    pub fn score_all(&self, user: usize) -> Vec<f32> {
        let items: Vec<usize> = (0..self.model.num_items()).collect();
        items
            .par_chunks(SCORE_CHUNK)
            .flat_map_iter(|chunk| self.model.score_items(user, chunk))
            .collect()
    }

    /// The `k` highest-probability item indices, best first; ties go to the lower index
    pub fn top_k(&self, user: usize, k: usize) -> Vec<(usize, f32)> {
        let scores = self.score_all(user);
        top_k_indices(&scores, k)
            .into_iter()
            .map(|i| (i, scores[i]))
            .collect()
    }

    /// Top-k as content candidates
    pub fn recommend(&self, profile_id: &str, k: usize) -> Result<Vec<Candidate>> {
        let user = self.index.users.encode(profile_id)?;
        Ok(self
            .top_k(user, k)
            .into_iter()
            .filter_map(|(item, score)| {
                self.index
                    .items
                    .decode(item)
                    .map(|content_id| Candidate::new(content_id, f64::from(score), Source::Neural))
            })
            .collect())
    }
}

fn by_score_then_index(scores: &[f32]) -> impl Fn(&usize, &usize) -> CmpOrdering + '_ {
    move |&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b))
}

/// Partial selection of the best `k` indices followed by a sort of only those `k`
pub fn top_k_indices(scores: &[f32], k: usize) -> Vec<usize> {
    let k = k.min(scores.len());
    if k == 0 {
        return Vec::new();
    }
    let compare = by_score_then_index(scores);
    let mut order: Vec<usize> = (0..scores.len()).collect();
    if k < order.len() {
        order.select_nth_unstable_by(k - 1, &compare);
        order.truncate(k);
    }
    order.sort_unstable_by(&compare);
    order
}

/// Trainable relevance model with an atomically swapped current state
pub struct NeuralScorer {
    model_config: ModelConfig,
    training_config: TrainingConfig,
    current: RwLock<Option<Arc<TrainedModel>>>,
    versions: AtomicU64,
    training: tokio::sync::Mutex<()>,
}

impl NeuralScorer {
    pub fn new(model_config: ModelConfig, training_config: TrainingConfig) -> Self {
        Self {
            model_config,
            training_config,
            current: RwLock::new(None),
            versions: AtomicU64::new(0),
            training: tokio::sync::Mutex::new(()),
        }
    }

    /// The currently served state, or `ModelNotReady`
    pub fn snapshot(&self) -> Result<Arc<TrainedModel>> {
        let current = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        current.clone().ok_or(Error::ModelNotReady)
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot().is_ok()
    }

    pub fn version(&self) -> Option<u64> {
        self.snapshot().ok().map(|model| model.version)
    }

    /// Whether a training run currently holds the single-flight lock
    pub fn is_training(&self) -> bool {
        self.training.try_lock().is_err()
    }

    fn install(&self, model: Arc<TrainedModel>) {
        let mut current = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = Some(model);
    }

    /// Fit a fresh index and model on `interactions` and swap it in.
    ///
    /// Only one run proceeds at a time; a concurrent call gets `TrainingInProgress`. On any
    /// failure the served state is unchanged.
    #[instrument(skip(self, interactions), fields(interactions = interactions.len()))]
    pub async fn train(&self, interactions: Vec<Interaction>) -> Result<Arc<TrainedModel>> {
        let _running = self
            .training
            .try_lock()
            .map_err(|_| Error::TrainingInProgress)?;

        if interactions.is_empty() {
            return Err(Error::training("no interactions in the training window"));
        }

        let started = Instant::now();
        let index = EntityIndex::fit(&interactions);
        let samples = interactions
            .iter()
            .map(|i| {
                Ok(TrainingSample {
                    user: index.users.encode(&i.profile_id)?,
                    item: index.items.encode(&i.content_id)?,
                    label: i.implicit_rating,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Training on {} interactions ({} users, {} items)",
            samples.len(),
            index.users.len(),
            index.items.len()
        );

        let model_config = self.model_config.clone();
        let training_config = self.training_config.clone();
        let (num_users, num_items) = (index.users.len(), index.items.len());
        let (model, epoch_losses) = tokio::task::spawn_blocking(move || {
            let _timer = PerformanceTimer::new("ncf_training");
            let mut rng = match training_config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let mut model = NcfModel::new(num_users, num_items, &model_config, &mut rng)?;
            let losses = model.fit(&samples, &training_config, &mut rng)?;
            Ok::<_, Error>((model, losses))
        })
        .await??;

        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let trained = Arc::new(TrainedModel {
            version,
            trained_at: Utc::now(),
            index,
            epoch_losses,
            interactions: interactions.len(),
            model,
        });
        self.install(trained.clone());
        metrics::gauge!("streamrec_model_version").set(version as f64);

        info!(
            "Model version {} installed in {}ms",
            version,
            started.elapsed().as_millis()
        );
        Ok(trained)
    }

    /// Top-k content for a profile from the current state.
    ///
    /// `ModelNotReady` when nothing has been trained, `UnknownEntity` when the profile was
    /// not in the training window.
    #[instrument(skip(self))]
    pub async fn recommend(&self, profile_id: &str, top_k: usize) -> Result<Vec<Candidate>> {
        let snapshot = self.snapshot()?;
        // Fail fast on cold start before leaving the runtime thread
        snapshot.index.users.encode(profile_id)?;

        let profile = profile_id.to_string();
        let candidates =
            tokio::task::spawn_blocking(move || snapshot.recommend(&profile, top_k)).await??;
        debug!("Neural scorer returned {} candidates", candidates.len());
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> (ModelConfig, TrainingConfig) {
        (
            ModelConfig {
                embedding_dim: 8,
                hidden_layers: vec![16, 8],
                dropout: 0.2,
                embedding_init_std: 0.01,
            },
            TrainingConfig {
                epochs: 3,
                batch_size: 4,
                learning_rate: 0.01,
                seed: Some(5),
                ..TrainingConfig::default()
            },
        )
    }

    fn interaction(profile: &str, content: &str, rating: f32) -> Interaction {
        Interaction {
            profile_id: profile.to_string(),
            content_id: content.to_string(),
            implicit_rating: rating,
            observed_at: Utc::now(),
        }
    }

    fn interactions() -> Vec<Interaction> {
        vec![
            interaction("u1", "c1", 1.0),
            interaction("u1", "c2", 0.2),
            interaction("u2", "c1", 1.0),
            interaction("u2", "c3", 1.0),
            interaction("u3", "c4", 0.5),
        ]
    }

    #[test]
    fn test_top_k_indices_partial_selection() {
        let scores = [0.1, 0.9, 0.5, 0.9, 0.3];
        assert_eq!(top_k_indices(&scores, 3), vec![1, 3, 2]);
        assert_eq!(top_k_indices(&scores, 10), vec![1, 3, 2, 4, 0]);
        assert!(top_k_indices(&scores, 0).is_empty());
    }

    #[tokio::test]
    async fn test_untrained_scorer_is_not_ready() {
        let (model, training) = config();
        let scorer = NeuralScorer::new(model, training);
        assert!(!scorer.is_ready());
        assert!(matches!(
            scorer.recommend("u1", 5).await,
            Err(Error::ModelNotReady)
        ));
    }

    #[tokio::test]
    async fn test_train_installs_versioned_state() {
        let (model, training) = config();
        let scorer = NeuralScorer::new(model, training);

        let first = scorer.train(interactions()).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.epoch_losses.len(), 3);

        let recs = scorer.recommend("u1", 3).await.unwrap();
        assert_eq!(recs.len(), 3);
        assert!(recs.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(recs.iter().all(|c| c.source == Source::Neural));

        let second = scorer.train(interactions()).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(scorer.version(), Some(2));
        // A reader holding the old snapshot keeps a consistent view
        assert_eq!(first.index.items.len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_profile_is_cold_start() {
        let (model, training) = config();
        let scorer = NeuralScorer::new(model, training);
        scorer.train(interactions()).await.unwrap();
        let err = scorer.recommend("stranger", 3).await.unwrap_err();
        assert!(err.is_fallback_trigger());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serving_continues_while_training_runs() {
        let (model, mut training) = config();
        training.epochs = 10;
        let scorer = Arc::new(NeuralScorer::new(model, training));
        scorer.train(interactions()).await.unwrap();
        assert!(!scorer.is_training());

        let mut large = Vec::new();
        for user in 0..300 {
            for offset in 0..40 {
                let content = format!("c{}", (user * 7 + offset) % 500);
                large.push(interaction(&format!("u{}", user), &content, 1.0));
            }
        }

        let background = scorer.clone();
        let run = tokio::spawn(async move { background.train(large).await });
        while !scorer.is_training() && !run.is_finished() {
            tokio::task::yield_now().await;
        }
        assert!(scorer.is_training(), "training finished before it could be observed");

        // The previous state answers without waiting for the run
        let served = tokio::time::timeout(Duration::from_secs(1), scorer.recommend("u1", 3))
            .await
            .expect("serving blocked on training")
            .unwrap();
        assert_eq!(served.len(), 3);
        assert_eq!(scorer.version(), Some(1));

        assert!(matches!(
            scorer.train(interactions()).await,
            Err(Error::TrainingInProgress)
        ));

        let trained = run.await.unwrap().unwrap();
        assert_eq!(trained.version, 2);
        assert_eq!(scorer.version(), Some(2));
        assert!(!scorer.is_training());
    }

    #[tokio::test]
    async fn test_failed_training_keeps_previous_state() {
        let (model, training) = config();
        let scorer = NeuralScorer::new(model, training);
        scorer.train(interactions()).await.unwrap();

        assert!(scorer.train(Vec::new()).await.is_err());
        assert_eq!(scorer.version(), Some(1));
        assert!(scorer.recommend("u1", 2).await.is_ok());
    }
}
