//! Candidate Filters
//!
//! The three store-driven producers: item co-occurrence, genre similarity and popularity.
//! Each returns a tagged `SourceOutcome` instead of an error so that Hybrid Fusion decides
//! what a cold start or an outage means for its slot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::interactions::InteractionStore;
use crate::config::RecommendationConfig;
use crate::error::Error;

/// Producer of a ranked list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Neural,
    CoOccurrence,
    Genre,
    Popularity,
    Hybrid,
}

impl Source {
    /// Short tag used in cache keys and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Neural => "ncf",
            Source::CoOccurrence => "cf",
            Source::Genre => "genre",
            Source::Popularity => "popular",
            Source::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ranked content id with the producer's own score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub content_id: String,
    pub score: f64,
    pub source: Source,
}

impl Candidate {
    pub fn new(content_id: impl Into<String>, score: f64, source: Source) -> Self {
        Self {
            content_id: content_id.into(),
            score,
            source,
        }
    }
}

/// Result of asking one producer for candidates
#[derive(Debug)]
pub enum SourceOutcome<T> {
    /// Best first
    Ranked(Vec<T>),
    /// The producer has nothing to say about this subject
    ColdStart,
    /// The producer could not run
    Unavailable(Error),
}

impl<T> SourceOutcome<T> {
    pub fn is_ranked(&self) -> bool {
        matches!(self, SourceOutcome::Ranked(_))
    }

    /// Short tag for logs and metric labels
    pub fn reason(&self) -> &'static str {
        match self {
            SourceOutcome::Ranked(_) => "ranked",
            SourceOutcome::ColdStart => "cold_start",
            SourceOutcome::Unavailable(_) => "unavailable",
        }
    }

    pub fn into_ranked(self) -> Option<Vec<T>> {
        match self {
            SourceOutcome::Ranked(items) => Some(items),
            _ => None,
        }
    }
}

impl<T> From<crate::error::Result<Vec<T>>> for SourceOutcome<T> {
    fn from(result: crate::error::Result<Vec<T>>) -> Self {
        match result {
            Ok(items) => SourceOutcome::Ranked(items),
            Err(e) if e.is_fallback_trigger() => SourceOutcome::ColdStart,
            Err(e) => SourceOutcome::Unavailable(e),
        }
    }
}

/// Item-item collaborative filter over shared viewers
#[derive(Clone)]
pub struct CoOccurrenceFilter {
    store: Arc<dyn InteractionStore>,
    window_days: u32,
    history_limit: usize,
}

impl CoOccurrenceFilter {
    pub fn new(store: Arc<dyn InteractionStore>, config: &RecommendationConfig) -> Self {
        Self {
            store,
            window_days: config.interaction_window_days,
            history_limit: config.history_limit,
        }
    }

    /// Items co-viewed with the subject's recent history; `ColdStart` with no history
    #[instrument(skip(self))]
    pub async fn candidates(&self, profile_id: &str, top_k: usize) -> SourceOutcome<Candidate> {
        let seeds = match self
            .store
            .recent_history(profile_id, self.window_days, self.history_limit)
            .await
        {
            Ok(seeds) => seeds,
            Err(e) => return SourceOutcome::Unavailable(e),
        };
        if seeds.is_empty() {
            debug!("No recent history for {}", profile_id);
            return SourceOutcome::ColdStart;
        }

        match self
            .store
            .co_viewed(profile_id, &seeds, self.window_days, top_k)
            .await
        {
            Ok(items) => SourceOutcome::Ranked(
                items
                    .into_iter()
                    .map(|item| {
                        Candidate::new(item.content_id, item.co_occurrence as f64, Source::CoOccurrence)
                    })
                    .collect(),
            ),
            Err(e) => SourceOutcome::Unavailable(e),
        }
    }
}

/// Content-based filter over the subject's dominant genres
#[derive(Clone)]
pub struct GenreFilter {
    store: Arc<dyn InteractionStore>,
    window_days: u32,
    top_genres: usize,
}

impl GenreFilter {
    pub fn new(store: Arc<dyn InteractionStore>, config: &RecommendationConfig) -> Self {
        Self {
            store,
            window_days: config.interaction_window_days,
            top_genres: config.top_genres,
        }
    }

    #[instrument(skip(self))]
    pub async fn candidates(&self, profile_id: &str, top_k: usize) -> SourceOutcome<Candidate> {
        let genres = match self
            .store
            .top_genres(profile_id, self.window_days, self.top_genres)
            .await
        {
            Ok(genres) => genres,
            Err(e) => return SourceOutcome::Unavailable(e),
        };
        if genres.is_empty() {
            return SourceOutcome::ColdStart;
        }

        let preferred: Vec<String> = genres.into_iter().map(|g| g.genre).collect();
        debug!("Preferred genres for {}: {:?}", profile_id, preferred);

        match self
            .store
            .genre_candidates(profile_id, &preferred, top_k)
            .await
        {
            Ok(matches) => SourceOutcome::Ranked(
                matches
                    .into_iter()
                    .map(|m| Candidate::new(m.content_id, m.genre_matches as f64, Source::Genre))
                    .collect(),
            ),
            Err(e) => SourceOutcome::Unavailable(e),
        }
    }
}

/// Trending content, globally or within a region
#[derive(Clone)]
pub struct PopularityRanker {
    store: Arc<dyn InteractionStore>,
    window_days: u32,
}

impl PopularityRanker {
    pub fn new(store: Arc<dyn InteractionStore>, config: &RecommendationConfig) -> Self {
        Self {
            store,
            window_days: config.popularity_window_days,
        }
    }

    #[instrument(skip(self))]
    pub async fn candidates(&self, region: Option<&str>, top_k: usize) -> SourceOutcome<Candidate> {
        match self.store.popular(self.window_days, region, top_k).await {
            Ok(items) => SourceOutcome::Ranked(
                items
                    .into_iter()
                    .map(|item| {
                        Candidate::new(item.content_id, item.unique_viewers as f64, Source::Popularity)
                    })
                    .collect(),
            ),
            Err(e) => SourceOutcome::Unavailable(e),
        }
    }
}
