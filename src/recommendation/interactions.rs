//! Interaction Data Model
//!
//! Raw watch events, the implicit ratings derived from them, the aggregate rows each
//! filter reads, and the `InteractionStore` trait every backend implements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Rating tiers an implicit rating can take
pub const RATING_TIERS: [f32; 4] = [0.2, 0.5, 0.8, 1.0];

/// Weight of a watch in completion-weighted aggregates (co-occurrence, popularity)
pub fn engagement_weight(completed: bool) -> f64 {
    if completed {
        1.0
    } else {
        0.5
    }
}

/// `position / duration`, undefined when the duration is not positive
pub fn completion_ratio(position: i64, duration: i64) -> Option<f64> {
    if duration > 0 {
        Some(position as f64 / duration as f64)
    } else {
        None
    }
}

/// Implicit rating used for training: 1.0 complete, 0.8 past 70%, 0.5 past 30%, else 0.2
pub fn implicit_rating(completed: bool, position: i64, duration: i64) -> f32 {
    if completed {
        return 1.0;
    }
    match completion_ratio(position, duration) {
        Some(ratio) if ratio > 0.7 => 0.8,
        Some(ratio) if ratio > 0.3 => 0.5,
        _ => 0.2,
    }
}

/// A raw watch history row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WatchEvent {
    pub profile_id: String,
    pub content_id: String,
    pub position: i64,
    pub duration: i64,
    pub completed: bool,
    pub region: Option<String>,
    pub watched_at: DateTime<Utc>,
}

impl WatchEvent {
    pub fn implicit_rating(&self) -> f32 {
        implicit_rating(self.completed, self.position, self.duration)
    }

    pub fn to_interaction(&self) -> Interaction {
        Interaction {
            profile_id: self.profile_id.clone(),
            content_id: self.content_id.clone(),
            implicit_rating: self.implicit_rating(),
            observed_at: self.watched_at,
        }
    }
}

/// A (profile, content) interaction with its derived rating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub profile_id: String,
    pub content_id: String,
    pub implicit_rating: f32,
    pub observed_at: DateTime<Utc>,
}

/// An item co-viewed by profiles sharing the subject's history
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CoViewedItem {
    pub content_id: String,
    pub co_occurrence: i64,
    pub avg_rating: f64,
}

/// A genre and how often the subject watched it
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct GenreAffinity {
    pub genre: String,
    pub watch_count: i64,
}

/// A catalog item matching some of the subject's preferred genres
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct GenreMatch {
    pub content_id: String,
    pub genre_matches: i64,
    pub release_year: Option<i32>,
}

/// A trending item
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PopularItem {
    pub content_id: String,
    pub unique_viewers: i64,
    pub engagement_score: f64,
}

/// Catalog metadata returned with final recommendations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContentMetadata {
    pub content_id: String,
    pub title: String,
    pub content_type: String,
    pub poster_url: Option<String>,
    pub rating: Option<f64>,
    pub genres: Vec<String>,
}

/// Read access to watch history and the content catalog.
///
/// Every method is a single point-in-time read. Implementations bound each call with a
/// timeout and report pool exhaustion or connection loss as `StoreUnavailable`.
#[async_trait]
pub trait InteractionStore: Send + Sync {
    /// All interactions newer than `window_days`, newest first
    async fn load_interactions(&self, window_days: u32) -> Result<Vec<Interaction>>;

    /// Content ids of the profile's most recent watches within the window, newest first
    async fn recent_history(
        &self,
        profile_id: &str,
        window_days: u32,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Items watched by other profiles who watched any of `seed_items`, excluding everything
    /// the subject has watched, ranked by (co-occurrence desc, avg rating desc)
    async fn co_viewed(
        &self,
        profile_id: &str,
        seed_items: &[String],
        window_days: u32,
        limit: usize,
    ) -> Result<Vec<CoViewedItem>>;

    /// The profile's most watched genres within the window
    async fn top_genres(
        &self,
        profile_id: &str,
        window_days: u32,
        limit: usize,
    ) -> Result<Vec<GenreAffinity>>;

    /// Unseen published items ranked by (genre overlap desc, release year desc)
    async fn genre_candidates(
        &self,
        profile_id: &str,
        genres: &[String],
        limit: usize,
    ) -> Result<Vec<GenreMatch>>;

    /// Items ranked by (distinct viewers desc, engagement desc), optionally within a region
    async fn popular(
        &self,
        window_days: u32,
        region: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PopularItem>>;

    /// Published catalog rows for a batch of ids; missing ids are simply absent
    async fn content_metadata(&self, content_ids: &[String]) -> Result<Vec<ContentMetadata>>;

    /// Profiles with the most recent activity, most recent first
    async fn active_profiles(&self, window_days: u32, limit: usize) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implicit_rating_tiers() {
        assert_eq!(implicit_rating(true, 0, 0), 1.0);
        assert_eq!(implicit_rating(false, 80, 100), 0.8);
        assert_eq!(implicit_rating(false, 50, 100), 0.5);
        assert_eq!(implicit_rating(false, 30, 100), 0.2);
        assert_eq!(implicit_rating(false, 10, 100), 0.2);
    }

    #[test]
    fn test_zero_duration_falls_to_lowest_tier() {
        assert_eq!(completion_ratio(50, 0), None);
        assert_eq!(implicit_rating(false, 50, 0), 0.2);
        assert_eq!(implicit_rating(false, 50, -5), 0.2);
    }

    #[test]
    fn test_rating_is_monotonic_in_completion() {
        let duration = 1000;
        let mut previous = 0.0f32;
        for position in 0..=duration {
            let rating = implicit_rating(false, position, duration);
            assert!(RATING_TIERS.contains(&rating));
            assert!(rating >= previous, "rating dropped at position {}", position);
            previous = rating;
        }
        assert!(implicit_rating(true, 0, duration) >= previous);
    }

    #[test]
    fn test_watch_event_to_interaction() {
        let event = WatchEvent {
            profile_id: "p1".to_string(),
            content_id: "c1".to_string(),
            position: 45,
            duration: 100,
            completed: false,
            region: None,
            watched_at: Utc::now(),
        };
        let interaction = event.to_interaction();
        assert_eq!(interaction.implicit_rating, 0.5);
        assert_eq!(interaction.observed_at, event.watched_at);
    }
}
