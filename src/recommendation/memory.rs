//! In-process Interaction Store
//!
//! Holds watch events and catalog rows in memory and answers the same queries as the
//! PostgreSQL store, with the same windows, exclusions and tie-breaks. Used by the test
//! suite and for local runs without a database.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::interactions::{
    engagement_weight, CoViewedItem, ContentMetadata, GenreAffinity, GenreMatch, Interaction,
    InteractionStore, PopularItem, WatchEvent,
};
use crate::error::{Error, Result};

/// A catalog row
#[derive(Debug, Clone)]
pub struct CatalogItem {
    pub metadata: ContentMetadata,
    pub release_year: Option<i32>,
    pub is_published: bool,
}

impl CatalogItem {
    /// A published movie with the given genres
    pub fn new(content_id: &str, title: &str, genres: &[&str]) -> Self {
        Self {
            metadata: ContentMetadata {
                content_id: content_id.to_string(),
                title: title.to_string(),
                content_type: "movie".to_string(),
                poster_url: None,
                rating: None,
                genres: genres.iter().map(|g| g.to_string()).collect(),
            },
            release_year: None,
            is_published: true,
        }
    }

    pub fn released(mut self, year: i32) -> Self {
        self.release_year = Some(year);
        self
    }

    pub fn unpublished(mut self) -> Self {
        self.is_published = false;
        self
    }
}

#[derive(Default)]
struct State {
    events: Vec<WatchEvent>,
    catalog: HashMap<String, CatalogItem>,
}

/// Interaction store over vectors
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a watch event
    pub fn record(&self, event: WatchEvent) {
        self.write().events.push(event);
    }

    /// Append a watch event observed `age` ago
    pub fn record_watch(
        &self,
        profile_id: &str,
        content_id: &str,
        position: i64,
        duration: i64,
        completed: bool,
        age: ChronoDuration,
    ) {
        self.record(WatchEvent {
            profile_id: profile_id.to_string(),
            content_id: content_id.to_string(),
            position,
            duration,
            completed,
            region: None,
            watched_at: Utc::now() - age,
        });
    }

    /// Insert or replace a catalog row
    pub fn add_content(&self, item: CatalogItem) {
        self.write()
            .catalog
            .insert(item.metadata.content_id.clone(), item);
    }

    /// Make every subsequent call fail with `StoreUnavailable` until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn event_count(&self) -> usize {
        self.read().events.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::store_unavailable("in-memory store marked unavailable"));
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn cutoff(window_days: u32) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::days(i64::from(window_days))
}

/// Distinct-profile count and mean engagement per content id
#[derive(Default)]
struct Aggregate<'a> {
    profiles: HashSet<&'a str>,
    weight_sum: f64,
    rows: usize,
}

impl<'a> Aggregate<'a> {
    fn add(&mut self, event: &'a WatchEvent) {
        self.profiles.insert(event.profile_id.as_str());
        self.weight_sum += engagement_weight(event.completed);
        self.rows += 1;
    }

    fn mean(&self) -> f64 {
        if self.rows == 0 {
            0.0
        } else {
            self.weight_sum / self.rows as f64
        }
    }
}

#[async_trait]
impl InteractionStore for InMemoryStore {
    async fn load_interactions(&self, window_days: u32) -> Result<Vec<Interaction>> {
        self.check_available()?;
        let since = cutoff(window_days);
        let state = self.read();

        let mut events: Vec<&WatchEvent> =
            state.events.iter().filter(|e| e.watched_at > since).collect();
        events.sort_by(|a, b| b.watched_at.cmp(&a.watched_at));
        Ok(events.into_iter().map(WatchEvent::to_interaction).collect())
    }

    async fn recent_history(
        &self,
        profile_id: &str,
        window_days: u32,
        limit: usize,
    ) -> Result<Vec<String>> {
        self.check_available()?;
        let since = cutoff(window_days);
        let state = self.read();

        let mut events: Vec<&WatchEvent> = state
            .events
            .iter()
            .filter(|e| e.profile_id == profile_id && e.watched_at > since)
            .collect();
        events.sort_by(|a, b| b.watched_at.cmp(&a.watched_at));
        Ok(events
            .into_iter()
            .take(limit)
            .map(|e| e.content_id.clone())
            .collect())
    }

    async fn co_viewed(
        &self,
        profile_id: &str,
        seed_items: &[String],
        window_days: u32,
        limit: usize,
    ) -> Result<Vec<CoViewedItem>> {
        self.check_available()?;
        let since = cutoff(window_days);
        let state = self.read();

        let seeds: HashSet<&str> = seed_items.iter().map(String::as_str).collect();
        let co_viewers: HashSet<&str> = state
            .events
            .iter()
            .filter(|e| e.profile_id != profile_id && seeds.contains(e.content_id.as_str()))
            .map(|e| e.profile_id.as_str())
            .collect();
        let watched: HashSet<&str> = state
            .events
            .iter()
            .filter(|e| e.profile_id == profile_id)
            .map(|e| e.content_id.as_str())
            .collect();

        let mut groups: HashMap<&str, Aggregate<'_>> = HashMap::new();
        for event in state.events.iter().filter(|e| {
            e.watched_at > since
                && co_viewers.contains(e.profile_id.as_str())
                && !watched.contains(e.content_id.as_str())
        }) {
            groups.entry(event.content_id.as_str()).or_default().add(event);
        }

        let mut items: Vec<CoViewedItem> = groups
            .into_iter()
            .map(|(content_id, agg)| CoViewedItem {
                content_id: content_id.to_string(),
                co_occurrence: agg.profiles.len() as i64,
                avg_rating: agg.mean(),
            })
            .collect();
        items.sort_by(|a, b| {
            b.co_occurrence
                .cmp(&a.co_occurrence)
                .then(b.avg_rating.total_cmp(&a.avg_rating))
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        items.truncate(limit);
        Ok(items)
    }

    async fn top_genres(
        &self,
        profile_id: &str,
        window_days: u32,
        limit: usize,
    ) -> Result<Vec<GenreAffinity>> {
        self.check_available()?;
        let since = cutoff(window_days);
        let state = self.read();

        let mut counts: HashMap<&str, i64> = HashMap::new();
        for event in state
            .events
            .iter()
            .filter(|e| e.profile_id == profile_id && e.watched_at > since)
        {
            if let Some(item) = state.catalog.get(&event.content_id) {
                for genre in &item.metadata.genres {
                    *counts.entry(genre.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut genres: Vec<GenreAffinity> = counts
            .into_iter()
            .map(|(genre, watch_count)| GenreAffinity {
                genre: genre.to_string(),
                watch_count,
            })
            .collect();
        genres.sort_by(|a, b| b.watch_count.cmp(&a.watch_count).then_with(|| a.genre.cmp(&b.genre)));
        genres.truncate(limit);
        Ok(genres)
    }

    async fn genre_candidates(
        &self,
        profile_id: &str,
        genres: &[String],
        limit: usize,
    ) -> Result<Vec<GenreMatch>> {
        self.check_available()?;
        let state = self.read();

        let wanted: HashSet<&str> = genres.iter().map(String::as_str).collect();
        let watched: HashSet<&str> = state
            .events
            .iter()
            .filter(|e| e.profile_id == profile_id)
            .map(|e| e.content_id.as_str())
            .collect();

        let mut matches: Vec<GenreMatch> = state
            .catalog
            .values()
            .filter(|item| item.is_published && !watched.contains(item.metadata.content_id.as_str()))
            .filter_map(|item| {
                let overlap = item
                    .metadata
                    .genres
                    .iter()
                    .filter(|g| wanted.contains(g.as_str()))
                    .count() as i64;
                (overlap > 0).then(|| GenreMatch {
                    content_id: item.metadata.content_id.clone(),
                    genre_matches: overlap,
                    release_year: item.release_year,
                })
            })
            .collect();

        // NULL release years sort last, as in the SQL ordering
        matches.sort_by(|a, b| {
            b.genre_matches
                .cmp(&a.genre_matches)
                .then(b.release_year.cmp(&a.release_year))
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn popular(
        &self,
        window_days: u32,
        region: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PopularItem>> {
        self.check_available()?;
        let since = cutoff(window_days);
        let state = self.read();

        let mut groups: HashMap<&str, Aggregate<'_>> = HashMap::new();
        for event in state.events.iter().filter(|e| {
            e.watched_at > since && region.map_or(true, |r| e.region.as_deref() == Some(r))
        }) {
            groups.entry(event.content_id.as_str()).or_default().add(event);
        }

        let mut items: Vec<PopularItem> = groups
            .into_iter()
            .map(|(content_id, agg)| PopularItem {
                content_id: content_id.to_string(),
                unique_viewers: agg.profiles.len() as i64,
                engagement_score: agg.mean(),
            })
            .collect();
        items.sort_by(|a, b| {
            b.unique_viewers
                .cmp(&a.unique_viewers)
                .then(b.engagement_score.total_cmp(&a.engagement_score))
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        items.truncate(limit);
        Ok(items)
    }

    async fn content_metadata(&self, content_ids: &[String]) -> Result<Vec<ContentMetadata>> {
        self.check_available()?;
        let state = self.read();

        let mut seen = HashSet::new();
        Ok(content_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| state.catalog.get(id))
            .filter(|item| item.is_published)
            .map(|item| item.metadata.clone())
            .collect())
    }

    async fn active_profiles(&self, window_days: u32, limit: usize) -> Result<Vec<String>> {
        self.check_available()?;
        let since = cutoff(window_days);
        let state = self.read();

        let mut last_seen: HashMap<&str, DateTime<Utc>> = HashMap::new();
        for event in state.events.iter().filter(|e| e.watched_at > since) {
            let entry = last_seen
                .entry(event.profile_id.as_str())
                .or_insert(event.watched_at);
            if event.watched_at > *entry {
                *entry = event.watched_at;
            }
        }

        let mut profiles: Vec<(&str, DateTime<Utc>)> = last_seen.into_iter().collect();
        profiles.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        Ok(profiles
            .into_iter()
            .take(limit)
            .map(|(profile, _)| profile.to_string())
            .collect())
    }
}
