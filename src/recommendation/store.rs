//! PostgreSQL Interaction Store
//!
//! Every query acquires one pooled connection for its own duration; the connection goes
//! back to the pool when the guard drops, on success and on error alike. Variable-length
//! id lists are bound as arrays (`= ANY($n)`), never spliced into the SQL text.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::interactions::{
    CoViewedItem, ContentMetadata, GenreAffinity, GenreMatch, Interaction, InteractionStore,
    PopularItem, WatchEvent,
};
use crate::database::{with_timeout, Database};
use crate::error::{Error, Result};

/// Interaction store backed by the `watch_history` and `content` tables
#[derive(Clone)]
pub struct PostgresInteractionStore {
    pool: PgPool,
    timeout: Duration,
}

impl PostgresInteractionStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn from_database(db: &Database, timeout: Duration) -> Self {
        Self::new(db.pool().clone(), timeout)
    }
}

/// Profile and content ids are UUIDs in the store; anything else cannot match a row
fn parse_id(id: &str) -> Option<Uuid> {
    Uuid::parse_str(id).ok()
}

fn parse_ids(ids: &[String]) -> Vec<Uuid> {
    ids.iter().filter_map(|id| parse_id(id)).collect()
}

fn window(days: u32) -> i32 {
    i32::try_from(days).unwrap_or(i32::MAX)
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl InteractionStore for PostgresInteractionStore {
    #[instrument(skip(self))]
    async fn load_interactions(&self, window_days: u32) -> Result<Vec<Interaction>> {
        with_timeout("load_interactions", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let rows = sqlx::query_as::<_, WatchEvent>(
                r#"
                SELECT wh.profile_id::text AS profile_id,
                       wh.content_id::text AS content_id,
                       wh.position::bigint AS position,
                       wh.duration::bigint AS duration,
                       wh.completed,
                       wh.region,
                       wh.watched_at
                FROM watch_history wh
                WHERE wh.watched_at > NOW() - make_interval(days => $1)
                ORDER BY wh.watched_at DESC
                "#,
            )
            .bind(window(window_days))
            .fetch_all(&mut *conn)
            .await?;

            debug!("Loaded {} interactions from last {} days", rows.len(), window_days);
            Ok::<_, Error>(rows.iter().map(WatchEvent::to_interaction).collect())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn recent_history(
        &self,
        profile_id: &str,
        window_days: u32,
        limit_n: usize,
    ) -> Result<Vec<String>> {
        let Some(profile) = parse_id(profile_id) else {
            return Ok(Vec::new());
        };

        with_timeout("recent_history", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let ids = sqlx::query_scalar::<_, String>(
                r#"
                SELECT content_id::text
                FROM watch_history
                WHERE profile_id = $1
                  AND watched_at > NOW() - make_interval(days => $2)
                ORDER BY watched_at DESC
                LIMIT $3
                "#,
            )
            .bind(profile)
            .bind(window(window_days))
            .bind(limit(limit_n))
            .fetch_all(&mut *conn)
            .await?;

            Ok::<_, Error>(ids)
        })
        .await
    }

    #[instrument(skip(self, seed_items), fields(seeds = seed_items.len()))]
    async fn co_viewed(
        &self,
        profile_id: &str,
        seed_items: &[String],
        window_days: u32,
        limit_n: usize,
    ) -> Result<Vec<CoViewedItem>> {
        let Some(profile) = parse_id(profile_id) else {
            return Ok(Vec::new());
        };
        let seeds = parse_ids(seed_items);
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        with_timeout("co_viewed", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let rows = sqlx::query_as::<_, CoViewedItem>(
                r#"
                WITH co_viewers AS (
                    SELECT DISTINCT profile_id
                    FROM watch_history
                    WHERE content_id = ANY($1)
                      AND profile_id <> $2
                )
                SELECT wh.content_id::text AS content_id,
                       COUNT(DISTINCT wh.profile_id) AS co_occurrence,
                       AVG(CASE WHEN wh.completed THEN 1.0 ELSE 0.5 END)::float8 AS avg_rating
                FROM watch_history wh
                JOIN co_viewers cv ON cv.profile_id = wh.profile_id
                WHERE wh.watched_at > NOW() - make_interval(days => $3)
                  AND wh.content_id NOT IN (
                      SELECT content_id FROM watch_history WHERE profile_id = $2
                  )
                GROUP BY wh.content_id
                ORDER BY co_occurrence DESC, avg_rating DESC, wh.content_id::text COLLATE "C" ASC
                LIMIT $4
                "#,
            )
            .bind(seeds.as_slice())
            .bind(profile)
            .bind(window(window_days))
            .bind(limit(limit_n))
            .fetch_all(&mut *conn)
            .await?;
            Ok::<_, Error>(rows)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn top_genres(
        &self,
        profile_id: &str,
        window_days: u32,
        limit_n: usize,
    ) -> Result<Vec<GenreAffinity>> {
        let Some(profile) = parse_id(profile_id) else {
            return Ok(Vec::new());
        };

        with_timeout("top_genres", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let rows = sqlx::query_as::<_, GenreAffinity>(
                r#"
                SELECT g.genre AS genre, COUNT(*) AS watch_count
                FROM watch_history wh
                JOIN content c ON c.id = wh.content_id
                CROSS JOIN LATERAL UNNEST(c.genres) AS g(genre)
                WHERE wh.profile_id = $1
                  AND wh.watched_at > NOW() - make_interval(days => $2)
                GROUP BY g.genre
                ORDER BY watch_count DESC, g.genre COLLATE "C" ASC
                LIMIT $3
                "#,
            )
            .bind(profile)
            .bind(window(window_days))
            .bind(limit(limit_n))
            .fetch_all(&mut *conn)
            .await?;
            Ok::<_, Error>(rows)
        })
        .await
    }

    #[instrument(skip(self, genres), fields(genres = genres.len()))]
    async fn genre_candidates(
        &self,
        profile_id: &str,
        genres: &[String],
        limit_n: usize,
    ) -> Result<Vec<GenreMatch>> {
        let Some(profile) = parse_id(profile_id) else {
            return Ok(Vec::new());
        };
        if genres.is_empty() {
            return Ok(Vec::new());
        }

        with_timeout("genre_candidates", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let rows = sqlx::query_as::<_, GenreMatch>(
                r#"
                SELECT c.id::text AS content_id,
                       COUNT(*) AS genre_matches,
                       c.release_year
                FROM content c
                CROSS JOIN LATERAL UNNEST(c.genres) AS g(genre)
                WHERE g.genre = ANY($2)
                  AND c.is_published = TRUE
                  AND c.id NOT IN (
                      SELECT content_id FROM watch_history WHERE profile_id = $1
                  )
                GROUP BY c.id, c.release_year
                ORDER BY genre_matches DESC, c.release_year DESC NULLS LAST, c.id::text COLLATE "C" ASC
                LIMIT $3
                "#,
            )
            .bind(profile)
            .bind(genres)
            .bind(limit(limit_n))
            .fetch_all(&mut *conn)
            .await?;
            Ok::<_, Error>(rows)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn popular(
        &self,
        window_days: u32,
        region: Option<&str>,
        limit_n: usize,
    ) -> Result<Vec<PopularItem>> {
        with_timeout("popular", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let rows = sqlx::query_as::<_, PopularItem>(
                r#"
                SELECT wh.content_id::text AS content_id,
                       COUNT(DISTINCT wh.profile_id) AS unique_viewers,
                       AVG(CASE WHEN wh.completed THEN 1.0 ELSE 0.5 END)::float8 AS engagement_score
                FROM watch_history wh
                WHERE wh.watched_at > NOW() - make_interval(days => $1)
                  AND ($2::text IS NULL OR wh.region = $2)
                GROUP BY wh.content_id
                ORDER BY unique_viewers DESC, engagement_score DESC, wh.content_id::text COLLATE "C" ASC
                LIMIT $3
                "#,
            )
            .bind(window(window_days))
            .bind(region)
            .bind(limit(limit_n))
            .fetch_all(&mut *conn)
            .await?;
            Ok::<_, Error>(rows)
        })
        .await
    }

    #[instrument(skip(self, content_ids), fields(ids = content_ids.len()))]
    async fn content_metadata(&self, content_ids: &[String]) -> Result<Vec<ContentMetadata>> {
        let ids = parse_ids(content_ids);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        with_timeout("content_metadata", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let rows = sqlx::query_as::<_, ContentMetadata>(
                r#"
                SELECT c.id::text AS content_id,
                       c.title,
                       c.type AS content_type,
                       c.poster_url,
                       c.rating,
                       c.genres
                FROM content c
                WHERE c.id = ANY($1)
                  AND c.is_published = TRUE
                "#,
            )
            .bind(ids.as_slice())
            .fetch_all(&mut *conn)
            .await?;
            Ok::<_, Error>(rows)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn active_profiles(&self, window_days: u32, limit_n: usize) -> Result<Vec<String>> {
        with_timeout("active_profiles", self.timeout, async {
            let mut conn = self.pool.acquire().await?;
            let profiles = sqlx::query_scalar::<_, String>(
                r#"
                SELECT profile_id::text AS profile_id
                FROM watch_history
                WHERE watched_at > NOW() - make_interval(days => $1)
                GROUP BY profile_id
                ORDER BY MAX(watched_at) DESC
                LIMIT $2
                "#,
            )
            .bind(window(window_days))
            .bind(limit(limit_n))
            .fetch_all(&mut *conn)
            .await?;
            Ok::<_, Error>(profiles)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ids_skips_non_uuid_values() {
        let ids = vec![
            "6f1c1b8e-2b7a-4d55-9d0e-3c8f7f0f2a11".to_string(),
            "not-a-uuid".to_string(),
        ];
        assert_eq!(parse_ids(&ids).len(), 1);
    }

    #[test]
    fn test_window_and_limit_saturate() {
        assert_eq!(window(u32::MAX), i32::MAX);
        assert_eq!(window(90), 90);
        assert_eq!(limit(30), 30);
    }

    #[tokio::test]
    async fn test_popular_against_live_database() {
        // This test requires a running database
        if std::env::var("DATABASE_URL").is_err() {
            return;
        }

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&std::env::var("DATABASE_URL").unwrap())
            .await
            .unwrap();
        crate::database::run_migrations(&pool).await.unwrap();

        let store = PostgresInteractionStore::new(pool, Duration::from_secs(5));
        let popular = store.popular(7, None, 5).await.unwrap();
        assert!(popular.len() <= 5);
        for pair in popular.windows(2) {
            assert!(pair[0].unique_viewers >= pair[1].unique_viewers);
        }
    }
}
