use std::time::Duration;

use streamrec::config::DatabaseConfig;
use streamrec::database::{run_migrations, Database};
use streamrec::recommendation::{InteractionStore, PostgresInteractionStore};
use uuid::Uuid;

async fn insert_content(db: &Database, title: &str, genres: &[&str], published: bool) -> Uuid {
    let genres: Vec<String> = genres.iter().map(|g| g.to_string()).collect();
    sqlx::query_scalar::<_, Uuid>(
        "INSERT INTO content (title, type, genres, is_published) VALUES ($1, 'movie', $2, $3) RETURNING id",
    )
    .bind(title)
    .bind(&genres)
    .bind(published)
    .fetch_one(db.pool())
    .await
    .unwrap()
}

async fn watch(db: &Database, profile: Uuid, content: Uuid, position: i32, completed: bool) {
    sqlx::query(
        "INSERT INTO watch_history (profile_id, content_id, position, duration, completed, watched_at) \
         VALUES ($1, $2, $3, 100, $4, NOW() - INTERVAL '1 hour')",
    )
    .bind(profile)
    .bind(content)
    .bind(position)
    .bind(completed)
    .execute(db.pool())
    .await
    .unwrap();
}

#[tokio::test]
#[ignore]
async fn postgres_store_co_viewing_and_catalog() {
    // Ignored by default. Run with `cargo test -- --ignored` against a scratch database
    // named in DATABASE_URL.
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => return,
    };

    let db = Database::new(&DatabaseConfig {
        url,
        max_connections: 4,
        ..DatabaseConfig::default()
    })
    .await
    .unwrap();
    run_migrations(db.pool()).await.unwrap();
    tokio_test::assert_ok!(db.health_check().await);
    let store = PostgresInteractionStore::from_database(&db, Duration::from_secs(5));

    let c1 = insert_content(&db, "Harbor Lights", &["drama"], true).await;
    let c2 = insert_content(&db, "Low Tide", &["comedy"], true).await;
    let c3 = insert_content(&db, "North Road", &["drama"], true).await;
    let draft = insert_content(&db, "Draft", &["drama"], false).await;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    watch(&db, u1, c1, 100, true).await;
    watch(&db, u1, c2, 30, false).await;
    watch(&db, u2, c1, 100, true).await;
    watch(&db, u2, c3, 100, true).await;

    let history = store.recent_history(&u1.to_string(), 90, 50).await.unwrap();
    assert_eq!(history.len(), 2);

    let co_viewed = store
        .co_viewed(&u1.to_string(), &history, 90, 30)
        .await
        .unwrap();
    assert_eq!(co_viewed[0].content_id, c3.to_string());
    assert!(co_viewed.iter().all(|item| item.content_id != c1.to_string()));

    let genres = store.top_genres(&u1.to_string(), 90, 5).await.unwrap();
    assert!(genres.iter().any(|g| g.genre == "drama"));

    let metadata = store
        .content_metadata(&[c3.to_string(), draft.to_string(), "not-a-uuid".to_string()])
        .await
        .unwrap();
    assert_eq!(metadata.len(), 1);
    assert_eq!(metadata[0].content_id, c3.to_string());

    let unknown = store.recent_history("not-a-uuid", 90, 50).await.unwrap();
    assert!(unknown.is_empty());

    db.close().await;
}
