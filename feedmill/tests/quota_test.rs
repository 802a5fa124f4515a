// Quota enforcement at the storage boundaries: feed caps, article caps,
// and the progressive cleanup that runs ahead of large batches.

mod util;

use chrono::{Duration, Utc};
use feedmill::ingest::Ingestor;
use feedmill::sources::FetchedItem;
use feedmill::store::NewSource;

fn rss(url: &str) -> NewSource {
    NewSource {
        kind: "rss".to_string(),
        url: url.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn third_feed_exceeds_a_two_feed_quota() {
    let store = util::test_store().await;
    let user_id = util::create_active_user(&store, "u1").await;
    let mut quota = store.quota_for(user_id).await.unwrap();
    quota.max_feeds = 2;
    store.update_quota(user_id, &quota).await.unwrap();

    store
        .create_source(user_id, &rss("https://example.com/a.xml"))
        .await
        .expect("feed A");
    store
        .create_source(user_id, &rss("https://example.com/b.xml"))
        .await
        .expect("feed B");

    let err = store
        .create_source(user_id, &rss("https://example.com/c.xml"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "QUOTA_EXCEEDED");
    assert_eq!(err.detail().as_deref(), Some("feeds"));
}

#[tokio::test]
async fn duplicate_source_url_conflicts() {
    let store = util::test_store().await;
    let user_id = util::create_active_user(&store, "dup").await;
    store
        .create_source(user_id, &rss("https://example.com/a.xml"))
        .await
        .unwrap();
    let err = store
        .create_source(user_id, &rss("https://example.com/a.xml"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");

    // A different user can subscribe to the same URL.
    let other = util::create_active_user(&store, "dup2").await;
    store
        .create_source(other, &rss("https://example.com/a.xml"))
        .await
        .expect("other user same url");
}

#[tokio::test]
async fn article_count_never_exceeds_the_cap() {
    let store = util::test_store().await;
    let user_id = util::create_active_user(&store, "cap").await;
    let mut quota = store.quota_for(user_id).await.unwrap();
    quota.max_articles = 5;
    store.update_quota(user_id, &quota).await.unwrap();

    let source_id = store
        .create_source(user_id, &rss("https://example.com/a.xml"))
        .await
        .unwrap();
    let ingestor = Ingestor::new(store.clone(), None);

    let items: Vec<FetchedItem> = (0..8)
        .map(|i| FetchedItem {
            title: format!("Item {}", i),
            published_at: Some(Utc::now() - Duration::hours(i)),
            ..Default::default()
        })
        .collect();

    let err = ingestor.ingest(user_id, source_id, items).await.unwrap_err();
    assert_eq!(err.code(), "QUOTA_EXCEEDED");
    assert_eq!(err.detail().as_deref(), Some("articles"));

    // Partial work up to the cap is retained, never more.
    let count = store.count_items(user_id).await.unwrap();
    assert_eq!(count, 5);
}

#[tokio::test]
async fn large_batch_near_storage_cap_triggers_cleanup() {
    let store = util::test_store().await;
    let user_id = util::create_active_user(&store, "storage").await;
    // 1 MB storage cap.
    let mut quota = store.quota_for(user_id).await.unwrap();
    quota.max_storage_mb = 1;
    quota.max_articles = 0;
    store.update_quota(user_id, &quota).await.unwrap();

    let source_id = store
        .create_source(user_id, &rss("https://example.com/a.xml"))
        .await
        .unwrap();
    let ingestor = Ingestor::new(store.clone(), None);

    // Fill to ~95% of the cap with old, unpinned items.
    let body = "x".repeat(100 * 1024);
    let old: Vec<FetchedItem> = (0..10)
        .map(|i| FetchedItem {
            title: format!("Old {}", i),
            content: Some(body.clone()),
            published_at: Some(Utc::now() - Duration::days(30 + i)),
            ..Default::default()
        })
        .collect();
    ingestor.ingest(user_id, source_id, old).await.expect("seed");

    let cap_bytes = 1024 * 1024;
    let used_before = store.storage_bytes(user_id).await.unwrap();
    assert!(used_before * 10 >= cap_bytes * 9, "seeded within 10% of cap");

    // A >10-item batch fires the progressive cleanup before inserting.
    let fresh: Vec<FetchedItem> = (0..11)
        .map(|i| FetchedItem {
            title: format!("Fresh {}", i),
            published_at: Some(Utc::now() - Duration::hours(i)),
            ..Default::default()
        })
        .collect();
    ingestor.ingest(user_id, source_id, fresh).await.expect("large batch");

    let used_after = store.storage_bytes(user_id).await.unwrap();
    assert!(
        used_after * 10 <= cap_bytes * 9,
        "post-insert usage {}B must be at most 90% of the {}B cap",
        used_after,
        cap_bytes
    );
}

#[tokio::test]
async fn favorites_survive_cleanup() {
    let store = util::test_store().await;
    let user_id = util::create_active_user(&store, "fav").await;
    let source_id = store
        .create_source(user_id, &rss("https://example.com/a.xml"))
        .await
        .unwrap();
    let ingestor = Ingestor::new(store.clone(), None);

    let ids = ingestor
        .ingest(
            user_id,
            source_id,
            vec![
                FetchedItem {
                    title: "Keep me".to_string(),
                    content: Some("pinned".repeat(100)),
                    published_at: Some(Utc::now() - Duration::days(100)),
                    ..Default::default()
                },
                FetchedItem {
                    title: "Drop me".to_string(),
                    content: Some("victim".repeat(100)),
                    published_at: Some(Utc::now() - Duration::days(99)),
                    ..Default::default()
                },
            ],
        )
        .await
        .unwrap();
    store.toggle_favorite(user_id, ids[0]).await.unwrap();

    // Cleaning to zero bytes can only remove the unpinned item.
    store.cleanup_to_target(user_id, 0).await.unwrap();
    let remaining = store
        .list_items(user_id, &feedmill::store::items::ItemFilter {
            filter: Some("favorites".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].title, "Keep me");
    assert_eq!(store.count_items(user_id).await.unwrap(), 1);
}
