// Outbound sync: the immediate path queues on failure, the drain delivers
// with at-least-once semantics and dead-letters after too many attempts.

mod util;

use chrono::Utc;
use feedmill::ingest::Ingestor;
use feedmill::sources::FetchedItem;
use feedmill::store::NewSource;
use feedmill::sync::{Action, SyncLayer};

async fn setup_synced_user(
    store: &feedmill::store::Store,
    secrets: &feedmill::secrets::SecretBox,
    endpoint: &str,
) -> (i64, i64) {
    let user_id = util::create_active_user(store, "syncer").await;
    let password_enc = secrets.encrypt("aggregator-pass").unwrap();
    store
        .save_settings(
            user_id,
            &serde_json::json!({
                "sync": {
                    "enabled": true,
                    "endpoint": endpoint,
                    "username": "syncer",
                    "password_enc": password_enc,
                }
            }),
        )
        .await
        .unwrap();

    let source_id = store
        .create_source(
            user_id,
            &NewSource {
                kind: "external".to_string(),
                url: format!("{}/stream", endpoint),
                params_json: Some(r#"{"stream_id":"feed/1"}"#.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let ingestor = Ingestor::new(store.clone(), None);
    ingestor
        .ingest(
            user_id,
            source_id,
            vec![FetchedItem {
                title: "Synced item".to_string(),
                url: Some("https://example.com/synced".to_string()),
                published_at: Some(Utc::now()),
                external_id: Some("tag:google.com,2005:reader/item/0001".to_string()),
                ..Default::default()
            }],
        )
        .await
        .unwrap();

    (user_id, source_id)
}

#[tokio::test]
async fn failed_immediate_push_lands_in_the_queue() {
    let store = util::test_store().await;
    let secrets = util::test_secrets();

    // Aggregator is down: login answers 500.
    let mut server = mockito::Server::new_async().await;
    let _login = server
        .mock("POST", "/accounts/ClientLogin")
        .with_status(500)
        .create_async()
        .await;

    let (user_id, _) = setup_synced_user(&store, &secrets, &server.url()).await;
    let item = &store
        .list_items(user_id, &Default::default())
        .await
        .unwrap()[0];

    let sync = SyncLayer::new(store.clone(), secrets.clone());
    sync.push_flag_change(
        user_id,
        item.id,
        item.url.as_deref(),
        item.external_id.as_deref(),
        Action::MarkFavorite,
    )
    .await;

    let ops = store.pending_sync_ops(user_id, 10).await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].action, "mark_favorite");
    assert_eq!(ops[0].attempts, 0);
}

#[tokio::test]
async fn drain_delivers_queued_ops_after_recovery() {
    let store = util::test_store().await;
    let secrets = util::test_secrets();

    let mut server = mockito::Server::new_async().await;
    let (user_id, _) = setup_synced_user(&store, &secrets, &server.url()).await;
    let item = &store
        .list_items(user_id, &Default::default())
        .await
        .unwrap()[0];

    // Queue an op directly, as if an immediate push had failed earlier.
    store
        .enqueue_sync_op(
            user_id,
            item.id,
            item.url.as_deref(),
            "mark_read",
            item.external_id.as_deref(),
        )
        .await
        .unwrap();

    // Aggregator has recovered.
    let _login = server
        .mock("POST", "/accounts/ClientLogin")
        .with_status(200)
        .with_body("Auth=t\n")
        .create_async()
        .await;
    let _token = server
        .mock("GET", "/reader/api/0/token")
        .with_status(200)
        .with_body("T1")
        .create_async()
        .await;
    let edit = server
        .mock("POST", "/reader/api/0/edit-tag")
        .with_status(200)
        .with_body("OK")
        .create_async()
        .await;

    let sync = SyncLayer::new(store.clone(), secrets.clone());
    sync.drain_outbound().await.expect("drain");

    edit.assert_async().await;
    assert_eq!(store.count_sync_ops(user_id).await.unwrap(), 0, "op deleted on success");
}

#[tokio::test]
async fn inbound_pull_does_not_clobber_queued_local_flags() {
    let store = util::test_store().await;
    let secrets = util::test_secrets();

    let mut server = mockito::Server::new_async().await;
    let _login = server
        .mock("POST", "/accounts/ClientLogin")
        .with_status(200)
        .with_body("Auth=t\n")
        .create_async()
        .await;
    // The remote unread list does not contain the item: the user's unread
    // toggle has not reached the aggregator yet.
    let _stream = server
        .mock(
            "GET",
            mockito::Matcher::Regex(r"^/reader/api/0/stream/contents/.*".to_string()),
        )
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"items":[]}"#)
        .create_async()
        .await;

    let (user_id, _source_id) = setup_synced_user(&store, &secrets, &server.url()).await;
    let item = store
        .list_items(user_id, &Default::default())
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert!(!item.read);

    // The user marked the item unread while the aggregator was down; the
    // op is still waiting for the next drain.
    store
        .enqueue_sync_op(
            user_id,
            item.id,
            item.url.as_deref(),
            "mark_unread",
            item.external_id.as_deref(),
        )
        .await
        .unwrap();

    let sync = SyncLayer::new(store.clone(), secrets.clone());
    let ingestor = Ingestor::new(store.clone(), None);
    sync.pull_inbound(user_id, &ingestor).await.expect("pull");

    let refreshed = store.item_by_id(user_id, item.id).await.unwrap();
    assert!(
        !refreshed.read,
        "a flag change still queued outbound must not be overwritten by inbound sync"
    );
}

#[tokio::test]
async fn inbound_pull_reconciles_untouched_items_and_inserts_remote_ones() {
    let store = util::test_store().await;
    let secrets = util::test_secrets();

    let mut server = mockito::Server::new_async().await;
    let _login = server
        .mock("POST", "/accounts/ClientLogin")
        .with_status(200)
        .with_body("Auth=t\n")
        .create_async()
        .await;
    // The known local item (item/0001) is absent from the remote unread
    // list (read elsewhere); a brand-new remote item (item/0002) is
    // present.
    let _stream = server
        .mock(
            "GET",
            mockito::Matcher::Regex(r"^/reader/api/0/stream/contents/.*".to_string()),
        )
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"items":[{"id":"tag:google.com,2005:reader/item/0002",
                "title":"Fresh remote item",
                "published":1704103200,
                "canonical":[{"href":"https://example.com/r2"}],
                "summary":{"content":"<p>remote body</p>"}}]}"#,
        )
        .create_async()
        .await;

    let (user_id, _source_id) = setup_synced_user(&store, &secrets, &server.url()).await;
    let item = store
        .list_items(user_id, &Default::default())
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert!(!item.read);

    let sync = SyncLayer::new(store.clone(), secrets.clone());
    let ingestor = Ingestor::new(store.clone(), None);
    sync.pull_inbound(user_id, &ingestor).await.expect("pull");

    // No queued op: remote read-state wins for the untouched item.
    let refreshed = store.item_by_id(user_id, item.id).await.unwrap();
    assert!(refreshed.read, "untouched item read remotely must be marked read locally");

    // The remote-only item was ingested with its external id.
    let inserted = store
        .item_by_external_id(user_id, "tag:google.com,2005:reader/item/0002")
        .await
        .unwrap()
        .expect("remote item inserted");
    assert_eq!(inserted.title, "Fresh remote item");
}

#[tokio::test]
async fn ops_dead_letter_after_exhausting_attempts() {
    let store = util::test_store().await;
    let secrets = util::test_secrets();

    let mut server = mockito::Server::new_async().await;
    let _login = server
        .mock("POST", "/accounts/ClientLogin")
        .with_status(500)
        .create_async()
        .await;

    let (user_id, _) = setup_synced_user(&store, &secrets, &server.url()).await;
    let item = &store
        .list_items(user_id, &Default::default())
        .await
        .unwrap()[0];
    let op_id = store
        .enqueue_sync_op(
            user_id,
            item.id,
            item.url.as_deref(),
            "mark_read",
            item.external_id.as_deref(),
        )
        .await
        .unwrap();

    // Ten failed attempts keep the op queued; the eleventh drops it.
    for _ in 0..10 {
        let attempts = store.bump_sync_attempts(op_id).await.unwrap();
        assert!(attempts <= 10);
    }
    assert_eq!(store.count_sync_ops(user_id).await.unwrap(), 1);

    let sync = SyncLayer::new(store.clone(), secrets.clone());
    sync.drain_outbound().await.expect("drain");
    assert_eq!(
        store.count_sync_ops(user_id).await.unwrap(),
        0,
        "op past the attempt cap is dead-lettered"
    );
}
