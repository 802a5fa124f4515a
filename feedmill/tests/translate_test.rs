// Orchestrator pipeline: detection short-circuit, cache idempotence, echo
// post-check, and degradation to the free provider at the usage limit.

mod util;

use feedmill::ratelimit::Priority;
use feedmill::translate::{TranslateRequest, REASON_ALREADY_TARGET, REASON_EQUALS_ORIGINAL};

fn request(text: &str, target: &str) -> TranslateRequest {
    TranslateRequest {
        text: text.to_string(),
        target_lang: target.to_string(),
        source_lang: None,
        priority: Priority::High,
        markdown: false,
    }
}

#[tokio::test]
async fn second_identical_translation_is_a_cache_hit() {
    let store = util::test_store().await;
    let user_id = util::create_active_user(&store, "cache").await;

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", mockito::Matcher::Any)
        .with_status(200)
        .with_body(r#"[[["Bonjour","Hello",null]],null,"en"]"#)
        .expect(1)
        .create_async()
        .await;

    let orchestrator =
        util::orchestrator_with_free_endpoint(store.clone(), util::test_secrets(), &server.url(), 0);

    let first = orchestrator
        .translate(user_id, &request("Hello", "fr"))
        .await
        .expect("first translation");
    assert!(!first.skipped);
    assert!(!first.cached);
    assert_eq!(first.translated_text, "Bonjour");

    let second = orchestrator
        .translate(user_id, &request("Hello", "fr"))
        .await
        .expect("second translation");
    assert!(second.cached, "second call must come from the cache");
    assert_eq!(second.translated_text, "Bonjour");

    // Exactly one provider HTTP call, one cache row.
    mock.assert_async().await;
    assert_eq!(store.translation_cache_count().await.unwrap(), 1);
}

#[tokio::test]
async fn text_already_in_target_language_is_skipped() {
    let store = util::test_store().await;
    let user_id = util::create_active_user(&store, "already").await;

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", mockito::Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let orchestrator =
        util::orchestrator_with_free_endpoint(store.clone(), util::test_secrets(), &server.url(), 0);

    let text = "你好，这是一段比较长的中文文本，用来测试语言检测。";
    let outcome = orchestrator
        .translate(user_id, &request(text, "zh"))
        .await
        .expect("translate");
    assert!(outcome.skipped);
    assert_eq!(outcome.reason, Some(REASON_ALREADY_TARGET));
    assert_eq!(outcome.translated_text, text);

    // No provider traffic and no usage increment.
    mock.assert_async().await;
    let (used, _) = store.usage_for(user_id).await.unwrap();
    assert_eq!(used, 0);
}

#[tokio::test]
async fn provider_echo_is_treated_as_skipped() {
    let store = util::test_store().await;
    let user_id = util::create_active_user(&store, "echo").await;

    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", mockito::Matcher::Any)
        .with_status(200)
        // Echoes the original text back.
        .with_body(r#"[[["bonjour tout le monde","bonjour tout le monde",null]],null,"fr"]"#)
        .create_async()
        .await;

    let orchestrator =
        util::orchestrator_with_free_endpoint(store.clone(), util::test_secrets(), &server.url(), 0);

    let outcome = orchestrator
        .translate(user_id, &request("bonjour tout le monde", "en"))
        .await
        .expect("translate");
    assert!(outcome.skipped);
    assert_eq!(outcome.reason, Some(REASON_EQUALS_ORIGINAL));
    // Nothing is cached for an echo.
    assert_eq!(store.translation_cache_count().await.unwrap(), 0);
}

#[tokio::test]
async fn at_usage_limit_the_free_provider_carries_the_call() {
    let store = util::test_store().await;
    let user_id = util::create_active_user(&store, "limited").await;
    let secrets = util::test_secrets();

    // An AI endpoint that must never be called.
    let mut ai_server = mockito::Server::new_async().await;
    let ai_mock = ai_server
        .mock("POST", mockito::Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let key_enc = secrets.encrypt("sk-test").unwrap();
    let ai_endpoint = format!("{}/v1/chat/completions", ai_server.url());
    store
        .create_ai_profile(
            user_id,
            "default",
            Some(key_enc.as_str()),
            Some(ai_endpoint.as_str()),
            Some("test-model"),
            None,
            true,
        )
        .await
        .unwrap();

    // Soft limit 10, already used 20.
    store.set_usage_limit(user_id, 10).await.unwrap();
    store.add_usage(user_id, 20).await.unwrap();

    let mut free_server = mockito::Server::new_async().await;
    let free_mock = free_server
        .mock("GET", mockito::Matcher::Any)
        .with_status(200)
        .with_body(r#"[[["Bonjour","Hello",null]],null,"en"]"#)
        .create_async()
        .await;

    let orchestrator =
        util::orchestrator_with_free_endpoint(store.clone(), secrets, &free_server.url(), 0);

    let outcome = orchestrator
        .translate(user_id, &request("Hello", "fr"))
        .await
        .expect("translate");
    assert!(!outcome.skipped);
    assert_eq!(outcome.translated_text, "Bonjour");
    assert_eq!(outcome.provider.as_deref(), Some("free"));
    assert!(outcome.limit_reached, "response must flag the reached limit");

    ai_mock.assert_async().await;
    free_mock.assert_async().await;

    // The free call does not increase AI usage.
    let (used, _) = store.usage_for(user_id).await.unwrap();
    assert_eq!(used, 20);
}
