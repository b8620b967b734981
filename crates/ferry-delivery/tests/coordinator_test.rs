//! End-to-end coordinator tests against a mocked automation server.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ferry_core::{ClientEventKind, Clock, HandlerId, Request};
use ferry_delivery::{
    codec::ENCRYPTED_DATA_FIELD, ClientConfig, DeliveryError, ResponseBody, SecretKey,
    SessionKind,
};
use ferry_testing::{fixtures, unreachable_base_url, JournalEntryBuilder, MockWebhook, TestEnv};
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;

async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn send_delivers_request_and_handles_response() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock.mock_json(&home.webhook_path, &json!({})).await;
    let coordinator = env.coordinator().unwrap();

    coordinator
        .send(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(1.5, 2.5))
        .await
        .unwrap();

    assert_eq!(env.http_mock.received_json().await, vec![json!({
        "type": "update_location",
        "data": {"gps": [1.5, 2.5], "gps_accuracy": 10}
    })]);
    assert!(env.journal.is_empty().await);
    assert!(env.lifetime.reasons().contains(&"webhook send".to_owned()));
    assert!(coordinator.outstanding_transfers().await.unwrap().is_empty());
}

#[tokio::test]
async fn error_status_is_definitive_and_logged() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock.mock_status(&home.webhook_path, StatusCode::NOT_FOUND).await;
    let coordinator = env.coordinator().unwrap();

    let err = coordinator
        .send(HandlerId::SERVICE_CALL, &home, fixtures::service_call("light", "turn_on"))
        .await
        .unwrap_err();

    assert!(matches!(err, DeliveryError::UnacceptableStatus { status_code: 404 }));
    env.http_mock.assert_request_count(1).await;
    assert_eq!(env.events.events_of(ClientEventKind::NetworkRequest).len(), 1);
    assert!(env.journal.is_empty().await);
}

#[tokio::test]
async fn transport_failure_falls_back_to_durable_session() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock
        .mock_webhook(
            MockWebhook::success(&home.webhook_path)
                .with_delay(Duration::from_secs(2))
                .times(1)
                .priority(1),
        )
        .await;
    env.http_mock
        .mock_webhook(MockWebhook::success(&home.webhook_path).with_json(&json!({})).priority(2))
        .await;

    let mut config = env.config();
    config.client = ClientConfig { timeout: Duration::from_millis(300), ..ClientConfig::default() };
    let coordinator = env.coordinator_builder_with(config).build().unwrap();

    coordinator
        .send(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(1.0, 2.0))
        .await
        .unwrap();

    env.http_mock.assert_request_count(2).await;
    assert!(env.journal.is_empty().await);
}

#[tokio::test]
async fn durable_transfer_retries_until_response() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock
        .mock_webhook(
            MockWebhook::success(&home.webhook_path)
                .with_delay(Duration::from_secs(2))
                .times(2)
                .priority(1),
        )
        .await;
    env.http_mock
        .mock_webhook(MockWebhook::success(&home.webhook_path).with_json(&json!({})).priority(2))
        .await;

    let mut config = env.config();
    config.client = ClientConfig { timeout: Duration::from_millis(300), ..ClientConfig::default() };
    let coordinator =
        env.coordinator_builder_with(config).durable_immediately(true).build().unwrap();
    let started = env.clock.now();

    coordinator
        .send(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(1.0, 2.0))
        .await
        .unwrap();

    env.http_mock.assert_request_count(3).await;
    assert!(env.journal.is_empty().await);
    // Backoff of 1s then 2s, driven by the test clock.
    assert!(env.clock.now() - started >= chrono::Duration::seconds(3));
}

#[tokio::test]
async fn durable_transfer_gives_up_after_max_attempts() {
    let mut env = TestEnv::new().await;
    let mut home = env.destination("home");
    home.base_url = unreachable_base_url();
    env.register(home.clone());

    let coordinator = env.coordinator_builder().durable_immediately(true).build().unwrap();

    let err = coordinator
        .send(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(1.0, 2.0))
        .await
        .unwrap_err();

    assert!(err.is_retryable(), "expected transport error, got {err}");
    assert!(env.journal.is_empty().await);
}

#[tokio::test]
async fn newer_location_update_replaces_outstanding_one() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock
        .mock_webhook(
            MockWebhook::success(&home.webhook_path)
                .with_json(&json!({}))
                .with_delay(Duration::from_millis(500)),
        )
        .await;
    let coordinator = env.coordinator().unwrap();

    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        let home = home.clone();
        async move {
            coordinator
                .send(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(1.0, 1.0))
                .await
        }
    });
    assert!(
        eventually(|| async { coordinator.outstanding_transfers().await.unwrap().len() == 1 })
            .await
    );

    coordinator
        .send(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(2.0, 2.0))
        .await
        .unwrap();

    let first = first.await.unwrap();
    assert!(matches!(first, Err(DeliveryError::Replaced)), "got {first:?}");
    assert!(first.unwrap_err().is_cancelled());
}

#[tokio::test]
async fn durable_replacement_removes_journal_entry() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock
        .mock_webhook(
            MockWebhook::success(&home.webhook_path)
                .with_json(&json!({}))
                .with_delay(Duration::from_millis(500)),
        )
        .await;
    let coordinator = env.coordinator_builder().durable_immediately(true).build().unwrap();

    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        let home = home.clone();
        async move {
            coordinator
                .send(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(1.0, 1.0))
                .await
        }
    });
    assert!(eventually(|| async { env.journal.len().await == 1 }).await);
    let replaced = env.journal.entries().await[0].transfer_id;

    coordinator
        .send(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(2.0, 2.0))
        .await
        .unwrap();

    let first = first.await.unwrap();
    assert!(matches!(first, Err(DeliveryError::Replaced)), "got {first:?}");
    assert!(env.journal.get(replaced).await.is_none());
    assert!(eventually(|| async { env.journal.is_empty().await }).await);
}

#[tokio::test]
async fn durable_transfer_with_unreadable_correlation_is_cancelled() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock
        .mock_webhook(
            MockWebhook::success(&home.webhook_path)
                .with_json(&json!({}))
                .with_delay(Duration::from_millis(500)),
        )
        .await;
    let orphan = JournalEntryBuilder::new(env.durable_session_id(), home.clone())
        .raw_correlation(STANDARD.encode("not json"))
        .created_at(env.clock.now())
        .build()
        .unwrap();
    env.journal.seed(orphan).await;
    let coordinator = env.coordinator().unwrap();
    assert_eq!(coordinator.resume().await.unwrap(), 1);

    coordinator
        .send(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(1.0, 2.0))
        .await
        .unwrap();

    assert!(eventually(|| async { env.journal.is_empty().await }).await);
    assert!(env.events.events_of(ClientEventKind::NetworkRequest).iter().any(|event| {
        event.text == "Cancelled webhook transfer with unreadable correlation"
            && event.payload["category"] == "correlation"
    }));
    assert!(coordinator.outstanding_transfers().await.unwrap().is_empty());
}

#[tokio::test]
async fn completion_for_unknown_destination_is_dropped() {
    let env = TestEnv::new().await;
    let ghost = fixtures::destination("ghost", &env.http_mock.url());
    env.http_mock.mock_json(&ghost.webhook_path, &json!({})).await;
    let entry = JournalEntryBuilder::new(env.durable_session_id(), ghost)
        .request(
            HandlerId::SERVICE_CALL,
            fixtures::service_call_with_notification("lock", "unlock", "Door unlocked"),
        )
        .created_at(env.clock.now())
        .build()
        .unwrap();
    env.journal.seed(entry).await;
    let coordinator = env.coordinator().unwrap();

    assert_eq!(coordinator.resume().await.unwrap(), 1);

    assert!(eventually(|| async { env.journal.is_empty().await }).await);
    assert!(
        eventually(|| async {
            env.events.events_of(ClientEventKind::NetworkRequest).iter().any(|event| {
                event.text == "Dropped webhook response that cannot be dispatched"
                    && event.payload["category"] == "correlation"
            })
        })
        .await
    );
    env.http_mock.assert_request_count(1).await;
    assert!(env.notifications.delivered().is_empty());
}

#[tokio::test]
async fn service_calls_do_not_replace_each_other() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock
        .mock_webhook(
            MockWebhook::success(&home.webhook_path)
                .with_json(&json!({}))
                .with_delay(Duration::from_millis(200)),
        )
        .await;
    let coordinator = env.coordinator().unwrap();

    let (a, b) = tokio::join!(
        coordinator.send(HandlerId::SERVICE_CALL, &home, fixtures::service_call("light", "on")),
        coordinator.send(HandlerId::SERVICE_CALL, &home, fixtures::service_call("light", "off")),
    );

    a.unwrap();
    b.unwrap();
    env.http_mock.assert_request_count(2).await;
}

#[tokio::test]
async fn unregistered_handler_is_rejected_before_sending() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    let coordinator = env.coordinator().unwrap();

    let err = coordinator
        .send(HandlerId::new("unknown"), &home, Request::new("ping", json!({})))
        .await
        .unwrap_err();

    assert!(matches!(err, DeliveryError::UnregisteredHandler { handler_id } if handler_id == "unknown"));
    env.http_mock.assert_request_count(0).await;
}

#[tokio::test]
async fn service_call_notification_reaches_sink() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock.mock_json(&home.webhook_path, &json!({})).await;
    let coordinator = env.coordinator().unwrap();

    coordinator
        .send(
            HandlerId::SERVICE_CALL,
            &home,
            fixtures::service_call_with_notification("scene", "turn_on", "Movie time"),
        )
        .await
        .unwrap();

    let delivered = env.notifications.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].body, "Movie time");
    assert_eq!(delivered[0].title.as_deref(), Some("scene.turn_on"));
    assert_eq!(env.events.events_of(ClientEventKind::Notification).len(), 1);
    // Local metadata never leaves the device.
    assert!(env.http_mock.received_json().await[0].get("local_metadata").is_none());
}

#[tokio::test]
async fn passive_send_returns_once_journaled() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock
        .mock_webhook(
            MockWebhook::success(&home.webhook_path)
                .with_json(&json!({}))
                .with_delay(Duration::from_millis(300)),
        )
        .await;
    let coordinator = env.coordinator().unwrap();

    coordinator
        .send_passive(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(3.0, 4.0))
        .await
        .unwrap();

    let outstanding = coordinator.outstanding_transfers().await.unwrap();
    assert_eq!(outstanding.len(), 1);
    assert_eq!(outstanding[0].kind, SessionKind::Durable);
    assert!(outstanding[0].correlation.is_some());

    assert!(eventually(|| async { env.journal.is_empty().await }).await);
    env.http_mock.assert_request_count(1).await;
    assert!(env.lifetime.reasons().contains(&"webhook passive send".to_owned()));
}

#[tokio::test]
async fn passive_send_failure_is_recorded_as_client_event() {
    let mut env = TestEnv::new().await;
    let mut home = env.destination("home");
    home.base_url = unreachable_base_url();
    env.register(home.clone());
    let coordinator = env.coordinator().unwrap();

    coordinator
        .send_passive(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(3.0, 4.0))
        .await
        .unwrap();

    assert!(
        eventually(|| async {
            env.events.events_of(ClientEventKind::NetworkRequest).iter().any(|event| {
                event.text == "Background webhook request failed"
                    && event.payload["category"] == "transport"
            })
        })
        .await
    );
    assert!(eventually(|| async { env.journal.is_empty().await }).await);
}

#[tokio::test]
async fn passive_send_reports_journal_failure() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.journal.inject_insert_error("disk full").await;
    let coordinator = env.coordinator().unwrap();

    let err = coordinator
        .send_passive(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(3.0, 4.0))
        .await
        .unwrap_err();

    assert!(matches!(err, DeliveryError::Storage { .. }));
    env.http_mock.assert_request_count(0).await;
}

#[derive(Debug, Deserialize)]
struct RemoteConfig {
    version: String,
}

#[tokio::test]
async fn ephemeral_send_returns_decoded_body_without_correlation() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock
        .mock_webhook(
            MockWebhook::success(&home.webhook_path)
                .with_json(&json!({"version": "2024.1"}))
                .with_delay(Duration::from_millis(300)),
        )
        .await;
    let coordinator = env.coordinator().unwrap();

    let pending = tokio::spawn({
        let coordinator = coordinator.clone();
        let home = home.clone();
        async move {
            coordinator
                .send_ephemeral_as::<RemoteConfig>(&home, Request::new("get_config", json!({})))
                .await
        }
    });
    assert!(
        eventually(|| async { !coordinator.outstanding_transfers().await.unwrap().is_empty() })
            .await
    );
    let outstanding = coordinator.outstanding_transfers().await.unwrap();

    assert_eq!(outstanding[0].kind, SessionKind::Immediate);
    assert!(outstanding[0].correlation.is_none());
    assert_eq!(pending.await.unwrap().unwrap().version, "2024.1");
    assert!(env.journal.is_empty().await);
}

#[tokio::test]
async fn ephemeral_send_opens_sealed_response() {
    let mut env = TestEnv::new().await;
    let home = env.sealed_destination("home", "correct horse battery staple");
    let key = SecretKey::from_secret("correct horse battery staple");
    let sealed = key.seal(br#"{"ok":true}"#).unwrap();
    env.http_mock
        .mock_json(&home.webhook_path, &json!({ "encrypted_data": STANDARD.encode(sealed) }))
        .await;
    let coordinator = env.coordinator().unwrap();

    let body = coordinator.send_ephemeral(&home, Request::new("ping", json!({"n": 1}))).await.unwrap();

    assert_eq!(body, ResponseBody::Json(json!({"ok": true})));
    let sent = &env.http_mock.received_json().await[0];
    assert_eq!(sent["type"], "ping");
    assert_eq!(sent["encrypted"], true);
    assert!(sent.get("data").is_none());
    let opened = key.open(&STANDARD.decode(sent[ENCRYPTED_DATA_FIELD].as_str().unwrap()).unwrap());
    assert_eq!(opened.unwrap(), br#"{"n":1}"#);
}

#[tokio::test]
async fn send_test_targets_alternate_base_url() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock.mock_json(&home.webhook_path, &json!({"components": []})).await;
    let coordinator = env.coordinator().unwrap();

    let reachable = coordinator.send_test(&home, &env.http_mock.url()).await;
    let unreachable = coordinator.send_test(&home, &unreachable_base_url()).await;

    reachable.unwrap();
    assert!(unreachable.unwrap_err().is_retryable());
    assert_eq!(env.http_mock.received_json().await, vec![json!({"type": "get_config", "data": {}})]);
}

#[tokio::test]
async fn resume_restarts_journaled_transfers() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock.mock_json(&home.webhook_path, &json!({})).await;
    let entry = JournalEntryBuilder::new(env.durable_session_id(), home.clone())
        .request(
            HandlerId::SERVICE_CALL,
            fixtures::service_call_with_notification("lock", "unlock", "Door unlocked"),
        )
        .attempts(3)
        .created_at(env.clock.now())
        .build()
        .unwrap();
    env.journal.seed(entry).await;
    let coordinator = env.coordinator().unwrap();

    assert_eq!(coordinator.resume().await.unwrap(), 1);

    assert!(eventually(|| async { env.journal.is_empty().await }).await);
    assert!(eventually(|| async { env.notifications.delivered().len() == 1 }).await);
    env.http_mock.assert_request_count(1).await;
}

#[tokio::test]
async fn resume_discards_unsupported_entries() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    let entry = JournalEntryBuilder::new(env.durable_session_id(), home)
        .version(99)
        .build()
        .unwrap();
    env.journal.seed(entry).await;
    let coordinator = env.coordinator().unwrap();

    assert_eq!(coordinator.resume().await.unwrap(), 0);
    assert!(eventually(|| async { env.journal.is_empty().await }).await);
    env.http_mock.assert_request_count(0).await;
}

#[tokio::test]
async fn background_wake_for_previous_session_completes_once_handled() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock.mock_json(&home.webhook_path, &json!({})).await;
    let entry = JournalEntryBuilder::new("webhook-previous", home)
        .created_at(env.clock.now())
        .build()
        .unwrap();
    env.journal.seed(entry).await;
    let coordinator = env.coordinator().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = oneshot::channel();

    coordinator
        .handle_background_wake("webhook-previous", {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            }
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), done_rx).await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(env.journal.is_empty().await);
    assert!(coordinator.outstanding_transfers().await.unwrap().is_empty());
}

#[tokio::test]
async fn background_wake_on_idle_session_completes_immediately() {
    let env = TestEnv::new().await;
    let coordinator = env.coordinator().unwrap();
    let (done_tx, done_rx) = oneshot::channel();

    coordinator
        .handle_background_wake(&env.durable_session_id(), move || {
            let _ = done_tx.send(());
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), done_rx).await.unwrap().unwrap();
}

#[tokio::test]
async fn background_wake_rejects_foreign_identifiers() {
    let env = TestEnv::new().await;
    let coordinator = env.coordinator().unwrap();

    let err = coordinator.handle_background_wake("com.other.download", || {}).await.unwrap_err();

    assert!(matches!(err, DeliveryError::Configuration { .. }));
}

#[tokio::test]
async fn shutdown_keeps_durable_transfers_journaled() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock
        .mock_webhook(
            MockWebhook::success(&home.webhook_path)
                .with_json(&json!({}))
                .with_delay(Duration::from_secs(1)),
        )
        .await;
    let coordinator = env.coordinator().unwrap();

    coordinator
        .send_passive(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(5.0, 6.0))
        .await
        .unwrap();
    coordinator.shutdown().await.unwrap();

    assert_eq!(env.journal.len().await, 1);
    let err = coordinator
        .send(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(5.0, 6.0))
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::ShutdownRequested));
}

#[tokio::test]
async fn shutdown_resolves_pending_waiters() {
    let mut env = TestEnv::new().await;
    let home = env.destination("home");
    env.http_mock
        .mock_webhook(
            MockWebhook::success(&home.webhook_path)
                .with_json(&json!({}))
                .with_delay(Duration::from_secs(1)),
        )
        .await;
    let coordinator = env.coordinator().unwrap();

    let pending = tokio::spawn({
        let coordinator = coordinator.clone();
        let home = home.clone();
        async move { coordinator.send_ephemeral(&home, Request::new("ping", json!({}))).await }
    });
    assert!(
        eventually(|| async { !coordinator.outstanding_transfers().await.unwrap().is_empty() })
            .await
    );
    coordinator.shutdown().await.unwrap();

    assert!(matches!(pending.await.unwrap(), Err(DeliveryError::ShutdownRequested)));
}
