//! End-to-end tests of the service against a SQLite journal and a mocked
//! automation server.

use std::time::Duration;

use ferry::{App, Config, DestinationConfig};
use ferry_core::{storage::Storage, HandlerId, SessionId};
use ferry_testing::{fixtures, MockServer, MockWebhook};
use serde_json::json;

fn config_for(server: &MockServer) -> Config {
    Config {
        app_identifier: "io.ferry.e2e".to_string(),
        request_timeout_seconds: 5,
        shutdown_timeout_seconds: 5,
        destinations: vec![DestinationConfig {
            id: "home".to_string(),
            base_url: server.url(),
            webhook_path: fixtures::webhook_path("home"),
            secret: None,
            verify_tls: true,
        }],
        ..Config::default()
    }
}

async fn journaled(storage: &Storage, session_id: &SessionId) -> u64 {
    storage.transfers.count_by_session(session_id).await.unwrap()
}

#[tokio::test]
async fn delivers_to_configured_destination() {
    let server = MockServer::start().await;
    server.mock_json(&fixtures::webhook_path("home"), &json!({})).await;
    let config = config_for(&server);
    let storage = Storage::in_memory().await.unwrap();
    let app = App::start_with_storage(config.clone(), storage).await.unwrap();
    let home = config.to_destinations().remove(0);

    app.coordinator
        .send(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(1.0, 2.0))
        .await
        .unwrap();

    assert_eq!(app.check_destinations().await, 1);
    server.assert_request_count(2).await;
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn journaled_transfer_survives_restart() {
    let server = MockServer::start().await;
    server
        .mock_webhook(
            MockWebhook::success(&fixtures::webhook_path("home"))
                .with_json(&json!({}))
                .with_delay(Duration::from_secs(1)),
        )
        .await;
    let config = config_for(&server);
    let storage = Storage::in_memory().await.unwrap();
    let home = config.to_destinations().remove(0);

    let first = App::start_with_storage(config.clone(), storage.clone()).await.unwrap();
    first
        .coordinator
        .send_passive(HandlerId::LOCATION_UPDATE, &home, fixtures::location_update(1.0, 2.0))
        .await
        .unwrap();
    let session_id = first.coordinator.durable_session_id().clone();
    first.shutdown().await.unwrap();
    assert_eq!(journaled(&storage, &session_id).await, 1);

    let second = App::start_with_storage(config.clone(), storage.clone()).await.unwrap();

    let mut drained = false;
    for _ in 0..300 {
        if journaled(&storage, &session_id).await == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(drained, "journal entry was not removed after resume");
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreachable_destination_is_reported() {
    let server = MockServer::start().await;
    let mut config = config_for(&server);
    config.destinations[0].base_url = ferry_testing::unreachable_base_url();
    let app = App::start_with_storage(config, Storage::in_memory().await.unwrap()).await.unwrap();

    assert_eq!(app.check_destinations().await, 0);
    app.shutdown().await.unwrap();
}
