// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RAS emission tests: failures never reach the caller.

mod common;

use std::sync::Arc;

use common::{Failure, FailingGateway, TestStore, count, identity, ras_count};
use dai_core::RasEventEmitter;
use dai_core::gateway::{GatewayError, ResponseStatus};
use dai_core::ras::{NON_DESCRIPTIVE_EVENT_TYPE, RasEvent, events};

#[tokio::test]
async fn test_store_failure_is_swallowed() {
    let store = TestStore::new().await;
    let failing = Arc::new(FailingGateway::new(store.gateway.clone()).fail(
        "RasEventStore",
        Failure::Transport(GatewayError::ConnectionLost("socket closed".to_string())),
    ));
    let ras = RasEventEmitter::new(failing, identity("WLM", 1));

    ras.emit(RasEvent::new(events::ADAPTER_EXCEPTION).instance_data("Exception=boom"))
        .await;
    ras.flush().await;

    assert_eq!(count(&store.gateway, "SELECT COUNT(*) FROM RasEvent").await, 0);
}

#[tokio::test]
async fn test_missing_metadata_falls_back_to_non_descriptive_type() {
    let store = TestStore::new().await;
    let failing = Arc::new(FailingGateway::new(store.gateway.clone()).fail(
        "RasMetaDataList",
        Failure::Status(ResponseStatus::UnexpectedFailure, "table missing".to_string()),
    ));
    let ras = RasEventEmitter::new(failing, identity("WLM", 1));

    assert!(!ras.load_metadata().await);
    assert_eq!(ras.event_type(events::NODE_ACTIVE).await, NON_DESCRIPTIVE_EVENT_TYPE);

    ras.emit(RasEvent::new(events::NODE_ACTIVE).lctn("R0-CN1")).await;
    ras.flush().await;

    let stored: String = sqlx::query_scalar("SELECT EventType FROM RasEvent")
        .fetch_one(store.gateway.pool())
        .await
        .unwrap();
    assert_eq!(stored, NON_DESCRIPTIVE_EVENT_TYPE);
}

#[tokio::test]
async fn test_unknown_name_uses_non_descriptive_type() {
    let store = TestStore::new().await;
    let ras = RasEventEmitter::new(store.gateway.clone(), identity("WLM", 1));

    assert!(ras.load_metadata().await);
    assert_eq!(ras.event_type("RasNoSuchEvent").await, NON_DESCRIPTIVE_EVENT_TYPE);
    assert_eq!(ras.event_type(events::ADAPTER_ABEND).await, "0001000001");
}

#[tokio::test]
async fn test_job_correlation_failure_is_reported() {
    let store = TestStore::new().await;
    let ras = Arc::new(RasEventEmitter::new(store.gateway.clone(), identity("WLM", 1)));

    ras.emit(RasEvent::new(events::NODE_ACTIVE).lctn("R0-CN1")).await;
    ras.flush().await;
    let (id, event_type): (i64, String) = sqlx::query_as("SELECT Id, EventType FROM RasEvent")
        .fetch_one(store.gateway.pool())
        .await
        .unwrap();

    ras.set_associated_job_id("job-17", event_type.clone(), id);
    ras.flush().await;
    let job: Option<String> = sqlx::query_scalar("SELECT JobId FROM RasEvent WHERE Id = ?")
        .bind(id)
        .fetch_one(store.gateway.pool())
        .await
        .unwrap();
    assert_eq!(job.as_deref(), Some("job-17"));

    // No such event: the failure becomes a RAS event of its own.
    ras.set_associated_job_id("job-18", event_type, id + 100);
    ras.flush().await;
    assert_eq!(ras_count(&store.gateway, events::CALLBACK_NO_VALUE_FAILED).await, 1);
}
