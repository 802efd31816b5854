// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for dai-core integration tests.
//!
//! Provides a file-backed store that survives the agent closing its gateway,
//! plus gateway wrappers that record or fail selected procedure calls.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use dai_core::adapter::AdapterIdentity;
use dai_core::gateway::{GatewayError, ProcedureGateway, ProcedureResponse, ResponseStatus, Value};
use dai_core::{Agent, AgentConfig, SqliteGateway, WaitOptions};

/// A SQLite store in a temp directory.
pub struct TestStore {
    pub gateway: Arc<SqliteGateway>,
    pub database_url: String,
    _temp_dir: tempfile::TempDir,
}

impl TestStore {
    pub async fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let database_url = format!("sqlite://{}", temp_dir.path().join("dai.db").display());
        let gateway = Arc::new(
            SqliteGateway::connect(&database_url, 4)
                .await
                .expect("Failed to open test store"),
        );
        Self {
            gateway,
            database_url,
            _temp_dir: temp_dir,
        }
    }

    /// Fresh gateway on the same database file.
    pub async fn reopen(&self) -> Arc<SqliteGateway> {
        Arc::new(
            SqliteGateway::connect(&self.database_url, 4)
                .await
                .expect("Failed to reopen test store"),
        )
    }
}

pub fn identity(adapter_type: &str, pid: u32) -> Arc<AdapterIdentity> {
    Arc::new(AdapterIdentity::new(
        adapter_type,
        format!("{}_ADAPTER", adapter_type),
        "R0-SN0",
        "sn0",
        pid,
    ))
}

/// Poll loop settings that keep tests fast.
pub fn fast_config() -> AgentConfig {
    AgentConfig {
        idle_sleep: Duration::from_millis(2),
        max_idle_backoff: 3,
    }
}

pub fn agent(gateway: Arc<dyn ProcedureGateway>, adapter_type: &str, pid: u32) -> Agent {
    Agent::new(
        gateway,
        identity(adapter_type, pid),
        fast_config(),
        WaitOptions::default(),
    )
}

pub async fn discover_node(gateway: &dyn ProcedureGateway, procedure: &str, lctn: &str, owner: &str) {
    let response = gateway
        .call(
            procedure,
            &[
                Value::from(lctn),
                Value::from(lctn.to_lowercase()),
                Value::from(owner),
                Value::Long(1),
                Value::from("PROVISIONER"),
                Value::Long(-1),
            ],
        )
        .await
        .expect("discover call failed");
    assert!(response.is_success(), "{} failed: {}", procedure, response.message());
}

pub async fn count(store: &SqliteGateway, sql: &str) -> i64 {
    sqlx::query_scalar(sql)
        .fetch_one(store.pool())
        .await
        .expect("count query failed")
}

/// Stored RAS events with the given descriptive name.
pub async fn ras_count(store: &SqliteGateway, descriptive_name: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM RasEvent e JOIN RasMetaData m ON e.EventType = m.EventType \
         WHERE m.DescriptiveName = ?",
    )
    .bind(descriptive_name)
    .fetch_one(store.pool())
    .await
    .expect("RAS count query failed")
}

/// Records every call, then forwards it.
pub struct RecordingGateway {
    inner: Arc<dyn ProcedureGateway>,
    calls: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
}

impl RecordingGateway {
    pub fn new(inner: Arc<dyn ProcedureGateway>) -> Self {
        Self {
            inner,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn procedures(&self) -> Vec<String> {
        self.calls().into_iter().map(|(name, _)| name).collect()
    }
}

#[async_trait]
impl ProcedureGateway for RecordingGateway {
    async fn call(&self, procedure: &str, args: &[Value]) -> Result<ProcedureResponse, GatewayError> {
        self.calls
            .lock()
            .unwrap()
            .push((procedure.to_string(), args.to_vec()));
        self.inner.call(procedure, args).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// What a scripted procedure does instead of reaching the store.
#[derive(Clone)]
pub enum Failure {
    Status(ResponseStatus, String),
    Transport(GatewayError),
}

/// Fails the scripted procedures, forwards everything else.
pub struct FailingGateway {
    inner: Arc<dyn ProcedureGateway>,
    script: Mutex<HashMap<String, Failure>>,
}

impl FailingGateway {
    pub fn new(inner: Arc<dyn ProcedureGateway>) -> Self {
        Self {
            inner,
            script: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail(self, procedure: &str, failure: Failure) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(procedure.to_string(), failure);
        self
    }
}

#[async_trait]
impl ProcedureGateway for FailingGateway {
    async fn call(&self, procedure: &str, args: &[Value]) -> Result<ProcedureResponse, GatewayError> {
        let scripted = self.script.lock().unwrap().get(procedure).cloned();
        match scripted {
            Some(Failure::Status(status, message)) => Ok(ProcedureResponse::failure(status, message)),
            Some(Failure::Transport(e)) => Err(e),
            None => self.inner.call(procedure, args).await,
        }
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
