// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adapter instance identity.

use std::sync::atomic::{AtomicI64, Ordering};

use tokio_util::sync::CancellationToken;

/// Id used before the store has assigned one.
pub const UNASSIGNED_ID: i64 = -1;

/// Who this adapter instance is, plus its shutdown signal.
///
/// Type, name, location, hostname and pid never change. The adapter id and
/// base work item id are assigned once during registration. Every component
/// holds the identity behind an `Arc` and watches the same shutdown token.
#[derive(Debug)]
pub struct AdapterIdentity {
    adapter_type: String,
    name: String,
    lctn: String,
    hostname: String,
    pid: u32,
    unique_name_extension: Option<String>,
    id: AtomicI64,
    base_work_item_id: AtomicI64,
    shutdown: CancellationToken,
}

impl AdapterIdentity {
    pub fn new(
        adapter_type: impl Into<String>,
        name: impl Into<String>,
        lctn: impl Into<String>,
        hostname: impl Into<String>,
        pid: u32,
    ) -> Self {
        Self {
            adapter_type: adapter_type.into(),
            name: name.into(),
            lctn: lctn.into(),
            hostname: hostname.into(),
            pid,
            unique_name_extension: None,
            id: AtomicI64::new(UNASSIGNED_ID),
            base_work_item_id: AtomicI64::new(UNASSIGNED_ID),
            shutdown: CancellationToken::new(),
        }
    }

    /// Identity of the current process.
    pub fn for_current_process(
        adapter_type: impl Into<String>,
        name: impl Into<String>,
        lctn: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self::new(adapter_type, name, lctn, hostname, std::process::id())
    }

    /// Use `extension` instead of the adapter id when building [`Self::unique_name`].
    pub fn with_unique_name_extension(mut self, extension: impl Into<String>) -> Self {
        self.unique_name_extension = Some(extension.into());
        self
    }

    pub fn adapter_type(&self) -> &str {
        &self.adapter_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lctn(&self) -> &str {
        &self.lctn
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Store-assigned adapter id, or [`UNASSIGNED_ID`] before registration.
    pub fn id(&self) -> i64 {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn set_id(&self, id: i64) {
        self.id.store(id, Ordering::Release);
    }

    /// Id of this instance's base work item, or [`UNASSIGNED_ID`] before setup.
    pub fn base_work_item_id(&self) -> i64 {
        self.base_work_item_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_base_work_item_id(&self, id: i64) {
        self.base_work_item_id.store(id, Ordering::Release);
    }

    /// `<name>_<extension>` if an extension was given, else `<name>_<id>`.
    pub fn unique_name(&self) -> String {
        match &self.unique_name_extension {
            Some(extension) => format!("{}_{}", self.name, extension),
            None => format!("{}_{}", self.name, self.id()),
        }
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once shutdown has been signalled (immediately if it already was).
    pub async fn shutdown_requested(&self) {
        self.shutdown.cancelled().await;
    }

    /// Token that fires on shutdown, for wiring into external tasks.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
