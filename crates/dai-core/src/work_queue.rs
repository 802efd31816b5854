// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work item queue for one adapter instance.
//!
//! Claims, creates, finishes and waits on work items through the
//! [`ProcedureGateway`]. Claim exclusivity is enforced by the store's
//! `WorkItemFindAndOwn` procedure; this side keeps no locks beyond the
//! bookkeeping for the item it currently holds.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::adapter::AdapterIdentity;
use crate::compression;
use crate::error::{DaiError, Result};
use crate::gateway::{ProcedureGateway, ProcedureResponse, Row, Value};
use crate::params::{self, ParamsError};
use crate::ras::{RasEvent, RasEventEmitter, events};

/// `WorkToBeDone` of every adapter's base work item.
pub const BASE_WORK: &str = "BaseWork";

/// Queue that base work items are created in.
pub const BASE_WORK_ITEM_QUEUE: &str = "BaseWorkItem";

/// Work item id reported while no item is held.
pub const NO_WORK_ITEM_ID: i64 = -99999;

/// Results reported by [`WorkItemQueue::get_work_item_status`] for an unknown item.
pub const WORK_ITEM_NOT_FOUND: &str = "Work Item Not Found!";

const TIMESTAMP_PREFIX: &str = "(Timestamp=";

/// How [`WorkItemQueue::wait_for_work_item_to_finish_and_mark_done`] polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    /// Give up after this long; `None` waits until shutdown.
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            timeout: None,
        }
    }
}

/// The work item this adapter currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimedWorkItem {
    pub id: i64,
    pub work_to_be_done: String,
    pub parameters: Option<String>,
    pub working_results: Option<String>,
    pub queue: Option<String>,
    pub notify_when_finished: bool,
    pub requesting_adapter_type: Option<String>,
    pub requesting_work_item_id: Option<i64>,
    /// False when the item was requeued after an earlier owner went away.
    pub is_new: bool,
}

impl ClaimedWorkItem {
    fn from_row(row: Row<'_>) -> Option<Self> {
        Some(Self {
            id: row.get_long("Id")?,
            work_to_be_done: row.get_string("WorkToBeDone")?.to_string(),
            is_new: row.get_string("State")? == "Q",
            parameters: row.get_string("Parameters").map(str::to_string),
            working_results: row.get_string("WorkingResults").map(str::to_string),
            queue: row.get_string("Queue").map(str::to_string),
            notify_when_finished: row.get_string("NotifyWhenFinished") == Some("T"),
            requesting_adapter_type: row.get_string("RequestingAdapterType").map(str::to_string),
            requesting_work_item_id: row.get_long("RequestingWorkItemId"),
        })
    }

    /// Parameter blob decoded into a map; empty when the item has no parameters.
    pub fn client_parameters(&self) -> std::result::Result<BTreeMap<String, String>, ParamsError> {
        match &self.parameters {
            Some(blob) => params::decode(blob),
            None => Ok(BTreeMap::new()),
        }
    }
}

/// Terminal state and decompressed results of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItemStatus {
    pub state: String,
    pub results: String,
}

impl WorkItemStatus {
    pub fn is_finished(&self) -> bool {
        self.state == "F"
    }

    pub fn is_error(&self) -> bool {
        self.state == "E"
    }
}

/// A work item moved back to the queue because its owner is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequeuedWorkItem {
    pub id: i64,
    pub adapter_type: String,
    pub previous_adapter_id: Option<i64>,
    pub work_to_be_done: String,
}

/// Request to create a work item, see [`WorkItemQueue::queue_work_item`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkItem {
    pub adapter_type: String,
    pub queue: Option<String>,
    pub work_to_be_done: String,
    pub parameters: String,
    pub notify_when_finished: bool,
    /// Defaults to this adapter and the item it currently holds.
    pub requested_by: Option<(String, i64)>,
}

impl NewWorkItem {
    pub fn new(adapter_type: impl Into<String>, work_to_be_done: impl Into<String>) -> Self {
        Self {
            adapter_type: adapter_type.into(),
            queue: None,
            work_to_be_done: work_to_be_done.into(),
            parameters: String::new(),
            notify_when_finished: false,
            requested_by: None,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Encode key/value pairs with [`params::encode`].
    pub fn parameters<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.parameters = params::encode(pairs);
        self
    }

    /// Use an already encoded parameter blob.
    pub fn raw_parameters(mut self, blob: impl Into<String>) -> Self {
        self.parameters = blob.into();
        self
    }

    pub fn notify_when_finished(mut self, notify: bool) -> Self {
        self.notify_when_finished = notify;
        self
    }

    pub fn requested_by(mut self, adapter_type: impl Into<String>, work_item_id: i64) -> Self {
        self.requested_by = Some((adapter_type.into(), work_item_id));
        self
    }
}

#[derive(Debug)]
struct ClaimState {
    current: Option<ClaimedWorkItem>,
    /// Consecutive empty claims; 0 right after a successful claim.
    idle: u32,
}

/// Work item operations on behalf of one adapter instance.
pub struct WorkItemQueue {
    gateway: Arc<dyn ProcedureGateway>,
    identity: Arc<AdapterIdentity>,
    ras: Arc<RasEventEmitter>,
    wait: WaitOptions,
    state: Mutex<ClaimState>,
}

impl WorkItemQueue {
    pub fn new(
        gateway: Arc<dyn ProcedureGateway>,
        identity: Arc<AdapterIdentity>,
        ras: Arc<RasEventEmitter>,
        wait: WaitOptions,
    ) -> Self {
        Self {
            gateway,
            identity,
            ras,
            wait,
            state: Mutex::new(ClaimState {
                current: None,
                idle: 1,
            }),
        }
    }

    pub fn identity(&self) -> &Arc<AdapterIdentity> {
        &self.identity
    }

    pub fn ras(&self) -> &Arc<RasEventEmitter> {
        &self.ras
    }

    fn state(&self) -> MutexGuard<'_, ClaimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn call(&self, procedure: &str, args: &[Value]) -> Result<ProcedureResponse> {
        let response = self.gateway.call(procedure, args).await?;
        if !response.is_success() {
            error!(
                procedure,
                status = %response.status,
                status_string = response.message(),
                "Procedure failed"
            );
        }
        response.ensure_success(procedure)
    }

    /// Create and claim this adapter's base work item.
    ///
    /// Any failure here is fatal for the adapter. A claimed id that differs
    /// from the one just created means another instance raced us.
    #[instrument(skip(self), fields(adapter_type = %self.identity.adapter_type()))]
    pub async fn setup_adapters_base_work_item(&self) -> Result<i64> {
        let adapter_type = self.identity.adapter_type();

        let created = self
            .call(
                "WorkItemQueue",
                &[
                    Value::from(BASE_WORK_ITEM_QUEUE),
                    Value::from(adapter_type),
                    Value::from(BASE_WORK),
                    Value::from(""),
                    Value::from("F"),
                    Value::from(adapter_type),
                    Value::Long(-1),
                ],
            )
            .await?
            .scalar_long()
            .ok_or_else(|| DaiError::MissingResult {
                procedure: "WorkItemQueue".to_string(),
            })?;

        let claim = self
            .call(
                "WorkItemFindAndOwn",
                &[
                    Value::from(adapter_type),
                    Value::Long(self.identity.id()),
                    Value::from("T"),
                    Value::Long(created),
                    Value::from(BASE_WORK_ITEM_QUEUE),
                ],
            )
            .await?;
        let claimed = claim
            .first_table()
            .and_then(|table| table.row(0))
            .and_then(|row| row.get_long("Id"))
            .ok_or_else(|| DaiError::MissingResult {
                procedure: "WorkItemFindAndOwn".to_string(),
            })?;

        if claimed != created {
            error!(created, claimed, "Claimed a different base work item than was created");
            return Err(DaiError::BaseWorkItemMismatch { created, claimed });
        }

        self.identity.set_base_work_item_id(created);
        info!(base_work_item_id = created, "Base work item set up");
        Ok(created)
    }

    /// Try to claim the next pending work item for this adapter type.
    ///
    /// Returns `Ok(false)` and bumps the idle counter when nothing is queued.
    #[instrument(skip(self), fields(adapter_type = %self.identity.adapter_type()))]
    pub async fn grab_next_avail_work_item(&self, queue: Option<&str>) -> Result<bool> {
        let args = [
            Value::from(self.identity.adapter_type()),
            Value::Long(self.identity.id()),
            Value::from("F"),
            Value::Long(self.identity.base_work_item_id()),
            Value::from(queue),
        ];

        let response = match self.call("WorkItemFindAndOwn", &args).await {
            Ok(response) => response,
            Err(e) => {
                self.ras
                    .emit(RasEvent::new(events::FIND_AND_OWN_FAILED).instance_data(format!(
                        "AdapterName={}, StatusString={}, Queue={}",
                        self.identity.name(),
                        e,
                        queue.unwrap_or("null")
                    )))
                    .await;
                return Err(e);
            }
        };

        let claimed = match response.first_table().and_then(|table| table.row(0)) {
            Some(row) => Some(ClaimedWorkItem::from_row(row).ok_or_else(|| {
                DaiError::MissingResult {
                    procedure: "WorkItemFindAndOwn".to_string(),
                }
            })?),
            None => None,
        };

        let mut state = self.state();
        match claimed {
            None => {
                debug!("No work items available");
                state.idle = state.idle.saturating_add(1);
                state.current = None;
                Ok(false)
            }
            Some(item) => {
                if item.is_new {
                    info!(
                        work_item_id = item.id,
                        work_to_be_done = %item.work_to_be_done,
                        "Grabbed a new work item"
                    );
                } else {
                    info!(
                        work_item_id = item.id,
                        work_to_be_done = %item.work_to_be_done,
                        working_results_len = item.working_results.as_deref().map_or(0, str::len),
                        "Grabbed a requeued work item"
                    );
                }
                state.idle = 0;
                state.current = Some(item);
                Ok(true)
            }
        }
    }

    /// Snapshot of the item currently held, if any.
    pub fn current(&self) -> Option<ClaimedWorkItem> {
        self.state().current.clone()
    }

    pub fn work_item_id(&self) -> i64 {
        self.state()
            .current
            .as_ref()
            .map_or(NO_WORK_ITEM_ID, |item| item.id)
    }

    pub fn work_to_be_done(&self) -> Option<String> {
        self.state()
            .current
            .as_ref()
            .map(|item| item.work_to_be_done.clone())
    }

    pub fn working_results(&self) -> Option<String> {
        self.state()
            .current
            .as_ref()
            .and_then(|item| item.working_results.clone())
    }

    /// True for a freshly queued item (and when nothing is held).
    pub fn is_this_new_work_item(&self) -> bool {
        self.state().current.as_ref().is_none_or(|item| item.is_new)
    }

    /// Work item to name as the requester of new work: the held item, else the base work item.
    pub fn requesting_work_item_id(&self) -> i64 {
        match self.work_item_id() {
            NO_WORK_ITEM_ID => self.identity.base_work_item_id(),
            id => id,
        }
    }

    pub fn base_work_item_id(&self) -> i64 {
        self.identity.base_work_item_id()
    }

    /// Idle backoff counter: consecutive empty claims since the last success.
    pub fn amt_time_to_wait(&self) -> u32 {
        self.state().idle
    }

    /// Whether the last claim attempt produced work.
    pub fn was_work_done(&self) -> bool {
        self.state().idle == 0
    }

    /// Parameters of the held item as a map.
    pub fn client_parameters(&self) -> Result<BTreeMap<String, String>> {
        match self.state().current.as_ref() {
            Some(item) => Ok(item.client_parameters()?),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Raw parameter blob of the held item split on `separator`.
    pub fn client_parameters_split(&self, separator: &str) -> Option<Vec<String>> {
        let state = self.state();
        let blob = state.current.as_ref()?.parameters.as_deref()?;
        Some(params::split_fields(blob, separator))
    }

    /// Report a held item nobody knows how to handle and ask the adapter to stop.
    pub async fn handle_processing_when_unexpected_work_item(&self) {
        let work_to_be_done = self.work_to_be_done().unwrap_or_default();
        error!(
            %work_to_be_done,
            work_item_id = self.work_item_id(),
            "No handler for this work item, shutting the adapter down"
        );
        self.ras
            .emit(
                RasEvent::new(events::MISSING_CASE)
                    .instance_data(format!("WorkToBeDone={}", work_to_be_done))
                    .check_for_job()
                    .for_work_item(self.work_item_id()),
            )
            .await;
        self.identity.signal_shutdown();
    }

    /// Create a work item and return its id.
    #[instrument(skip(self, request), fields(target = %request.adapter_type, work = %request.work_to_be_done))]
    pub async fn queue_work_item(&self, request: NewWorkItem) -> Result<i64> {
        let (requesting_type, requesting_id) = request.requested_by.clone().unwrap_or_else(|| {
            (
                self.identity.adapter_type().to_string(),
                self.requesting_work_item_id(),
            )
        });

        let id = self
            .call(
                "WorkItemQueue",
                &[
                    Value::from(request.queue.as_deref()),
                    Value::from(request.adapter_type.as_str()),
                    Value::from(request.work_to_be_done.as_str()),
                    Value::from(request.parameters.as_str()),
                    Value::from(if request.notify_when_finished { "T" } else { "F" }),
                    Value::from(requesting_type),
                    Value::Long(requesting_id),
                ],
            )
            .await?
            .scalar_long()
            .ok_or_else(|| DaiError::MissingResult {
                procedure: "WorkItemQueue".to_string(),
            })?;

        info!(work_item_id = id, "Queued work item");
        Ok(id)
    }

    async fn finish(
        &self,
        procedure: &'static str,
        cmd_for_msg: &str,
        work_item_id: i64,
        results: &str,
    ) -> Result<()> {
        self.call(
            procedure,
            &[
                Value::from(self.identity.adapter_type()),
                Value::Long(work_item_id),
                Value::from(compression::compress(results)),
            ],
        )
        .await?;
        info!(
            cmd = cmd_for_msg,
            work_item_id,
            procedure,
            "Finished work item"
        );
        Ok(())
    }

    /// Mark an item this adapter holds as finished with `results`.
    pub async fn finished_work_item(
        &self,
        cmd_for_msg: &str,
        work_item_id: i64,
        results: &str,
    ) -> Result<()> {
        self.finish("WorkItemFinished", cmd_for_msg, work_item_id, results)
            .await
    }

    /// Mark an item this adapter holds as finished in error.
    pub async fn finished_work_item_due_to_error(
        &self,
        cmd_for_msg: &str,
        work_item_id: i64,
        results: &str,
    ) -> Result<()> {
        self.finish(
            "WorkItemFinishedDueToError",
            cmd_for_msg,
            work_item_id,
            results,
        )
        .await
    }

    fn status_from(response: &ProcedureResponse) -> Result<Option<WorkItemStatus>> {
        let Some(row) = response.first_table().and_then(|table| table.row(0)) else {
            return Ok(None);
        };
        let state = row.get_string("State").unwrap_or_default().to_string();
        let results = compression::decompress(row.get_string("Results"))?;
        Ok(Some(WorkItemStatus { state, results }))
    }

    /// Poll until another item reaches F or E, then mark it Done.
    ///
    /// Honors the configured poll interval and timeout, and stops early with
    /// [`DaiError::ShuttingDown`] once the adapter is shutting down.
    #[instrument(skip(self))]
    pub async fn wait_for_work_item_to_finish_and_mark_done(
        &self,
        cmd_for_msg: &str,
        adapter_type: &str,
        work_item_id: i64,
        requesting_work_item_id: i64,
    ) -> Result<WorkItemStatus> {
        info!("Waiting for work item to finish");
        let started = tokio::time::Instant::now();

        loop {
            let response = self
                .call(
                    "WorkItemFinishedResults",
                    &[Value::from(adapter_type), Value::Long(work_item_id)],
                )
                .await?;

            if let Some(status) = Self::status_from(&response)? {
                if status.is_finished() {
                    info!("Work item was successful");
                } else {
                    error!(state = %status.state, results = %status.results, "Work item failed");
                    self.ras
                        .emit(
                            RasEvent::new(events::WAIT_FOR_WORK_ITEM_FAILED)
                                .instance_data(format!(
                                    "AdapterName={}, WorkToBeDone={}, WorkItem={}, Results={}",
                                    self.identity.name(),
                                    cmd_for_msg,
                                    work_item_id,
                                    status.results
                                ))
                                .for_work_item(requesting_work_item_id),
                        )
                        .await;
                }
                self.mark_work_item_done(adapter_type, work_item_id).await?;
                return Ok(status);
            }

            if let Some(timeout) = self.wait.timeout {
                let waited = started.elapsed();
                if waited >= timeout {
                    warn!(?waited, "Gave up waiting for work item");
                    return Err(DaiError::WaitTimedOut {
                        work_item_id,
                        waited,
                    });
                }
            }

            tokio::select! {
                _ = self.identity.shutdown_requested() => return Err(DaiError::ShuttingDown),
                _ = tokio::time::sleep(self.wait.poll_interval) => {}
            }
        }
    }

    /// Single non-blocking completion check.
    ///
    /// A finished or failed item is marked Done as a side effect. An unknown
    /// item reports state `F` with [`WORK_ITEM_NOT_FOUND`].
    #[instrument(skip(self))]
    pub async fn get_work_item_status(
        &self,
        adapter_type: &str,
        work_item_id: i64,
    ) -> Result<WorkItemStatus> {
        let response = self
            .call(
                "WorkItemStateAndResults",
                &[Value::from(adapter_type), Value::Long(work_item_id)],
            )
            .await?;

        let Some(status) = Self::status_from(&response)? else {
            return Ok(WorkItemStatus {
                state: "F".to_string(),
                results: WORK_ITEM_NOT_FOUND.to_string(),
            });
        };

        if status.is_finished() {
            self.mark_work_item_done(adapter_type, work_item_id).await?;
        } else if status.is_error() {
            error!(results = %status.results, "Work item failed");
            self.ras
                .emit(
                    RasEvent::new(events::WAIT_FOR_WORK_ITEM_FAILED)
                        .instance_data(format!(
                            "AdapterName={}, AdapterType={}, WorkItem={}, Results={}",
                            self.identity.name(),
                            adapter_type,
                            work_item_id,
                            status.results
                        ))
                        .for_work_item(work_item_id),
                )
                .await;
            self.mark_work_item_done(adapter_type, work_item_id).await?;
        }
        Ok(status)
    }

    /// Move a finished item to Done. Already-Done items are accepted.
    pub async fn mark_work_item_done(&self, adapter_type: &str, work_item_id: i64) -> Result<()> {
        let response = self
            .call(
                "WorkItemDone",
                &[Value::from(adapter_type), Value::Long(work_item_id)],
            )
            .await?;
        if response.scalar_long() == Some(1) {
            debug!(adapter_type, work_item_id, "Work item was already done");
        } else {
            info!(adapter_type, work_item_id, "Work item marked done");
        }
        Ok(())
    }

    /// Save a restart checkpoint, appending a history row stamped now.
    pub async fn save_work_items_restart_data(
        &self,
        work_item_id: i64,
        restart_data: &str,
    ) -> Result<()> {
        self.save_work_items_restart_data_with(work_item_id, restart_data, true, 0)
            .await
    }

    /// Save a restart checkpoint.
    ///
    /// With `insert_history` false the latest history row is updated in place.
    /// A `timestamp_micros` of 0 means "now".
    #[instrument(skip(self, restart_data))]
    pub async fn save_work_items_restart_data_with(
        &self,
        work_item_id: i64,
        restart_data: &str,
        insert_history: bool,
        timestamp_micros: i64,
    ) -> Result<()> {
        let result = self
            .call(
                "WorkItemSaveRestartData",
                &[
                    Value::from(self.identity.adapter_type()),
                    Value::Long(work_item_id),
                    Value::from(restart_data),
                    Value::Long(i64::from(insert_history)),
                    Value::Long(timestamp_micros),
                ],
            )
            .await;

        if let Err(e) = result {
            self.ras
                .emit(
                    RasEvent::new(events::SAVE_RESTART_DATA_FAILED)
                        .instance_data(format!(
                            "AdapterName={}, WorkItemId={}",
                            self.identity.name(),
                            work_item_id
                        ))
                        .for_work_item(work_item_id),
                )
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Requeue items held by adapter instances that are no longer registered.
    ///
    /// `adapter_type` limits the sweep to one adapter family.
    pub async fn requeue_zombie_work_items(
        &self,
        adapter_type: Option<&str>,
    ) -> Result<Vec<RequeuedWorkItem>> {
        let response = self
            .call("WorkItemRequeueZombies", &[Value::from(adapter_type)])
            .await?;

        let requeued: Vec<RequeuedWorkItem> = response
            .first_table()
            .map(|table| {
                table
                    .rows()
                    .filter_map(|row| {
                        Some(RequeuedWorkItem {
                            id: row.get_long("WorkitemId")?,
                            adapter_type: row.get_string("WorkitemWorkingAdapterType")?.to_string(),
                            previous_adapter_id: row.get_long("WorkitemWorkingAdapterId"),
                            work_to_be_done: row.get_string("WorkitemWorkToBeDone")?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        for item in &requeued {
            warn!(
                work_item_id = item.id,
                adapter_type = %item.adapter_type,
                work_to_be_done = %item.work_to_be_done,
                "Requeued work item of a dead adapter instance"
            );
        }
        Ok(requeued)
    }
}

/// Timestamp recorded as `(Timestamp=...)` in a restart checkpoint.
pub fn get_ts_from_working_results(working_results: &str) -> Option<&str> {
    let start = working_results.find(TIMESTAMP_PREFIX)? + TIMESTAMP_PREFIX.len();
    let len = working_results[start..].find(')')?;
    Some(&working_results[start..start + len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{SqliteGateway, sqlite_test_gateway};

    async fn queue() -> (Arc<SqliteGateway>, WorkItemQueue) {
        let gateway = Arc::new(sqlite_test_gateway().await);
        let identity = Arc::new(AdapterIdentity::new("WLM", "WLM_ADAPTER", "R0-SN0", "sn0", 7));
        identity.set_id(3);
        let ras = Arc::new(RasEventEmitter::new(gateway.clone(), identity.clone()));
        let queue = WorkItemQueue::new(gateway.clone(), identity, ras, WaitOptions::default());
        (gateway, queue)
    }

    #[test]
    fn test_ts_from_working_results() {
        assert_eq!(
            get_ts_from_working_results("Moved rows (Timestamp=2024-01-02 03:04:05.123) ok"),
            Some("2024-01-02 03:04:05.123")
        );
        assert_eq!(get_ts_from_working_results("no stamp"), None);
        assert_eq!(get_ts_from_working_results("(Timestamp=unterminated"), None);
    }

    #[test]
    fn test_new_work_item_builder() {
        let request = NewWorkItem::new("WLM", "UseNode")
            .queue("nodes")
            .parameters([("Lctn", "R0-CN1")])
            .notify_when_finished(true)
            .requested_by("PROVISIONER", 12);
        assert_eq!(request.parameters, "Lctn#R0-CN1$");
        assert_eq!(request.queue.as_deref(), Some("nodes"));
        assert_eq!(request.requested_by, Some(("PROVISIONER".to_string(), 12)));
    }

    #[tokio::test]
    async fn test_idle_counter_starts_at_one() {
        let (_gateway, queue) = queue().await;
        assert_eq!(queue.amt_time_to_wait(), 1);
        assert!(!queue.was_work_done());
        assert_eq!(queue.work_item_id(), NO_WORK_ITEM_ID);
        assert!(queue.is_this_new_work_item());
    }

    #[tokio::test]
    async fn test_base_work_item_setup() {
        let (_gateway, queue) = queue().await;
        let id = queue.setup_adapters_base_work_item().await.unwrap();
        assert_eq!(queue.base_work_item_id(), id);

        // Base work is never handed out by a normal claim.
        assert!(!queue.grab_next_avail_work_item(None).await.unwrap());
        assert_eq!(queue.amt_time_to_wait(), 2);
    }

    #[tokio::test]
    async fn test_claim_resets_idle_counter() {
        let (_gateway, queue) = queue().await;
        queue.setup_adapters_base_work_item().await.unwrap();
        assert!(!queue.grab_next_avail_work_item(None).await.unwrap());

        let id = queue
            .queue_work_item(NewWorkItem::new("WLM", "UseNode").parameters([("Lctn", "R0-CN1")]))
            .await
            .unwrap();
        assert!(queue.grab_next_avail_work_item(None).await.unwrap());
        assert_eq!(queue.work_item_id(), id);
        assert_eq!(queue.amt_time_to_wait(), 0);
        assert!(queue.was_work_done());
        assert!(queue.is_this_new_work_item());
        assert_eq!(queue.client_parameters().unwrap()["Lctn"], "R0-CN1");
    }

    #[tokio::test]
    async fn test_queue_filter() {
        let (_gateway, queue) = queue().await;
        queue.setup_adapters_base_work_item().await.unwrap();
        queue
            .queue_work_item(NewWorkItem::new("WLM", "UseNode").queue("fast"))
            .await
            .unwrap();

        assert!(!queue.grab_next_avail_work_item(Some("slow")).await.unwrap());
        assert!(queue.grab_next_avail_work_item(Some("fast")).await.unwrap());
    }

    #[tokio::test]
    async fn test_finish_and_status() {
        let (_gateway, queue) = queue().await;
        queue.setup_adapters_base_work_item().await.unwrap();
        let id = queue
            .queue_work_item(NewWorkItem::new("WLM", "UseNode").notify_when_finished(true))
            .await
            .unwrap();
        assert!(queue.grab_next_avail_work_item(None).await.unwrap());
        queue
            .finished_work_item("UseNode", id, "node R0-CN1 in use")
            .await
            .unwrap();

        let status = queue.get_work_item_status("WLM", id).await.unwrap();
        assert!(status.is_finished());
        assert_eq!(status.results, "node R0-CN1 in use");

        // Already Done: reported as not found.
        let gone = queue.get_work_item_status("WLM", id).await.unwrap();
        assert_eq!(gone.results, WORK_ITEM_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_of_unfinished_item() {
        let (_gateway, queue) = queue().await;
        let id = queue
            .queue_work_item(NewWorkItem::new("WLM", "UseNode").requested_by("WLM", -1))
            .await
            .unwrap();
        let status = queue.get_work_item_status("WLM", id).await.unwrap();
        assert_eq!(status.state, "Q");
        assert_eq!(status.results, compression::NULL_RESPONSE);
    }

    #[tokio::test]
    async fn test_finishing_unclaimed_item_fails() {
        let (_gateway, queue) = queue().await;
        let id = queue
            .queue_work_item(NewWorkItem::new("WLM", "UseNode"))
            .await
            .unwrap();
        let err = queue
            .finished_work_item("UseNode", id, "done")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "GRACEFUL_FAILURE");
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (gateway, _) = queue().await;
        let identity = Arc::new(AdapterIdentity::new("WLM", "WLM_ADAPTER", "R0-SN0", "sn0", 7));
        let ras = Arc::new(RasEventEmitter::new(gateway.clone(), identity.clone()));
        let queue = WorkItemQueue::new(
            gateway,
            identity,
            ras,
            WaitOptions {
                poll_interval: Duration::from_millis(1),
                timeout: Some(Duration::from_millis(20)),
            },
        );
        let id = queue
            .queue_work_item(NewWorkItem::new("WLM", "UseNode"))
            .await
            .unwrap();

        let err = queue
            .wait_for_work_item_to_finish_and_mark_done("UseNode", "WLM", id, -1)
            .await
            .unwrap_err();
        assert!(matches!(err, DaiError::WaitTimedOut { work_item_id, .. } if work_item_id == id));
    }

    #[tokio::test]
    async fn test_wait_stops_on_shutdown() {
        let (_gateway, queue) = queue().await;
        let id = queue
            .queue_work_item(NewWorkItem::new("WLM", "UseNode"))
            .await
            .unwrap();
        queue.identity().signal_shutdown();

        let err = queue
            .wait_for_work_item_to_finish_and_mark_done("UseNode", "WLM", id, -1)
            .await
            .unwrap_err();
        assert!(matches!(err, DaiError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_restart_data_requires_working_item() {
        let (gateway, queue) = queue().await;
        let err = queue
            .save_work_items_restart_data(4242, "(Timestamp=1)")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "GRACEFUL_FAILURE");

        queue.ras().flush().await;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM RasEvent WHERE EventType = '0001000006'")
            .fetch_one(gateway.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
