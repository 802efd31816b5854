// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adapter lifecycle.
//!
//! ```text
//! Initializing ──start──▶ Registered ──▶ PollLoop ──shutdown──▶ ShuttingDown ──▶ Terminated
//! ```
//!
//! [`Agent::start`] registers the adapter instance, claims its base work item
//! and loads RAS metadata. The poll loop claims one work item at a time and
//! dispatches it to the [`WorkHandler`] registered for its `WorkToBeDone`.
//! [`Agent::shutdown_adapter`] always tears down the adapter record and the
//! base work item, then closes the gateway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterIdentity, UNASSIGNED_ID};
use crate::config::Config;
use crate::error::{DaiError, Result};
use crate::gateway::{ProcedureGateway, Value};
use crate::node_state::NodeStateCoordinator;
use crate::ras::{RasEvent, RasEventEmitter, events};
use crate::work_queue::{BASE_WORK, ClaimedWorkItem, WaitOptions, WorkItemQueue};

/// Poll loop tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Sleep unit while idle.
    pub idle_sleep: Duration,
    /// Cap on the idle multiplier.
    pub max_idle_backoff: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_millis(100),
            max_idle_backoff: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Initializing,
    Registered,
    PollLoop,
    ShuttingDown,
    Terminated,
}

/// What a handler gets to work with for one claimed item.
pub struct WorkContext<'a> {
    pub item: &'a ClaimedWorkItem,
    pub queue: &'a WorkItemQueue,
    pub nodes: &'a NodeStateCoordinator,
}

impl WorkContext<'_> {
    /// Required parameter of the claimed item.
    pub fn parameter(&self, name: &str) -> Result<String> {
        self.item
            .client_parameters()?
            .remove(name)
            .ok_or_else(|| DaiError::MissingParameter {
                work: self.item.work_to_be_done.clone(),
                name: name.to_string(),
            })
    }

    /// Optional parameter of the claimed item.
    pub fn optional_parameter(&self, name: &str) -> Result<Option<String>> {
        Ok(self.item.client_parameters()?.remove(name))
    }
}

/// Role-specific handling of one kind of work item.
///
/// A handler is expected to finish the item itself. If it returns an error
/// the agent reports it and finishes the item in error.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, ctx: &WorkContext<'_>) -> Result<()>;
}

/// One adapter instance.
pub struct Agent {
    gateway: Arc<dyn ProcedureGateway>,
    identity: Arc<AdapterIdentity>,
    ras: Arc<RasEventEmitter>,
    queue: Arc<WorkItemQueue>,
    nodes: Arc<NodeStateCoordinator>,
    handlers: HashMap<String, Arc<dyn WorkHandler>>,
    config: AgentConfig,
    state: watch::Sender<AgentState>,
}

impl Agent {
    pub fn new(
        gateway: Arc<dyn ProcedureGateway>,
        identity: Arc<AdapterIdentity>,
        config: AgentConfig,
        wait: WaitOptions,
    ) -> Self {
        let ras = Arc::new(RasEventEmitter::new(gateway.clone(), identity.clone()));
        let queue = Arc::new(WorkItemQueue::new(
            gateway.clone(),
            identity.clone(),
            ras.clone(),
            wait,
        ));
        let nodes = Arc::new(NodeStateCoordinator::new(gateway.clone(), queue.clone()));
        let (state, _) = watch::channel(AgentState::Initializing);

        Self {
            gateway,
            identity,
            ras,
            queue,
            nodes,
            handlers: HashMap::new(),
            config,
            state,
        }
    }

    /// Agent for the current process, configured from `config`.
    pub fn from_config(gateway: Arc<dyn ProcedureGateway>, config: &Config) -> Self {
        let identity = Arc::new(AdapterIdentity::for_current_process(
            config.adapter_type.as_str(),
            config.adapter_name.as_str(),
            config.lctn.as_str(),
            config.hostname.as_str(),
        ));
        Self::new(gateway, identity, config.agent_config(), config.wait_options())
    }

    /// Dispatch work items whose `WorkToBeDone` is `work` to `handler`.
    pub fn with_handler(mut self, work: impl Into<String>, handler: Arc<dyn WorkHandler>) -> Self {
        self.handlers.insert(work.into(), handler);
        self
    }

    /// Register the handlers in [`crate::handlers::builtin`].
    pub fn with_builtin_handlers(self) -> Self {
        crate::handlers::builtin()
            .into_iter()
            .fold(self, |agent, (work, handler)| agent.with_handler(work, handler))
    }

    pub fn identity(&self) -> &Arc<AdapterIdentity> {
        &self.identity
    }

    pub fn queue(&self) -> &Arc<WorkItemQueue> {
        &self.queue
    }

    pub fn nodes(&self) -> &Arc<NodeStateCoordinator> {
        &self.nodes
    }

    pub fn ras(&self) -> &Arc<RasEventEmitter> {
        &self.ras
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    fn transition(&self, next: AgentState) {
        let previous = self.state.send_replace(next);
        info!(?previous, ?next, adapter = %self.identity.unique_name(), "Agent state changed");
    }

    /// Record this instance in the store and remember its adapter id.
    pub async fn register_adapter(&self) -> Result<i64> {
        let response = self
            .gateway
            .call(
                "AdapterStarted",
                &[
                    Value::from(self.identity.adapter_type()),
                    Value::Long(UNASSIGNED_ID),
                    Value::from(self.identity.lctn()),
                    Value::Long(i64::from(self.identity.pid())),
                ],
            )
            .await?
            .ensure_success("AdapterStarted")?;
        let id = response
            .scalar_long()
            .ok_or_else(|| DaiError::MissingResult {
                procedure: "AdapterStarted".to_string(),
            })?;

        self.identity.set_id(id);
        info!(adapter_id = id, adapter = %self.identity.unique_name(), "Adapter registered");
        Ok(id)
    }

    /// Adapter id the store has for this type, location and pid, or -1.
    pub async fn lookup_adapter_id(&self) -> Result<i64> {
        let response = self
            .gateway
            .call(
                "AdapterInfoUsingTypeLctnPid",
                &[
                    Value::from(self.identity.adapter_type()),
                    Value::from(self.identity.lctn()),
                    Value::Long(i64::from(self.identity.pid())),
                ],
            )
            .await?
            .ensure_success("AdapterInfoUsingTypeLctnPid")?;

        Ok(response
            .first_table()
            .and_then(|table| table.row(0))
            .and_then(|row| row.get_long("Id"))
            .unwrap_or(UNASSIGNED_ID))
    }

    /// Mark this instance's adapter record terminated.
    pub async fn tear_down_adapter(&self) -> Result<()> {
        self.gateway
            .call(
                "AdapterTerminated",
                &[
                    Value::from(self.identity.adapter_type()),
                    Value::Long(self.identity.id()),
                    Value::from(self.identity.adapter_type()),
                    Value::Long(self.identity.base_work_item_id()),
                ],
            )
            .await?
            .ensure_success("AdapterTerminated")?;
        info!(adapter_id = self.identity.id(), "Adapter torn down");
        Ok(())
    }

    /// Finish the base work item.
    pub async fn tear_down_base_work_item(&self, abnormal: bool) -> Result<()> {
        let results = if abnormal {
            "Adapter terminating by exception!"
        } else {
            "Adapter terminating normally."
        };
        self.queue
            .finished_work_item(BASE_WORK, self.identity.base_work_item_id(), results)
            .await
    }

    /// Register, claim the base work item and load RAS metadata.
    pub async fn start(&self) -> Result<()> {
        self.register_adapter().await?;
        self.queue.setup_adapters_base_work_item().await?;
        if !self.ras.load_metadata().await {
            warn!("Continuing without RAS metadata");
        }
        self.transition(AgentState::Registered);
        Ok(())
    }

    fn idle_sleep(&self) -> Duration {
        let factor = self
            .queue
            .amt_time_to_wait()
            .min(self.config.max_idle_backoff)
            .max(1);
        self.config
            .idle_sleep
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
    }

    /// Claim and handle at most one work item. Returns whether one was claimed.
    ///
    /// A claimed item nobody handles is reported, shutdown is signalled and
    /// [`DaiError::UnexpectedWorkItem`] is returned.
    pub async fn poll_once(&self) -> Result<bool> {
        if !self.queue.grab_next_avail_work_item(None).await? {
            return Ok(false);
        }
        let Some(item) = self.queue.current() else {
            return Ok(false);
        };

        let Some(handler) = self.handlers.get(&item.work_to_be_done).cloned() else {
            self.queue.handle_processing_when_unexpected_work_item().await;
            return Err(DaiError::UnexpectedWorkItem(item.work_to_be_done));
        };

        debug!(work_item_id = item.id, work_to_be_done = %item.work_to_be_done, "Dispatching work item");
        let ctx = WorkContext {
            item: &item,
            queue: &self.queue,
            nodes: &self.nodes,
        };
        if let Err(e) = handler.handle(&ctx).await {
            error!(
                work_item_id = item.id,
                work_to_be_done = %item.work_to_be_done,
                error = %e,
                "Work item handler failed"
            );
            self.ras
                .emit(
                    RasEvent::new(events::EXCEPTION_BUT_CONTINUE)
                        .instance_data(format!(
                            "AdapterName={}, WorkToBeDone={}, Exception={}",
                            self.identity.name(),
                            item.work_to_be_done,
                            e
                        ))
                        .for_work_item(item.id),
                )
                .await;
            if let Err(finish_err) = self
                .queue
                .finished_work_item_due_to_error(&item.work_to_be_done, item.id, &e.to_string())
                .await
            {
                warn!(work_item_id = item.id, error = %finish_err, "Could not finish failed work item");
            }
        }
        Ok(true)
    }

    /// Poll until shutdown is signalled. Returns the error that ended the loop, if any.
    pub async fn run_poll_loop(&self) -> Option<DaiError> {
        self.transition(AgentState::PollLoop);

        while !self.identity.is_shutting_down() {
            match self.poll_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e @ DaiError::UnexpectedWorkItem(_)) => return Some(e),
                Err(e) => {
                    error!(error = %e, code = e.error_code(), "Poll failed, continuing");
                }
            }

            let sleep = self.idle_sleep();
            tokio::select! {
                biased;

                _ = self.identity.shutdown_requested() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        None
    }

    /// Tear everything down and close the gateway.
    ///
    /// With a `cause` the exception and abend RAS events are emitted first and
    /// the base work item records an abnormal end. Returns 0 for a normal and
    /// 1 for an abnormal termination. Teardown failures are logged only.
    pub async fn shutdown_adapter(&self, cause: Option<&DaiError>) -> i32 {
        if self.state() == AgentState::Terminated {
            return i32::from(cause.is_some());
        }
        self.transition(AgentState::ShuttingDown);

        if let Some(e) = cause {
            error!(error = %e, "Adapter terminating because of an error");
            self.ras
                .emit(RasEvent::new(events::ADAPTER_EXCEPTION).instance_data(format!("Exception={}", e)))
                .await;
            self.ras
                .emit(RasEvent::new(events::ADAPTER_ABEND).instance_data(format!(
                    "AdapterName={}, Reason=exception",
                    self.identity.name()
                )))
                .await;
        }

        if let Err(e) = self.tear_down_adapter().await {
            error!(error = %e, "Adapter teardown failed");
        }
        if self.identity.base_work_item_id() != UNASSIGNED_ID {
            if let Err(e) = self.tear_down_base_work_item(cause.is_some()).await {
                error!(error = %e, "Base work item teardown failed");
            }
        }

        self.identity.signal_shutdown();
        self.nodes.flush().await;
        self.gateway.close().await;
        self.transition(AgentState::Terminated);
        i32::from(cause.is_some())
    }

    /// Full lifecycle: start, poll until shutdown, tear down.
    ///
    /// A start failure still tears down whatever was set up and is returned
    /// as the error. Otherwise the exit code of [`Self::shutdown_adapter`].
    pub async fn run(&self) -> Result<i32> {
        if let Err(e) = self.start().await {
            error!(error = %e, "Adapter failed to start");
            self.shutdown_adapter(Some(&e)).await;
            return Err(e);
        }
        let fatal = self.run_poll_loop().await;
        Ok(self.shutdown_adapter(fatal.as_ref()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{SqliteGateway, sqlite_test_gateway};
    use crate::work_queue::NewWorkItem;

    struct Finish;

    #[async_trait]
    impl WorkHandler for Finish {
        async fn handle(&self, ctx: &WorkContext<'_>) -> Result<()> {
            ctx.queue
                .finished_work_item(&ctx.item.work_to_be_done, ctx.item.id, "ok")
                .await
        }
    }

    struct Fail;

    #[async_trait]
    impl WorkHandler for Fail {
        async fn handle(&self, ctx: &WorkContext<'_>) -> Result<()> {
            ctx.parameter("Missing").map(|_| ())
        }
    }

    fn agent(gateway: Arc<SqliteGateway>) -> Agent {
        let identity = Arc::new(AdapterIdentity::new("WLM", "WLM_ADAPTER", "R0-SN0", "sn0", 11));
        Agent::new(
            gateway,
            identity,
            AgentConfig {
                idle_sleep: Duration::from_millis(1),
                max_idle_backoff: 2,
            },
            WaitOptions::default(),
        )
        .with_handler("Frobnicate", Arc::new(Finish))
        .with_handler("Explode", Arc::new(Fail))
    }

    #[test]
    fn test_default_agent_config() {
        let config = AgentConfig::default();
        assert_eq!(config.idle_sleep, Duration::from_millis(100));
        assert_eq!(config.max_idle_backoff, 5);
    }

    #[tokio::test]
    async fn test_start_registers_and_claims_base_work() {
        let gateway = Arc::new(sqlite_test_gateway().await);
        let agent = agent(gateway.clone());
        assert_eq!(agent.state(), AgentState::Initializing);

        agent.start().await.unwrap();
        assert_eq!(agent.state(), AgentState::Registered);
        assert!(agent.identity().id() > 0);
        assert!(agent.queue().base_work_item_id() > 0);
        assert_eq!(agent.lookup_adapter_id().await.unwrap(), agent.identity().id());
    }

    #[tokio::test]
    async fn test_idle_sleep_is_capped() {
        let gateway = Arc::new(sqlite_test_gateway().await);
        let agent = agent(gateway);
        agent.start().await.unwrap();
        assert_eq!(agent.idle_sleep(), Duration::from_millis(1));

        for _ in 0..4 {
            assert!(!agent.poll_once().await.unwrap());
        }
        assert_eq!(agent.idle_sleep(), Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_idle_sleep_saturates() {
        let gateway = Arc::new(sqlite_test_gateway().await);
        let identity = Arc::new(AdapterIdentity::new("WLM", "WLM_ADAPTER", "R0-SN0", "sn0", 12));
        let agent = Agent::new(
            gateway,
            identity,
            AgentConfig {
                idle_sleep: Duration::from_secs(u64::MAX / 2),
                max_idle_backoff: 5,
            },
            WaitOptions::default(),
        );
        agent.start().await.unwrap();

        for _ in 0..3 {
            assert!(!agent.poll_once().await.unwrap());
        }
        assert_eq!(agent.idle_sleep(), Duration::MAX);
    }

    #[tokio::test]
    async fn test_handler_error_finishes_item_in_error() {
        let gateway = Arc::new(sqlite_test_gateway().await);
        let agent = agent(gateway.clone());
        agent.start().await.unwrap();

        let id = agent
            .queue()
            .queue_work_item(NewWorkItem::new("WLM", "Explode").notify_when_finished(true))
            .await
            .unwrap();
        assert!(agent.poll_once().await.unwrap());

        let status = agent.queue().get_work_item_status("WLM", id).await.unwrap();
        assert!(status.is_error());
        assert!(status.results.contains("Missing"));
        assert!(!agent.identity().is_shutting_down());
    }

    #[tokio::test]
    async fn test_unknown_work_signals_shutdown() {
        let gateway = Arc::new(sqlite_test_gateway().await);
        let agent = agent(gateway.clone());
        agent.start().await.unwrap();
        agent
            .queue()
            .queue_work_item(NewWorkItem::new("WLM", "Mystery"))
            .await
            .unwrap();

        let fatal = agent.run_poll_loop().await;
        assert!(matches!(fatal, Some(DaiError::UnexpectedWorkItem(ref w)) if w == "Mystery"));
        assert!(agent.identity().is_shutting_down());

        agent.ras().flush().await;
        let missing_case: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM RasEvent WHERE EventType = '0001000003'")
                .fetch_one(gateway.pool())
                .await
                .unwrap();
        assert_eq!(missing_case, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_gateway() {
        let gateway = Arc::new(sqlite_test_gateway().await);
        let agent = agent(gateway.clone());
        agent.start().await.unwrap();

        let mut states = agent.subscribe();
        assert_eq!(agent.shutdown_adapter(None).await, 0);
        assert_eq!(agent.state(), AgentState::Terminated);
        assert!(states.has_changed().unwrap());
        assert!(gateway.is_closed());

        // A second shutdown is a no-op.
        assert_eq!(agent.shutdown_adapter(None).await, 0);
    }
}
