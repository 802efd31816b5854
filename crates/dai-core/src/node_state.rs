// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node boot/error state transitions and WLM notification.
//!
//! State changes are issued as detached calls. Their outcomes are classified
//! on the completion task: known failures become the matching RAS event,
//! out-of-order writes (return value > 0) are reported but never rejected.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::error::{DaiError, Result};
use crate::gateway::{CallOutcome, ProcedureGateway, Value, call_detached};
use crate::ras::{DetachedCall, RasEvent, RasEventEmitter, events};
use crate::work_queue::{NewWorkItem, WorkItemQueue};

/// Adapter type that owns workload manager work items.
pub const WLM_ADAPTER_TYPE: &str = "WLM";

/// `Owner` code of nodes managed by the workload manager.
pub const WLM_OWNER: &str = "W";

/// Boot states an adapter can report for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootState {
    NodeBooting,
    NodeOffline,
    NodeOnline,
}

impl BootState {
    /// Single-character state stored for the node.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NodeBooting => "B",
            Self::NodeOffline => "M",
            Self::NodeOnline => "A",
        }
    }

    /// Parse `booting`, `offline` or `online` (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "booting" | "node_booting" => Some(Self::NodeBooting),
            "offline" | "node_offline" => Some(Self::NodeOffline),
            "online" | "node_online" => Some(Self::NodeOnline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Compute,
    Service,
}

impl NodeKind {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Compute => "ComputeNode",
            Self::Service => "ServiceNode",
        }
    }

    pub fn set_state_procedure(&self) -> &'static str {
        match self {
            Self::Compute => "ComputeNodeSetState",
            Self::Service => "ServiceNodeSetState",
        }
    }

    pub fn error_procedure(&self) -> &'static str {
        match self {
            Self::Compute => "ErrorOnComputeNode",
            Self::Service => "ErrorOnServiceNode",
        }
    }
}

/// Cached basic information about one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub kind: NodeKind,
    pub lctn: String,
    pub host_name: Option<String>,
    pub sequence_number: i64,
    pub owner: String,
}

/// Applies node state transitions for one adapter instance.
pub struct NodeStateCoordinator {
    gateway: Arc<dyn ProcedureGateway>,
    queue: Arc<WorkItemQueue>,
    nodes: OnceCell<HashMap<String, NodeInfo>>,
    in_flight: TaskTracker,
}

impl NodeStateCoordinator {
    pub fn new(gateway: Arc<dyn ProcedureGateway>, queue: Arc<WorkItemQueue>) -> Self {
        Self {
            gateway,
            queue,
            nodes: OnceCell::new(),
            in_flight: TaskTracker::new(),
        }
    }

    fn ras(&self) -> &Arc<RasEventEmitter> {
        self.queue.ras()
    }

    async fn load_kind(&self, kind: NodeKind, nodes: &mut HashMap<String, NodeInfo>) -> Result<()> {
        let procedure = format!("{}BasicInformation", kind.prefix());
        let response = self.gateway.call(&procedure, &[]).await?;
        let response = response.ensure_success(&procedure)?;
        if let Some(table) = response.first_table() {
            for row in table.rows() {
                let Some(lctn) = row.get_string("Lctn") else {
                    continue;
                };
                nodes.insert(
                    lctn.to_string(),
                    NodeInfo {
                        kind,
                        lctn: lctn.to_string(),
                        host_name: row.get_string("HostName").map(str::to_string),
                        sequence_number: row.get_long("SequenceNumber").unwrap_or_default(),
                        owner: row.get_string("Owner").unwrap_or_default().to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn nodes(&self) -> Result<&HashMap<String, NodeInfo>> {
        self.nodes
            .get_or_try_init(|| async {
                let mut nodes = HashMap::new();
                self.load_kind(NodeKind::Compute, &mut nodes).await?;
                self.load_kind(NodeKind::Service, &mut nodes).await?;
                info!(count = nodes.len(), "Loaded node information");
                Ok::<_, DaiError>(nodes)
            })
            .await
    }

    /// Basic information for `lctn`, loading the node cache on first use.
    pub async fn node_info(&self, lctn: &str) -> Result<Option<NodeInfo>> {
        Ok(self.nodes().await?.get(lctn).cloned())
    }

    pub async fn is_compute_node_lctn(&self, lctn: &str) -> Result<bool> {
        Ok(self
            .node_info(lctn)
            .await?
            .is_some_and(|node| node.kind == NodeKind::Compute))
    }

    pub async fn is_service_node_lctn(&self, lctn: &str) -> Result<bool> {
        Ok(self
            .node_info(lctn)
            .await?
            .is_some_and(|node| node.kind == NodeKind::Service))
    }

    fn spawn_tracked(&self, handle: tokio::task::JoinHandle<()>) {
        self.in_flight.spawn(async move {
            if let Err(e) = handle.await {
                error!(error = %e, "Detached node call panicked");
            }
        });
    }

    /// Record a boot state change for a node without waiting for the store.
    ///
    /// An unknown location is logged and ignored. With `inform_wlm` a node
    /// going online is handed to the workload manager. Booting and offline
    /// are not announced; taking a node away is left to
    /// [`Self::mark_node_in_error_state`].
    pub async fn mark_node_state(
        &self,
        state: BootState,
        lctn: &str,
        timestamp_micros: i64,
        inform_wlm: bool,
    ) -> Result<()> {
        let Some(node) = self.node_info(lctn).await? else {
            error!(lctn, ?state, "Cannot update state of a location that is not a compute or service node");
            return Ok(());
        };

        let identity = self.queue.identity().clone();
        let work_item_id = self.queue.requesting_work_item_id();
        let procedure = node.kind.set_state_procedure();
        let pertinent_info = format!(
            "Lctn={},NewState={},TimeInMicroSecs={}",
            lctn,
            state.code(),
            timestamp_micros
        );
        let call = DetachedCall {
            procedure: procedure.to_string(),
            pertinent_info: pertinent_info.clone(),
            lctn: Some(lctn.to_string()),
            work_item_id,
            returns_value: true,
        };
        let ras = self.ras().clone();
        let kind = node.kind;
        let node_lctn = lctn.to_string();

        let handle = call_detached(
            self.gateway.clone(),
            procedure,
            vec![
                Value::from(lctn),
                Value::from(state.code()),
                Value::Long(timestamp_micros),
                Value::from(identity.adapter_type()),
                Value::Long(work_item_id),
            ],
            move |outcome| async move {
                match outcome {
                    CallOutcome::Failed { message, .. } => {
                        ras.report_failure(&call, &message).await;
                    }
                    CallOutcome::Completed { return_value } => {
                        if return_value.unwrap_or_default() > 0 {
                            info!(
                                procedure = %call.procedure,
                                pertinent_info = %call.pertinent_info,
                                "Item occurred out of timestamp order, still handled"
                            );
                            ras.emit(
                                RasEvent::new(events::OUT_OF_ORDER)
                                    .instance_data(format!(
                                        "AdapterName={}, StoredProcedure={}, PertinentInfo={}",
                                        identity.name(),
                                        call.procedure,
                                        call.pertinent_info
                                    ))
                                    .lctn(node_lctn.clone())
                                    .for_work_item(call.work_item_id),
                            )
                            .await;
                        }
                        if kind == NodeKind::Compute && state == BootState::NodeOnline {
                            ras.emit(
                                RasEvent::new(events::NODE_ACTIVE)
                                    .instance_data(format!(
                                        "AdapterName={}, Lctn={}",
                                        identity.name(),
                                        node_lctn
                                    ))
                                    .lctn(node_lctn.clone())
                                    .at(timestamp_micros)
                                    .for_work_item(call.work_item_id),
                            )
                            .await;
                        }
                    }
                }
            },
        );
        self.spawn_tracked(handle);
        info!(procedure, lctn, %pertinent_info, "Requested node state change");

        if inform_wlm && state == BootState::NodeOnline {
            self.tell_wlm_to_use_this_node(lctn).await?;
        }
        Ok(())
    }

    /// Put a node into error state without waiting for the store.
    pub async fn mark_node_in_error_state(&self, lctn: &str, inform_wlm: bool) -> Result<()> {
        let Some(node) = self.node_info(lctn).await? else {
            error!(lctn, "Cannot put a location that is not a compute or service node into error state");
            return Ok(());
        };

        let identity = self.queue.identity().clone();
        let work_item_id = self.queue.requesting_work_item_id();
        let procedure = node.kind.error_procedure();
        let call = DetachedCall {
            procedure: procedure.to_string(),
            pertinent_info: format!("Lctn={}", lctn),
            lctn: Some(lctn.to_string()),
            work_item_id,
            returns_value: false,
        };
        let ras = self.ras().clone();

        let handle = call_detached(
            self.gateway.clone(),
            procedure,
            vec![
                Value::from(lctn),
                Value::from(identity.adapter_type()),
                Value::Long(work_item_id),
            ],
            move |outcome| async move {
                if let CallOutcome::Failed { message, .. } = outcome {
                    ras.report_failure(&call, &message).await;
                }
            },
        );
        self.spawn_tracked(handle);
        info!(procedure, lctn, "Requested node error state");

        if inform_wlm {
            self.tell_wlm_to_not_use_this_node(lctn, "markNodeInErrorState")
                .await?;
        }
        Ok(())
    }

    /// Whether the workload manager may be told about `lctn`; emits the
    /// diagnostic RAS event when it may not.
    async fn wlm_may_manage(&self, lctn: &str) -> Result<bool> {
        let node = self.node_info(lctn).await?;
        match node {
            Some(node) if node.kind == NodeKind::Compute && node.owner == WLM_OWNER => Ok(true),
            Some(node) if node.kind == NodeKind::Compute => {
                warn!(lctn, owner = %node.owner, "WLM does not own this compute node, not telling it");
                self.ras()
                    .emit(
                        RasEvent::new(events::WLM_UNOWNED_NODE)
                            .instance_data(format!("OwningSubsystem={}", node.owner))
                            .lctn(lctn)
                            .for_work_item(self.queue.requesting_work_item_id()),
                    )
                    .await;
                Ok(false)
            }
            _ => {
                warn!(lctn, "Not a compute node, not telling WLM");
                self.ras()
                    .emit(
                        RasEvent::new(events::WLM_NON_COMPUTE_NODE)
                            .lctn(lctn)
                            .for_work_item(self.queue.requesting_work_item_id()),
                    )
                    .await;
                Ok(false)
            }
        }
    }

    /// Queue `UseNode` for the workload manager. Returns the new work item id,
    /// or `None` when the node is not a WLM-owned compute node.
    pub async fn tell_wlm_to_use_this_node(&self, lctn: &str) -> Result<Option<i64>> {
        if !self.wlm_may_manage(lctn).await? {
            return Ok(None);
        }
        let id = self
            .queue
            .queue_work_item(
                NewWorkItem::new(WLM_ADAPTER_TYPE, "UseNode").parameters([("locations", lctn)]),
            )
            .await?;
        info!(lctn, work_item_id = id, "Told WLM to use node");
        Ok(Some(id))
    }

    /// Queue `DontUseNode` for the workload manager.
    pub async fn tell_wlm_to_not_use_this_node(
        &self,
        lctn: &str,
        reason: &str,
    ) -> Result<Option<i64>> {
        if !self.wlm_may_manage(lctn).await? {
            return Ok(None);
        }
        let id = self
            .queue
            .queue_work_item(NewWorkItem::new(WLM_ADAPTER_TYPE, "DontUseNode").parameters([
                ("locations", lctn),
                ("ensure_node_drained", "false"),
                ("reason_for_draining", reason),
            ]))
            .await?;
        info!(lctn, reason, work_item_id = id, "Told WLM to stop using node");
        Ok(Some(id))
    }

    /// Wait for every detached state change issued so far, including the RAS
    /// events their outcomes produce.
    pub async fn flush(&self) {
        self.in_flight.close();
        self.in_flight.wait().await;
        self.in_flight.reopen();
        self.ras().flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterIdentity;
    use crate::gateway::{SqliteGateway, sqlite_test_gateway};
    use crate::work_queue::WaitOptions;

    async fn coordinator() -> (Arc<SqliteGateway>, NodeStateCoordinator) {
        let gateway = Arc::new(sqlite_test_gateway().await);
        for (procedure, lctn, owner) in [
            ("ComputeNodeDiscovered", "R0-CN1", "W"),
            ("ComputeNodeDiscovered", "R0-CN2", "G"),
            ("ServiceNodeDiscovered", "R0-SN0", "S"),
        ] {
            gateway
                .call(
                    procedure,
                    &[
                        lctn.into(),
                        Value::Null,
                        owner.into(),
                        Value::Long(1_000),
                        "PROVISIONER".into(),
                        Value::Long(-1),
                    ],
                )
                .await
                .unwrap();
        }

        let identity = Arc::new(AdapterIdentity::new(
            "PROVISIONER",
            "PROVISIONER_ADAPTER",
            "R0-SN0",
            "sn0",
            9,
        ));
        let ras = Arc::new(RasEventEmitter::new(gateway.clone(), identity.clone()));
        let queue = Arc::new(WorkItemQueue::new(
            gateway.clone(),
            identity,
            ras,
            WaitOptions::default(),
        ));
        (gateway.clone(), NodeStateCoordinator::new(gateway, queue))
    }

    async fn ras_types(gateway: &SqliteGateway) -> Vec<String> {
        sqlx::query_scalar("SELECT EventType FROM RasEvent ORDER BY Id")
            .fetch_all(gateway.pool())
            .await
            .unwrap()
    }

    #[test]
    fn test_boot_state_codes() {
        assert_eq!(BootState::NodeBooting.code(), "B");
        assert_eq!(BootState::NodeOffline.code(), "M");
        assert_eq!(BootState::NodeOnline.code(), "A");
        assert_eq!(BootState::parse("Online"), Some(BootState::NodeOnline));
        assert_eq!(BootState::parse("sideways"), None);
    }

    #[tokio::test]
    async fn test_node_cache() {
        let (_gateway, coordinator) = coordinator().await;
        assert!(coordinator.is_compute_node_lctn("R0-CN1").await.unwrap());
        assert!(!coordinator.is_compute_node_lctn("R0-SN0").await.unwrap());
        assert!(coordinator.is_service_node_lctn("R0-SN0").await.unwrap());
        assert_eq!(coordinator.node_info("R9").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_online_compute_node_emits_node_active() {
        let (gateway, coordinator) = coordinator().await;
        coordinator
            .mark_node_state(BootState::NodeOnline, "R0-CN1", 2_000, false)
            .await
            .unwrap();
        coordinator.flush().await;

        let state: String = sqlx::query_scalar("SELECT State FROM ComputeNode WHERE Lctn = 'R0-CN1'")
            .fetch_one(gateway.pool())
            .await
            .unwrap();
        assert_eq!(state, "A");
        assert_eq!(ras_types(&gateway).await, vec!["0002000001".to_string()]);
    }

    #[tokio::test]
    async fn test_out_of_order_change_emits_ras() {
        let (gateway, coordinator) = coordinator().await;
        coordinator
            .mark_node_state(BootState::NodeBooting, "R0-SN0", 5_000, false)
            .await
            .unwrap();
        coordinator.flush().await;
        coordinator
            .mark_node_state(BootState::NodeOffline, "R0-SN0", 3_000, false)
            .await
            .unwrap();
        coordinator.flush().await;

        let state: String = sqlx::query_scalar("SELECT State FROM ServiceNode WHERE Lctn = 'R0-SN0'")
            .fetch_one(gateway.pool())
            .await
            .unwrap();
        assert_eq!(state, "B");
        assert_eq!(ras_types(&gateway).await, vec!["0001000009".to_string()]);
    }

    #[tokio::test]
    async fn test_error_to_active_is_suppressed() {
        let (gateway, coordinator) = coordinator().await;
        coordinator
            .mark_node_in_error_state("R0-CN1", false)
            .await
            .unwrap();
        coordinator.flush().await;
        coordinator
            .mark_node_state(BootState::NodeOnline, "R0-CN1", crate::now_micros() + 10_000_000, false)
            .await
            .unwrap();
        coordinator.flush().await;

        let state: String = sqlx::query_scalar("SELECT State FROM ComputeNode WHERE Lctn = 'R0-CN1'")
            .fetch_one(gateway.pool())
            .await
            .unwrap();
        assert_eq!(state, "E");
        assert!(ras_types(&gateway).await.is_empty());
    }

    #[tokio::test]
    async fn test_wlm_told_only_about_owned_compute_nodes() {
        let (gateway, coordinator) = coordinator().await;
        assert!(coordinator.tell_wlm_to_use_this_node("R0-CN1").await.unwrap().is_some());
        assert!(coordinator.tell_wlm_to_use_this_node("R0-CN2").await.unwrap().is_none());
        assert!(coordinator
            .tell_wlm_to_not_use_this_node("R0-SN0", "test")
            .await
            .unwrap()
            .is_none());
        coordinator.flush().await;

        let queued: Vec<(String, String)> =
            sqlx::query_as("SELECT WorkingAdapterType, WorkToBeDone FROM WorkItem")
                .fetch_all(gateway.pool())
                .await
                .unwrap();
        assert_eq!(queued, vec![("WLM".to_string(), "UseNode".to_string())]);
        let mut types = ras_types(&gateway).await;
        types.sort();
        assert_eq!(types, vec!["0003000001".to_string(), "0003000002".to_string()]);
    }
}
