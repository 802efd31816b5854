// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in work item handlers.
//!
//! | WorkToBeDone | Parameters | Effect |
//! |--------------|------------|--------|
//! | `UseNode` | `locations` | acknowledge that the node may take jobs |
//! | `DontUseNode` | `locations`, `reason_for_draining` | acknowledge that the node is drained |
//! | `ChangeNodeState` | `Lctn`, `State`, `InformWlm` | record a node boot state |

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::agent::{WorkContext, WorkHandler};
use crate::error::{DaiError, Result};
use crate::node_state::BootState;
use crate::now_micros;

/// Acknowledges `UseNode` requests.
pub struct UseNodeHandler;

#[async_trait]
impl WorkHandler for UseNodeHandler {
    async fn handle(&self, ctx: &WorkContext<'_>) -> Result<()> {
        let lctn = ctx.parameter("locations")?;
        info!(lctn = %lctn, work_item_id = ctx.item.id, "Node may be used");
        ctx.queue
            .finished_work_item(
                &ctx.item.work_to_be_done,
                ctx.item.id,
                &format!("Lctn={}, Usable=true", lctn),
            )
            .await
    }
}

/// Acknowledges `DontUseNode` requests.
pub struct DontUseNodeHandler;

#[async_trait]
impl WorkHandler for DontUseNodeHandler {
    async fn handle(&self, ctx: &WorkContext<'_>) -> Result<()> {
        let lctn = ctx.parameter("locations")?;
        let reason = ctx
            .optional_parameter("reason_for_draining")?
            .unwrap_or_default();
        info!(lctn = %lctn, reason = %reason, work_item_id = ctx.item.id, "Node must not be used");
        ctx.queue
            .finished_work_item(
                &ctx.item.work_to_be_done,
                ctx.item.id,
                &format!("Lctn={}, Usable=false, Reason={}", lctn, reason),
            )
            .await
    }
}

/// Applies a requested node boot state.
pub struct ChangeNodeStateHandler;

#[async_trait]
impl WorkHandler for ChangeNodeStateHandler {
    async fn handle(&self, ctx: &WorkContext<'_>) -> Result<()> {
        let lctn = ctx.parameter("Lctn")?;
        let raw_state = ctx.parameter("State")?;
        let state = BootState::parse(&raw_state).ok_or_else(|| DaiError::InvalidParameter {
            name: "State".to_string(),
            value: raw_state.clone(),
        })?;
        let inform_wlm = ctx
            .optional_parameter("InformWlm")?
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        ctx.nodes
            .mark_node_state(state, &lctn, now_micros(), inform_wlm)
            .await?;
        ctx.queue
            .finished_work_item(
                &ctx.item.work_to_be_done,
                ctx.item.id,
                &format!("Lctn={}, NewState={}", lctn, state.code()),
            )
            .await
    }
}

/// Handlers every adapter gets from [`crate::Agent::with_builtin_handlers`].
pub fn builtin() -> Vec<(&'static str, Arc<dyn WorkHandler>)> {
    vec![
        ("UseNode", Arc::new(UseNodeHandler)),
        ("DontUseNode", Arc::new(DontUseNodeHandler)),
        ("ChangeNodeState", Arc::new(ChangeNodeStateHandler)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterIdentity;
    use crate::agent::{Agent, AgentConfig};
    use crate::gateway::{ProcedureGateway, SqliteGateway, Value, sqlite_test_gateway};
    use crate::work_queue::{NewWorkItem, WaitOptions};

    async fn started_agent() -> (Arc<SqliteGateway>, Agent) {
        let gateway = Arc::new(sqlite_test_gateway().await);
        gateway
            .call(
                "ComputeNodeDiscovered",
                &[
                    Value::from("R0-CN1"),
                    Value::from("cn1"),
                    Value::from("W"),
                    Value::Long(1),
                    Value::from("PROVISIONER"),
                    Value::Long(-1),
                ],
            )
            .await
            .unwrap();

        let identity = Arc::new(AdapterIdentity::new("WLM", "WLM_ADAPTER", "R0-SN0", "sn0", 5));
        let agent = Agent::new(
            gateway.clone(),
            identity,
            AgentConfig::default(),
            WaitOptions::default(),
        )
        .with_builtin_handlers();
        agent.start().await.unwrap();
        (gateway, agent)
    }

    #[test]
    fn test_builtin_names() {
        let names: Vec<_> = builtin().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["UseNode", "DontUseNode", "ChangeNodeState"]);
    }

    #[tokio::test]
    async fn test_use_node_finishes_with_location() {
        let (_gateway, agent) = started_agent().await;
        let id = agent
            .queue()
            .queue_work_item(
                NewWorkItem::new("WLM", "UseNode")
                    .parameters([("locations", "R0-CN1")])
                    .notify_when_finished(true),
            )
            .await
            .unwrap();

        assert!(agent.poll_once().await.unwrap());
        let status = agent.queue().get_work_item_status("WLM", id).await.unwrap();
        assert!(status.is_finished());
        assert_eq!(status.results, "Lctn=R0-CN1, Usable=true");
    }

    #[tokio::test]
    async fn test_dont_use_node_without_locations_fails_item() {
        let (_gateway, agent) = started_agent().await;
        let id = agent
            .queue()
            .queue_work_item(NewWorkItem::new("WLM", "DontUseNode").notify_when_finished(true))
            .await
            .unwrap();

        assert!(agent.poll_once().await.unwrap());
        let status = agent.queue().get_work_item_status("WLM", id).await.unwrap();
        assert!(status.is_error());
        assert!(status.results.contains("locations"));
    }

    #[tokio::test]
    async fn test_change_node_state_rejects_unknown_state() {
        let (_gateway, agent) = started_agent().await;
        let id = agent
            .queue()
            .queue_work_item(
                NewWorkItem::new("WLM", "ChangeNodeState")
                    .parameters([("Lctn", "R0-CN1"), ("State", "sleeping")])
                    .notify_when_finished(true),
            )
            .await
            .unwrap();

        assert!(agent.poll_once().await.unwrap());
        let status = agent.queue().get_work_item_status("WLM", id).await.unwrap();
        assert!(status.is_error());
        assert!(status.results.contains("sleeping"));
    }

    #[tokio::test]
    async fn test_change_node_state_updates_node() {
        let (gateway, agent) = started_agent().await;
        let id = agent
            .queue()
            .queue_work_item(
                NewWorkItem::new("WLM", "ChangeNodeState")
                    .parameters([("Lctn", "R0-CN1"), ("State", "online")])
                    .notify_when_finished(true),
            )
            .await
            .unwrap();

        assert!(agent.poll_once().await.unwrap());
        agent.nodes().flush().await;

        let status = agent.queue().get_work_item_status("WLM", id).await.unwrap();
        assert_eq!(status.results, "Lctn=R0-CN1, NewState=A");

        let state: String = sqlx::query_scalar("SELECT State FROM ComputeNode WHERE Lctn = 'R0-CN1'")
            .fetch_one(gateway.pool())
            .await
            .unwrap();
        assert_eq!(state, "A");
    }
}
