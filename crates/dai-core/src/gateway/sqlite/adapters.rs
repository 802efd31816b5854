// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adapter instance registration procedures.

use sqlx::SqlitePool;

use super::{Args, ProcResult, abort};
use crate::gateway::{Table, Value};
use crate::now_micros;

/// Adapter families allowed to register.
const ADAPTER_TYPES: &[&str] = &[
    "WLM",
    "PROVISIONER",
    "RAS",
    "ONLINE_TIER",
    "NEARLINE_TIER",
    "MONITOR",
    "RM_RTE",
    "FM",
    "UI",
    "CONTROL",
    "DIAGNOSTICS",
    "DAI_MGR",
    "SERVICE",
    "INVENTORY",
    "POWER_MANAGER",
    "INITIALIZATION",
    "ALERT_MGR",
    "FABRICCRIT",
    "FABRICPERF",
    "FABRIC",
];

/// `AdapterStarted(adapterType, reqWorkItemId, lctn, pid)`, returns the new adapter id.
pub(super) async fn started(pool: &SqlitePool, args: &Args<'_>) -> ProcResult {
    let adapter_type = args.text(0)?;
    let req_work_item_id = args.long(1)?;
    let lctn = args.text(2)?;
    let pid = args.long(3)?;

    if !ADAPTER_TYPES.contains(&adapter_type.to_uppercase().as_str()) {
        return abort(format!(
            "AdapterStarted - can't start adapter because an invalid AdapterType was specified ({})!",
            adapter_type
        ));
    }

    let now = now_micros();
    let mut tx = pool.begin().await?;

    let id = sqlx::query(
        r#"
        INSERT INTO Adapter
            (AdapterType, State, Lctn, Pid, LastChgAdapterType, LastChgWorkItemId, DbUpdatedTimestamp)
        VALUES (?, 'A', ?, ?, ?, ?, ?)
        "#,
    )
    .bind(adapter_type)
    .bind(lctn)
    .bind(pid)
    .bind(adapter_type)
    .bind(req_work_item_id)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    sqlx::query(
        r#"
        INSERT INTO AdapterHistory
            (Id, AdapterType, State, Lctn, Pid, LastChgAdapterType, LastChgWorkItemId, DbUpdatedTimestamp)
        VALUES (?, ?, 'A', ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(adapter_type)
    .bind(lctn)
    .bind(pid)
    .bind(adapter_type)
    .bind(req_work_item_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(vec![Table::scalar(id)])
}

/// `AdapterInfoUsingTypeLctnPid(adapterType, lctn, pid)`: ids of matching active instances.
pub(super) async fn info_using_type_lctn_pid(pool: &SqlitePool, args: &Args<'_>) -> ProcResult {
    let adapter_type = args.text(0)?;
    let lctn = args.text(1)?;
    let pid = args.long(2)?;

    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT Id FROM Adapter WHERE AdapterType = ? AND Lctn = ? AND Pid = ? ORDER BY Id",
    )
    .bind(adapter_type)
    .bind(lctn)
    .bind(pid)
    .fetch_all(pool)
    .await?;

    let mut table = Table::new(["Id"]);
    for id in ids {
        table.push_row(vec![Value::Long(id)]);
    }
    Ok(vec![table])
}

/// `AdapterTerminated(adapterType, adapterId, reqAdapterType, reqWorkItemId)`,
/// returns the number of instances removed (0 or 1).
pub(super) async fn terminated(pool: &SqlitePool, args: &Args<'_>) -> ProcResult {
    let adapter_type = args.text(0)?;
    let id = args.long(1)?;
    let req_adapter_type = args.text(2)?;
    let req_work_item_id = args.long(3)?;

    let now = now_micros();
    let mut tx = pool.begin().await?;

    let existing: Option<(String, i64)> =
        sqlx::query_as("SELECT Lctn, Pid FROM Adapter WHERE AdapterType = ? AND Id = ?")
            .bind(adapter_type)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

    let Some((lctn, pid)) = existing else {
        return Ok(vec![Table::scalar(0_i64)]);
    };

    sqlx::query("DELETE FROM Adapter WHERE AdapterType = ? AND Id = ?")
        .bind(adapter_type)
        .bind(id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO AdapterHistory
            (Id, AdapterType, State, Lctn, Pid, LastChgAdapterType, LastChgWorkItemId, DbUpdatedTimestamp)
        VALUES (?, ?, 'T', ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(adapter_type)
    .bind(lctn)
    .bind(pid)
    .bind(req_adapter_type)
    .bind(req_work_item_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(vec![Table::scalar(1_i64)])
}
