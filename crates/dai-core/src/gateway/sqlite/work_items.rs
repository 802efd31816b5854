// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work item procedures.
//!
//! Active items live in `WorkItem`; every transition is also appended to
//! `WorkItemHistory`. Done is terminal: the active row is deleted and a `D`
//! history row is written.

use std::collections::HashSet;

use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use super::{Args, ProcResult, abort};
use crate::gateway::{Table, Value};
use crate::now_micros;

const BASE_WORK: &str = "BaseWork";

/// A queued base work item older than this was abandoned by a start that
/// never got to claim it.
const ORPHAN_BASE_WORK_AGE_MICROS: i64 = 60_000_000;

const COLUMNS: &str = "Id, Queue, WorkingAdapterType, WorkToBeDone, Parameters, NotifyWhenFinished, \
     State, RequestingWorkItemId, RequestingAdapterType, WorkingAdapterId, WorkingResults";

#[derive(Debug, sqlx::FromRow)]
#[sqlx(rename_all = "PascalCase")]
struct WorkItemRow {
    id: i64,
    queue: Option<String>,
    working_adapter_type: String,
    work_to_be_done: String,
    parameters: Option<String>,
    notify_when_finished: String,
    state: String,
    requesting_work_item_id: i64,
    requesting_adapter_type: Option<String>,
    working_adapter_id: Option<i64>,
    working_results: Option<String>,
}

async fn fetch(
    conn: &mut SqliteConnection,
    adapter_type: &str,
    id: i64,
) -> Result<Option<WorkItemRow>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM WorkItem WHERE WorkingAdapterType = ? AND Id = ?",
        COLUMNS
    );
    sqlx::query_as(&sql)
        .bind(adapter_type)
        .bind(id)
        .fetch_optional(conn)
        .await
}

/// Append the current active row to history, optionally overriding its state.
async fn copy_to_history(
    conn: &mut SqliteConnection,
    adapter_type: &str,
    id: i64,
    state: Option<&str>,
    end_timestamp: Option<i64>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO WorkItemHistory
            (Id, Queue, WorkingAdapterType, WorkToBeDone, Parameters, NotifyWhenFinished, State,
             RequestingWorkItemId, RequestingAdapterType, WorkingAdapterId, WorkingResults, Results,
             StartTimestamp, DbUpdatedTimestamp, EndTimestamp)
        SELECT Id, Queue, WorkingAdapterType, WorkToBeDone, Parameters, NotifyWhenFinished,
               COALESCE(?, State), RequestingWorkItemId, RequestingAdapterType, WorkingAdapterId,
               WorkingResults, Results, StartTimestamp, DbUpdatedTimestamp, ?
        FROM WorkItem
        WHERE WorkingAdapterType = ? AND Id = ?
        "#,
    )
    .bind(state)
    .bind(end_timestamp)
    .bind(adapter_type)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Record Done in history and drop the active row.
async fn retire(
    conn: &mut SqliteConnection,
    adapter_type: &str,
    id: i64,
    now: i64,
) -> Result<(), sqlx::Error> {
    copy_to_history(&mut *conn, adapter_type, id, Some("D"), Some(now)).await?;
    sqlx::query("DELETE FROM WorkItem WHERE WorkingAdapterType = ? AND Id = ?")
        .bind(adapter_type)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Fail a base work item with `reason` and retire it.
async fn retire_base_work(
    conn: &mut SqliteConnection,
    adapter_type: &str,
    id: i64,
    reason: &str,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE WorkItem SET State = 'E', Results = ?, DbUpdatedTimestamp = ? \
         WHERE WorkingAdapterType = ? AND Id = ?",
    )
    .bind(reason)
    .bind(now)
    .bind(adapter_type)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    copy_to_history(&mut *conn, adapter_type, id, None, None).await?;
    retire(conn, adapter_type, id, now).await
}

/// `WorkItemQueue(queue, adapterType, work, parameters, notify, reqAdapterType, reqWorkItemId)`
pub(super) async fn queue(pool: &SqlitePool, args: &Args<'_>) -> ProcResult {
    let queue = args.opt_text(0)?;
    let adapter_type = args.text(1)?;
    let work = args.text(2)?;
    let parameters = args.opt_text(3)?;
    let notify = args.text(4)?;
    let req_adapter_type = args.opt_text(5)?;
    let req_work_item_id = args.long(6)?;

    if notify != "T" && notify != "F" {
        return abort(format!(
            "WorkItemQueue - invalid NotifyWhenFinished value '{}'",
            notify
        ));
    }

    let now = now_micros();
    let mut tx = pool.begin().await?;

    let id = sqlx::query(
        r#"
        INSERT INTO WorkItem
            (Queue, WorkingAdapterType, WorkToBeDone, Parameters, NotifyWhenFinished, State,
             RequestingWorkItemId, RequestingAdapterType, StartTimestamp, DbUpdatedTimestamp)
        VALUES (?, ?, ?, ?, ?, 'Q', ?, ?, ?, ?)
        "#,
    )
    .bind(queue)
    .bind(adapter_type)
    .bind(work)
    .bind(parameters)
    .bind(notify)
    .bind(req_work_item_id)
    .bind(req_adapter_type)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    copy_to_history(&mut tx, adapter_type, id, None, None).await?;
    tx.commit().await?;

    debug!(work_item_id = id, adapter_type, work, "Work item queued");
    Ok(vec![Table::scalar(id)])
}

/// `WorkItemFindAndOwn(adapterType, adapterId, baseWorkFlag, baseWorkItemId, queue)`
///
/// Returns the claimed row with its state as it was before the claim, or an
/// empty table when nothing is available. A base claim (flag `T`) only ever
/// considers the base work item named by `baseWorkItemId`.
pub(super) async fn find_and_own(pool: &SqlitePool, args: &Args<'_>) -> ProcResult {
    let adapter_type = args.text(0)?;
    let adapter_id = args.long(1)?;
    let base_flag = args.text(2)?;
    let base_work_item_id = args.long(3)?;
    let queue = args.opt_text(4)?.filter(|q| !q.is_empty());

    let base = match base_flag {
        "T" => true,
        "F" => false,
        other => {
            return abort(format!(
                "WorkItemFindAndOwn - invalid base work item flag '{}'",
                other
            ));
        }
    };

    let mut claimed = Table::new([
        "Id",
        "WorkToBeDone",
        "State",
        "WorkingResults",
        "Parameters",
        "Queue",
        "NotifyWhenFinished",
        "RequestingAdapterType",
        "RequestingWorkItemId",
    ]);

    let now = now_micros();
    let mut tx = pool.begin().await?;

    let sql = format!(
        "SELECT {} FROM WorkItem \
         WHERE WorkingAdapterType = ? AND State IN ('Q', 'R') \
           AND (WorkToBeDone = '{}') = ? \
           AND (? = 0 OR Id = ?) \
           AND (? IS NULL OR Queue = ?) \
         ORDER BY Id LIMIT 1",
        COLUMNS, BASE_WORK
    );
    let candidate: Option<WorkItemRow> = sqlx::query_as(&sql)
        .bind(adapter_type)
        .bind(base)
        .bind(base)
        .bind(base_work_item_id)
        .bind(queue)
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(item) = candidate else {
        return Ok(vec![claimed]);
    };

    let updated = sqlx::query(
        "UPDATE WorkItem SET State = 'W', WorkingAdapterId = ?, DbUpdatedTimestamp = ? \
         WHERE Id = ? AND State = ?",
    )
    .bind(adapter_id)
    .bind(now)
    .bind(item.id)
    .bind(&item.state)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        debug!(work_item_id = item.id, "Work item was claimed elsewhere");
        return Ok(vec![claimed]);
    }

    copy_to_history(&mut tx, adapter_type, item.id, None, None).await?;
    tx.commit().await?;

    debug!(
        work_item_id = item.id,
        adapter_id,
        base_work_item_id,
        prior_state = %item.state,
        "Work item claimed"
    );

    claimed.push_row(vec![
        Value::Long(item.id),
        item.work_to_be_done.into(),
        item.state.into(),
        item.working_results.into(),
        item.parameters.into(),
        item.queue.into(),
        item.notify_when_finished.into(),
        item.requesting_adapter_type.into(),
        Value::Long(item.requesting_work_item_id),
    ]);
    Ok(vec![claimed])
}

/// `WorkItemFinished` / `WorkItemFinishedDueToError(adapterType, workItemId, results)`
pub(super) async fn finished(pool: &SqlitePool, args: &Args<'_>, state: &str) -> ProcResult {
    let adapter_type = args.text(0)?;
    let id = args.long(1)?;
    let results = args.opt_text(2)?;
    let procedure = if state == "E" {
        "WorkItemFinishedDueToError"
    } else {
        "WorkItemFinished"
    };

    let now = now_micros();
    let mut tx = pool.begin().await?;

    let Some(item) = fetch(&mut tx, adapter_type, id).await? else {
        return abort(format!(
            "{} - there is no WorkItem {} for adapter type {}",
            procedure, id, adapter_type
        ));
    };
    if item.state != "W" {
        return abort(format!(
            "{} - unable to change WorkItem {} to {} state due to incompatible State value ({})",
            procedure, id, state, item.state
        ));
    }

    sqlx::query(
        "UPDATE WorkItem SET State = ?, Results = ?, DbUpdatedTimestamp = ? \
         WHERE WorkingAdapterType = ? AND Id = ?",
    )
    .bind(state)
    .bind(results)
    .bind(now)
    .bind(adapter_type)
    .bind(id)
    .execute(&mut *tx)
    .await?;
    copy_to_history(&mut tx, adapter_type, id, None, None).await?;

    // Nobody is waiting for the results, go straight to Done.
    if item.notify_when_finished == "F" {
        retire(&mut tx, adapter_type, id, now).await?;
    }

    tx.commit().await?;
    Ok(vec![Table::scalar(0_i64)])
}

/// `WorkItemDone(adapterType, workItemId)`
///
/// Returns 0 when the item moved to Done and 1 when it was already Done.
pub(super) async fn done(pool: &SqlitePool, args: &Args<'_>) -> ProcResult {
    let adapter_type = args.text(0)?;
    let id = args.long(1)?;

    let now = now_micros();
    let mut tx = pool.begin().await?;

    match fetch(&mut tx, adapter_type, id).await? {
        Some(item) if item.state == "F" || item.state == "E" => {
            retire(&mut tx, adapter_type, id, now).await?;
            tx.commit().await?;
            Ok(vec![Table::scalar(0_i64)])
        }
        Some(item) => abort(format!(
            "WorkItemDone - unable to change WorkItem {} to Done state due to incompatible State value ({})",
            id, item.state
        )),
        None => {
            let already_done: Option<i64> = sqlx::query_scalar(
                "SELECT HistoryId FROM WorkItemHistory \
                 WHERE WorkingAdapterType = ? AND Id = ? AND State = 'D' LIMIT 1",
            )
            .bind(adapter_type)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

            match already_done {
                Some(_) => Ok(vec![Table::scalar(1_i64)]),
                None => abort(format!(
                    "WorkItemDone - there is no WorkItem {} for adapter type {}",
                    id, adapter_type
                )),
            }
        }
    }
}

fn state_results_table(row: Option<(String, Option<String>)>) -> Vec<Table> {
    let mut table = Table::new(["State", "Results"]);
    if let Some((state, results)) = row {
        table.push_row(vec![state.into(), results.into()]);
    }
    vec![table]
}

/// `WorkItemStateAndResults(adapterType, workItemId)`
pub(super) async fn state_and_results(pool: &SqlitePool, args: &Args<'_>) -> ProcResult {
    let adapter_type = args.text(0)?;
    let id = args.long(1)?;

    let row: Option<(String, Option<String>)> = sqlx::query_as(
        "SELECT State, Results FROM WorkItem WHERE WorkingAdapterType = ? AND Id = ?",
    )
    .bind(adapter_type)
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(state_results_table(row))
}

/// `WorkItemFinishedResults(adapterType, workItemId)`: a row only once the item is F or E.
pub(super) async fn finished_results(pool: &SqlitePool, args: &Args<'_>) -> ProcResult {
    let adapter_type = args.text(0)?;
    let id = args.long(1)?;

    let row: Option<(String, Option<String>)> = sqlx::query_as(
        "SELECT State, Results FROM WorkItem \
         WHERE WorkingAdapterType = ? AND Id = ? AND State IN ('F', 'E')",
    )
    .bind(adapter_type)
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(state_results_table(row))
}

/// `WorkItemSaveRestartData(adapterType, workItemId, restartData, insertFlag, timestamp)`
///
/// A timestamp of 0 means "now". With insertFlag 0 the latest history row is
/// updated in place instead of appending a new one.
pub(super) async fn save_restart_data(pool: &SqlitePool, args: &Args<'_>) -> ProcResult {
    let adapter_type = args.text(0)?;
    let id = args.long(1)?;
    let restart_data = args.opt_text(2)?;
    let insert_flag = args.long(3)?;
    let timestamp = match args.long(4)? {
        0 => now_micros(),
        ts => ts,
    };

    let mut tx = pool.begin().await?;

    let Some(item) = fetch(&mut tx, adapter_type, id).await? else {
        return abort(format!(
            "WorkItemSaveRestartData - there is no WorkItem {} for adapter type {}",
            id, adapter_type
        ));
    };
    if item.state != "W" {
        return abort(format!(
            "WorkItemSaveRestartData - unable to save restart data for WorkItem {} due to incompatible State value ({})",
            id, item.state
        ));
    }

    sqlx::query(
        "UPDATE WorkItem SET WorkingResults = ?, DbUpdatedTimestamp = ? \
         WHERE WorkingAdapterType = ? AND Id = ?",
    )
    .bind(restart_data)
    .bind(timestamp)
    .bind(adapter_type)
    .bind(id)
    .execute(&mut *tx)
    .await?;

    if insert_flag == 1 || item.working_results.is_none() {
        copy_to_history(&mut tx, adapter_type, id, None, None).await?;
    } else {
        sqlx::query(
            "UPDATE WorkItemHistory SET WorkingResults = ?, DbUpdatedTimestamp = ? \
             WHERE HistoryId = (SELECT MAX(HistoryId) FROM WorkItemHistory \
                                WHERE WorkingAdapterType = ? AND Id = ?)",
        )
        .bind(restart_data)
        .bind(timestamp)
        .bind(adapter_type)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(vec![Table::scalar(0_i64)])
}

/// `WorkItemRequeueZombies(adapterType)`
///
/// Requeues (state `R`) working items whose owning adapter instance is no
/// longer active. A null or empty adapter type covers every type. Base work
/// items of dead instances are retired instead, since only their owner can
/// ever claim them, and so are queued base work items nobody claimed within
/// a minute of being created.
pub(super) async fn requeue_zombies(pool: &SqlitePool, args: &Args<'_>) -> ProcResult {
    let adapter_type = args.opt_text(0)?.filter(|t| !t.is_empty());

    let now = now_micros();
    let mut tx = pool.begin().await?;

    let active: HashSet<(String, i64)> =
        sqlx::query_as::<_, (String, i64)>("SELECT AdapterType, Id FROM Adapter WHERE State = 'A'")
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|(t, id)| (t.to_uppercase(), id))
            .collect();

    let orphans: Vec<(String, i64)> = sqlx::query_as(&format!(
        "SELECT WorkingAdapterType, Id FROM WorkItem \
         WHERE State IN ('Q', 'R') AND WorkToBeDone = '{}' AND StartTimestamp < ? \
           AND (? IS NULL OR WorkingAdapterType = ?) \
         ORDER BY Id",
        BASE_WORK
    ))
    .bind(now - ORPHAN_BASE_WORK_AGE_MICROS)
    .bind(adapter_type)
    .bind(adapter_type)
    .fetch_all(&mut *tx)
    .await?;
    for (orphan_type, orphan_id) in orphans {
        debug!(work_item_id = orphan_id, adapter_type = %orphan_type, "Retiring unclaimed base work item");
        retire_base_work(&mut tx, &orphan_type, orphan_id, "Base work item was never claimed", now)
            .await?;
    }

    let sql = format!(
        "SELECT {} FROM WorkItem WHERE State = 'W' AND (? IS NULL OR WorkingAdapterType = ?) \
         ORDER BY WorkingAdapterType, Id",
        COLUMNS
    );
    let working: Vec<WorkItemRow> = sqlx::query_as(&sql)
        .bind(adapter_type)
        .bind(adapter_type)
        .fetch_all(&mut *tx)
        .await?;

    let mut requeued = Table::new([
        "WorkitemId",
        "WorkitemWorkingAdapterType",
        "WorkitemWorkingAdapterId",
        "WorkitemWorkToBeDone",
    ]);

    for item in working {
        let owner_alive = item.working_adapter_id.is_some_and(|owner| {
            active.contains(&(item.working_adapter_type.to_uppercase(), owner))
        });
        if owner_alive {
            continue;
        }

        if item.work_to_be_done == BASE_WORK {
            retire_base_work(
                &mut tx,
                &item.working_adapter_type,
                item.id,
                "Adapter instance is no longer active",
                now,
            )
            .await?;
            continue;
        }

        sqlx::query(
            "UPDATE WorkItem SET State = 'R', WorkingAdapterId = NULL, DbUpdatedTimestamp = ? \
             WHERE WorkingAdapterType = ? AND Id = ?",
        )
        .bind(now)
        .bind(&item.working_adapter_type)
        .bind(item.id)
        .execute(&mut *tx)
        .await?;
        copy_to_history(&mut tx, &item.working_adapter_type, item.id, None, None).await?;

        requeued.push_row(vec![
            Value::Long(item.id),
            item.working_adapter_type.into(),
            item.working_adapter_id.into(),
            item.work_to_be_done.into(),
        ]);
    }

    tx.commit().await?;
    Ok(vec![requeued])
}
