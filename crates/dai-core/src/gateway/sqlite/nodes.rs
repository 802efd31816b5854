// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute and service node procedures.
//!
//! `LastChgTimestamp` is unique per node across the active row and its
//! history. A write older than the active row is kept in history only, and
//! the procedure returns 1 so the caller can report it as out of order.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use super::{Args, ProcResult, abort};
use crate::gateway::{Table, Value};
use crate::now_micros;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Compute,
    Service,
}

impl NodeKind {
    fn table(self) -> &'static str {
        match self {
            Self::Compute => "ComputeNode",
            Self::Service => "ServiceNode",
        }
    }

    fn history_table(self) -> &'static str {
        match self {
            Self::Compute => "ComputeNodeHistory",
            Self::Service => "ServiceNodeHistory",
        }
    }
}

/// Where a history snapshot copies the unchanged columns from.
#[derive(Clone, Copy)]
enum Snapshot<'a> {
    Active(&'a str),
    History(i64),
}

struct Change<'a> {
    state: &'a str,
    timestamp: i64,
    req_adapter_type: &'a str,
    req_work_item_id: i64,
}

async fn insert_history(
    conn: &mut SqliteConnection,
    kind: NodeKind,
    source: Snapshot<'_>,
    change: &Change<'_>,
) -> Result<(), sqlx::Error> {
    let (from, filter) = match source {
        Snapshot::Active(_) => (kind.table(), "Lctn = ?"),
        Snapshot::History(_) => (kind.history_table(), "HistoryId = ?"),
    };
    let sql = format!(
        "INSERT INTO {hist} \
            (Lctn, SequenceNumber, State, HostName, IpAddr, MacAddr, BmcIpAddr, BmcMacAddr, \
             BmcHostName, Owner, Aggregator, LastChgTimestamp, InventoryTimestamp, \
             LastChgAdapterType, LastChgWorkItemId, DbUpdatedTimestamp) \
         SELECT Lctn, SequenceNumber, ?, HostName, IpAddr, MacAddr, BmcIpAddr, BmcMacAddr, \
                BmcHostName, Owner, Aggregator, ?, InventoryTimestamp, ?, ?, ? \
         FROM {from} WHERE {filter}",
        hist = kind.history_table(),
        from = from,
        filter = filter,
    );

    let query = sqlx::query(&sql)
        .bind(change.state)
        .bind(change.timestamp)
        .bind(change.req_adapter_type)
        .bind(change.req_work_item_id)
        .bind(now_micros());
    let query = match source {
        Snapshot::Active(lctn) => query.bind(lctn),
        Snapshot::History(history_id) => query.bind(history_id),
    };
    query.execute(conn).await?;
    Ok(())
}

/// Bump `new_ts` by one microsecond until it collides with neither the active
/// row's timestamp nor any history timestamp for this node.
async fn ensure_unique_timestamp(
    conn: &mut SqliteConnection,
    kind: NodeKind,
    lctn: &str,
    new_ts: i64,
    current_ts: i64,
) -> Result<i64, sqlx::Error> {
    let sql = format!(
        "SELECT HistoryId FROM {} WHERE Lctn = ? AND LastChgTimestamp = ? LIMIT 1",
        kind.history_table()
    );
    let mut ts = new_ts;
    loop {
        if ts == current_ts {
            ts += 1;
        }
        let taken: Option<i64> = sqlx::query_scalar(&sql)
            .bind(lctn)
            .bind(ts)
            .fetch_optional(&mut *conn)
            .await?;
        match taken {
            Some(_) => {
                debug!(lctn, ts, "Timestamp already used, bumping");
                ts += 1;
            }
            None => return Ok(ts),
        }
    }
}

async fn current(
    conn: &mut SqliteConnection,
    kind: NodeKind,
    lctn: &str,
) -> Result<Option<(String, i64)>, sqlx::Error> {
    let sql = format!(
        "SELECT State, LastChgTimestamp FROM {} WHERE Lctn = ?",
        kind.table()
    );
    sqlx::query_as(&sql).bind(lctn).fetch_optional(conn).await
}

async fn update_active(
    conn: &mut SqliteConnection,
    kind: NodeKind,
    lctn: &str,
    change: &Change<'_>,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        "UPDATE {} SET State = ?, LastChgTimestamp = ?, LastChgAdapterType = ?, \
         LastChgWorkItemId = ?, DbUpdatedTimestamp = ? WHERE Lctn = ?",
        kind.table()
    );
    sqlx::query(&sql)
        .bind(change.state)
        .bind(change.timestamp)
        .bind(change.req_adapter_type)
        .bind(change.req_work_item_id)
        .bind(now_micros())
        .bind(lctn)
        .execute(conn)
        .await?;
    Ok(())
}

/// `{Compute,Service}NodeBasicInformation()`
pub(super) async fn basic_information(pool: &SqlitePool, kind: NodeKind) -> ProcResult {
    let sql = format!(
        "SELECT Lctn, HostName, SequenceNumber, Owner, State FROM {} ORDER BY Lctn",
        kind.table()
    );
    let rows: Vec<(String, Option<String>, i64, String, String)> =
        sqlx::query_as(&sql).fetch_all(pool).await?;

    let mut table = Table::new(["Lctn", "HostName", "SequenceNumber", "Owner", "State"]);
    for (lctn, host_name, sequence_number, owner, state) in rows {
        table.push_row(vec![
            lctn.into(),
            host_name.into(),
            Value::Long(sequence_number),
            owner.into(),
            state.into(),
        ]);
    }
    Ok(vec![table])
}

/// `{Compute,Service}NodeSetState(lctn, newState, tsMicros, reqAdapterType, reqWorkItemId)`
///
/// Returns 0 when the active row was updated, 1 when the change was older than
/// the active row.
pub(super) async fn set_state(pool: &SqlitePool, args: &Args<'_>, kind: NodeKind) -> ProcResult {
    let lctn = args.text(0)?;
    let new_state = args.text(1)?;
    let ts = args.long(2)?;
    let req_adapter_type = args.text(3)?;
    let req_work_item_id = args.long(4)?;

    let mut tx = pool.begin().await?;

    let Some((current_state, current_ts)) = current(&mut tx, kind, lctn).await? else {
        return abort(format!(
            "{table}SetState - there is no entry in the {table} table for the specified node lctn({lctn}) \
             - ReqAdapterType={req_adapter_type}, ReqWorkItemId={req_work_item_id}!",
            table = kind.table(),
        ));
    };

    let ts = ensure_unique_timestamp(&mut tx, kind, lctn, ts, current_ts).await?;
    let change = Change {
        state: new_state,
        timestamp: ts,
        req_adapter_type,
        req_work_item_id,
    };

    if ts > current_ts {
        if error_to_active(kind, &current_state, new_state) {
            return reject_error_to_active(lctn);
        }
        update_active(&mut tx, kind, lctn, &change).await?;
        insert_history(&mut tx, kind, Snapshot::Active(lctn), &change).await?;
        tx.commit().await?;
        return Ok(vec![Table::scalar(0_i64)]);
    }

    // A late change is judged against the state the node was in at its timestamp.
    let sql = format!(
        "SELECT HistoryId, State FROM {} WHERE Lctn = ? AND LastChgTimestamp < ? \
         ORDER BY LastChgTimestamp DESC LIMIT 1",
        kind.history_table()
    );
    let preceding: Option<(i64, String)> = sqlx::query_as(&sql)
        .bind(lctn)
        .bind(ts)
        .fetch_optional(&mut *tx)
        .await?;

    if let Some((history_id, preceding_state)) = preceding {
        if error_to_active(kind, &preceding_state, new_state) {
            return reject_error_to_active(lctn);
        }
        insert_history(&mut tx, kind, Snapshot::History(history_id), &change).await?;
        tx.commit().await?;
    }
    debug!(lctn, ts, current_ts, "Node state change arrived out of order");
    Ok(vec![Table::scalar(1_i64)])
}

fn error_to_active(kind: NodeKind, from: &str, to: &str) -> bool {
    kind == NodeKind::Compute && from == "E" && to == "A"
}

fn reject_error_to_active(lctn: &str) -> ProcResult {
    abort(format!(
        "ComputeNodeSetState - Invalid state change was attempted from ERROR to ACTIVE - Lctn={}",
        lctn
    ))
}

/// `ErrorOn{Compute,Service}Node(lctn, reqAdapterType, reqWorkItemId)`
pub(super) async fn error_on_node(pool: &SqlitePool, args: &Args<'_>, kind: NodeKind) -> ProcResult {
    let lctn = args.text(0)?;
    let req_adapter_type = args.text(1)?;
    let req_work_item_id = args.long(2)?;

    let mut tx = pool.begin().await?;

    let Some((_, current_ts)) = current(&mut tx, kind, lctn).await? else {
        return abort(format!(
            "ErrorOn{table} - there is no entry in the {table} table for the specified node ({lctn}) \
             - ReqAdapterType={req_adapter_type}, ReqWorkItemId={req_work_item_id}!",
            table = kind.table(),
        ));
    };

    let ts = now_micros().max(current_ts + 1);
    let ts = ensure_unique_timestamp(&mut tx, kind, lctn, ts, current_ts).await?;
    let change = Change {
        state: "E",
        timestamp: ts,
        req_adapter_type,
        req_work_item_id,
    };

    update_active(&mut tx, kind, lctn, &change).await?;
    insert_history(&mut tx, kind, Snapshot::Active(lctn), &change).await?;
    tx.commit().await?;
    Ok(vec![Table::scalar(0_i64)])
}

/// `{Compute,Service}NodeDiscovered(lctn, hostName, owner, tsMicros, reqAdapterType, reqWorkItemId)`
///
/// Adds the node in state `D`; a node seen again gets a new sequence number.
pub(super) async fn discovered(pool: &SqlitePool, args: &Args<'_>, kind: NodeKind) -> ProcResult {
    let lctn = args.text(0)?;
    let host_name = args.opt_text(1)?;
    let owner = args.text(2)?;
    let ts = args.long(3)?;
    let req_adapter_type = args.text(4)?;
    let req_work_item_id = args.long(5)?;

    let now = now_micros();
    let mut tx = pool.begin().await?;

    let ts = match current(&mut tx, kind, lctn).await? {
        None => {
            let sql = format!(
                "INSERT INTO {} (Lctn, SequenceNumber, State, HostName, Owner, LastChgTimestamp, \
                 LastChgAdapterType, LastChgWorkItemId, DbUpdatedTimestamp) \
                 VALUES (?, 0, 'D', ?, ?, ?, ?, ?, ?)",
                kind.table()
            );
            sqlx::query(&sql)
                .bind(lctn)
                .bind(host_name)
                .bind(owner)
                .bind(ts)
                .bind(req_adapter_type)
                .bind(req_work_item_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            ts
        }
        Some((_, current_ts)) => {
            let ts = ensure_unique_timestamp(&mut tx, kind, lctn, ts.max(current_ts + 1), current_ts)
                .await?;
            let sql = format!(
                "UPDATE {} SET SequenceNumber = SequenceNumber + 1, State = 'D', HostName = ?, \
                 Owner = ?, LastChgTimestamp = ?, LastChgAdapterType = ?, LastChgWorkItemId = ?, \
                 DbUpdatedTimestamp = ? WHERE Lctn = ?",
                kind.table()
            );
            sqlx::query(&sql)
                .bind(host_name)
                .bind(owner)
                .bind(ts)
                .bind(req_adapter_type)
                .bind(req_work_item_id)
                .bind(now)
                .bind(lctn)
                .execute(&mut *tx)
                .await?;
            ts
        }
    };

    let change = Change {
        state: "D",
        timestamp: ts,
        req_adapter_type,
        req_work_item_id,
    };
    insert_history(&mut tx, kind, Snapshot::Active(lctn), &change).await?;
    tx.commit().await?;
    Ok(vec![Table::scalar(0_i64)])
}
