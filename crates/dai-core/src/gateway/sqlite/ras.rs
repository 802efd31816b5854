// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RAS event procedures.

use sqlx::SqlitePool;

use super::{Args, ProcResult, abort};
use crate::gateway::{Table, Value};
use crate::now_micros;

/// `RasEventStore(eventType, instanceData, lctn, jobId, tsMicros, reqAdapterType, reqWorkItemId)`
pub(super) async fn store(pool: &SqlitePool, args: &Args<'_>) -> ProcResult {
    let event_type = args.text(0)?;
    let instance_data = args.opt_text(1)?;
    let lctn = args.opt_text(2)?;
    let job_id = args.opt_text(3)?;
    let ts = args.long(4)?;
    let req_adapter_type = args.text(5)?;
    let req_work_item_id = args.long(6)?;

    if event_type.is_empty() {
        return abort("RasEventStore - an event type is required");
    }

    let id = sqlx::query(
        r#"
        INSERT INTO RasEvent
            (EventType, Lctn, JobId, InstanceData, LastChgTimestamp, LastChgAdapterType,
             LastChgWorkItemId, DbUpdatedTimestamp)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event_type)
    .bind(lctn)
    .bind(job_id)
    .bind(instance_data)
    .bind(ts)
    .bind(req_adapter_type)
    .bind(req_work_item_id)
    .bind(now_micros())
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(vec![Table::scalar(id)])
}

/// `RasEventUpdateJobId(jobId, eventType, eventId)`
pub(super) async fn update_job_id(pool: &SqlitePool, args: &Args<'_>) -> ProcResult {
    let job_id = args.opt_text(0)?;
    let event_type = args.text(1)?;
    let id = args.long(2)?;

    let updated = sqlx::query(
        "UPDATE RasEvent SET JobId = ?, DbUpdatedTimestamp = ? WHERE EventType = ? AND Id = ?",
    )
    .bind(job_id)
    .bind(now_micros())
    .bind(event_type)
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return abort(format!(
            "RasEventUpdateJobId - there is no RasEvent {} with EventType {}",
            id, event_type
        ));
    }
    Ok(vec![Table::scalar(0_i64)])
}

/// `RasMetaDataList()`
pub(super) async fn metadata_list(pool: &SqlitePool) -> ProcResult {
    let rows: Vec<(String, String, String, String, String, Option<String>)> = sqlx::query_as(
        "SELECT EventType, DescriptiveName, Severity, Category, Component, Msg \
         FROM RasMetaData ORDER BY EventType",
    )
    .fetch_all(pool)
    .await?;

    let mut table = Table::new([
        "EventType",
        "DescriptiveName",
        "Severity",
        "Category",
        "Component",
        "Msg",
    ]);
    for (event_type, name, severity, category, component, msg) in rows {
        table.push_row(vec![
            event_type.into(),
            name.into(),
            severity.into(),
            category.into(),
            component.into(),
            Value::from(msg),
        ]);
    }
    Ok(vec![table])
}

#[cfg(test)]
mod tests {
    use super::super::test_support::gateway;
    use crate::gateway::{ProcedureGateway, ResponseStatus, Value};

    #[tokio::test]
    async fn test_store_and_correlate_job() {
        let gw = gateway().await;
        let id = gw
            .call(
                "RasEventStore",
                &[
                    "0001000003".into(),
                    "WorkToBeDone=Frobnicate".into(),
                    "R0-CN1".into(),
                    "?".into(),
                    Value::Long(1_000),
                    "WLM".into(),
                    Value::Long(7),
                ],
            )
            .await
            .unwrap()
            .scalar_long()
            .unwrap();

        let response = gw
            .call(
                "RasEventUpdateJobId",
                &["job-42".into(), "0001000003".into(), Value::Long(id)],
            )
            .await
            .unwrap();
        assert!(response.is_success());

        let job: Option<String> = sqlx::query_scalar("SELECT JobId FROM RasEvent WHERE Id = ?")
            .bind(id)
            .fetch_one(gw.pool())
            .await
            .unwrap();
        assert_eq!(job.as_deref(), Some("job-42"));

        let wrong_type = gw
            .call(
                "RasEventUpdateJobId",
                &["job-42".into(), "0009999999".into(), Value::Long(id)],
            )
            .await
            .unwrap();
        assert_eq!(wrong_type.status, ResponseStatus::GracefulFailure);
    }

    #[tokio::test]
    async fn test_metadata_is_seeded() {
        let gw = gateway().await;
        let response = gw.call("RasMetaDataList", &[]).await.unwrap();
        let table = response.first_table().unwrap();
        let unknown = table
            .rows()
            .find(|r| r.get_string("DescriptiveName") == Some("RasUnknownEvent"))
            .unwrap();
        assert_eq!(unknown.get_string("EventType"), Some("0001000013"));
    }
}
