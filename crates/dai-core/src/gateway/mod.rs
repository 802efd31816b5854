// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote procedure gateway.
//!
//! Every component talks to the backing store through [`ProcedureGateway`]:
//! call a named procedure with positional arguments and get back a status plus
//! zero or more row sets. A call can be awaited directly or detached with a
//! completion callback via [`call_detached`].

mod sqlite;

pub use sqlite::SqliteGateway;

#[cfg(test)]
pub(crate) use sqlite::test_support::gateway as sqlite_test_gateway;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::DaiError;

/// A positional procedure argument or a result cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Long(i64),
    Text(String),
}

impl Value {
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Long(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Self::Text(v.clone())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Completion status of a remote procedure call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    UserAbort,
    ConnectionLost,
    ConnectionTimeout,
    GracefulFailure,
    ResponseUnknown,
    UnexpectedFailure,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::UserAbort => "USER_ABORT",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::GracefulFailure => "GRACEFUL_FAILURE",
            Self::ResponseUnknown => "RESPONSE_UNKNOWN",
            Self::UnexpectedFailure => "UNEXPECTED_FAILURE",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row set returned by a procedure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Single-cell table holding a procedure's return value.
    pub fn scalar(value: impl Into<Value>) -> Self {
        let mut table = Self::new(["RETURN"]);
        table.push_row(vec![value.into()]);
        table
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len(), "row width mismatch");
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<Row<'_>> {
        self.rows.get(index).map(|values| Row {
            columns: &self.columns,
            values,
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(|values| Row {
            columns: &self.columns,
            values,
        })
    }

    /// First cell of the first row as a long.
    pub fn as_scalar_long(&self) -> Option<i64> {
        self.rows.first()?.first()?.as_long()
    }
}

/// Borrowed view of one row, addressed by column name.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl<'a> Row<'a> {
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        let index = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.values.get(index)
    }

    pub fn get_string(&self, column: &str) -> Option<&'a str> {
        self.get(column).and_then(Value::as_str)
    }

    pub fn get_long(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_long)
    }
}

/// Response to a single procedure call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcedureResponse {
    pub status: ResponseStatus,
    pub status_string: Option<String>,
    pub results: Vec<Table>,
}

impl ProcedureResponse {
    pub fn success(results: Vec<Table>) -> Self {
        Self {
            status: ResponseStatus::Success,
            status_string: None,
            results,
        }
    }

    pub fn failure(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            status_string: Some(message.into()),
            results: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn first_table(&self) -> Option<&Table> {
        self.results.first()
    }

    pub fn scalar_long(&self) -> Option<i64> {
        self.first_table()?.as_scalar_long()
    }

    pub fn message(&self) -> &str {
        self.status_string.as_deref().unwrap_or("")
    }

    /// Turn a non-success status into a [`DaiError::Procedure`].
    pub fn ensure_success(self, procedure: &str) -> Result<Self, DaiError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(DaiError::procedure(procedure, self.status, self.message()))
        }
    }
}

/// Transport-level gateway failures. The call never produced a response.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connection timed out: {0}")]
    ConnectionTimeout(String),

    #[error("response unknown: {0}")]
    ResponseUnknown(String),

    #[error("gateway is closed")]
    Closed,
}

impl GatewayError {
    pub fn status(&self) -> ResponseStatus {
        match self {
            Self::ConnectionLost(_) | Self::Closed => ResponseStatus::ConnectionLost,
            Self::ConnectionTimeout(_) => ResponseStatus::ConnectionTimeout,
            Self::ResponseUnknown(_) => ResponseStatus::ResponseUnknown,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Closed => "GATEWAY_CLOSED",
            other => other.status().as_str(),
        }
    }
}

/// Execute named procedures against the backing store.
///
/// Implementations must be safe to call from the poll loop and from detached
/// completion tasks at the same time.
#[async_trait]
pub trait ProcedureGateway: Send + Sync {
    /// Call `procedure` with positional `args` and wait for its response.
    async fn call(
        &self,
        procedure: &str,
        args: &[Value],
    ) -> Result<ProcedureResponse, GatewayError>;

    /// Release the underlying connections. Later calls fail with [`GatewayError::Closed`].
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Tagged result of a detached call, handed to its completion callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallOutcome {
    Completed {
        return_value: Option<i64>,
    },
    Failed {
        status: ResponseStatus,
        message: String,
    },
}

impl CallOutcome {
    pub fn from_result(result: Result<ProcedureResponse, GatewayError>) -> Self {
        match result {
            Ok(response) if response.is_success() => Self::Completed {
                return_value: response.scalar_long(),
            },
            Ok(response) => Self::Failed {
                status: response.status,
                message: response.message().to_string(),
            },
            Err(e) => Self::Failed {
                status: e.status(),
                message: e.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Issue a call without waiting for it; `on_complete` runs on the spawned task
/// once the response (or transport failure) is known.
pub fn call_detached<F, Fut>(
    gateway: Arc<dyn ProcedureGateway>,
    procedure: impl Into<String>,
    args: Vec<Value>,
    on_complete: F,
) -> JoinHandle<()>
where
    F: FnOnce(CallOutcome) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let procedure = procedure.into();
    tokio::spawn(async move {
        let outcome = CallOutcome::from_result(gateway.call(&procedure, &args).await);
        debug!(procedure = %procedure, ?outcome, "Detached call completed");
        on_complete(outcome).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_table() -> Table {
        let mut table = Table::new(["Lctn", "HostName", "SequenceNumber", "Owner"]);
        table.push_row(vec![
            "R0-CN1".into(),
            "cn1".into(),
            Value::Long(3),
            "W".into(),
        ]);
        table.push_row(vec![
            "R0-CN2".into(),
            Value::Null,
            Value::Long(0),
            "G".into(),
        ]);
        table
    }

    #[test]
    fn test_row_lookup_is_case_insensitive() {
        let table = node_table();
        let row = table.row(0).unwrap();
        assert_eq!(row.get_string("lctn"), Some("R0-CN1"));
        assert_eq!(row.get_long("SEQUENCENUMBER"), Some(3));
        assert!(row.get("Missing").is_none());
    }

    #[test]
    fn test_null_cells_are_not_strings() {
        let table = node_table();
        let row = table.row(1).unwrap();
        assert_eq!(row.get_string("HostName"), None);
        assert!(row.get("HostName").unwrap().is_null());
    }

    #[test]
    fn test_scalar_table() {
        let table = Table::scalar(42_i64);
        assert_eq!(table.as_scalar_long(), Some(42));
        assert_eq!(table.row_count(), 1);
        assert_eq!(Table::new(["Id"]).as_scalar_long(), None);
    }

    #[test]
    fn test_option_into_value() {
        assert_eq!(Value::from(None::<&str>), Value::Null);
        assert_eq!(Value::from(Some("Q")), Value::Text("Q".to_string()));
    }

    #[test]
    fn test_ensure_success() {
        let ok = ProcedureResponse::success(vec![Table::scalar(1_i64)]);
        assert!(ok.ensure_success("WorkItemDone").is_ok());

        let failed = ProcedureResponse::failure(ResponseStatus::UserAbort, "aborted");
        let err = failed.ensure_success("WorkItemDone").unwrap_err();
        assert_eq!(err.status(), Some(ResponseStatus::UserAbort));
        assert!(err.to_string().contains("aborted"));
    }

    #[test]
    fn test_call_outcome_from_result() {
        let completed =
            CallOutcome::from_result(Ok(ProcedureResponse::success(vec![Table::scalar(1_i64)])));
        assert_eq!(
            completed,
            CallOutcome::Completed {
                return_value: Some(1)
            }
        );

        let lost = CallOutcome::from_result(Err(GatewayError::Closed));
        assert!(!lost.is_success());
        assert!(matches!(
            lost,
            CallOutcome::Failed {
                status: ResponseStatus::ConnectionLost,
                ..
            }
        ));
    }

    #[test]
    fn test_call_outcome_serializes_tagged() {
        let outcome = CallOutcome::Failed {
            status: ResponseStatus::GracefulFailure,
            message: "no entry".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["status"], "GRACEFUL_FAILURE");
    }
}
