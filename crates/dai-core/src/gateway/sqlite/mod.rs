// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed procedure gateway.
//!
//! Each named procedure runs as one transaction. Calls on a gateway are
//! serialized, and claims use compare-and-set updates so ownership stays
//! exclusive even when several processes share one database file.

mod adapters;
mod nodes;
mod ras;
mod work_items;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{GatewayError, ProcedureGateway, ProcedureResponse, ResponseStatus, Table, Value};
use crate::error::DaiError;
use crate::migrations;
use nodes::NodeKind;

pub(crate) type ProcResult = Result<Vec<Table>, ProcedureError>;

/// Why a procedure did not commit.
#[derive(Debug)]
pub(crate) enum ProcedureError {
    /// Business rule rejected the call; reported as a graceful failure.
    Abort(String),
    Database(sqlx::Error),
}

impl From<sqlx::Error> for ProcedureError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e)
    }
}

pub(crate) fn abort<T>(message: impl Into<String>) -> Result<T, ProcedureError> {
    Err(ProcedureError::Abort(message.into()))
}

/// Positional argument accessor that aborts on missing or mistyped values.
pub(crate) struct Args<'a> {
    procedure: &'a str,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    fn value(&self, index: usize) -> Result<&'a Value, ProcedureError> {
        self.values.get(index).ok_or_else(|| {
            ProcedureError::Abort(format!(
                "{} - missing argument {} (got {})",
                self.procedure,
                index,
                self.values.len()
            ))
        })
    }

    pub(crate) fn text(&self, index: usize) -> Result<&'a str, ProcedureError> {
        match self.value(index)? {
            Value::Text(s) => Ok(s),
            other => abort(format!(
                "{} - argument {} must be a string, got {:?}",
                self.procedure, index, other
            )),
        }
    }

    pub(crate) fn opt_text(&self, index: usize) -> Result<Option<&'a str>, ProcedureError> {
        match self.value(index)? {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s)),
            other => abort(format!(
                "{} - argument {} must be a string or null, got {:?}",
                self.procedure, index, other
            )),
        }
    }

    pub(crate) fn long(&self, index: usize) -> Result<i64, ProcedureError> {
        match self.value(index)? {
            Value::Long(v) => Ok(*v),
            other => abort(format!(
                "{} - argument {} must be a long, got {:?}",
                self.procedure, index, other
            )),
        }
    }
}

/// [`ProcedureGateway`] over a SQLite database with the embedded schema.
pub struct SqliteGateway {
    pool: SqlitePool,
    serial: Mutex<()>,
}

impl SqliteGateway {
    /// Wrap an already-migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            serial: Mutex::new(()),
        }
    }

    /// Open (creating if needed) the database at `database_url` and apply migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DaiError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(connect_error)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(connect_error)?;

        migrations::run_sqlite(&pool).await?;
        info!(database_url, max_connections, "SQLite gateway ready");

        Ok(Self::new(pool))
    }

    /// Private in-memory database. The single connection never expires, so
    /// the data lives as long as the gateway.
    pub async fn in_memory() -> Result<Self, DaiError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(connect_error)?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn dispatch(&self, procedure: &str, args: &Args<'_>) -> Option<ProcResult> {
        let pool = &self.pool;
        let result = match procedure {
            "WorkItemQueue" => work_items::queue(pool, args).await,
            "WorkItemFindAndOwn" => work_items::find_and_own(pool, args).await,
            "WorkItemFinished" => work_items::finished(pool, args, "F").await,
            "WorkItemFinishedDueToError" => work_items::finished(pool, args, "E").await,
            "WorkItemDone" => work_items::done(pool, args).await,
            "WorkItemStateAndResults" => work_items::state_and_results(pool, args).await,
            "WorkItemFinishedResults" => work_items::finished_results(pool, args).await,
            "WorkItemSaveRestartData" => work_items::save_restart_data(pool, args).await,
            "WorkItemRequeueZombies" => work_items::requeue_zombies(pool, args).await,
            "AdapterStarted" => adapters::started(pool, args).await,
            "AdapterInfoUsingTypeLctnPid" => adapters::info_using_type_lctn_pid(pool, args).await,
            "AdapterTerminated" => adapters::terminated(pool, args).await,
            "ComputeNodeBasicInformation" => nodes::basic_information(pool, NodeKind::Compute).await,
            "ServiceNodeBasicInformation" => nodes::basic_information(pool, NodeKind::Service).await,
            "ComputeNodeSetState" => nodes::set_state(pool, args, NodeKind::Compute).await,
            "ServiceNodeSetState" => nodes::set_state(pool, args, NodeKind::Service).await,
            "ErrorOnComputeNode" => nodes::error_on_node(pool, args, NodeKind::Compute).await,
            "ErrorOnServiceNode" => nodes::error_on_node(pool, args, NodeKind::Service).await,
            "ComputeNodeDiscovered" => nodes::discovered(pool, args, NodeKind::Compute).await,
            "ServiceNodeDiscovered" => nodes::discovered(pool, args, NodeKind::Service).await,
            "RasEventStore" => ras::store(pool, args).await,
            "RasEventUpdateJobId" => ras::update_job_id(pool, args).await,
            "RasMetaDataList" => ras::metadata_list(pool).await,
            _ => return None,
        };
        Some(result)
    }
}

#[async_trait]
impl ProcedureGateway for SqliteGateway {
    #[instrument(skip(self, args))]
    async fn call(
        &self,
        procedure: &str,
        args: &[Value],
    ) -> Result<ProcedureResponse, GatewayError> {
        if self.pool.is_closed() {
            return Err(GatewayError::Closed);
        }

        let _serial = self.serial.lock().await;
        let args = Args {
            procedure,
            values: args,
        };

        match self.dispatch(procedure, &args).await {
            Some(Ok(results)) => Ok(ProcedureResponse::success(results)),
            Some(Err(ProcedureError::Abort(message))) => {
                debug!(%message, "Procedure aborted");
                Ok(ProcedureResponse::failure(
                    ResponseStatus::GracefulFailure,
                    message,
                ))
            }
            Some(Err(ProcedureError::Database(e))) => database_failure(e),
            None => {
                warn!("Unknown procedure");
                Ok(ProcedureResponse::failure(
                    ResponseStatus::GracefulFailure,
                    format!("Procedure {} was not found", procedure),
                ))
            }
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

fn connect_error(e: sqlx::Error) -> DaiError {
    DaiError::Gateway(GatewayError::ConnectionLost(e.to_string()))
}

/// Split store errors into transport failures and failed responses.
fn database_failure(e: sqlx::Error) -> Result<ProcedureResponse, GatewayError> {
    match e {
        sqlx::Error::Io(io) => Err(GatewayError::ConnectionLost(io.to_string())),
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => Err(GatewayError::Closed),
        sqlx::Error::PoolTimedOut => Err(GatewayError::ConnectionTimeout(
            "timed out acquiring a database connection".to_string(),
        )),
        other => {
            warn!(error = %other, "Procedure failed in the store");
            Ok(ProcedureResponse::failure(
                ResponseStatus::UnexpectedFailure,
                other.to_string(),
            ))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::gateway;
    use super::*;

    #[tokio::test]
    async fn test_unknown_procedure_is_graceful_failure() {
        let gw = gateway().await;
        let response = gw.call("NoSuchProcedure", &[]).await.unwrap();
        assert_eq!(response.status, ResponseStatus::GracefulFailure);
        assert!(response.message().contains("NoSuchProcedure"));
    }

    #[tokio::test]
    async fn test_mistyped_argument_aborts() {
        let gw = gateway().await;
        let response = gw
            .call("WorkItemDone", &[Value::Long(1), Value::Long(2)])
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatus::GracefulFailure);
        assert!(response.message().contains("must be a string"));
    }

    #[tokio::test]
    async fn test_missing_argument_aborts() {
        let gw = gateway().await;
        let response = gw.call("WorkItemDone", &["WLM".into()]).await.unwrap();
        assert_eq!(response.status, ResponseStatus::GracefulFailure);
        assert!(response.message().contains("missing argument 1"));
    }

    #[tokio::test]
    async fn test_closed_gateway_rejects_calls() {
        let gw = gateway().await;
        gw.close().await;
        assert!(gw.is_closed());
        let err = gw.call("RasMetaDataList", &[]).await.unwrap_err();
        assert!(matches!(err, GatewayError::Closed));
    }
}
