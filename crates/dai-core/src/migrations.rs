// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for dai-core.
//!
//! The store schema (work items, adapters, nodes, RAS events and metadata) is
//! embedded in the binary. [`crate::gateway::SqliteGateway`] applies it on
//! connect; products managing their own pool can call [`run_sqlite`].
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use dai_core::migrations;
//!
//! let pool = SqlitePool::connect(&database_url).await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with the full schema embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
