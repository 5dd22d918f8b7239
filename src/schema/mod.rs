//! Idempotent schema installation and migrations.

mod install;
mod migrations;

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use sqlx::{Connection, MySqlConnection};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::Result;
use crate::lock::resource::Resource;
use crate::lock::session;

use migrations::SCHEMA_MIGRATIONS;

/// Generous deadline for the migration lock: a competing process may be in
/// the middle of installing the whole schema.
const MIGRATION_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

fn render(stmt: &str, prefix: &str) -> String {
    stmt.replace("{prefix}", prefix)
}

/// Ensures the target schema exists: installs the base tables when the job
/// table is absent, then applies pending migrations under the migration lock.
pub(crate) async fn prepare(
    conn: &mut MySqlConnection,
    prefix: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    if !job_table_exists(conn, prefix).await? {
        info!(prefix, "Installing storage schema");
        for stmt in install::INSTALL_STATEMENTS {
            sqlx::query(&render(stmt, prefix)).execute(&mut *conn).await?;
        }
    }

    let lock_name = Resource::Migration.lock_name(prefix);
    session::acquire(conn, &lock_name, MIGRATION_LOCK_TIMEOUT, cancel).await?;
    let result = run_migrations(conn, prefix).await;
    session::release(conn, &lock_name).await;
    result
}

async fn job_table_exists(conn: &mut MySqlConnection, prefix: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables \
         WHERE table_schema = DATABASE() AND table_name = ?",
    )
    .bind(format!("{prefix}Job"))
    .fetch_one(&mut *conn)
    .await?;

    Ok(count > 0)
}

async fn run_migrations(conn: &mut MySqlConnection, prefix: &str) -> Result<()> {
    let create_registry = render(
        "CREATE TABLE IF NOT EXISTS `{prefix}Migration` (
            `Id` VARCHAR(100) NOT NULL,
            `ExecutedAt` DATETIME(6) NOT NULL,
            PRIMARY KEY (`Id`)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
        prefix,
    );
    sqlx::query(&create_registry).execute(&mut *conn).await?;

    let applied: HashSet<String> =
        sqlx::query_scalar(&render("SELECT `Id` FROM `{prefix}Migration`", prefix))
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .collect();

    for migration in SCHEMA_MIGRATIONS {
        if applied.contains(migration.id) {
            continue;
        }

        info!(migration = migration.id, "Applying schema migration");
        let mut tx = conn.begin().await?;
        for stmt in migration.stmts {
            sqlx::query(&render(stmt, prefix)).execute(tx.as_mut()).await?;
        }
        sqlx::query(&render(
            "INSERT INTO `{prefix}Migration` (`Id`, `ExecutedAt`) VALUES (?, ?)",
            prefix,
        ))
        .bind(migration.id)
        .bind(Utc::now())
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;
    }

    Ok(())
}
