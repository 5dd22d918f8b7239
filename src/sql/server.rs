use chrono::{DateTime, Utc};
use indoc::formatdoc;
use sqlx::MySqlExecutor;

use crate::errors::Result;

use super::Tables;

#[tracing::instrument(skip_all, err, fields(otel.kind = "client", db.system = "mysql"))]
pub(crate) async fn announce<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    server_id: &str,
    data: &str,
    heartbeat: DateTime<Utc>,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            INSERT INTO {server} (`Id`, `Data`, `LastHeartbeat`)
            VALUES (?, ?, ?)
            ON DUPLICATE KEY UPDATE `Data` = VALUES(`Data`), `LastHeartbeat` = VALUES(`LastHeartbeat`)
        "#,
        server = tables.server
    );

    sqlx::query(&sql)
        .bind(server_id)
        .bind(data)
        .bind(heartbeat)
        .execute(executor)
        .await?;

    Ok(())
}

pub(crate) async fn heartbeat<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    server_id: &str,
    heartbeat: DateTime<Utc>,
) -> Result<()> {
    let sql = format!(
        "UPDATE {server} SET `LastHeartbeat` = ? WHERE `Id` = ?",
        server = tables.server
    );

    sqlx::query(&sql)
        .bind(heartbeat)
        .bind(server_id)
        .execute(executor)
        .await?;

    Ok(())
}

pub(crate) async fn remove<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    server_id: &str,
) -> Result<()> {
    let sql = format!("DELETE FROM {server} WHERE `Id` = ?", server = tables.server);

    sqlx::query(&sql).bind(server_id).execute(executor).await?;

    Ok(())
}

/// Deletes every server whose heartbeat is older than the cutoff; returns
/// the number of removed registrations.
pub(crate) async fn remove_timed_out<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let sql = format!(
        "DELETE FROM {server} WHERE `LastHeartbeat` < ?",
        server = tables.server
    );

    let result = sqlx::query(&sql).bind(cutoff).execute(executor).await?;

    Ok(result.rows_affected())
}
