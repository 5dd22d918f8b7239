use chrono::{DateTime, Utc};
use getset::Getters;
use indoc::formatdoc;
use sqlx::{FromRow, MySqlExecutor};

use crate::errors::Result;

use super::Tables;

/// Inserts an available delivery slot for a job.
pub(crate) async fn enqueue<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    queue: &str,
    job_id: i64,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {job_queue} (`JobId`, `Queue`) VALUES (?, ?)",
        job_queue = tables.job_queue
    );

    sqlx::query(&sql)
        .bind(job_id)
        .bind(queue)
        .execute(executor)
        .await?;

    Ok(())
}

/// Renders the atomic claim statement for `queue_count` queues.
///
/// Bind order: fetched-at, token, the queue names, then the stale cutoff.
pub(crate) fn claim_sql(tables: &Tables, queue_count: usize) -> String {
    let placeholders = vec!["?"; queue_count].join(", ");
    formatdoc!(
        r#"
            UPDATE {job_queue}
            SET `FetchedAt` = ?, `FetchToken` = ?
            WHERE `Queue` IN ({placeholders})
              AND (`FetchedAt` IS NULL OR `FetchedAt` < ?)
            LIMIT 1
        "#,
        job_queue = tables.job_queue
    )
}

/// Executes a rendered claim statement; returns the number of claimed rows
/// (zero or one).
pub(crate) async fn claim<'e>(
    executor: impl MySqlExecutor<'e>,
    sql: &str,
    fetched_at: DateTime<Utc>,
    token: &str,
    queues: &[String],
    stale_cutoff: DateTime<Utc>,
) -> Result<u64> {
    let mut query = sqlx::query(sql).bind(fetched_at).bind(token);
    for queue in queues {
        query = query.bind(queue);
    }
    let result = query.bind(stale_cutoff).execute(executor).await?;

    Ok(result.rows_affected())
}

/// The just-claimed slot, located through its fetch token.
#[derive(Debug, FromRow, Getters)]
#[sqlx(rename_all = "PascalCase")]
#[getset(get = "pub(crate)")]
pub(crate) struct ClaimedRow {
    id: i64,
    job_id: i64,
    queue: String,
}

pub(crate) async fn claimed_by_token<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    token: &str,
) -> Result<Option<ClaimedRow>> {
    let sql = format!(
        "SELECT `Id`, `JobId`, `Queue` FROM {job_queue} WHERE `FetchToken` = ? LIMIT 1",
        job_queue = tables.job_queue
    );

    let row = sqlx::query_as(&sql)
        .bind(token)
        .fetch_optional(executor)
        .await?;

    Ok(row)
}

/// Deletes a slot by row id; the id, not the token, is the authority.
pub(crate) async fn remove<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    row_id: i64,
) -> Result<()> {
    let sql = format!(
        "DELETE FROM {job_queue} WHERE `Id` = ?",
        job_queue = tables.job_queue
    );

    sqlx::query(&sql).bind(row_id).execute(executor).await?;

    Ok(())
}

/// Makes a claimed slot immediately available again.
pub(crate) async fn requeue<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    row_id: i64,
) -> Result<()> {
    let sql = format!(
        "UPDATE {job_queue} SET `FetchedAt` = NULL WHERE `Id` = ?",
        job_queue = tables.job_queue
    );

    sqlx::query(&sql).bind(row_id).execute(executor).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_sql_renders_one_placeholder_per_queue() {
        let tables = Tables::new("t_");
        let sql = claim_sql(&tables, 3);
        assert_eq!(sql.matches("?").count(), 2 + 3 + 1);
        assert!(sql.contains("`t_JobQueue`"));
        assert!(sql.contains("LIMIT 1"));
    }
}
