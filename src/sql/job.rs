use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indoc::formatdoc;
use sqlx::{FromRow, MySqlExecutor};

use crate::errors::Result;
use crate::job::{JobData, StateData};

use super::Tables;

/// Inserts a job record and returns its id.
pub(crate) async fn insert_job<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    invocation_data: &str,
    arguments: &str,
    created_at: DateTime<Utc>,
    expire_at: DateTime<Utc>,
) -> Result<i64> {
    let sql = formatdoc!(
        r#"
            INSERT INTO {job} (`InvocationData`, `Arguments`, `CreatedAt`, `ExpireAt`)
            VALUES (?, ?, ?, ?)
        "#,
        job = tables.job
    );

    let result = sqlx::query(&sql)
        .bind(invocation_data)
        .bind(arguments)
        .bind(created_at)
        .bind(expire_at)
        .execute(executor)
        .await?;

    Ok(result.last_insert_id() as i64)
}

/// Bulk insert of initial job parameters; no-op for an empty map.
pub(crate) async fn insert_job_parameters<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    job_id: i64,
    parameters: &HashMap<String, String>,
) -> Result<()> {
    if parameters.is_empty() {
        return Ok(());
    }

    let rows = vec!["(?, ?, ?)"; parameters.len()].join(", ");
    let sql = format!(
        "INSERT INTO {job_parameter} (`JobId`, `Name`, `Value`) VALUES {rows}",
        job_parameter = tables.job_parameter
    );

    let mut query = sqlx::query(&sql);
    for (name, value) in parameters {
        query = query.bind(job_id).bind(name).bind(value);
    }
    query.execute(executor).await?;

    Ok(())
}

pub(crate) async fn upsert_job_parameter<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    job_id: i64,
    name: &str,
    value: &str,
) -> Result<()> {
    let sql = formatdoc!(
        r#"
            INSERT INTO {job_parameter} (`JobId`, `Name`, `Value`)
            VALUES (?, ?, ?)
            ON DUPLICATE KEY UPDATE `Value` = VALUES(`Value`)
        "#,
        job_parameter = tables.job_parameter
    );

    sqlx::query(&sql)
        .bind(job_id)
        .bind(name)
        .bind(value)
        .execute(executor)
        .await?;

    Ok(())
}

pub(crate) async fn get_job_parameter<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    job_id: i64,
    name: &str,
) -> Result<Option<String>> {
    let sql = format!(
        "SELECT `Value` FROM {job_parameter} WHERE `JobId` = ? AND `Name` = ? LIMIT 1",
        job_parameter = tables.job_parameter
    );

    let value: Option<Option<String>> = sqlx::query_scalar(&sql)
        .bind(job_id)
        .bind(name)
        .fetch_optional(executor)
        .await?;

    Ok(value.flatten())
}

#[derive(FromRow)]
#[sqlx(rename_all = "PascalCase")]
struct JobRow {
    invocation_data: String,
    state_name: Option<String>,
    created_at: DateTime<Utc>,
}

/// Reads a job record. A failure to deserialize the invocation payload is
/// recorded on the returned data instead of failing the read.
pub(crate) async fn get_job_data<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    job_id: i64,
) -> Result<Option<JobData>> {
    let sql = format!(
        "SELECT `InvocationData`, `StateName`, `CreatedAt` FROM {job} WHERE `Id` = ? LIMIT 1",
        job = tables.job
    );

    let row: Option<JobRow> = sqlx::query_as(&sql)
        .bind(job_id)
        .fetch_optional(executor)
        .await?;

    Ok(row.map(|row| {
        let (invocation, load_error) = match serde_json::from_str(&row.invocation_data) {
            Ok(data) => (Some(data), None),
            Err(error) => (None, Some(error.to_string())),
        };
        JobData {
            invocation,
            state_name: row.state_name,
            created_at: row.created_at,
            load_error,
        }
    }))
}

#[derive(FromRow)]
#[sqlx(rename_all = "PascalCase")]
struct StateRow {
    name: String,
    reason: Option<String>,
    data: Option<String>,
}

/// Reads the job's current state through its `StateId` pointer.
pub(crate) async fn get_state_data<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    job_id: i64,
) -> Result<Option<StateData>> {
    let sql = formatdoc!(
        r#"
            SELECT s.`Name`, s.`Reason`, s.`Data`
            FROM {job} j
            INNER JOIN {state} s ON s.`Id` = j.`StateId`
            WHERE j.`Id` = ?
            LIMIT 1
        "#,
        job = tables.job,
        state = tables.state
    );

    let row: Option<StateRow> = sqlx::query_as(&sql)
        .bind(job_id)
        .fetch_optional(executor)
        .await?;

    row.map(|row| {
        let data = match row.data.as_deref() {
            Some(json) if !json.is_empty() => serde_json::from_str(json)?,
            _ => HashMap::new(),
        };
        Ok(StateData {
            name: row.name,
            reason: row.reason,
            data,
        })
    })
    .transpose()
}
