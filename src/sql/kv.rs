//! Reads over the hash / set / list / counter tables.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indoc::formatdoc;
use sqlx::{FromRow, MySqlExecutor};

use crate::errors::Result;

use super::Tables;

/// Sum over the union of raw and aggregated counter rows; missing key is 0.
pub(crate) async fn get_counter<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    key: &str,
) -> Result<i64> {
    let sql = formatdoc!(
        r#"
            SELECT CAST(COALESCE(SUM(`Value`), 0) AS SIGNED)
            FROM (
                SELECT `Value` FROM {counter} WHERE `Key` = ?
                UNION ALL
                SELECT `Value` FROM {aggregated_counter} WHERE `Key` = ?
            ) AS counters
        "#,
        counter = tables.counter,
        aggregated_counter = tables.aggregated_counter
    );

    let total: i64 = sqlx::query_scalar(&sql)
        .bind(key)
        .bind(key)
        .fetch_one(executor)
        .await?;

    Ok(total)
}

pub(crate) async fn get_set_count<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    key: &str,
) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {set} WHERE `Key` = ?",
        set = tables.set
    );

    Ok(sqlx::query_scalar(&sql).bind(key).fetch_one(executor).await?)
}

pub(crate) async fn get_all_items_from_set<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    key: &str,
) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT `Value` FROM {set} WHERE `Key` = ? ORDER BY `Id` ASC",
        set = tables.set
    );

    Ok(sqlx::query_scalar(&sql).bind(key).fetch_all(executor).await?)
}

/// Rank window by `Id` ascending: ranks `[from + 1, to + 1]`.
pub(crate) async fn get_range_from_set<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    key: &str,
    from: u64,
    to: u64,
) -> Result<Vec<String>> {
    if to < from {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT `Value` FROM {set} WHERE `Key` = ? ORDER BY `Id` ASC LIMIT ? OFFSET ?",
        set = tables.set
    );

    let values = sqlx::query_scalar(&sql)
        .bind(key)
        .bind((to - from + 1) as i64)
        .bind(from as i64)
        .fetch_all(executor)
        .await?;

    Ok(values)
}

pub(crate) async fn get_first_by_lowest_score_from_set<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    key: &str,
    from_score: f64,
    to_score: f64,
) -> Result<Option<String>> {
    let sql = formatdoc!(
        r#"
            SELECT `Value` FROM {set}
            WHERE `Key` = ? AND `Score` BETWEEN ? AND ?
            ORDER BY `Score` ASC
            LIMIT 1
        "#,
        set = tables.set
    );

    let value = sqlx::query_scalar(&sql)
        .bind(key)
        .bind(from_score)
        .bind(to_score)
        .fetch_optional(executor)
        .await?;

    Ok(value)
}

pub(crate) async fn get_list_count<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    key: &str,
) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {list} WHERE `Key` = ?",
        list = tables.list
    );

    Ok(sqlx::query_scalar(&sql).bind(key).fetch_one(executor).await?)
}

/// Newest first: lists are read by `Id` descending.
pub(crate) async fn get_all_items_from_list<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    key: &str,
) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT `Value` FROM {list} WHERE `Key` = ? ORDER BY `Id` DESC",
        list = tables.list
    );

    Ok(sqlx::query_scalar(&sql).bind(key).fetch_all(executor).await?)
}

/// Rank window by `Id` descending: ranks `[from + 1, to + 1]`.
pub(crate) async fn get_range_from_list<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    key: &str,
    from: u64,
    to: u64,
) -> Result<Vec<String>> {
    if to < from {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT `Value` FROM {list} WHERE `Key` = ? ORDER BY `Id` DESC LIMIT ? OFFSET ?",
        list = tables.list
    );

    let values = sqlx::query_scalar(&sql)
        .bind(key)
        .bind((to - from + 1) as i64)
        .bind(from as i64)
        .fetch_all(executor)
        .await?;

    Ok(values)
}

#[derive(FromRow)]
#[sqlx(rename_all = "PascalCase")]
struct HashEntryRow {
    field: String,
    value: Option<String>,
}

/// All fields of a keyed hash; `None` when the hash does not exist.
pub(crate) async fn get_all_entries_from_hash<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    key: &str,
) -> Result<Option<HashMap<String, String>>> {
    let sql = format!(
        "SELECT `Field`, `Value` FROM {hash} WHERE `Key` = ?",
        hash = tables.hash
    );

    let rows: Vec<HashEntryRow> = sqlx::query_as(&sql).bind(key).fetch_all(executor).await?;
    if rows.is_empty() {
        return Ok(None);
    }

    Ok(Some(
        rows.into_iter()
            .map(|row| (row.field, row.value.unwrap_or_default()))
            .collect(),
    ))
}

pub(crate) async fn get_hash_count<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    key: &str,
) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {hash} WHERE `Key` = ?",
        hash = tables.hash
    );

    Ok(sqlx::query_scalar(&sql).bind(key).fetch_one(executor).await?)
}

pub(crate) async fn get_value_from_hash<'e>(
    executor: impl MySqlExecutor<'e>,
    tables: &Tables,
    key: &str,
    field: &str,
) -> Result<Option<String>> {
    let sql = format!(
        "SELECT `Value` FROM {hash} WHERE `Key` = ? AND `Field` = ? LIMIT 1",
        hash = tables.hash
    );

    let value: Option<Option<String>> = sqlx::query_scalar(&sql)
        .bind(key)
        .bind(field)
        .fetch_optional(executor)
        .await?;

    Ok(value.flatten())
}

/// Earliest expiry of any row under the key; `None` when nothing expires.
pub(crate) async fn min_expire_at<'e>(
    executor: impl MySqlExecutor<'e>,
    table: &str,
    key: &str,
) -> Result<Option<DateTime<Utc>>> {
    let sql = format!("SELECT MIN(`ExpireAt`) FROM {table} WHERE `Key` = ?");

    let expire_at: Option<DateTime<Utc>> = sqlx::query_scalar(&sql)
        .bind(key)
        .fetch_one(executor)
        .await?;

    Ok(expire_at)
}
