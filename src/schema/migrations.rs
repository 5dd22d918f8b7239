use indoc::indoc;

/// One applied-at-most-once schema change, identified by a stable string id
/// recorded in the migrations table.
pub(crate) struct SchemaMigration {
    pub(crate) id: &'static str,
    pub(crate) stmts: &'static [&'static str],
}

/// Applied in declaration order; never re-run, never reordered. Ids already
/// recorded in the migrations table but absent here are ignored.
pub(crate) const SCHEMA_MIGRATIONS: &[SchemaMigration] = &[
    SchemaMigration {
        id: "m000001_set_score_index",
        stmts: &[indoc! {r#"
            CREATE INDEX `IX_{prefix}Set_Score` ON `{prefix}Set` (`Score`);
        "#}],
    },
    SchemaMigration {
        id: "m000002_job_queue_fetch_token_index",
        stmts: &[indoc! {r#"
            CREATE INDEX `IX_{prefix}JobQueue_FetchToken` ON `{prefix}JobQueue` (`FetchToken`);
        "#}],
    },
];
