use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use sqlx::{MySqlConnection, Row};
use tokio_util::sync::CancellationToken;

use crate::errors::Result;

use super::session;

/// Classes of operations whose mutual exclusion is managed through one
/// advisory lock per tag per prefix.
///
/// Variants are declared in the lexicographic order of their tags, so a
/// `BTreeSet<Resource>` iterates in canonical lock-acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resource {
    Counter,
    Hash,
    Job,
    List,
    Lock,
    Migration,
    Queue,
    Server,
    Set,
    State,
}

impl Resource {
    pub(crate) fn tag(self) -> &'static str {
        match self {
            Resource::Counter => "counter",
            Resource::Hash => "hash",
            Resource::Job => "job",
            Resource::List => "list",
            Resource::Lock => "lock",
            Resource::Migration => "migration",
            Resource::Queue => "queue",
            Resource::Server => "server",
            Resource::Set => "set",
            Resource::State => "state",
        }
    }

    /// Full advisory-lock name for this resource under the given prefix.
    pub(crate) fn lock_name(self, prefix: &str) -> String {
        format!("{prefix}/{}", self.tag())
    }
}

/// Acquires every lock in the set on one session, in sorted order, against a
/// single shared deadline. All-or-nothing: a failure partway through releases
/// what was already acquired and rethrows the originating error.
///
/// Returns the acquired lock names for the paired [`release_many`].
pub(crate) async fn acquire_all(
    conn: &mut MySqlConnection,
    prefix: &str,
    resources: &BTreeSet<Resource>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let deadline = Instant::now() + timeout;
    let mut acquired = Vec::with_capacity(resources.len());

    for resource in resources {
        let name = resource.lock_name(prefix);
        let remaining = deadline.saturating_duration_since(Instant::now());
        match session::acquire(conn, &name, remaining, cancel).await {
            Ok(()) => acquired.push(name),
            Err(error) => {
                release_many(conn, &acquired).await;
                return Err(error);
            }
        }
    }

    Ok(acquired)
}

/// Releases each lock independently; individual failures are logged by the
/// session layer and do not stop the remaining releases.
pub(crate) async fn release_many(conn: &mut MySqlConnection, names: &[String]) {
    for name in names {
        session::release(conn, name).await;
    }
}

/// True iff every lock in the set is either free or already held by this
/// same session. One round trip: `CONNECTION_ID()` plus one `IS_USED_LOCK`
/// per name.
pub(crate) async fn all_free_or_held_by_session(
    conn: &mut MySqlConnection,
    prefix: &str,
    resources: &BTreeSet<Resource>,
) -> Result<bool> {
    if resources.is_empty() {
        return Ok(true);
    }

    let holders = (0..resources.len())
        .map(|i| format!("IS_USED_LOCK(?) AS holder{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT CONNECTION_ID() AS session_id, {holders}");

    let mut query = sqlx::query(&sql);
    for resource in resources {
        query = query.bind(resource.lock_name(prefix));
    }
    let row = query.fetch_one(&mut *conn).await?;

    let session_id: u64 = row.try_get("session_id")?;
    for i in 0..resources.len() {
        let holder: Option<u64> = row.try_get(format!("holder{i}").as_str())?;
        if holder.is_some_and(|id| id != session_id) {
            return Ok(false);
        }
    }

    Ok(true)
}
