//! Records exchanged with the host job framework.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};

/// Serializable description of the invocation a job performs. The engine
/// stores it opaquely and only deserializes it on read-back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationData {
    pub job_type: String,
    pub method: String,
    #[serde(default)]
    pub parameter_types: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// A state transition supplied by the framework's state machines.
#[derive(Debug, Clone, Default)]
pub struct StateRecord {
    pub name: String,
    pub reason: Option<String>,
    pub data: HashMap<String, String>,
}

/// Job record as read back by the storage connection.
///
/// Invocation data that cannot be deserialized does not fail the read; the
/// parse failure is carried in `load_error` and `invocation` stays `None`.
#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct JobData {
    pub(crate) invocation: Option<InvocationData>,
    pub(crate) state_name: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) load_error: Option<String>,
}

/// Latest state of a job, joined through the job's current state pointer.
#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct StateData {
    pub(crate) name: String,
    pub(crate) reason: Option<String>,
    pub(crate) data: HashMap<String, String>,
}

/// Metadata a worker registers about itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerData {
    pub worker_count: usize,
    #[serde(default)]
    pub queues: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
}
