//! Statement modules, one per operation family.
//!
//! Table names are a configuration boundary, not runtime input: they are
//! rendered once per storage instance into a [`Tables`] value and spliced
//! into statement text; values always travel as bound parameters.

pub(crate) mod job;
pub(crate) mod kv;
pub(crate) mod queue;
pub(crate) mod server;

use crate::errors::{Result, StorageError};

/// Job ids travel as text on the public surface; everything internal is the
/// numeric primary key.
pub(crate) fn parse_job_id(job_id: &str) -> Result<i64> {
    job_id
        .trim()
        .parse::<i64>()
        .map_err(|_| StorageError::Validation(format!("malformed job id `{job_id}`")))
}

/// Backtick-quoted, prefix-rendered table names.
#[derive(Debug, Clone)]
pub(crate) struct Tables {
    pub(crate) prefix: String,
    pub(crate) job: String,
    pub(crate) job_parameter: String,
    pub(crate) job_queue: String,
    pub(crate) state: String,
    pub(crate) server: String,
    pub(crate) hash: String,
    pub(crate) set: String,
    pub(crate) list: String,
    pub(crate) counter: String,
    pub(crate) aggregated_counter: String,
}

impl Tables {
    pub(crate) fn new(prefix: &str) -> Self {
        let quote = |table: &str| format!("`{prefix}{table}`");
        Tables {
            prefix: prefix.to_string(),
            job: quote("Job"),
            job_parameter: quote("JobParameter"),
            job_queue: quote("JobQueue"),
            state: quote("State"),
            server: quote("Server"),
            hash: quote("Hash"),
            set: quote("Set"),
            list: quote("List"),
            counter: quote("Counter"),
            aggregated_counter: quote("AggregatedCounter"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_carry_the_prefix_uniformly() {
        let tables = Tables::new("lib1_");
        assert_eq!(tables.job, "`lib1_Job`");
        assert_eq!(tables.counter, "`lib1_Counter`");
        assert_eq!(tables.aggregated_counter, "`lib1_AggregatedCounter`");
        assert_eq!(tables.prefix, "lib1_");
    }

    #[test]
    fn empty_prefix_yields_bare_names() {
        let tables = Tables::new("");
        assert_eq!(tables.job_queue, "`JobQueue`");
    }

    #[test]
    fn job_ids_parse_from_their_textual_form() {
        assert_eq!(parse_job_id("42").unwrap(), 42);
        assert_eq!(parse_job_id(" 7 ").unwrap(), 7);
        assert!(parse_job_id("").is_err());
        assert!(parse_job_id("forty-two").is_err());
    }
}
