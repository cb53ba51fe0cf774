//! Column conversions for outbox rows.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::Priority;

pub fn attempts_from_sql(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("attempt count out of range: {value}"))
}

pub fn timestamp_to_sql(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn timestamp_from_sql(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .with_context(|| format!("invalid outbox timestamp {value:?}"))
}

pub fn priority_from_sql(value: &str) -> Result<Priority> {
    [Priority::High, Priority::Normal, Priority::Low]
        .into_iter()
        .find(|priority| priority.as_str() == value)
        .ok_or_else(|| anyhow!("unknown outbox priority {value:?}"))
}
