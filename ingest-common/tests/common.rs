use chrono::{DateTime, Duration, Utc};
use ingest_common::{NewJob, NewStagingRow};
use serde_json::json;
use uuid::Uuid;

pub const SOURCE_SYSTEM: &str = "ExternalProvider";

#[allow(dead_code)]
pub fn new_job(fingerprint: &str) -> NewJob {
    NewJob::new(fingerprint, "/data/incoming/source.csv", SOURCE_SYSTEM)
}

#[allow(dead_code)]
pub fn staged(job_id: Uuid, key: &str, fingerprint: &str) -> NewStagingRow {
    NewStagingRow::new(
        job_id,
        key,
        fingerprint,
        SOURCE_SYSTEM,
        json!({ "key": key, "fingerprint": fingerprint }),
    )
}

#[allow(dead_code)]
pub fn dates_match(left: &DateTime<Utc>, right: &DateTime<Utc>) -> bool {
    // Roundtripping a datetime to PG drops sub-microsecond precision
    let diff = *left - *right;
    diff.abs() < Duration::milliseconds(1)
}
