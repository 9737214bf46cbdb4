use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A transformed row awaiting merge, owned by one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StagingRow {
    pub seq: i64,
    pub job_id: Uuid,
    pub record_key: String,
    pub payload_fingerprint: String,
    pub source_system: String,
    pub ingested_at: DateTime<Utc>,
    pub attributes: serde_json::Value,
}

/// A row to be written to staging. `seq` is assigned by the store on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStagingRow {
    pub job_id: Uuid,
    pub record_key: String,
    pub payload_fingerprint: String,
    pub source_system: String,
    pub ingested_at: DateTime<Utc>,
    pub attributes: serde_json::Value,
}

impl NewStagingRow {
    pub fn new(
        job_id: Uuid,
        record_key: &str,
        payload_fingerprint: &str,
        source_system: &str,
        attributes: serde_json::Value,
    ) -> Self {
        Self {
            job_id,
            record_key: record_key.to_owned(),
            payload_fingerprint: payload_fingerprint.to_owned(),
            source_system: source_system.to_owned(),
            ingested_at: Utc::now(),
            attributes,
        }
    }

    pub fn ingested_at(mut self, ingested_at: DateTime<Utc>) -> Self {
        self.ingested_at = ingested_at;
        self
    }
}

/// The durable, merged version of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProductionRow {
    pub record_key: String,
    pub payload_fingerprint: String,
    pub source_system: String,
    pub attributes: serde_json::Value,
    pub last_job_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
