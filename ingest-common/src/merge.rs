//! Merge of a job's staging rows into production.
//!
//! The algorithm is the same for every store:
//! 1. keep the most recent staging row per record key (`dedup_latest`),
//! 2. compare its payload fingerprint with the stored one (`classify`),
//! 3. insert new keys, overwrite changed ones, leave unchanged ones alone,
//! 4. drop the job's staging rows,
//!
//! all in one transaction.
use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MergeError;
use crate::staging::StagingRow;

/// Counts of production writes done by one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub inserted: u64,
    pub updated: u64,
    /// Deduplicated rows whose fingerprint matched production. Not written.
    pub unchanged: u64,
}

impl MergeOutcome {
    /// Rows actually written to production.
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }
}

#[async_trait]
pub trait MergeEngine: Send + Sync {
    /// Merge the staging rows of `job_id` into production and clear them, atomically.
    /// On error nothing is written and staging is left as it was.
    async fn merge(&self, job_id: Uuid) -> Result<MergeOutcome, MergeError>;

    /// Delete the staging rows of `job_id` without merging them.
    async fn discard_staging(&self, job_id: Uuid) -> Result<u64, MergeError>;
}

/// How a deduplicated staging row relates to production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    New,
    Changed,
    Unchanged,
}

impl Change {
    pub fn as_str(&self) -> &'static str {
        match self {
            Change::New => "new",
            Change::Changed => "changed",
            Change::Unchanged => "unchanged",
        }
    }
}

/// Compare an incoming payload fingerprint with the one stored for the same key.
pub fn classify(incoming: &str, stored: Option<&str>) -> Change {
    match stored {
        None => Change::New,
        Some(stored) if stored == incoming => Change::Unchanged,
        Some(_) => Change::Changed,
    }
}

/// Keep one row per record key: latest `ingested_at`, then highest `seq`.
/// The result is sorted by record key.
pub fn dedup_latest<I>(rows: I) -> Vec<StagingRow>
where
    I: IntoIterator<Item = StagingRow>,
{
    let mut latest: HashMap<String, StagingRow> = HashMap::new();

    for row in rows {
        match latest.get(&row.record_key) {
            Some(current) if (current.ingested_at, current.seq) >= (row.ingested_at, row.seq) => {}
            _ => {
                latest.insert(row.record_key.clone(), row);
            }
        }
    }

    let mut deduped: Vec<StagingRow> = latest.into_values().collect();
    deduped.sort_by(|a, b| a.record_key.cmp(&b.record_key));
    deduped
}

/// Deduplicated rows split by how they must be written.
#[derive(Debug, Default)]
pub struct MergePlan {
    pub inserts: Vec<StagingRow>,
    pub updates: Vec<StagingRow>,
    pub unchanged: Vec<StagingRow>,
}

impl MergePlan {
    /// `stored` looks up the production fingerprint of a record key.
    pub fn build<'a, F>(rows: Vec<StagingRow>, stored: F) -> Self
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let mut plan = MergePlan::default();
        for row in dedup_latest(rows) {
            match classify(&row.payload_fingerprint, stored(&row.record_key)) {
                Change::New => plan.inserts.push(row),
                Change::Changed => plan.updates.push(row),
                Change::Unchanged => plan.unchanged.push(row),
            }
        }
        plan
    }

    pub fn outcome(&self) -> MergeOutcome {
        MergeOutcome {
            inserted: self.inserts.len() as u64,
            updated: self.updates.len() as u64,
            unchanged: self.unchanged.len() as u64,
        }
    }
}

pub(crate) fn record_outcome(outcome: &MergeOutcome) {
    metrics::counter!("ingest_merge_rows", &[("kind", Change::New.as_str())])
        .increment(outcome.inserted);
    metrics::counter!("ingest_merge_rows", &[("kind", Change::Changed.as_str())])
        .increment(outcome.updated);
    metrics::counter!("ingest_merge_rows", &[("kind", Change::Unchanged.as_str())])
        .increment(outcome.unchanged);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn row(seq: i64, key: &str, fingerprint: &str, age_secs: i64) -> StagingRow {
        StagingRow {
            seq,
            job_id: Uuid::nil(),
            record_key: key.to_owned(),
            payload_fingerprint: fingerprint.to_owned(),
            source_system: "ExternalProvider".to_owned(),
            ingested_at: Utc::now() - Duration::seconds(age_secs),
            attributes: serde_json::json!({ "seq": seq }),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("h1", None), Change::New);
        assert_eq!(classify("h1", Some("h1")), Change::Unchanged);
        assert_eq!(classify("h2", Some("h1")), Change::Changed);
    }

    #[test]
    fn test_dedup_keeps_most_recent_row() {
        let deduped = dedup_latest(vec![row(1, "k", "new", 0), row(2, "k", "old", 60)]);

        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].payload_fingerprint, "new");
    }

    #[test]
    fn test_dedup_breaks_ties_with_sequence() {
        let now = Utc::now();
        let mut first = row(1, "k", "first", 0);
        let mut second = row(2, "k", "second", 0);
        first.ingested_at = now;
        second.ingested_at = now;

        let deduped = dedup_latest(vec![second.clone(), first.clone()]);
        assert_eq!(deduped, vec![second.clone()]);

        let deduped = dedup_latest(vec![first, second.clone()]);
        assert_eq!(deduped, vec![second]);
    }

    #[test]
    fn test_dedup_keeps_one_row_per_key() {
        let deduped = dedup_latest(vec![
            row(1, "b", "b1", 10),
            row(2, "a", "a1", 10),
            row(3, "b", "b2", 5),
            row(4, "c", "c1", 10),
        ]);

        let keys: Vec<&str> = deduped.iter().map(|r| r.record_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(deduped[1].payload_fingerprint, "b2");
    }

    #[test]
    fn test_plan_counts_only_real_writes() {
        let stored: HashMap<String, String> = [
            ("same".to_owned(), "h".to_owned()),
            ("diff".to_owned(), "old".to_owned()),
        ]
        .into_iter()
        .collect();

        let plan = MergePlan::build(
            vec![
                row(1, "same", "h", 0),
                row(2, "diff", "new", 0),
                row(3, "fresh", "x", 0),
                row(4, "fresh", "y", 10),
            ],
            |key| stored.get(key).map(String::as_str),
        );

        assert_eq!(
            plan.outcome(),
            MergeOutcome {
                inserted: 1,
                updated: 1,
                unchanged: 1
            }
        );
        assert_eq!(plan.inserts[0].payload_fingerprint, "x");
        assert_eq!(plan.outcome().written(), 2);
    }
}
