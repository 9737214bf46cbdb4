use chrono::{Duration, Utc};
use common::{dates_match, staged};
use ingest_common::{MergeEngine, MergeError, MergeOutcome, PgMergeEngine};
use sqlx::PgPool;
use uuid::Uuid;

mod common;

#[sqlx::test(migrations = "../migrations")]
async fn test_merge_inserts_and_clears_staging(db: PgPool) {
    let engine = PgMergeEngine::from_pool(db);
    let job_id = Uuid::now_v7();
    let loaded = engine
        .insert_staging_rows(&[staged(job_id, "k1", "h1"), staged(job_id, "k2", "h2")])
        .await
        .expect("failed to stage rows");
    assert_eq!(loaded, 2);

    let outcome = engine.merge(job_id).await.expect("failed to merge");

    assert_eq!(
        outcome,
        MergeOutcome {
            inserted: 2,
            updated: 0,
            unchanged: 0
        }
    );
    assert!(engine.staged_rows(job_id).await.unwrap().is_empty());
    let row = engine.production_row("k1").await.unwrap().unwrap();
    assert_eq!(row.payload_fingerprint, "h1");
    assert_eq!(row.last_job_id, job_id);
    assert_eq!(row.attributes["key"], "k1");
}

#[sqlx::test(migrations = "../migrations")]
async fn test_merge_picks_latest_row_then_highest_sequence(db: PgPool) {
    let engine = PgMergeEngine::from_pool(db);
    let job_id = Uuid::now_v7();
    let now = Utc::now();
    engine
        .insert_staging_rows(&[
            staged(job_id, "recent", "newest").ingested_at(now),
            staged(job_id, "recent", "older").ingested_at(now - Duration::minutes(5)),
            staged(job_id, "tied", "first").ingested_at(now),
            staged(job_id, "tied", "second").ingested_at(now),
        ])
        .await
        .unwrap();

    let staged_rows = engine.staged_rows(job_id).await.unwrap();
    assert_eq!(staged_rows.len(), 4);
    assert!(staged_rows.windows(2).all(|w| w[0].seq < w[1].seq));

    let outcome = engine.merge(job_id).await.unwrap();

    assert_eq!(outcome.inserted, 2);
    let recent = engine.production_row("recent").await.unwrap().unwrap();
    assert_eq!(recent.payload_fingerprint, "newest");
    let tied = engine.production_row("tied").await.unwrap().unwrap();
    assert_eq!(tied.payload_fingerprint, "second");
}

#[sqlx::test(migrations = "../migrations")]
async fn test_unchanged_rows_are_not_rewritten(db: PgPool) {
    let engine = PgMergeEngine::from_pool(db);
    let first_job = Uuid::now_v7();
    engine
        .insert_staging_rows(&[staged(first_job, "same", "h"), staged(first_job, "diff", "old")])
        .await
        .unwrap();
    engine.merge(first_job).await.unwrap();
    let same_before = engine.production_row("same").await.unwrap().unwrap();
    let diff_before = engine.production_row("diff").await.unwrap().unwrap();

    let second_job = Uuid::now_v7();
    engine
        .insert_staging_rows(&[
            staged(second_job, "same", "h"),
            staged(second_job, "diff", "new"),
            staged(second_job, "fresh", "x"),
        ])
        .await
        .unwrap();
    let outcome = engine.merge(second_job).await.unwrap();

    assert_eq!(
        outcome,
        MergeOutcome {
            inserted: 1,
            updated: 1,
            unchanged: 1
        }
    );

    let same_after = engine.production_row("same").await.unwrap().unwrap();
    assert_eq!(same_after.last_job_id, first_job);
    assert!(dates_match(&same_after.updated_at, &same_before.updated_at));

    let diff_after = engine.production_row("diff").await.unwrap().unwrap();
    assert_eq!(diff_after.payload_fingerprint, "new");
    assert_eq!(diff_after.last_job_id, second_job);
    assert!(dates_match(&diff_after.created_at, &diff_before.created_at));
    assert!(diff_after.updated_at >= diff_before.updated_at);
}

#[sqlx::test(migrations = "../migrations")]
async fn test_merge_only_touches_its_own_job(db: PgPool) {
    let engine = PgMergeEngine::from_pool(db);
    let ours = Uuid::now_v7();
    let theirs = Uuid::now_v7();
    engine
        .insert_staging_rows(&[staged(ours, "a", "1"), staged(theirs, "b", "2")])
        .await
        .unwrap();

    engine.merge(ours).await.unwrap();

    assert!(engine.production_row("b").await.unwrap().is_none());
    assert_eq!(engine.staged_rows(theirs).await.unwrap().len(), 1);

    assert_eq!(engine.discard_staging(theirs).await.unwrap(), 1);
    assert!(engine.staged_rows(theirs).await.unwrap().is_empty());
}

#[sqlx::test(migrations = "../migrations")]
async fn test_merge_without_staging_is_a_no_op(db: PgPool) {
    let engine = PgMergeEngine::from_pool(db);
    let outcome = engine.merge(Uuid::now_v7()).await.unwrap();
    assert_eq!(outcome, MergeOutcome::default());
    assert_eq!(engine.insert_staging_rows(&[]).await.unwrap(), 0);
}

#[sqlx::test(migrations = "../migrations")]
async fn test_failed_merge_rolls_back_production_and_staging(db: PgPool) {
    let engine = PgMergeEngine::from_pool(db.clone());
    let first_job = Uuid::now_v7();
    engine
        .insert_staging_rows(&[staged(first_job, "kept", "old")])
        .await
        .unwrap();
    engine.merge(first_job).await.unwrap();
    let kept_before = engine.production_row("kept").await.unwrap().unwrap();

    // Staging cleanup runs after the upserts, make it fail
    sqlx::query(
        r#"
CREATE FUNCTION refuse_staging_delete() RETURNS trigger AS $$
BEGIN
    RAISE EXCEPTION 'staging rows are locked';
END
$$ LANGUAGE plpgsql
        "#,
    )
    .execute(&db)
    .await
    .unwrap();
    sqlx::query(
        r#"
CREATE TRIGGER refuse_staging_delete BEFORE DELETE ON staging_rows
FOR EACH ROW EXECUTE FUNCTION refuse_staging_delete()
        "#,
    )
    .execute(&db)
    .await
    .unwrap();

    let second_job = Uuid::now_v7();
    engine
        .insert_staging_rows(&[
            staged(second_job, "kept", "new"),
            staged(second_job, "added", "x"),
        ])
        .await
        .unwrap();

    match engine.merge(second_job).await {
        Err(MergeError::Aborted { job_id, .. }) => assert_eq!(job_id, second_job),
        other => panic!("unexpected merge result: {other:?}"),
    }

    assert_eq!(
        engine.production_row("kept").await.unwrap().unwrap(),
        kept_before
    );
    assert!(engine.production_row("added").await.unwrap().is_none());
    assert_eq!(engine.staged_rows(second_job).await.unwrap().len(), 2);

    sqlx::query("DROP TRIGGER refuse_staging_delete ON staging_rows")
        .execute(&db)
        .await
        .unwrap();

    let outcome = engine.merge(second_job).await.unwrap();
    assert_eq!(
        outcome,
        MergeOutcome {
            inserted: 1,
            updated: 1,
            unchanged: 0
        }
    );
    assert!(engine.staged_rows(second_job).await.unwrap().is_empty());
}
