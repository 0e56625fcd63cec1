//! Pipeline integration tests: registration, durable jobs, extraction quality and
//! proposals, driven end to end through `CurationApi` against a file-backed store.

mod common;

use common::{FixedTranslator, Harness, OfflineProposer, HARVEST, RITE};
use lantern::model::{
    JobStatus, ProfileDraft, ProfileSegmentation, RegisterOutcome, ReprocessTriggerMode, TranslationStatus,
};
use lantern::store::{jobs, proposals, ReprocessFilter};
use lantern::PipelineConfig;
use std::sync::Arc;

// === Scenario: the same bytes registered twice ===

#[tokio::test]
async fn exact_duplicate_returns_existing_source() {
    let h = Harness::new();
    let (first_outcome, first) = h.register("rite.txt", RITE).await;
    let (second_outcome, second) = h.register("mirror/rite.txt", RITE).await;

    assert_eq!(first_outcome, RegisterOutcome::Created);
    assert_eq!(second_outcome, RegisterOutcome::ExactDuplicate);
    assert_eq!(second.source_id, first.source_id);
}

#[tokio::test]
async fn rescanned_layout_joins_the_witness_group() {
    let h = Harness::new();
    let (_, first) = h.register("rite.txt", RITE).await;
    let (outcome, second) = h.register("scan/rite.txt", &RITE.replace(' ', "  ")).await;

    assert_eq!(outcome, RegisterOutcome::AlternateWitness);
    assert_eq!(second.witness_group_id, first.witness_group_id);
    assert_ne!(second.source_id, first.source_id);
}

// === Scenario: enqueue is idempotent on its key ===

#[tokio::test]
async fn same_key_returns_same_job() {
    let h = Harness::new();
    let (_, source) = h.register("rite.txt", RITE).await;

    let a = h.api.enqueue_job(source.source_id.as_str(), Some("nightly"), "op").unwrap();
    let b = h.api.enqueue_job(source.source_id.as_str(), Some("nightly"), "op").unwrap();
    assert_eq!(a.job_id, b.job_id);
    assert_eq!(h.api.jobs_with_status(JobStatus::Pending).unwrap().len(), 1);

    let trail = h.api.audit_trail(a.job_id.as_str()).unwrap();
    assert_eq!(trail.iter().filter(|e| e.action == "job_created").count(), 1);
}

#[tokio::test]
async fn enqueue_for_unknown_source_is_referential() {
    let h = Harness::new();
    let err = h.api.enqueue_job("src_missing", None, "op").unwrap_err();
    assert_eq!(err.error_code, "referential_error");
}

// === Scenario: a job runs end to end ===

#[tokio::test]
async fn ingested_source_yields_passages_and_evidence_linked_tags() {
    let h = Harness::new();
    let source = h.ingest("rite.txt", RITE).await;

    let passages = h.passages(&source);
    assert_eq!(passages.len(), 1);
    let completed = h.api.jobs_with_status(JobStatus::Completed).unwrap();
    assert_eq!(completed.len(), 1);

    let tags = h
        .store
        .read(|c| proposals::tags_for_passage(c, &passages[0].passage_id))
        .unwrap();
    assert!(!tags.is_empty());
    for tag in &tags {
        assert!(!tag.evidence_ids.is_empty());
        assert!(tag.evidence_ids.contains(&passages[0].passage_id));
    }
}

#[tokio::test]
async fn reprocessing_a_source_adds_no_duplicate_passages() {
    let h = Harness::new();
    let source = h.ingest("rite.txt", RITE).await;
    let summary = h.api.extract_passages(source.source_id.as_str()).await.unwrap();

    assert_eq!(summary.persisted, 0);
    assert_eq!(summary.existing, 1);
    assert_eq!(h.passages(&source).len(), 1);
}

// === Scenario: the default tuning profile shapes segmentation ===

#[tokio::test]
async fn default_profile_caps_passages_per_source() {
    let text = format!("{}\n\n{}", RITE, HARVEST);

    let open = Harness::new();
    let source = open.ingest("rites.txt", &text).await;
    assert_eq!(open.passages(&source).len(), 2);

    let capped = Harness::new();
    let draft = ProfileDraft {
        name: "one-per-source".into(),
        segmentation: ProfileSegmentation {
            max_passages_per_source: Some(1),
            ..ProfileSegmentation::default()
        },
        ..ProfileDraft::default()
    };
    let profile = capped.api.create_profile(&draft, true, "curator").unwrap();
    assert_eq!(capped.api.default_profile("curator").unwrap().profile_id, profile.profile_id);

    let source = capped.ingest("rites.txt", &text).await;
    let passages = capped.passages(&source);
    assert_eq!(passages.len(), 1);
    assert_eq!(passages[0].locator, "p1:l1-1");
}

// === Scenario: repeated capability failures ===

#[tokio::test]
async fn job_dead_letters_after_max_attempts_and_can_be_requeued() {
    let h = Harness::with(PipelineConfig::default(), |c| c.with_proposer(Arc::new(OfflineProposer)));
    let (_, source) = h.register("rite.txt", RITE).await;
    let job = h.api.enqueue_job(source.source_id.as_str(), None, "op").unwrap();

    h.api.worker().run_until_idle().await.unwrap();

    let dead = h.api.job(job.job_id.as_str()).unwrap();
    assert_eq!(dead.status, JobStatus::DeadLetter);
    assert_eq!(dead.attempt_count, 3);
    assert_eq!(dead.error_code.as_deref(), Some("capability_failure"));
    let attempts = h.store.read(|c| jobs::attempts_for_job(c, &job.job_id)).unwrap();
    assert_eq!(attempts.len(), 3);

    let err = h.api.requeue_dead_letter(Some(job.job_id.as_str()), "", "op").unwrap_err();
    assert_eq!(err.error_code, "policy_violation");

    let requeued = h
        .api
        .requeue_dead_letter(Some(job.job_id.as_str()), "proposal service restored", "op")
        .unwrap();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].status, JobStatus::Pending);
    assert_eq!(requeued[0].attempt_count, 0);
}

#[tokio::test]
async fn requeue_of_a_live_job_is_a_policy_violation() {
    let h = Harness::new();
    let (_, source) = h.register("rite.txt", RITE).await;
    let job = h.api.enqueue_job(source.source_id.as_str(), None, "op").unwrap();

    let err = h.api.requeue_dead_letter(Some(job.job_id.as_str()), "retry", "op").unwrap_err();
    assert_eq!(err.error_code, "policy_violation");
}

// === Scenario: untranslated ratio above threshold ===

#[tokio::test]
async fn high_untranslated_ratio_queues_one_auto_reprocess() {
    let h = Harness::with(PipelineConfig::default(), |c| {
        c.with_translator(Arc::new(FixedTranslator::untranslated(0.35)))
    });
    let (_, source) = h.register("rite.txt", RITE).await;

    let first = h.api.extract_passages(source.source_id.as_str()).await.unwrap();
    let second = h.api.extract_passages(source.source_id.as_str()).await.unwrap();
    assert_eq!(first.reprocess_queued, 1);
    assert_eq!(second.reprocess_queued, 0);

    let queued = h.api.list_reprocess(&ReprocessFilter::new()).unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].trigger_mode, ReprocessTriggerMode::AutoThreshold);
    assert_eq!(h.passages(&source)[0].translation_status, TranslationStatus::NeedsReprocess);
}

#[tokio::test]
async fn manual_reprocess_requires_known_passage() {
    let h = Harness::new();
    let err = h
        .api
        .requeue_passage("psg_missing", ReprocessTriggerMode::Manual, "reviewer_request", None, "op")
        .unwrap_err();
    assert_eq!(err.error_code, "referential_error");
}

// === Scenario: witnesses consolidate ===

#[tokio::test]
async fn witness_group_consolidates_matching_passages() {
    let h = Harness::new();
    let first = h.ingest("rite.txt", RITE).await;
    h.ingest("scan/rite.txt", &RITE.replace(' ', "  ")).await;
    h.ingest("harvest.txt", HARVEST).await;

    let group = first.witness_group_id.clone().unwrap();
    let consolidated = h.api.consolidated_passages(group.as_str()).unwrap();
    assert_eq!(consolidated.len(), 1);
    assert_eq!(consolidated[0].contributors.len(), 2);

    let again = h.api.consolidate(group.as_str(), "op").unwrap();
    assert_eq!(again.created, 0);
    assert_eq!(again.removed, 0);
}
