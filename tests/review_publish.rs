//! Review gate and publication integration tests.

mod common;

use common::{Harness, HARVEST, RITE};
use lantern::model::{PublishState, ReviewDecisionKind, ReviewableType, ReviewerState};
use lantern::review::PublishOutcome;
use lantern::store::proposals;

const VIGIL: &str = "Through the night of the vigil the mourners keep the lamp burning beside the body, taking turns \
    to recite the names of the ancestors so that the dead may find the road. At first light the lamp is carried \
    to the river and set upon the water while the eldest son speaks the farewell.";

const WELL: &str = "Before a new well is dug the diviner walks the field with a forked hazel rod held loosely in both \
    hands. Where the rod dips a stone is set and a small cake of barley is buried beneath it as a gift to the \
    spirit of the spring, and only then may the digging begin at sunrise.";

async fn passage_ids(h: &Harness, texts: &[(&str, &str)]) -> Vec<String> {
    let mut ids = Vec::new();
    for (locator, text) in texts {
        let source = h.ingest(locator, text).await;
        ids.extend(h.passages(&source).into_iter().map(|p| p.passage_id.to_string()));
    }
    ids
}

// === Scenario: notes are mandatory for negative decisions ===

#[tokio::test]
async fn reject_without_notes_is_a_policy_violation() {
    let h = Harness::new();
    let ids = passage_ids(&h, &[("rite.txt", RITE)]).await;

    let err = h
        .api
        .decide(ReviewableType::Passage, &ids[0], ReviewDecisionKind::Reject, "alice", None)
        .unwrap_err();
    assert_eq!(err.error_code, "policy_violation");

    let unchanged = h.api.lookup(&ids[0]).unwrap();
    assert_eq!(unchanged["reviewer_state"], "proposed");
    assert!(h
        .api
        .audit_trail(&ids[0])
        .unwrap()
        .iter()
        .all(|e| e.action != "review_decision"));
}

#[tokio::test]
async fn needs_revision_then_resubmit_returns_to_queue() {
    let h = Harness::new();
    let ids = passage_ids(&h, &[("rite.txt", RITE)]).await;

    h.api
        .decide(
            ReviewableType::Passage,
            &ids[0],
            ReviewDecisionKind::NeedsRevision,
            "alice",
            Some("locator points at the wrong page"),
        )
        .unwrap();
    assert_eq!(h.api.review_queue(ReviewableType::Passage, 1, 10).unwrap().total, 0);

    h.api.resubmit(ReviewableType::Passage, &ids[0], "curator", None).unwrap();
    let queue = h.api.review_queue(ReviewableType::Passage, 1, 10).unwrap();
    assert_eq!(queue.total, 1);
    assert_eq!(queue.items[0]["passage_id"], ids[0].as_str());
}

// === Scenario: bulk decisions report per item ===

#[tokio::test]
async fn bulk_approve_reports_missing_item_without_rolling_back_others() {
    let h = Harness::new();
    let mut ids = passage_ids(
        &h,
        &[("rite.txt", RITE), ("harvest.txt", HARVEST), ("vigil.txt", VIGIL), ("well.txt", WELL)],
    )
    .await;
    assert_eq!(ids.len(), 4);
    ids.insert(2, "psg_missing".to_string());

    let report = h
        .api
        .bulk_decide(ReviewableType::Passage, &ids, ReviewDecisionKind::Approve, "alice", None)
        .unwrap();
    assert_eq!(report.succeeded, 4);
    assert_eq!(report.failed, 1);
    let missing = &report.items[2];
    assert_eq!(missing.object_id, "psg_missing");
    assert_eq!(missing.error.as_ref().unwrap().error_code, "referential_error");

    for id in ids.iter().filter(|id| id.as_str() != "psg_missing") {
        assert_eq!(h.api.lookup(id).unwrap()["reviewer_state"], "approved");
    }
}

#[tokio::test]
async fn bulk_reject_without_notes_touches_nothing() {
    let h = Harness::new();
    let ids = passage_ids(&h, &[("rite.txt", RITE), ("vigil.txt", VIGIL)]).await;

    let err = h
        .api
        .bulk_decide(ReviewableType::Passage, &ids, ReviewDecisionKind::Reject, "alice", Some("  "))
        .unwrap_err();
    assert_eq!(err.error_code, "policy_violation");
    assert_eq!(h.api.review_queue(ReviewableType::Passage, 1, 10).unwrap().total, 2);
}

// === Scenario: publication requires approved evidence ===

#[tokio::test]
async fn tag_publishes_once_after_its_evidence_is_approved() {
    let h = Harness::new();
    let ids = passage_ids(&h, &[("rite.txt", RITE)]).await;
    let passage_id = lantern::model::PassageId::from_string(&ids[0]);
    let tag = h
        .store
        .read(|c| proposals::tags_for_passage(c, &passage_id))
        .unwrap()
        .remove(0);
    let tag_id = tag.tag_id.to_string();

    h.api
        .decide(ReviewableType::Tag, &tag_id, ReviewDecisionKind::Approve, "alice", None)
        .unwrap();
    let blocked = h.api.publish(ReviewableType::Tag, &tag_id, "curator").unwrap();
    assert!(matches!(blocked, PublishOutcome::Skipped { .. }));

    h.api
        .decide(ReviewableType::Passage, &ids[0], ReviewDecisionKind::Approve, "alice", None)
        .unwrap();
    let PublishOutcome::Published(package) = h.api.publish(ReviewableType::Tag, &tag_id, "curator").unwrap() else {
        panic!("expected the tag to publish");
    };
    assert_eq!(package.snapshot["evidence"][0]["passage_id"], ids[0].as_str());

    let PublishOutcome::AlreadyPublished(again) = h.api.publish(ReviewableType::Tag, &tag_id, "curator").unwrap() else {
        panic!("expected the existing package");
    };
    assert_eq!(again.package_id, package.package_id);
    assert_eq!(again.content_hash, package.content_hash);

    let published = h.api.lookup(&tag_id).unwrap();
    assert_eq!(published["publish_state"], PublishState::Published.as_str());
    let trail = h.api.audit_trail(&tag_id).unwrap();
    assert_eq!(trail.iter().filter(|e| e.action == "publish").count(), 1);
}

#[tokio::test]
async fn published_objects_are_immutable_to_review() {
    let h = Harness::new();
    let ids = passage_ids(&h, &[("rite.txt", RITE)]).await;
    h.api
        .decide(ReviewableType::Passage, &ids[0], ReviewDecisionKind::Approve, "alice", None)
        .unwrap();
    assert!(matches!(
        h.api.publish(ReviewableType::Passage, &ids[0], "curator").unwrap(),
        PublishOutcome::Published(_)
    ));

    let err = h
        .api
        .decide(
            ReviewableType::Passage,
            &ids[0],
            ReviewDecisionKind::Reject,
            "bob",
            Some("second thoughts"),
        )
        .unwrap_err();
    assert_eq!(err.error_code, "policy_violation");
    assert_eq!(h.api.lookup(&ids[0]).unwrap()["reviewer_state"], ReviewerState::Approved.as_str());
}

#[tokio::test]
async fn unapproved_passage_is_skipped_not_published() {
    let h = Harness::new();
    let ids = passage_ids(&h, &[("rite.txt", RITE)]).await;

    let outcome = h.api.publish(ReviewableType::Passage, &ids[0], "curator").unwrap();
    let PublishOutcome::Skipped { reason } = outcome else {
        panic!("expected a skip");
    };
    assert!(reason.contains("not approved"));
}
