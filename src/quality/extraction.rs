//! Lazy passage extraction for one source
//!
//! An [`Extraction`] yields one persisted passage per detected span. It is finite
//! and not restartable: a retried job builds a fresh extraction from the parsed
//! text. Passage ids are derived from `(source, locator, excerpt)`, so re-extracting
//! unchanged text finds the existing rows instead of creating new ones.

use super::segment::{locator_matches, segment, Segment};
use super::{assess_excerpt, auto_reprocess_reason, QualitySettings};
use crate::capability::{CapabilityError, Translator};
use crate::error::{CurationError, CurationResult, ProcessingError};
use crate::model::*;
use crate::reprocess::{self, RequeueOutcome};
use crate::store::{insert_audit, passages, SqliteStore};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

/// One passage produced by an extraction pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    /// The stored row (pre-existing rows keep their review state)
    pub passage: Passage,
    pub created: bool,
    pub reprocess: Option<RequeueOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionSummary {
    /// Tuning snapshot the pass ran under
    pub quality_version: String,
    pub persisted: usize,
    pub existing: usize,
    pub skipped: usize,
    pub reprocess_queued: usize,
}

pub struct Extraction<'a> {
    store: &'a SqliteStore,
    translator: &'a dyn Translator,
    source: Source,
    parsed_text: String,
    segments: std::vec::IntoIter<Segment>,
    settings: QualitySettings,
    actor: String,
    summary: ExtractionSummary,
}

impl<'a> Extraction<'a> {
    pub fn new(
        store: &'a SqliteStore,
        translator: &'a dyn Translator,
        source: Source,
        parsed_text: String,
        settings: &QualitySettings,
        actor: &str,
    ) -> Self {
        let segments = segment(&parsed_text, settings.min_passage_length, settings.max_passages_per_source);
        debug!(
            source_id = %source.source_id,
            spans = segments.len(),
            quality_version = %settings.quality_version,
            "segmented source"
        );
        Self {
            store,
            translator,
            source,
            parsed_text,
            segments: segments.into_iter(),
            settings: settings.clone(),
            actor: actor.to_string(),
            summary: ExtractionSummary {
                quality_version: settings.quality_version.clone(),
                ..ExtractionSummary::default()
            },
        }
    }

    pub fn summary(&self) -> &ExtractionSummary {
        &self.summary
    }

    /// Assess, validate and persist the next span.
    ///
    /// Spans that fail validation, or whose translator output is out of
    /// contract, are logged and skipped. Any other translator failure ends the
    /// pass with an error; passages already yielded stay persisted.
    pub async fn next(&mut self) -> Option<Result<Extracted, ProcessingError>> {
        loop {
            let span = self.segments.next()?;
            let quality = match assess_excerpt(self.translator, &span.text, &self.settings).await {
                Ok(quality) => quality,
                Err(CapabilityError::InvalidOutput(reason)) => {
                    warn!(
                        source_id = %self.source.source_id,
                        locator = %span.locator,
                        translator = self.translator.name(),
                        %reason,
                        "skipping span with invalid translator output"
                    );
                    self.summary.skipped += 1;
                    continue;
                }
                Err(err) => {
                    return Some(Err(ProcessingError::Capability {
                        capability: self.translator.name().to_string(),
                        message: err.to_string(),
                    }))
                }
            };

            let passage = self.build_passage(&span, quality);
            if let Err(err) = self.validate(&passage) {
                warn!(
                    source_id = %self.source.source_id,
                    locator = %passage.locator,
                    error = %err,
                    "skipping invalid passage"
                );
                self.summary.skipped += 1;
                continue;
            }
            return Some(self.persist(passage).map_err(ProcessingError::from));
        }
    }

    /// Consume the remaining spans.
    pub async fn drain(mut self) -> Result<ExtractionSummary, ProcessingError> {
        while let Some(item) = self.next().await {
            item?;
        }
        Ok(self.summary)
    }

    fn build_passage(&self, span: &Segment, quality: QualityUpdate) -> Passage {
        let locator = span.locator.to_string();
        let now = Utc::now();
        Passage {
            passage_id: PassageId::from_string(stable_id(
                PassageId::PREFIX,
                &[self.source.source_id.as_str(), &locator, &span.text],
            )),
            source_id: self.source.source_id.clone(),
            text_id: self.source.text_id.clone(),
            locator,
            original_excerpt: span.text.clone(),
            normalized_excerpt: quality.normalized_excerpt,
            detected_language: quality.detected_language,
            language_confidence: quality.language_confidence,
            translation_status: quality.translation_status,
            untranslated_ratio: quality.untranslated_ratio,
            usability_score: quality.usability_score,
            relevance_score: quality.relevance_score,
            relevance_state: quality.relevance_state,
            reviewer_state: ReviewerState::Proposed,
            publish_state: PublishState::Blocked,
            created_at: now,
            updated_at: now,
        }
    }

    fn validate(&self, passage: &Passage) -> CurationResult<()> {
        for (field, value) in [
            ("original_excerpt", &passage.original_excerpt),
            ("normalized_excerpt", &passage.normalized_excerpt),
            ("detected_language", &passage.detected_language),
        ] {
            if value.trim().is_empty() {
                return Err(CurationError::validation(field, "required field is empty"));
            }
        }
        if !locator_matches(&passage.locator, &self.parsed_text, &passage.original_excerpt) {
            return Err(CurationError::validation(
                "locator",
                format!("{} does not resolve to the excerpt", passage.locator),
            ));
        }
        for (field, value) in [
            ("language_confidence", passage.language_confidence),
            ("untranslated_ratio", passage.untranslated_ratio),
            ("usability_score", passage.usability_score),
            ("relevance_score", passage.relevance_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CurationError::validation(field, format!("{} is outside [0, 1]", value)));
            }
        }
        Ok(())
    }

    fn persist(&mut self, passage: Passage) -> CurationResult<Extracted> {
        let actor = self.actor.as_str();
        let settings = &self.settings;
        let extracted = self.store.transaction(|tx| -> CurationResult<Extracted> {
            let created = passages::insert_passage_if_absent(tx, &passage)?;
            if created {
                insert_audit(
                    tx,
                    &AuditEvent::new(actor, "create", "passage", passage.passage_id.as_str())
                        .with_transition(None, Some(ReviewerState::Proposed.as_str()))
                        .with_correlation(passage.source_id.as_str())
                        .with_details(serde_json::json!({
                            "locator": passage.locator,
                            "relevance_state": passage.relevance_state,
                            "translation_status": passage.translation_status,
                            "quality_version": settings.quality_version,
                        })),
                )?;
            }
            let stored = passages::get_passage(tx, &passage.passage_id)?;
            let reason = auto_reprocess_reason(stored.untranslated_ratio, stored.usability_score, settings)
                .filter(|_| stored.relevance_state != RelevanceState::Filtered);
            let reprocess = match reason {
                Some(reason) => Some(reprocess::enqueue(
                    tx,
                    &stored.passage_id,
                    ReprocessTriggerMode::AutoThreshold,
                    reason,
                    None,
                    actor,
                )?),
                None => None,
            };
            Ok(Extracted {
                passage: stored,
                created,
                reprocess,
            })
        })?;

        if extracted.created {
            self.summary.persisted += 1;
        } else {
            self.summary.existing += 1;
        }
        if matches!(extracted.reprocess, Some(RequeueOutcome::Queued(_))) {
            self.summary.reprocess_queued += 1;
        }
        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Assessment, CapabilityError};
    use crate::quality::HeuristicTranslator;
    use crate::store::{jobs, sources, OpenStore, ReprocessFilter};
    use async_trait::async_trait;

    const RITE: &str = "At dawn the priest walks to the temple altar and pours a libation of \
        water and wine as an offering to the ancestor spirit. The invocation is chanted three \
        times while the household stands inside a protective circle drawn with salt.";

    fn seeded_store() -> (SqliteStore, Source) {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let text = Text {
            text_id: TextId::new(),
            title: "Dawn rite".into(),
            origin_region: None,
            tradition_tags: vec![],
            created_at: now,
        };
        let source = Source {
            source_id: SourceId::new(),
            text_id: text.text_id.clone(),
            locator: "dawn.txt".into(),
            format_hint: "txt".into(),
            source_sha256: "a".repeat(64),
            normalized_sha256: "b".repeat(64),
            witness_group_id: None,
            is_duplicate_of: None,
            created_at: now,
        };
        store
            .transaction(|tx| -> CurationResult<()> {
                sources::insert_text(tx, &text)?;
                sources::insert_source(tx, &source)?;
                Ok(())
            })
            .unwrap();
        (store, source)
    }

    fn settings() -> QualitySettings {
        QualitySettings {
            min_passage_length: 40,
            ..QualitySettings::default()
        }
    }

    struct FixedTranslator(Assessment);

    #[async_trait]
    impl Translator for FixedTranslator {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn assess(&self, _text: &str) -> Result<Assessment, CapabilityError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn extracts_one_passage_per_paragraph() {
        let (store, source) = seeded_store();
        let translator = HeuristicTranslator::new();
        let text = format!("{}\n\n{}", RITE, RITE.replace("dawn", "night"));
        let mut extraction = Extraction::new(&store, &translator, source, text, &settings(), "ops");

        let first = extraction.next().await.unwrap().unwrap();
        assert!(first.created);
        assert_eq!(first.passage.locator, "p1:l1-1");
        assert_eq!(first.passage.detected_language, "eng");
        assert_eq!(first.passage.relevance_state, RelevanceState::Accepted);
        assert!(first.reprocess.is_none());

        let second = extraction.next().await.unwrap().unwrap();
        assert_eq!(second.passage.locator, "p1:l3-3");
        assert!(extraction.next().await.is_none());
        assert_eq!(extraction.summary().persisted, 2);
    }

    #[tokio::test]
    async fn re_extraction_keeps_passage_ids() {
        let (store, source) = seeded_store();
        let translator = HeuristicTranslator::new();

        let first = Extraction::new(&store, &translator, source.clone(), RITE.to_string(), &settings(), "ops")
            .drain()
            .await
            .unwrap();
        let second = Extraction::new(&store, &translator, source.clone(), RITE.to_string(), &settings(), "ops")
            .drain()
            .await
            .unwrap();

        assert_eq!(first.persisted, 1);
        assert_eq!(second.persisted, 0);
        assert_eq!(second.existing, 1);
        let rows = store.read(|conn| passages::passages_for_source(conn, &source.source_id)).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_skipped() {
        let (store, source) = seeded_store();
        let translator = FixedTranslator(Assessment {
            translated_text: RITE.to_string(),
            detected_language: "eng".into(),
            confidence: 1.5,
            untranslated_ratio: 0.0,
        });
        let summary = Extraction::new(&store, &translator, source.clone(), RITE.to_string(), &settings(), "ops")
            .drain()
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.persisted, 0);
        let rows = store.read(|conn| passages::passages_for_source(conn, &source.source_id)).unwrap();
        assert!(rows.is_empty());
    }

    // === Scenario: a garbage assessment mid-pass skips only that span ===
    #[tokio::test]
    async fn garbage_assessment_mid_pass_skips_one_span() {
        struct Flaky(std::sync::atomic::AtomicUsize);

        #[async_trait]
        impl Translator for Flaky {
            fn name(&self) -> &str {
                "flaky"
            }

            async fn assess(&self, text: &str) -> Result<Assessment, CapabilityError> {
                let call = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(Assessment {
                    translated_text: text.to_string(),
                    detected_language: "eng".into(),
                    confidence: 0.9,
                    untranslated_ratio: if call == 1 { f64::NAN } else { 0.0 },
                })
            }
        }

        let (store, source) = seeded_store();
        let text = format!("{}\n\n{}\n\n{}", RITE, RITE.replace("dawn", "night"), RITE.replace("dawn", "noon"));
        let translator = Flaky(std::sync::atomic::AtomicUsize::new(0));
        let summary = Extraction::new(&store, &translator, source.clone(), text, &settings(), "ops")
            .drain()
            .await
            .unwrap();

        assert_eq!(summary.persisted, 2);
        assert_eq!(summary.skipped, 1);
        let rows = store.read(|conn| passages::passages_for_source(conn, &source.source_id)).unwrap();
        let locators: Vec<&str> = rows.iter().map(|p| p.locator.as_str()).collect();
        assert!(locators.contains(&"p1:l1-1"));
        assert!(locators.contains(&"p1:l5-5"));
        assert!(!locators.contains(&"p1:l3-3"));
    }

    // === Scenario: the tuning snapshot drives segmentation and scoring ===
    #[tokio::test]
    async fn settings_snapshot_drives_segmentation_and_relevance() {
        let (store, source) = seeded_store();
        let translator = FixedTranslator(Assessment {
            translated_text: "The villagers keep the cake and the stone through the winter.".into(),
            detected_language: "eng".into(),
            confidence: 0.9,
            untranslated_ratio: 0.0,
        });
        let text = format!("{}\n\n{}", RITE, RITE.replace("dawn", "night"));

        let builtin = Extraction::new(&store, &translator, source.clone(), text.clone(), &settings(), "ops");
        let builtin = builtin.drain().await.unwrap();
        assert_eq!(builtin.persisted, 2);
        assert_eq!(builtin.quality_version, "builtin");
        let rows = store.read(|conn| passages::passages_for_source(conn, &source.source_id)).unwrap();
        assert!(rows.iter().all(|p| p.relevance_state == RelevanceState::Filtered));

        let tuned = QualitySettings {
            quality_version: "tpf_test@v3".into(),
            min_passage_length: 2 * RITE.len(),
            relevance_accept_threshold: 0.2,
            relevance_filter_threshold: 0.1,
            ..QualitySettings::default()
        };
        let mut extraction = Extraction::new(&store, &translator, source, text, &tuned, "ops");
        let only = extraction.next().await.unwrap().unwrap();
        assert!(extraction.next().await.is_none());
        assert!(only.created);
        assert_eq!(only.passage.locator, "p1:l1-3");
        assert_eq!(only.passage.relevance_state, RelevanceState::Accepted);
        assert_eq!(extraction.summary().quality_version, "tpf_test@v3");

        let trail = store
            .read(|c| crate::store::audit_trail(c, only.passage.passage_id.as_str()))
            .unwrap();
        assert_eq!(trail[0].details["quality_version"], "tpf_test@v3");
    }

    // === Scenario: untranslated ratio 0.35 queues exactly one reprocess job ===
    #[tokio::test]
    async fn high_untranslated_ratio_queues_reprocess_once() {
        let (store, source) = seeded_store();
        let translator = FixedTranslator(Assessment {
            translated_text: RITE.to_string(),
            detected_language: "lat".into(),
            confidence: 0.7,
            untranslated_ratio: 0.35,
        });

        let summary = Extraction::new(&store, &translator, source.clone(), RITE.to_string(), &settings(), "ops")
            .drain()
            .await
            .unwrap();
        assert_eq!(summary.reprocess_queued, 1);

        let mut again = Extraction::new(&store, &translator, source, RITE.to_string(), &settings(), "ops");
        let extracted = again.next().await.unwrap().unwrap();
        assert!(matches!(extracted.reprocess, Some(RequeueOutcome::AlreadyOpen(_))));

        let queued = store
            .read(|conn| jobs::list_reprocess_jobs(conn, &ReprocessFilter::new()))
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].trigger_mode, ReprocessTriggerMode::AutoThreshold);
        assert_eq!(queued[0].trigger_reason_code, "untranslated_ratio");
        assert_eq!(extracted.passage.translation_status, TranslationStatus::NeedsReprocess);
    }

    #[tokio::test]
    async fn translator_failure_ends_the_pass() {
        struct Down;

        #[async_trait]
        impl Translator for Down {
            fn name(&self) -> &str {
                "down"
            }

            async fn assess(&self, _text: &str) -> Result<Assessment, CapabilityError> {
                Err(CapabilityError::Unavailable("offline".into()))
            }
        }

        let (store, source) = seeded_store();
        let err = Extraction::new(&store, &Down, source, RITE.to_string(), &settings(), "ops")
            .drain()
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::Capability { .. }));
    }
}
