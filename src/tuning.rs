//! Tuning Profiles
//!
//! Relevance and reprocess thresholds, extra lexicon terms and segmentation
//! limits live in named, versioned profiles so operators can adjust extraction
//! without a release. Exactly one profile is the default. Each extraction or
//! reprocess pass takes a [`QualitySettings`] snapshot of it when it starts.
//!
//! Drafts are validated on write; a stored profile is always usable as-is.

use crate::config::PipelineConfig;
use crate::error::{CurationError, CurationResult};
use crate::model::*;
use crate::quality::{
    QualitySettings, DEFAULT_ACCEPT_THRESHOLD, DEFAULT_FILTER_THRESHOLD, DEFAULT_MIN_PASSAGE_LENGTH,
    DEFAULT_UNTRANSLATED_RATIO_THRESHOLD, DEFAULT_USABILITY_REPROCESS_THRESHOLD,
};
use crate::store::{insert_audit, tuning, SqliteStore};
use chrono::Utc;
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use tracing::info;

pub const DEFAULT_PROFILE_NAME: &str = "Default";
pub const MIN_PASSAGE_LENGTH_RANGE: RangeInclusive<usize> = 1..=5000;
pub const MAX_PASSAGES_OVERRIDE_RANGE: RangeInclusive<usize> = 1..=500;

impl Default for ProfileThresholds {
    fn default() -> Self {
        Self {
            relevance_accept: DEFAULT_ACCEPT_THRESHOLD,
            relevance_filter: DEFAULT_FILTER_THRESHOLD,
            usability_reprocess: DEFAULT_USABILITY_REPROCESS_THRESHOLD,
            untranslated_ratio: DEFAULT_UNTRANSLATED_RATIO_THRESHOLD,
        }
    }
}

impl Default for ProfileSegmentation {
    fn default() -> Self {
        Self {
            min_passage_length: DEFAULT_MIN_PASSAGE_LENGTH,
            max_passages_per_source: None,
        }
    }
}

fn normalize_terms(terms: &BTreeSet<String>) -> BTreeSet<String> {
    terms
        .iter()
        .map(|term| term.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
        .filter(|term| !term.is_empty())
        .collect()
}

/// Check a draft and return it with its name trimmed and lexicon entries normalized.
pub fn validate_draft(draft: &ProfileDraft) -> CurationResult<ProfileDraft> {
    let name = draft.name.trim();
    if name.is_empty() {
        return Err(CurationError::validation("name", "a profile name is required"));
    }

    let thresholds = &draft.thresholds;
    for (field, value) in [
        ("thresholds.relevance_accept", thresholds.relevance_accept),
        ("thresholds.relevance_filter", thresholds.relevance_filter),
        ("thresholds.usability_reprocess", thresholds.usability_reprocess),
        ("thresholds.untranslated_ratio", thresholds.untranslated_ratio),
    ] {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(CurationError::validation(field, format!("{} is outside [0, 1]", value)));
        }
    }
    if thresholds.relevance_filter > thresholds.relevance_accept {
        return Err(CurationError::validation(
            "thresholds.relevance_filter",
            "must not exceed relevance_accept",
        ));
    }

    let segmentation = &draft.segmentation;
    if !MIN_PASSAGE_LENGTH_RANGE.contains(&segmentation.min_passage_length) {
        return Err(CurationError::validation(
            "segmentation.min_passage_length",
            format!("{} is outside 1..=5000", segmentation.min_passage_length),
        ));
    }
    if let Some(max) = segmentation.max_passages_per_source {
        if !MAX_PASSAGES_OVERRIDE_RANGE.contains(&max) {
            return Err(CurationError::validation(
                "segmentation.max_passages_per_source",
                format!("{} is outside 1..=500", max),
            ));
        }
    }

    Ok(ProfileDraft {
        name: name.to_string(),
        thresholds: thresholds.clone(),
        lexicons: ProfileLexicons {
            positive_keywords: normalize_terms(&draft.lexicons.positive_keywords),
            noise_keywords: normalize_terms(&draft.lexicons.noise_keywords),
            noise_phrases: normalize_terms(&draft.lexicons.noise_phrases),
        },
        segmentation: segmentation.clone(),
    })
}

fn version_label(version: u32) -> String {
    format!("v{}", version)
}

fn insert_new(
    conn: &Connection,
    draft: &ProfileDraft,
    is_default: bool,
    actor: &str,
) -> CurationResult<TuningProfile> {
    let now = Utc::now();
    let profile = TuningProfile {
        profile_id: ProfileId::new(),
        name: draft.name.clone(),
        is_default,
        version: 1,
        thresholds: draft.thresholds.clone(),
        lexicons: draft.lexicons.clone(),
        segmentation: draft.segmentation.clone(),
        created_by: actor.to_string(),
        updated_by: actor.to_string(),
        created_at: now,
        updated_at: now,
    };
    if is_default {
        tuning::clear_default(conn)?;
    }
    tuning::insert_profile(conn, &profile)?;
    insert_audit(
        conn,
        &AuditEvent::new(actor, "create", "tuning_profile", profile.profile_id.as_str())
            .with_transition(None, Some(version_label(1).as_str()))
            .with_details(serde_json::json!({
                "name": profile.name,
                "is_default": is_default,
            })),
    )?;
    Ok(profile)
}

/// Create a profile from a draft, optionally making it the default.
pub fn create_profile(
    store: &SqliteStore,
    draft: &ProfileDraft,
    make_default: bool,
    actor: &str,
) -> CurationResult<TuningProfile> {
    let draft = validate_draft(draft)?;
    let profile = store.transaction(|tx| insert_new(tx, &draft, make_default, actor))?;
    info!(profile_id = %profile.profile_id, name = %profile.name, is_default = make_default, "tuning profile created");
    Ok(profile)
}

/// Replace a profile's content. The version goes up by one.
pub fn update_profile(
    store: &SqliteStore,
    profile_id: &str,
    draft: &ProfileDraft,
    actor: &str,
) -> CurationResult<TuningProfile> {
    let draft = validate_draft(draft)?;
    let profile_id = ProfileId::from_string(profile_id);
    let profile = store.transaction(|tx| -> CurationResult<TuningProfile> {
        let current = tuning::find_profile(tx, &profile_id)?
            .ok_or_else(|| CurationError::not_found("tuning_profile", profile_id.as_str()))?;
        let updated = TuningProfile {
            name: draft.name.clone(),
            version: current.version + 1,
            thresholds: draft.thresholds.clone(),
            lexicons: draft.lexicons.clone(),
            segmentation: draft.segmentation.clone(),
            updated_by: actor.to_string(),
            updated_at: Utc::now(),
            ..current.clone()
        };
        tuning::update_content(tx, &updated)?;
        insert_audit(
            tx,
            &AuditEvent::new(actor, "update", "tuning_profile", profile_id.as_str())
                .with_transition(
                    Some(version_label(current.version).as_str()),
                    Some(version_label(updated.version).as_str()),
                )
                .with_details(serde_json::json!({ "name": updated.name })),
        )?;
        Ok(updated)
    })?;
    info!(profile_id = %profile.profile_id, version = profile.version, "tuning profile updated");
    Ok(profile)
}

/// Make a profile the only default.
pub fn set_default_profile(store: &SqliteStore, profile_id: &str, actor: &str) -> CurationResult<TuningProfile> {
    let profile_id = ProfileId::from_string(profile_id);
    let profile = store.transaction(|tx| -> CurationResult<TuningProfile> {
        let target = tuning::find_profile(tx, &profile_id)?
            .ok_or_else(|| CurationError::not_found("tuning_profile", profile_id.as_str()))?;
        if target.is_default {
            return Ok(target);
        }
        let previous = tuning::find_default(tx)?.map(|p| p.profile_id);
        tuning::set_default(tx, &profile_id, actor, Utc::now())?;
        insert_audit(
            tx,
            &AuditEvent::new(actor, "set_default", "tuning_profile", profile_id.as_str())
                .with_details(serde_json::json!({ "previous_default": previous })),
        )?;
        Ok(tuning::get_profile(tx, &profile_id)?)
    })?;
    info!(profile_id = %profile.profile_id, "default tuning profile set");
    Ok(profile)
}

/// The default profile, created on first use.
///
/// With no default marked, the oldest profile is promoted; with no profiles at
/// all, a `Default` profile is seeded from the built-in thresholds and the
/// configured minimum passage length.
pub fn ensure_default_profile(
    store: &SqliteStore,
    config: &PipelineConfig,
    actor: &str,
) -> CurationResult<TuningProfile> {
    store.transaction(|tx| -> CurationResult<TuningProfile> {
        if let Some(profile) = tuning::find_default(tx)? {
            return Ok(profile);
        }
        if let Some(oldest) = tuning::list_profiles(tx)?.into_iter().next() {
            tuning::set_default(tx, &oldest.profile_id, actor, Utc::now())?;
            insert_audit(
                tx,
                &AuditEvent::new(actor, "set_default", "tuning_profile", oldest.profile_id.as_str())
                    .with_details(serde_json::json!({ "previous_default": null })),
            )?;
            info!(profile_id = %oldest.profile_id, "promoted oldest tuning profile to default");
            return Ok(tuning::get_profile(tx, &oldest.profile_id)?);
        }
        let draft = ProfileDraft {
            name: DEFAULT_PROFILE_NAME.to_string(),
            segmentation: ProfileSegmentation {
                min_passage_length: config.min_passage_length,
                max_passages_per_source: None,
            },
            ..ProfileDraft::default()
        };
        let profile = insert_new(tx, &validate_draft(&draft)?, true, actor)?;
        info!(profile_id = %profile.profile_id, "seeded default tuning profile");
        Ok(profile)
    })
}

pub fn get_profile(store: &SqliteStore, profile_id: &str) -> CurationResult<TuningProfile> {
    let profile_id = ProfileId::from_string(profile_id);
    store.read(|conn| {
        tuning::find_profile(conn, &profile_id)?
            .ok_or_else(|| CurationError::not_found("tuning_profile", profile_id.as_str()))
    })
}

pub fn list_profiles(store: &SqliteStore) -> CurationResult<Vec<TuningProfile>> {
    Ok(store.read(tuning::list_profiles)?)
}

/// Snapshot a profile into the settings one pass runs under.
pub fn settings(profile: &TuningProfile, config: &PipelineConfig) -> QualitySettings {
    QualitySettings {
        quality_version: format!("{}@{}", profile.profile_id, version_label(profile.version)),
        relevance_accept_threshold: profile.thresholds.relevance_accept,
        relevance_filter_threshold: profile.thresholds.relevance_filter,
        usability_reprocess_threshold: profile.thresholds.usability_reprocess,
        untranslated_ratio_threshold: profile.thresholds.untranslated_ratio,
        lexicon: profile.lexicons.clone(),
        min_passage_length: profile.segmentation.min_passage_length,
        max_passages_per_source: profile
            .segmentation
            .max_passages_per_source
            .unwrap_or(config.max_passages_per_source),
    }
}

/// Settings of the current default profile.
pub fn active_settings(store: &SqliteStore, config: &PipelineConfig, actor: &str) -> CurationResult<QualitySettings> {
    let profile = ensure_default_profile(store, config, actor)?;
    Ok(settings(&profile, config))
}
