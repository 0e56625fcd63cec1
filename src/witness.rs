//! Witness Consolidation Engine
//!
//! Every passage of every member of a witness group lands in exactly one cluster.
//! A passage joins an existing cluster when its normalized text hashes the same
//! (similarity 1.0) or its token Jaccard against the cluster's merged text reaches
//! the threshold; otherwise it seeds a new cluster. The longest text of a cluster
//! is its merged text.
//!
//! Clusters are keyed by their sorted contributing passage ids, so re-running on
//! an unchanged group finds every cluster already stored and writes nothing.

use crate::error::CurationResult;
use crate::model::*;
use crate::quality::segment::compact;
use crate::store::{insert_audit, passages, sources, witness, SqliteStore};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidationReport {
    pub group_id: GroupId,
    pub sources: usize,
    pub consolidated: Vec<ConsolidatedId>,
    pub created: usize,
    pub removed: usize,
}

struct Cluster {
    hash: String,
    tokens: HashSet<String>,
    merged: String,
    contributors: Vec<Contributor>,
}

fn token_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .filter(|token| token.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    a.intersection(b).count() as f64 / a.union(b).count() as f64
}

fn cluster_key(contributors: &[Contributor]) -> String {
    let mut ids: Vec<&str> = contributors.iter().map(|c| c.passage_id.as_str()).collect();
    ids.sort_unstable();
    sha256_hex(ids.join("\n").as_bytes())
}

fn cluster(passages: &[Passage], threshold: f64) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = Vec::new();
    for passage in passages {
        let text = if passage.normalized_excerpt.trim().is_empty() {
            &passage.original_excerpt
        } else {
            &passage.normalized_excerpt
        };
        let normalized = compact(text);
        let hash = sha256_hex(normalized.as_bytes());
        let tokens = token_set(&normalized);

        let matched = match clusters.iter().position(|c| c.hash == hash) {
            Some(idx) => Some((idx, 1.0)),
            None => clusters
                .iter()
                .enumerate()
                .map(|(idx, c)| (idx, jaccard(&tokens, &c.tokens)))
                .filter(|(_, score)| *score >= threshold)
                .max_by(|a, b| a.1.total_cmp(&b.1)),
        };
        let contributor = |similarity: f64| Contributor {
            passage_id: passage.passage_id.clone(),
            source_id: passage.source_id.clone(),
            similarity: (similarity * 10_000.0).round() / 10_000.0,
        };
        match matched {
            Some((idx, similarity)) => {
                let target = &mut clusters[idx];
                target.contributors.push(contributor(similarity));
                if normalized.chars().count() > target.merged.chars().count() {
                    target.tokens = tokens;
                    target.merged = normalized;
                }
            }
            None => clusters.push(Cluster {
                hash,
                tokens,
                merged: normalized,
                contributors: vec![contributor(1.0)],
            }),
        }
    }
    clusters
}

/// Consolidate the passages of a witness group.
pub fn consolidate(
    store: &SqliteStore,
    group_id: &GroupId,
    threshold: f64,
    actor: &str,
) -> CurationResult<ConsolidationReport> {
    let report = store.transaction(|tx| -> CurationResult<ConsolidationReport> {
        sources::get_group(tx, group_id)?;
        let members = sources::group_members(tx, group_id)?;
        let mut all = Vec::new();
        for member in &members {
            all.extend(passages::passages_for_source(tx, &member.source_id)?);
        }

        let now = Utc::now();
        let mut report = ConsolidationReport {
            group_id: group_id.clone(),
            sources: members.len(),
            consolidated: Vec::new(),
            created: 0,
            removed: 0,
        };
        let mut keys = Vec::new();
        for cluster in cluster(&all, threshold) {
            let key = cluster_key(&cluster.contributors);
            let (id, created) = witness::insert_consolidated_if_absent(
                tx,
                &ConsolidatedPassage {
                    consolidated_id: ConsolidatedId::new(),
                    group_id: group_id.clone(),
                    cluster_key: key.clone(),
                    merged_text: cluster.merged,
                    contributors: cluster.contributors,
                    created_at: now,
                },
            )?;
            if created {
                report.created += 1;
            }
            report.consolidated.push(id);
            keys.push(key);
        }
        report.removed = witness::remove_stale_consolidations(tx, group_id, &keys)?;

        if report.created > 0 || report.removed > 0 {
            insert_audit(
                tx,
                &AuditEvent::new(actor, "consolidate", "witness_group", group_id.as_str()).with_details(
                    serde_json::json!({
                        "consolidated": report.consolidated.len(),
                        "created": report.created,
                        "removed": report.removed,
                    }),
                ),
            )?;
        }
        Ok(report)
    })?;

    info!(
        group_id = %group_id,
        consolidated = report.consolidated.len(),
        created = report.created,
        removed = report.removed,
        "consolidated witness group"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{count_audit_events, OpenStore};

    fn passage(id: &str, source: &str, text: &str) -> Passage {
        let now = Utc::now();
        Passage {
            passage_id: PassageId::from_string(id),
            source_id: SourceId::from_string(source),
            text_id: TextId::from_string("txt_1"),
            locator: "p1:l1-1".into(),
            original_excerpt: text.into(),
            normalized_excerpt: text.into(),
            detected_language: "eng".into(),
            language_confidence: 0.9,
            translation_status: TranslationStatus::Translated,
            untranslated_ratio: 0.0,
            usability_score: 0.8,
            relevance_score: 0.7,
            relevance_state: RelevanceState::Accepted,
            reviewer_state: ReviewerState::Proposed,
            publish_state: PublishState::Blocked,
            created_at: now,
            updated_at: now,
        }
    }

    const HYMN: &str = "We praise the shining dawn that drives away the darkness of night";

    #[test]
    fn identical_text_clusters_at_full_similarity() {
        let clusters = cluster(
            &[passage("psg_1", "src_a", HYMN), passage("psg_2", "src_b", &format!("  {}  ", HYMN))],
            0.92,
        );
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].contributors[1].similarity, 1.0);
    }

    #[test]
    fn near_duplicates_merge_and_keep_longer_text() {
        let longer = format!("{} forever", HYMN);
        let clusters = cluster(&[passage("psg_1", "src_a", HYMN), passage("psg_2", "src_b", &longer)], 0.9);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].merged, longer);
        let similarity = clusters[0].contributors[1].similarity;
        assert!((0.0..1.0).contains(&similarity));
    }

    #[test]
    fn dissimilar_passages_stay_apart() {
        let clusters = cluster(
            &[
                passage("psg_1", "src_a", HYMN),
                passage("psg_2", "src_b", "Bury the tablet beneath the threshold of the house"),
            ],
            0.92,
        );
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn cluster_key_ignores_order() {
        let a = Contributor {
            passage_id: PassageId::from_string("psg_1"),
            source_id: SourceId::from_string("src_a"),
            similarity: 1.0,
        };
        let b = Contributor {
            passage_id: PassageId::from_string("psg_2"),
            ..a.clone()
        };
        assert_eq!(cluster_key(&[a.clone(), b.clone()]), cluster_key(&[b, a]));
    }

    #[test]
    fn missing_group_is_referential() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = consolidate(&store, &GroupId::from_string("wgr_missing"), 0.92, "op").unwrap_err();
        assert_eq!(err.code(), "referential_error");
    }

    #[test]
    fn empty_group_consolidates_to_nothing_without_audit() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let text = Text {
            text_id: TextId::new(),
            title: "Hymn".into(),
            origin_region: None,
            tradition_tags: vec![],
            created_at: now,
        };
        let group = WitnessGroup {
            group_id: GroupId::new(),
            text_id: text.text_id.clone(),
            status: GroupStatus::Active,
            created_at: now,
        };
        store
            .read(|c| {
                sources::insert_text(c, &text)?;
                sources::insert_group(c, &group)
            })
            .unwrap();
        let report = consolidate(&store, &group.group_id, 0.92, "op").unwrap();
        assert!(report.consolidated.is_empty());
        assert_eq!(
            store.read(|c| count_audit_events(c, group.group_id.as_str(), "consolidate")).unwrap(),
            0
        );
    }
}
