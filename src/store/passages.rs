//! Passage evidence rows

use super::traits::{StorageError, StorageResult};
use crate::model::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const PASSAGE_COLUMNS: &str = "passage_id, source_id, text_id, locator, original_excerpt, \
     normalized_excerpt, detected_language, language_confidence, translation_status, \
     untranslated_ratio, usability_score, relevance_score, relevance_state, reviewer_state, \
     publish_state, created_at, updated_at";

fn passage_from_row(row: &Row<'_>) -> rusqlite::Result<Passage> {
    Ok(Passage {
        passage_id: row.get(0)?,
        source_id: row.get(1)?,
        text_id: row.get(2)?,
        locator: row.get(3)?,
        original_excerpt: row.get(4)?,
        normalized_excerpt: row.get(5)?,
        detected_language: row.get(6)?,
        language_confidence: row.get(7)?,
        translation_status: row.get(8)?,
        untranslated_ratio: row.get(9)?,
        usability_score: row.get(10)?,
        relevance_score: row.get(11)?,
        relevance_state: row.get(12)?,
        reviewer_state: row.get(13)?,
        publish_state: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

/// Insert a passage unless its id already exists. Existing rows keep their review
/// and quality state. Returns true if a row was written.
pub fn insert_passage_if_absent(conn: &Connection, passage: &Passage) -> StorageResult<bool> {
    let inserted = conn
        .execute(
            &format!(
                "INSERT INTO passages ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT(passage_id) DO NOTHING",
                PASSAGE_COLUMNS
            ),
            params![
                passage.passage_id,
                passage.source_id,
                passage.text_id,
                passage.locator,
                passage.original_excerpt,
                passage.normalized_excerpt,
                passage.detected_language,
                passage.language_confidence,
                passage.translation_status,
                passage.untranslated_ratio,
                passage.usability_score,
                passage.relevance_score,
                passage.relevance_state,
                passage.reviewer_state,
                passage.publish_state,
                passage.created_at,
                passage.updated_at,
            ],
        )
        .map_err(StorageError::classify)?;
    Ok(inserted == 1)
}

pub fn find_passage(conn: &Connection, passage_id: &PassageId) -> StorageResult<Option<Passage>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM passages WHERE passage_id = ?1", PASSAGE_COLUMNS),
            params![passage_id],
            passage_from_row,
        )
        .optional()?)
}

pub fn get_passage(conn: &Connection, passage_id: &PassageId) -> StorageResult<Passage> {
    find_passage(conn, passage_id)?.ok_or_else(|| StorageError::not_found("passage", passage_id.as_str()))
}

pub fn passages_for_source(conn: &Connection, source_id: &SourceId) -> StorageResult<Vec<Passage>> {
    query_passages(
        conn,
        &format!("SELECT {} FROM passages WHERE source_id = ?1 ORDER BY created_at, rowid", PASSAGE_COLUMNS),
        source_id.as_str(),
    )
}

pub fn passages_for_text(conn: &Connection, text_id: &TextId) -> StorageResult<Vec<Passage>> {
    query_passages(
        conn,
        &format!("SELECT {} FROM passages WHERE text_id = ?1 ORDER BY created_at, rowid", PASSAGE_COLUMNS),
        text_id.as_str(),
    )
}

/// Unfiltered passages of other texts, oldest first. Link candidates for a passage
/// of `text_id` come from here.
pub fn peer_passages(conn: &Connection, text_id: &TextId, limit: usize) -> StorageResult<Vec<Passage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM passages WHERE text_id <> ?1 AND relevance_state <> 'filtered'
         ORDER BY created_at, rowid LIMIT ?2",
        PASSAGE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![text_id, limit as i64], passage_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Passages in a given reviewer state, oldest first.
pub fn passages_in_review_state(
    conn: &Connection,
    state: ReviewerState,
    limit: usize,
    offset: usize,
) -> StorageResult<Vec<Passage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM passages WHERE reviewer_state = ?1 ORDER BY created_at, rowid LIMIT ?2 OFFSET ?3",
        PASSAGE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![state, limit as i64, offset as i64], passage_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_passages(conn: &Connection, sql: &str, key: &str) -> StorageResult<Vec<Passage>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![key], passage_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Overwrite the live quality fields of a passage.
pub fn update_quality(
    conn: &Connection,
    passage_id: &PassageId,
    update: &QualityUpdate,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    let changed = conn
        .execute(
            r#"
            UPDATE passages SET normalized_excerpt = ?2, detected_language = ?3,
                language_confidence = ?4, translation_status = ?5, untranslated_ratio = ?6,
                usability_score = ?7, relevance_score = ?8, relevance_state = ?9, updated_at = ?10
            WHERE passage_id = ?1
            "#,
            params![
                passage_id,
                update.normalized_excerpt,
                update.detected_language,
                update.language_confidence,
                update.translation_status,
                update.untranslated_ratio,
                update.usability_score,
                update.relevance_score,
                update.relevance_state,
                now,
            ],
        )
        .map_err(StorageError::classify)?;
    if changed == 0 {
        return Err(StorageError::not_found("passage", passage_id.as_str()));
    }
    Ok(())
}

pub fn set_translation_status(
    conn: &Connection,
    passage_id: &PassageId,
    status: TranslationStatus,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    conn.execute(
        "UPDATE passages SET translation_status = ?2, updated_at = ?3 WHERE passage_id = ?1",
        params![passage_id, status, now],
    )?;
    Ok(())
}

/// Conditional review transition: only applies while the passage is in `from`.
pub fn transition_passage_review(
    conn: &Connection,
    passage_id: &PassageId,
    from: ReviewerState,
    to: ReviewerState,
    publish_state: PublishState,
    now: DateTime<Utc>,
) -> StorageResult<usize> {
    Ok(conn
        .execute(
            "UPDATE passages SET reviewer_state = ?3, publish_state = ?4, updated_at = ?5
             WHERE passage_id = ?1 AND reviewer_state = ?2",
            params![passage_id, from, to, publish_state, now],
        )
        .map_err(StorageError::classify)?)
}

pub fn set_passage_publish_state(
    conn: &Connection,
    passage_id: &PassageId,
    publish_state: PublishState,
    now: DateTime<Utc>,
) -> StorageResult<usize> {
    Ok(conn
        .execute(
            "UPDATE passages SET publish_state = ?2, updated_at = ?3 WHERE passage_id = ?1",
            params![passage_id, publish_state, now],
        )
        .map_err(StorageError::classify)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{sources, OpenStore, SqliteStore};

    fn seed(store: &SqliteStore) -> (TextId, SourceId) {
        let text = Text {
            text_id: TextId::new(),
            title: "Rite".into(),
            origin_region: None,
            tradition_tags: vec![],
            created_at: Utc::now(),
        };
        let source = Source {
            source_id: SourceId::new(),
            text_id: text.text_id.clone(),
            locator: "mem://rite".into(),
            format_hint: "txt".into(),
            source_sha256: "raw".into(),
            normalized_sha256: "norm".into(),
            witness_group_id: None,
            is_duplicate_of: None,
            created_at: Utc::now(),
        };
        store
            .read(|conn| {
                sources::insert_text(conn, &text)?;
                sources::insert_source(conn, &source)
            })
            .unwrap();
        (text.text_id, source.source_id)
    }

    fn passage(text_id: &TextId, source_id: &SourceId) -> Passage {
        let now = Utc::now();
        Passage {
            passage_id: PassageId::from_string("psg_fixed"),
            source_id: source_id.clone(),
            text_id: text_id.clone(),
            locator: "p1:l1-3".into(),
            original_excerpt: "At dawn the priest pours a libation.".into(),
            normalized_excerpt: "At dawn the priest pours a libation.".into(),
            detected_language: "eng".into(),
            language_confidence: 0.88,
            translation_status: TranslationStatus::Translated,
            untranslated_ratio: 0.0,
            usability_score: 0.8,
            relevance_score: 0.6,
            relevance_state: RelevanceState::Accepted,
            reviewer_state: ReviewerState::Proposed,
            publish_state: PublishState::Blocked,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn reinsert_keeps_existing_review_state() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (text_id, source_id) = seed(&store);
        let p = passage(&text_id, &source_id);
        assert!(store.read(|c| insert_passage_if_absent(c, &p)).unwrap());
        store
            .read(|c| {
                transition_passage_review(
                    c,
                    &p.passage_id,
                    ReviewerState::Proposed,
                    ReviewerState::Approved,
                    PublishState::Eligible,
                    Utc::now(),
                )
            })
            .unwrap();

        assert!(!store.read(|c| insert_passage_if_absent(c, &p)).unwrap());
        let stored = store.read(|c| get_passage(c, &p.passage_id)).unwrap();
        assert_eq!(stored.reviewer_state, ReviewerState::Approved);
    }

    #[test]
    fn eligible_requires_approval_at_the_schema() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (text_id, source_id) = seed(&store);
        let p = passage(&text_id, &source_id);
        store.read(|c| insert_passage_if_absent(c, &p)).unwrap();
        let err = store
            .read(|c| set_passage_publish_state(c, &p.passage_id, PublishState::Eligible, Utc::now()))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn scores_outside_unit_interval_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (text_id, source_id) = seed(&store);
        let mut p = passage(&text_id, &source_id);
        p.language_confidence = 1.4;
        let err = store.read(|c| insert_passage_if_absent(c, &p)).unwrap_err();
        assert!(err.is_conflict());
    }
}
