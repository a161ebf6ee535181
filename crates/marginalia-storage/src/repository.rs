//! SQLite-backed entry store.
//!
//! `EntryRepository` is the single source of truth for highlight entries.
//! Inserts are all-or-nothing; the only mutation after insert is the join
//! update used by [`crate::joins::JoinGraph`], which is guarded by a
//! per-row version counter.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use marginalia_core::error::MarginaliaError;
use marginalia_core::types::{Entry, EntryMetadata, EntryOrder, ListOptions, StoredVector};

use crate::db::Database;

const COLUMNS_WITH_EMBEDDING: &str = "id, content, metadata, embedding, created_at, updated_at";
const COLUMNS_WITHOUT_EMBEDDING: &str = "id, content, metadata, NULL, created_at, updated_at";

/// The join-relevant state of one row as read at a given version.
#[derive(Debug, Clone)]
pub(crate) struct JoinsSnapshot {
    pub id: Uuid,
    pub metadata: EntryMetadata,
    pub version: i64,
}

/// Repository for highlight entries.
pub struct EntryRepository {
    db: Arc<Database>,
    dimensions: usize,
}

impl EntryRepository {
    /// Create a repository whose entries all carry `dimensions`-long embeddings.
    pub fn new(db: Arc<Database>, dimensions: usize) -> Self {
        Self { db, dimensions }
    }

    /// The embedding dimension every entry must have.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Validate and store a new entry, returning the persisted record.
    pub fn insert(
        &self,
        content: &str,
        metadata: EntryMetadata,
        embedding: Vec<f32>,
    ) -> Result<Entry, MarginaliaError> {
        self.insert_with_vector(content, metadata, embedding)
            .map(|(entry, _)| entry)
    }

    /// Like [`insert`](Self::insert), also returning the index record
    /// (id, insertion sequence, embedding) of the new row.
    pub fn insert_with_vector(
        &self,
        content: &str,
        metadata: EntryMetadata,
        embedding: Vec<f32>,
    ) -> Result<(Entry, StoredVector), MarginaliaError> {
        validate_new_entry(content, &metadata, &embedding, self.dimensions)?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        let metadata_json = serde_json::to_string(&metadata)?;
        let blob = encode_embedding(&embedding);

        let seq = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO entries (id, content, metadata, embedding, dimensions, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![
                    id.to_string(),
                    content,
                    metadata_json,
                    blob,
                    embedding.len() as i64,
                    now.timestamp_millis(),
                ],
            )
            .map_err(|e| MarginaliaError::Storage(format!("Failed to insert entry: {}", e)))?;
            Ok(conn.last_insert_rowid())
        })?;

        debug!(entry_id = %id, seq, dims = embedding.len(), "Entry inserted");

        let timestamp = from_millis(now.timestamp_millis());
        let vector = StoredVector {
            id,
            seq,
            embedding: embedding.clone(),
        };
        let entry = Entry {
            id,
            content: content.to_string(),
            metadata,
            embedding: Some(embedding),
            created_at: timestamp,
            updated_at: timestamp,
        };
        Ok((entry, vector))
    }

    /// Find an entry by ID, embedding included.
    pub fn find_by_id(&self, id: Uuid) -> Result<Option<Entry>, MarginaliaError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {} FROM entries WHERE id = ?1", COLUMNS_WITH_EMBEDDING);
            conn.query_row(&sql, rusqlite::params![id.to_string()], row_to_entry)
                .optional()
                .map_err(|e| MarginaliaError::Storage(e.to_string()))?
                .transpose()
        })
    }

    /// Fetch an entry by ID, failing with `NotFound` if it does not exist.
    pub fn get(&self, id: Uuid) -> Result<Entry, MarginaliaError> {
        self.find_by_id(id)?
            .ok_or_else(|| MarginaliaError::NotFound(format!("Entry {} not found", id)))
    }

    /// Resolve several ids, in the given order. Ids that do not resolve are skipped.
    pub fn get_many(
        &self,
        ids: &[Uuid],
        include_embedding: bool,
    ) -> Result<Vec<Entry>, MarginaliaError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let columns = select_columns(include_embedding);
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM entries WHERE id = ?1", columns))
                .map_err(|e| MarginaliaError::Storage(e.to_string()))?;

            let mut entries = Vec::with_capacity(ids.len());
            for id in ids {
                let found = stmt
                    .query_row(rusqlite::params![id.to_string()], row_to_entry)
                    .optional()
                    .map_err(|e| MarginaliaError::Storage(e.to_string()))?;
                if let Some(entry) = found {
                    entries.push(entry?);
                }
            }
            Ok(entries)
        })
    }

    /// List entries in insertion order.
    pub fn list(&self, options: &ListOptions) -> Result<Vec<Entry>, MarginaliaError> {
        let direction = match options.order {
            EntryOrder::NewestFirst => "DESC",
            EntryOrder::OldestFirst => "ASC",
        };
        // SQLite treats a negative LIMIT as unbounded.
        let limit = options
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let offset = i64::try_from(options.offset).unwrap_or(i64::MAX);

        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM entries ORDER BY seq {} LIMIT ?1 OFFSET ?2",
                select_columns(options.include_embedding),
                direction
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| MarginaliaError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![limit, offset], row_to_entry)
                .map_err(|e| MarginaliaError::Storage(e.to_string()))?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|e| MarginaliaError::Storage(e.to_string()))??);
            }
            Ok(entries)
        })
    }

    /// Pick one entry uniformly at random from the whole table.
    pub fn sample_random(&self) -> Result<Option<Entry>, MarginaliaError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM entries ORDER BY RANDOM() LIMIT 1",
                COLUMNS_WITH_EMBEDDING
            );
            conn.query_row(&sql, [], row_to_entry)
                .optional()
                .map_err(|e| MarginaliaError::Storage(e.to_string()))?
                .transpose()
        })
    }

    /// Count stored entries.
    pub fn count(&self) -> Result<u64, MarginaliaError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))
                .map_err(|e| MarginaliaError::Storage(e.to_string()))?;
            Ok(count as u64)
        })
    }

    /// Load every (id, seq, embedding) triple, oldest first, for index rebuilds.
    pub fn load_vectors(&self) -> Result<Vec<StoredVector>, MarginaliaError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, seq, embedding FROM entries ORDER BY seq ASC")
                .map_err(|e| MarginaliaError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    let id: String = row.get(0)?;
                    let seq: i64 = row.get(1)?;
                    let blob: Vec<u8> = row.get(2)?;
                    Ok((id, seq, blob))
                })
                .map_err(|e| MarginaliaError::Storage(e.to_string()))?;

            let mut vectors = Vec::new();
            for row in rows {
                let (id, seq, blob) = row.map_err(|e| MarginaliaError::Storage(e.to_string()))?;
                vectors.push(StoredVector {
                    id: parse_id(&id)?,
                    seq,
                    embedding: decode_embedding(&blob)?,
                });
            }
            Ok(vectors)
        })
    }

    /// Read the metadata and version of one row.
    pub(crate) fn read_joins(&self, id: Uuid) -> Result<Option<JoinsSnapshot>, MarginaliaError> {
        self.db.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT metadata, version FROM entries WHERE id = ?1",
                    rusqlite::params![id.to_string()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()
                .map_err(|e| MarginaliaError::Storage(e.to_string()))?;

            match found {
                Some((metadata_json, version)) => Ok(Some(JoinsSnapshot {
                    id,
                    metadata: serde_json::from_str(&metadata_json)?,
                    version,
                })),
                None => Ok(None),
            }
        })
    }

    /// Write new joins for every snapshot in one transaction.
    ///
    /// Each row is only written if its version still matches the snapshot.
    /// Returns `Ok(false)` and rolls everything back if any row changed
    /// since it was read.
    pub(crate) fn commit_joins(&self, updates: &[JoinsSnapshot]) -> Result<bool, MarginaliaError> {
        let now = Utc::now().timestamp_millis();
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| MarginaliaError::Storage(format!("Failed to begin: {}", e)))?;

            for update in updates {
                if !update_joins(&tx, update, now)? {
                    // Dropping the transaction rolls back earlier rows.
                    return Ok(false);
                }
            }

            tx.commit()
                .map_err(|e| MarginaliaError::Storage(format!("Failed to commit: {}", e)))?;
            Ok(true)
        })
    }

    /// Every (id, joins) pair in the store, for consistency audits.
    pub(crate) fn scan_joins(&self) -> Result<Vec<(Uuid, Vec<Uuid>)>, MarginaliaError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, metadata FROM entries ORDER BY seq ASC")
                .map_err(|e| MarginaliaError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(|e| MarginaliaError::Storage(e.to_string()))?;

            let mut out = Vec::new();
            for row in rows {
                let (id, metadata_json) =
                    row.map_err(|e| MarginaliaError::Storage(e.to_string()))?;
                let metadata: EntryMetadata = serde_json::from_str(&metadata_json)?;
                out.push((parse_id(&id)?, metadata.joins));
            }
            Ok(out)
        })
    }
}

/// Single-row conditional update of the joins set.
///
/// `updated_at` always moves forward, even when two mutations land in the
/// same millisecond.
fn update_joins(
    conn: &Connection,
    snapshot: &JoinsSnapshot,
    now_millis: i64,
) -> Result<bool, MarginaliaError> {
    let metadata_json = serde_json::to_string(&snapshot.metadata)?;
    let changed = conn
        .execute(
            "UPDATE entries
             SET metadata = ?1, version = version + 1, updated_at = MAX(?2, updated_at + 1)
             WHERE id = ?3 AND version = ?4",
            rusqlite::params![
                metadata_json,
                now_millis,
                snapshot.id.to_string(),
                snapshot.version
            ],
        )
        .map_err(|e| MarginaliaError::Storage(format!("Failed to update joins: {}", e)))?;
    Ok(changed == 1)
}

/// Reject inputs that would violate the entry invariants.
fn validate_new_entry(
    content: &str,
    metadata: &EntryMetadata,
    embedding: &[f32],
    dimensions: usize,
) -> Result<(), MarginaliaError> {
    if content.trim().is_empty() {
        return Err(MarginaliaError::Validation(
            "content must not be empty".to_string(),
        ));
    }
    if metadata.article.trim().is_empty() {
        return Err(MarginaliaError::Validation(
            "metadata.article must not be empty".to_string(),
        ));
    }
    if !metadata.joins.is_empty() {
        return Err(MarginaliaError::Validation(
            "new entries cannot carry joins; use join instead".to_string(),
        ));
    }
    if embedding.len() != dimensions {
        return Err(MarginaliaError::Validation(format!(
            "embedding has {} dimensions, expected {}",
            embedding.len(),
            dimensions
        )));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(MarginaliaError::Validation(
            "embedding contains non-finite values".to_string(),
        ));
    }
    Ok(())
}

fn select_columns(include_embedding: bool) -> &'static str {
    if include_embedding {
        COLUMNS_WITH_EMBEDDING
    } else {
        COLUMNS_WITHOUT_EMBEDDING
    }
}

pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, MarginaliaError> {
    if blob.len() % 4 != 0 {
        return Err(MarginaliaError::Storage(format!(
            "Corrupt embedding blob of {} bytes",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn parse_id(id: &str) -> Result<Uuid, MarginaliaError> {
    Uuid::parse_str(id).map_err(|e| MarginaliaError::Storage(format!("Invalid UUID: {}", e)))
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Entry, MarginaliaError>> {
    let id: String = row.get(0)?;
    let content: String = row.get(1)?;
    let metadata_json: String = row.get(2)?;
    let blob: Option<Vec<u8>> = row.get(3)?;
    let created_at: i64 = row.get(4)?;
    let updated_at: i64 = row.get(5)?;

    Ok(build_entry(
        &id,
        content,
        &metadata_json,
        blob.as_deref(),
        created_at,
        updated_at,
    ))
}

fn build_entry(
    id: &str,
    content: String,
    metadata_json: &str,
    blob: Option<&[u8]>,
    created_at: i64,
    updated_at: i64,
) -> Result<Entry, MarginaliaError> {
    Ok(Entry {
        id: parse_id(id)?,
        content,
        metadata: serde_json::from_str(metadata_json)?,
        embedding: blob.map(decode_embedding).transpose()?,
        created_at: from_millis(created_at),
        updated_at: from_millis(updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIMS: usize = 4;

    fn make_repo() -> EntryRepository {
        EntryRepository::new(Arc::new(Database::in_memory().unwrap()), DIMS)
    }

    fn metadata(article: &str) -> EntryMetadata {
        EntryMetadata::new(article, format!("https://en.wikipedia.org/wiki/{}", article))
    }

    fn insert(repo: &EntryRepository, content: &str, embedding: [f32; DIMS]) -> Entry {
        repo.insert(content, metadata("Rust"), embedding.to_vec())
            .unwrap()
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let repo = make_repo();
        let meta = metadata("Ferris").with_section("Mascot");
        let embedding = vec![0.25, -1.5, 3.0, 1e-7];

        let stored = repo
            .insert("Ferris is a crab.", meta.clone(), embedding.clone())
            .unwrap();
        let fetched = repo.get(stored.id).unwrap();

        assert_eq!(fetched.content, "Ferris is a crab.");
        assert_eq!(fetched.metadata, meta);
        assert_eq!(fetched.embedding, Some(embedding));
        assert_eq!(fetched.created_at, stored.created_at);
        assert_eq!(fetched.updated_at, stored.updated_at);
    }

    #[test]
    fn test_insert_validation() {
        let repo = make_repo();

        let blank = repo.insert("   ", metadata("A"), vec![0.0; DIMS]);
        assert!(matches!(blank, Err(MarginaliaError::Validation(_))));

        let no_article = repo.insert("text", EntryMetadata::default(), vec![0.0; DIMS]);
        assert!(matches!(no_article, Err(MarginaliaError::Validation(_))));

        let wrong_dims = repo.insert("text", metadata("A"), vec![0.0; DIMS + 1]);
        assert!(matches!(wrong_dims, Err(MarginaliaError::Validation(_))));

        let nan = repo.insert("text", metadata("A"), vec![f32::NAN, 0.0, 0.0, 0.0]);
        assert!(matches!(nan, Err(MarginaliaError::Validation(_))));

        let mut joined = metadata("A");
        joined.joins.push(Uuid::new_v4());
        let with_joins = repo.insert("text", joined, vec![0.0; DIMS]);
        assert!(matches!(with_joins, Err(MarginaliaError::Validation(_))));

        assert_eq!(repo.count().unwrap(), 0);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let repo = make_repo();
        assert!(repo.find_by_id(Uuid::new_v4()).unwrap().is_none());
        assert!(matches!(
            repo.get(Uuid::new_v4()),
            Err(MarginaliaError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_order_limit_offset() {
        let repo = make_repo();
        let ids: Vec<Uuid> = (0..5)
            .map(|i| insert(&repo, &format!("fragment {}", i), [i as f32, 0.0, 0.0, 1.0]).id)
            .collect();

        let newest = repo.list(&ListOptions::newest(2)).unwrap();
        assert_eq!(newest.iter().map(|e| e.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);
        assert!(newest.iter().all(|e| e.embedding.is_none()));

        let page = repo
            .list(&ListOptions {
                limit: Some(2),
                offset: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.iter().map(|e| e.id).collect::<Vec<_>>(), vec![ids[2], ids[1]]);

        let oldest = repo
            .list(&ListOptions {
                order: EntryOrder::OldestFirst,
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(oldest[0].id, ids[0]);

        let all = repo.list(&ListOptions::all_with_embeddings()).unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.iter().all(|e| e.embedding.as_ref().map(Vec::len) == Some(DIMS)));
    }

    #[test]
    fn test_get_many_skips_missing() {
        let repo = make_repo();
        let a = insert(&repo, "a", [1.0, 0.0, 0.0, 0.0]);
        let b = insert(&repo, "b", [0.0, 1.0, 0.0, 0.0]);

        let found = repo.get_many(&[b.id, Uuid::new_v4(), a.id], false).unwrap();
        assert_eq!(found.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b.id, a.id]);
        assert!(found[0].embedding.is_none());
    }

    #[test]
    fn test_sample_random_empty() {
        let repo = make_repo();
        assert!(repo.sample_random().unwrap().is_none());
    }

    #[test]
    fn test_sample_random_covers_whole_table() {
        let repo = make_repo();
        let ids: Vec<Uuid> = (0..3)
            .map(|i| insert(&repo, &format!("f{}", i), [1.0, i as f32, 0.0, 0.0]).id)
            .collect();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..300 {
            let entry = repo.sample_random().unwrap().unwrap();
            assert!(ids.contains(&entry.id));
            seen.insert(entry.id);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_insert_with_vector_reports_seq() {
        let repo = make_repo();
        let (first, v1) = repo
            .insert_with_vector("a", metadata("A"), vec![1.0, 0.0, 0.0, 0.0])
            .unwrap();
        let (_, v2) = repo
            .insert_with_vector("b", metadata("A"), vec![0.0, 1.0, 0.0, 0.0])
            .unwrap();
        assert_eq!(v1.id, first.id);
        assert!(v2.seq > v1.seq);
        assert_eq!(repo.load_vectors().unwrap(), vec![v1, v2]);
    }

    #[test]
    fn test_load_vectors_in_insertion_order() {
        let repo = make_repo();
        let a = insert(&repo, "a", [1.0, 2.0, 3.0, 4.0]);
        let b = insert(&repo, "b", [4.0, 3.0, 2.0, 1.0]);

        let vectors = repo.load_vectors().unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].id, a.id);
        assert_eq!(vectors[1].id, b.id);
        assert!(vectors[0].seq < vectors[1].seq);
        assert_eq!(vectors[1].embedding, vec![4.0, 3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_commit_joins_rejects_stale_version() {
        let repo = make_repo();
        let a = insert(&repo, "a", [1.0, 0.0, 0.0, 0.0]);
        let b = insert(&repo, "b", [0.0, 1.0, 0.0, 0.0]);

        let mut first = repo.read_joins(a.id).unwrap().unwrap();
        let stale = first.clone();
        first.metadata.joins.push(b.id);
        assert!(repo.commit_joins(&[first]).unwrap());

        let mut second = stale;
        second.metadata.joins.push(Uuid::new_v4());
        assert!(!repo.commit_joins(&[second]).unwrap());

        let stored = repo.get(a.id).unwrap();
        assert_eq!(stored.metadata.joins, vec![b.id]);
        assert!(stored.updated_at > a.updated_at);
    }

    #[test]
    fn test_commit_joins_is_all_or_nothing() {
        let repo = make_repo();
        let a = insert(&repo, "a", [1.0, 0.0, 0.0, 0.0]);
        let b = insert(&repo, "b", [0.0, 1.0, 0.0, 0.0]);

        let mut snap_a = repo.read_joins(a.id).unwrap().unwrap();
        let mut snap_b = repo.read_joins(b.id).unwrap().unwrap();
        snap_a.metadata.joins.push(b.id);
        snap_b.metadata.joins.push(a.id);
        snap_b.version += 1;

        assert!(!repo.commit_joins(&[snap_a, snap_b]).unwrap());
        assert!(repo.get(a.id).unwrap().metadata.joins.is_empty());
        assert!(repo.get(b.id).unwrap().metadata.joins.is_empty());
    }

    #[test]
    fn test_embedding_blob_round_trip() {
        let values = vec![0.0, -0.0, 1.5, f32::MIN_POSITIVE, -3.25];
        let decoded = decode_embedding(&encode_embedding(&values)).unwrap();
        assert_eq!(decoded, values);
        assert!(decode_embedding(&[0, 1, 2]).is_err());
    }
}
