use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Entries
// =============================================================================

/// Where a highlight came from, plus the ids of the entries it is joined to.
///
/// `joins` is kept symmetric by the join graph: if A lists B then B lists A.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Title of the source document.
    pub article: String,
    /// URL of the source document.
    #[serde(default)]
    pub url: String,
    /// Section of the document the fragment was taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Image the fragment describes, for image entries.
    #[serde(default, alias = "img_url", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Entries this one is connected to, in the order the joins were made.
    #[serde(default)]
    pub joins: Vec<Uuid>,
}

impl EntryMetadata {
    /// Metadata for a fragment of `article` at `url` with no joins.
    pub fn new(article: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            article: article.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the section.
    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    /// Whether `id` is among the joins.
    pub fn is_joined_to(&self, id: Uuid) -> bool {
        self.joins.contains(&id)
    }

    /// Key used to group entries by source: "article" or "article > section".
    pub fn group_key(&self) -> String {
        match self.section.as_deref() {
            Some(section) if !section.is_empty() => format!("{} > {}", self.article, section),
            _ => self.article.clone(),
        }
    }
}

/// A stored highlight fragment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    pub content: String,
    pub metadata: EntryMetadata,
    /// Omitted from listings unless explicitly requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entry {
    /// The same entry without its embedding, for compact payloads.
    pub fn without_embedding(mut self) -> Self {
        self.embedding = None;
        self
    }
}

/// A stored entry paired with its similarity to a query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: Entry,
    /// `1 - cosine_distance`, in [-1, 1].
    pub similarity: f64,
}

/// The minimal record needed to (re)build a similarity index.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredVector {
    pub id: Uuid,
    /// Insertion sequence; larger is newer.
    pub seq: i64,
    pub embedding: Vec<f32>,
}

// =============================================================================
// Listing
// =============================================================================

/// Sort order for listings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Options for listing entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub order: EntryOrder,
    /// `None` lists every entry.
    pub limit: Option<u64>,
    pub offset: u64,
    pub include_embedding: bool,
}

impl ListOptions {
    /// Newest entries first, at most `limit` of them, without embeddings.
    pub fn newest(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// Every entry, embeddings included. Used for layout computation.
    pub fn all_with_embeddings() -> Self {
        Self {
            include_embedding: true,
            ..Default::default()
        }
    }
}

/// Group entries by `EntryMetadata::group_key`, keeping first-seen group
/// order and the original order inside each group.
pub fn group_by_source(entries: Vec<Entry>) -> Vec<(String, Vec<Entry>)> {
    let mut groups: Vec<(String, Vec<Entry>)> = Vec::new();
    for entry in entries {
        let key = entry.metadata.group_key();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(entry),
            None => groups.push((key, vec![entry])),
        }
    }
    groups
}
