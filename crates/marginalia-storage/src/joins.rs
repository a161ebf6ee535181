//! Symmetric join graph over stored entries.
//!
//! Edges live inside each entry's `metadata.joins`. A join writes both
//! endpoints in one transaction, each guarded by its row version, and
//! retries from a fresh read when another writer got there first.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use marginalia_core::error::MarginaliaError;
use marginalia_core::types::Entry;

use crate::repository::{EntryRepository, JoinsSnapshot};

/// Result of a successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JoinOutcome {
    pub joined: [Uuid; 2],
    /// False when the two entries were already joined.
    pub created: bool,
}

/// An undirected edge between two entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JoinEdge {
    pub source: Uuid,
    pub target: Uuid,
}

/// Inconsistencies found by [`JoinGraph::audit`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinAudit {
    /// `(a, b)` where a lists b but b does not list a.
    pub asymmetric: Vec<(Uuid, Uuid)>,
    /// Entries that list themselves.
    pub self_links: Vec<Uuid>,
    /// `(a, b)` where a lists an id that no longer resolves.
    pub dangling: Vec<(Uuid, Uuid)>,
}

impl JoinAudit {
    pub fn is_consistent(&self) -> bool {
        self.asymmetric.is_empty() && self.self_links.is_empty() && self.dangling.is_empty()
    }
}

/// Join operations over an [`EntryRepository`].
pub struct JoinGraph {
    repo: Arc<EntryRepository>,
    max_retries: u32,
}

impl JoinGraph {
    pub fn new(repo: Arc<EntryRepository>, max_retries: u32) -> Self {
        Self { repo, max_retries }
    }

    /// Join two distinct entries, symmetrically.
    ///
    /// Joining entries that are already joined succeeds without touching
    /// either row. Fails with `Conflict` if the update keeps racing other
    /// writers after `max_retries` attempts.
    pub fn join(&self, id1: Uuid, id2: Uuid) -> Result<JoinOutcome, MarginaliaError> {
        if id1 == id2 {
            return Err(MarginaliaError::Validation(
                "an entry cannot be joined to itself".to_string(),
            ));
        }

        for attempt in 0..=self.max_retries {
            let first = self.snapshot(id1)?;
            let second = self.snapshot(id2)?;

            let mut updates: Vec<JoinsSnapshot> = Vec::with_capacity(2);
            for (mut snapshot, other) in [(first, id2), (second, id1)] {
                if !snapshot.metadata.is_joined_to(other) {
                    snapshot.metadata.joins.push(other);
                    updates.push(snapshot);
                }
            }

            if updates.is_empty() {
                debug!(%id1, %id2, "Entries already joined");
                return Ok(JoinOutcome {
                    joined: [id1, id2],
                    created: false,
                });
            }

            if self.repo.commit_joins(&updates)? {
                info!(%id1, %id2, attempt, "Entries joined");
                return Ok(JoinOutcome {
                    joined: [id1, id2],
                    created: true,
                });
            }

            debug!(%id1, %id2, attempt, "Join raced a concurrent update, retrying");
            std::thread::yield_now();
        }

        warn!(%id1, %id2, retries = self.max_retries, "Join gave up after repeated conflicts");
        Err(MarginaliaError::Conflict(format!(
            "join of {} and {} kept conflicting with concurrent updates",
            id1, id2
        )))
    }

    /// Entries joined to `id`, in join order. Ids that no longer resolve are skipped.
    pub fn neighbors(&self, id: Uuid) -> Result<Vec<Entry>, MarginaliaError> {
        let snapshot = self.snapshot(id)?;
        self.repo.get_many(&snapshot.metadata.joins, false)
    }

    /// Every undirected edge between members of `entries`, each reported once.
    pub fn edges(entries: &[Entry]) -> Vec<JoinEdge> {
        let present: HashSet<Uuid> = entries.iter().map(|e| e.id).collect();
        let mut seen: HashSet<(Uuid, Uuid)> = HashSet::new();
        let mut edges = Vec::new();

        for entry in entries {
            for &target in &entry.metadata.joins {
                if target == entry.id || !present.contains(&target) {
                    continue;
                }
                let key = if entry.id < target {
                    (entry.id, target)
                } else {
                    (target, entry.id)
                };
                if seen.insert(key) {
                    edges.push(JoinEdge {
                        source: entry.id,
                        target,
                    });
                }
            }
        }
        edges
    }

    /// Scan the whole store for join inconsistencies.
    pub fn audit(&self) -> Result<JoinAudit, MarginaliaError> {
        let rows = self.repo.scan_joins()?;
        let lookup: std::collections::HashMap<Uuid, &Vec<Uuid>> =
            rows.iter().map(|(id, joins)| (*id, joins)).collect();

        let mut audit = JoinAudit::default();
        for (id, joins) in &rows {
            for target in joins {
                if target == id {
                    audit.self_links.push(*id);
                    continue;
                }
                match lookup.get(target) {
                    None => audit.dangling.push((*id, *target)),
                    Some(back) if !back.contains(id) => audit.asymmetric.push((*id, *target)),
                    Some(_) => {}
                }
            }
        }
        Ok(audit)
    }

    fn snapshot(&self, id: Uuid) -> Result<JoinsSnapshot, MarginaliaError> {
        self.repo
            .read_joins(id)?
            .ok_or_else(|| MarginaliaError::NotFound(format!("Entry {} not found", id)))
    }
}
