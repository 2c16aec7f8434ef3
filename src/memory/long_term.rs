//! Cross-session fact store keyed by (entity, predicate)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::Result;
use crate::facts::Fact;
use crate::index::tokenize;

/// Outcome of a commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReport {
    pub added: usize,
    pub duplicates: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LongTermSnapshot {
    /// "entity::predicate" → facts in commit order
    entries: BTreeMap<String, Vec<Fact>>,
}

struct LongTermState {
    entries: BTreeMap<String, Vec<Fact>>,
    identities: HashSet<String>,
}

fn entry_key(entity: &str, predicate: &str) -> String {
    format!("{}::{}", entity, predicate)
}

/// Shared, read-mostly memory. Only explicit commits write to it.
pub struct LongTermMemory {
    path: Option<PathBuf>,
    state: RwLock<LongTermState>,
}

impl LongTermMemory {
    /// Memory that is never persisted
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(LongTermState {
                entries: BTreeMap::new(),
                identities: HashSet::new(),
            }),
        }
    }

    /// Open the JSON store at `path`; a missing file starts empty
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<LongTermSnapshot>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LongTermSnapshot::default(),
            Err(e) => return Err(e.into()),
        };

        let identities = snapshot
            .entries
            .values()
            .flatten()
            .map(|f| f.identity.clone())
            .collect::<HashSet<_>>();
        info!(
            "Opened long-term memory at {} with {} facts",
            path.display(),
            identities.len()
        );

        Ok(Self {
            path: Some(path),
            state: RwLock::new(LongTermState {
                entries: snapshot.entries,
                identities,
            }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.identities.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.identities.is_empty()
    }

    /// Add facts not already present by identity. Committing the same facts
    /// twice leaves the store unchanged.
    pub async fn commit(&self, facts: &[Fact]) -> Result<CommitReport> {
        let mut state = self.state.write().await;
        let mut report = CommitReport::default();
        let mut staged: Vec<Fact> = Vec::new();
        let mut staged_ids = HashSet::new();

        for fact in facts {
            if state.identities.contains(&fact.identity) || !staged_ids.insert(fact.identity.clone()) {
                report.duplicates += 1;
            } else {
                staged.push(fact.clone());
            }
        }

        if staged.is_empty() {
            debug!("Long-term commit: nothing new ({} duplicates)", report.duplicates);
            return Ok(report);
        }

        let mut next = state.entries.clone();
        for fact in &staged {
            next.entry(entry_key(&fact.entity, &fact.predicate))
                .or_default()
                .push(fact.clone());
        }

        if let Some(path) = &self.path {
            persist(path, &next).await?;
        }

        report.added = staged.len();
        state.entries = next;
        state.identities.extend(staged_ids);
        info!(
            "Committed {} facts to long-term memory ({} duplicates)",
            report.added, report.duplicates
        );
        Ok(report)
    }

    pub async fn get(&self, entity: &str, predicate: &str) -> Vec<Fact> {
        self.state
            .read()
            .await
            .entries
            .get(&entry_key(entity, predicate))
            .cloned()
            .unwrap_or_default()
    }

    /// Facts whose entity, predicate or value mention any topic term
    pub async fn recall(&self, topic: &str) -> Vec<Fact> {
        let terms: HashSet<String> = tokenize(topic).into_iter().collect();
        if terms.is_empty() {
            return Vec::new();
        }
        let state = self.state.read().await;
        state
            .entries
            .values()
            .flatten()
            .filter(|f| fact_matches(f, &terms))
            .cloned()
            .collect()
    }
}

pub(crate) fn fact_matches(fact: &Fact, terms: &HashSet<String>) -> bool {
    let text = format!("{} {} {}", fact.entity, fact.predicate, fact.value);
    tokenize(&text).iter().any(|t| terms.contains(t))
}

/// Write to a temp file, then rename over the target
async fn persist(path: &Path, entries: &BTreeMap<String, Vec<Fact>>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let snapshot = LongTermSnapshot {
        entries: entries.clone(),
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
