//! Context memory: session scopes over an audit log, plus long-term memory

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::log::AuditLog;
use super::long_term::{fact_matches, CommitReport, LongTermMemory};
use super::models::{LogEntry, MemoryBatch, MemoryEvent, Recall, RetrievalRecord, SessionScope};
use super::session::Session;
use crate::contradiction::{ContradictionRecord, Resolution};
use crate::context::{ConcatenationSummarizer, Summarizer};
use crate::error::{ContextError, Result};
use crate::facts::Fact;
use crate::index::tokenize;
use crate::metrics::METRICS;

/// Memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Directory holding one `<session>.jsonl` audit log per session
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// JSON store for committed facts; `None` keeps long-term memory in process
    #[serde(default = "default_long_term_path")]
    pub long_term_path: Option<PathBuf>,

    /// Token target for the running topic summary
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: usize,

    /// fsync each log append
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,

    /// "concat" (local) or "model" (routed backend)
    #[serde(default = "default_summarizer")]
    pub summarizer: String,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("data/sessions")
}

fn default_long_term_path() -> Option<PathBuf> {
    Some(PathBuf::from("data/long_term.json"))
}

fn default_summary_max_tokens() -> usize {
    512
}

fn default_sync_writes() -> bool {
    true
}

fn default_summarizer() -> String {
    "concat".to_string()
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            long_term_path: default_long_term_path(),
            summary_max_tokens: default_summary_max_tokens(),
            sync_writes: default_sync_writes(),
            summarizer: default_summarizer(),
        }
    }
}

impl MemoryConfig {
    /// Everything under one directory; handy for tests and tools
    pub fn rooted_at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            log_dir: dir.join("sessions"),
            long_term_path: Some(dir.join("long_term.json")),
            summary_max_tokens: default_summary_max_tokens(),
            sync_writes: false,
            summarizer: default_summarizer(),
        }
    }
}

/// Session-scoped memory plus a shared long-term tier.
///
/// Every mutation is appended to the session's audit log before it is
/// applied, so replaying the log reconstructs the scope.
pub struct ContextMemory {
    config: MemoryConfig,
    log: AuditLog,
    sessions: DashMap<String, Arc<Session>>,
    long_term: Arc<LongTermMemory>,
    summarizer: Arc<dyn Summarizer>,
}

impl ContextMemory {
    pub async fn open(config: MemoryConfig) -> Result<Self> {
        let summarizer: Arc<dyn Summarizer> = Arc::new(ConcatenationSummarizer::default());
        Self::with_summarizer(config, summarizer).await
    }

    pub async fn with_summarizer(config: MemoryConfig, summarizer: Arc<dyn Summarizer>) -> Result<Self> {
        let long_term = match &config.long_term_path {
            Some(path) => LongTermMemory::open(path.clone()).await?,
            None => LongTermMemory::in_memory(),
        };
        tokio::fs::create_dir_all(&config.log_dir).await?;
        let log = AuditLog::new(config.log_dir.clone(), config.sync_writes);
        Ok(Self {
            config,
            log,
            sessions: DashMap::new(),
            long_term: Arc::new(long_term),
            summarizer,
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn long_term(&self) -> &Arc<LongTermMemory> {
        &self.long_term
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.log
    }

    /// Start a session; a fresh id is generated when none is given
    pub async fn start_session(&self, session_id: Option<String>) -> Result<Arc<Session>> {
        let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.log.path_for(&id)?;
        if self.sessions.contains_key(&id) || self.log.exists(&id).await? {
            return Err(ContextError::Configuration(format!(
                "session {} already exists",
                id
            )));
        }

        let session = Arc::new(Session::new(id.clone(), SessionScope::new(&id), 0));
        self.write(&session, MemoryEvent::SessionStarted, false).await?;
        self.sessions.insert(id.clone(), session.clone());
        info!("Started session {}", id);
        Ok(session)
    }

    /// Rebuild a session from its audit log
    pub async fn restore_session(&self, session_id: &str) -> Result<Arc<Session>> {
        if let Some(existing) = self.sessions.get(session_id) {
            return Ok(existing.clone());
        }
        let (scope, next_seq) = self.log.replay(session_id).await?;
        let session = Arc::new(Session::new(session_id.to_string(), scope, next_seq));
        self.sessions.insert(session_id.to_string(), session.clone());
        info!("Restored session {} at seq {}", session_id, next_seq);
        Ok(session)
    }

    pub fn session(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| ContextError::SessionNotFound(session_id.to_string()))
    }

    pub async fn get_scope(&self, session_id: &str) -> Result<SessionScope> {
        Ok(self.session(session_id)?.scope().await)
    }

    /// Append then apply under the session lock. The event is validated
    /// against a copy of the scope first, so a rejected event is never logged.
    async fn write(&self, session: &Session, event: MemoryEvent, require_writable: bool) -> Result<()> {
        let mut state = session.lock().await;
        if require_writable {
            session.ensure_writable()?;
        }

        let mut next_scope = None;
        if !event.is_audit_only() {
            let mut candidate = state.scope.clone();
            candidate.apply(&event)?;
            next_scope = Some(candidate);
        }

        let entry = LogEntry {
            seq: state.next_seq,
            session_id: session.id().to_string(),
            at: Utc::now(),
            event,
        };
        self.log.append(&entry).await?;
        state.next_seq += 1;
        if let Some(scope) = next_scope {
            state.scope = scope;
        }
        Ok(())
    }

    pub async fn record_fact(&self, session_id: &str, fact: Fact) -> Result<()> {
        let session = self.session(session_id)?;
        self.write(&session, MemoryEvent::FactRecorded { fact }, true).await
    }

    pub async fn record_contradiction(&self, session_id: &str, record: ContradictionRecord) -> Result<()> {
        let session = self.session(session_id)?;
        self.write(&session, MemoryEvent::ContradictionRecorded { record }, true)
            .await
    }

    /// Resolve an open record and supersede the losing fact, atomically
    pub async fn resolve_contradiction(
        &self,
        session_id: &str,
        record_id: &str,
        resolution: Resolution,
    ) -> Result<ContradictionRecord> {
        let session = self.session(session_id)?;
        let scope = session.scope().await;
        let mut record = scope
            .contradictions
            .get(record_id)
            .cloned()
            .ok_or_else(|| ContextError::Internal(format!("unknown contradiction {}", record_id)))?;
        record.resolve(resolution)?;

        let mut batch = MemoryBatch::new(format!("resolve-{}", record_id));
        if let Some(loser) = record.loser() {
            if scope.accepted.contains_key(loser) {
                batch.supersede(loser, record.id.clone());
            }
        }
        batch.record_contradiction(record.clone());
        self.write(&session, batch.into_event(), true).await?;
        Ok(record)
    }

    pub async fn record_retrieval(&self, session_id: &str, record: RetrievalRecord) -> Result<()> {
        let session = self.session(session_id)?;
        self.write(&session, MemoryEvent::RetrievalRecorded { record }, true)
            .await
    }

    /// Fold new segments into the running summary, bounded by the token target
    pub async fn update_summary(&self, session_id: &str, segments: &[String]) -> Result<String> {
        let session = self.session(session_id)?;
        let current = session.scope().await.summary;
        let summary = self.summarize(&current, segments).await?;
        self.write(&session, MemoryEvent::SummaryUpdated { summary: summary.clone() }, true)
            .await?;
        Ok(summary)
    }

    /// Running summary with `segments` folded in, without writing it
    pub async fn summarize(&self, current: &str, segments: &[String]) -> Result<String> {
        let mut texts = Vec::with_capacity(segments.len() + 1);
        if !current.is_empty() {
            texts.push(current.to_string());
        }
        texts.extend(segments.iter().cloned());
        Ok(self
            .summarizer
            .summarize(&texts, self.config.summary_max_tokens)
            .await?)
    }

    /// Apply every staged mutation of a request as one log entry
    pub async fn apply_batch(&self, session_id: &str, batch: MemoryBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let session = self.session(session_id)?;
        let request_id = batch.request_id.clone();
        let count = batch.events.len();
        self.write(&session, batch.into_event(), true).await?;
        debug!(
            "Applied batch of {} events for request {} in session {}",
            count, request_id, session_id
        );
        Ok(())
    }

    /// Record an audit-only event such as a retry or request failure
    pub async fn log_event(&self, session_id: &str, event: MemoryEvent) -> Result<()> {
        if !event.is_audit_only() {
            return Err(ContextError::Internal(
                "log_event only accepts audit events".to_string(),
            ));
        }
        let session = self.session(session_id)?;
        self.write(&session, event, false).await
    }

    /// Copy accepted facts to long-term memory; repeated commits add nothing
    pub async fn commit_to_long_term(&self, session_id: &str) -> Result<CommitReport> {
        let session = self.session(session_id)?;
        let facts: Vec<Fact> = session.scope().await.accepted.values().cloned().collect();
        let report = self.long_term.commit(&facts).await?;
        self.write(
            &session,
            MemoryEvent::CommittedToLongTerm {
                added: report.added,
                duplicates: report.duplicates,
            },
            false,
        )
        .await?;
        METRICS.memory_commits.inc();
        Ok(report)
    }

    /// Facts about `topic` from this session, then long-term facts not
    /// already known to or superseded in the session
    pub async fn recall(&self, session_id: &str, topic: &str) -> Result<Recall> {
        let scope = self.get_scope(session_id).await?;
        let terms: HashSet<String> = tokenize(topic).into_iter().collect();

        let mut facts: Vec<Fact> = scope
            .accepted
            .values()
            .filter(|f| fact_matches(f, &terms))
            .cloned()
            .collect();
        let identities: HashSet<String> = scope
            .accepted
            .values()
            .chain(scope.superseded.values().map(|s| &s.fact))
            .map(|f| f.identity.clone())
            .collect();

        for fact in self.long_term.recall(topic).await {
            if !identities.contains(&fact.identity) && !scope.is_superseded(&fact.id) {
                facts.push(fact);
            }
        }

        Ok(Recall {
            facts,
            summary: scope.summary,
        })
    }

    /// Abort in-flight requests. Memory stays as of the last applied batch.
    pub async fn cancel_session(&self, session_id: &str) -> Result<()> {
        let session = self.session(session_id)?;
        if session.is_cancelled() {
            return Ok(());
        }
        session.cancel();
        self.write(&session, MemoryEvent::SessionCancelled, false).await?;
        warn!("Cancelled session {}", session_id);
        Ok(())
    }

    /// Tear a session down, committing its facts first when asked
    pub async fn end_session(&self, session_id: &str, commit: bool) -> Result<Option<CommitReport>> {
        let session = self.session(session_id)?;
        if session.is_ended() {
            return Err(ContextError::SessionClosed(session_id.to_string()));
        }
        let report = if commit {
            Some(self.commit_to_long_term(session_id).await?)
        } else {
            None
        };
        session.cancel();
        self.write(&session, MemoryEvent::SessionEnded { committed: commit }, false)
            .await?;
        session.mark_ended();
        self.sessions.remove(session_id);
        info!("Ended session {} (committed: {})", session_id, commit);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{Chunk, SourceInfo, TextRange};
    use crate::contradiction::{ResolutionRule, ResolutionStatus};
    use crate::facts::FactValue;

    fn fact(chunk_id: &str, provenance: &str, amount: f64) -> Fact {
        let chunk = Chunk {
            id: chunk_id.to_string(),
            document_id: "deck".to_string(),
            ordinal: 0,
            range: TextRange::new(0, 1),
            text: String::new(),
            token_count: 0,
            source: SourceInfo {
                document_id: "deck".to_string(),
                title: "Deck".to_string(),
                provenance: provenance.to_string(),
                published_at: None,
            },
        };
        let value = FactValue::Money {
            amount,
            currency: "USD".to_string(),
        };
        Fact::new("q3", "revenue", value, &chunk, 0.9, "test", 0.5)
    }

    async fn memory(dir: &std::path::Path) -> ContextMemory {
        ContextMemory::open(MemoryConfig::rooted_at(dir)).await.unwrap()
    }

    #[tokio::test]
    async fn test_replay_reconstructs_scope() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(dir.path()).await;
        let session = mem.start_session(Some("s1".to_string())).await.unwrap();

        let a = fact("d#0000", "internal_memo", 10.0);
        let b = fact("d#0001", "audited_report", 12.0);
        mem.record_fact("s1", a.clone()).await.unwrap();
        mem.record_fact("s1", b.clone()).await.unwrap();
        let record = ContradictionRecord::new(&a, &b, "differ");
        mem.record_contradiction("s1", record.clone()).await.unwrap();
        mem.resolve_contradiction(
            "s1",
            &record.id,
            Resolution {
                status: record.status_keeping(&b.id).unwrap(),
                rule: ResolutionRule::SourceTrust,
                rationale: "audit wins".to_string(),
            },
        )
        .await
        .unwrap();
        mem.update_summary("s1", &["Q3 revenue discussed".to_string()])
            .await
            .unwrap();

        let live = session.scope().await;
        assert!(live.is_superseded(&a.id));
        assert_eq!(live.contradictions[&record.id].status, ResolutionStatus::ResolvedKeptB);

        let other = memory(dir.path()).await;
        let (replayed, _) = other.audit_log().replay("s1").await.unwrap();
        assert_eq!(replayed, live);
    }

    #[tokio::test]
    async fn test_apply_batch_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(dir.path()).await;
        mem.start_session(Some("s1".to_string())).await.unwrap();

        let a = fact("d#0000", "web", 10.0);
        let mut batch = MemoryBatch::new("req-1");
        batch.record_fact(a.clone()).supersede("fact-unknown", "contra-x");

        assert!(mem.apply_batch("s1", batch).await.is_err());
        let scope = mem.get_scope("s1").await.unwrap();
        assert!(scope.accepted.is_empty());

        let entries = mem.audit_log().read("s1").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_is_idempotent_and_recall_prefers_session() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(dir.path()).await;
        mem.start_session(Some("s1".to_string())).await.unwrap();
        mem.record_fact("s1", fact("d#0000", "web", 10.0)).await.unwrap();

        let first = mem.commit_to_long_term("s1").await.unwrap();
        let second = mem.commit_to_long_term("s1").await.unwrap();
        assert_eq!(first.added, 1);
        assert_eq!(second.added, 0);
        assert_eq!(mem.long_term().len().await, 1);

        let recall = mem.recall("s1", "q3 revenue").await.unwrap();
        assert_eq!(recall.facts.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_session_rejects_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(dir.path()).await;
        mem.start_session(Some("s1".to_string())).await.unwrap();
        mem.cancel_session("s1").await.unwrap();

        let mut batch = MemoryBatch::new("req-1");
        batch.record_fact(fact("d#0000", "web", 10.0));
        assert!(matches!(
            mem.apply_batch("s1", batch).await,
            Err(ContextError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(dir.path()).await;
        mem.start_session(Some("s1".to_string())).await.unwrap();
        mem.start_session(Some("s2".to_string())).await.unwrap();
        mem.record_fact("s1", fact("d#0000", "web", 10.0)).await.unwrap();

        assert_eq!(mem.get_scope("s1").await.unwrap().accepted.len(), 1);
        assert!(mem.get_scope("s2").await.unwrap().accepted.is_empty());
    }

    #[tokio::test]
    async fn test_end_session_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(dir.path()).await;
        mem.start_session(Some("s1".to_string())).await.unwrap();
        mem.record_fact("s1", fact("d#0000", "web", 10.0)).await.unwrap();

        let report = mem.end_session("s1", true).await.unwrap();
        assert_eq!(report.unwrap().added, 1);
        assert!(matches!(mem.session("s1"), Err(ContextError::SessionNotFound(_))));

        let restored = mem.restore_session("s1").await.unwrap();
        assert_eq!(restored.scope().await.accepted.len(), 1);
        assert!(mem.start_session(Some("s1".to_string())).await.is_err());
    }
}
